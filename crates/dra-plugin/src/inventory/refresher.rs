use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::discovery::DeviceSource;
use super::discovery::DiscoveryResult;
use super::DeviceInventory;

/// Exponential backoff used while waiting for the first enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 2,
            cap: Duration::from_secs(5 * 60),
            steps: 10,
        }
    }
}

impl Backoff {
    /// Delay after the given zero based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(multiplier)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Keeps a [`DeviceInventory`] up to date from a [`DeviceSource`].
pub struct InventoryRefresher {
    source: Arc<dyn DeviceSource>,
    inventory: Arc<DeviceInventory>,
    interval: Duration,
    backoff: Backoff,
}

impl InventoryRefresher {
    pub fn new(
        source: Arc<dyn DeviceSource>,
        inventory: Arc<DeviceInventory>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            inventory,
            interval,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enumerates once and publishes the result. The previous snapshot stays
    /// in place on failure.
    pub async fn refresh_once(&self) -> DiscoveryResult<usize> {
        let devices = self.source.enumerate().await?;
        let count = devices.len();
        self.inventory.publish(devices);
        Ok(count)
    }

    /// Retries the first enumeration with exponential backoff.
    ///
    /// Returns `true` once devices were published, `false` when the attempts
    /// are exhausted, the error cannot be retried, or `cancel` fired.
    pub async fn wait_for_devices(&self, cancel: &CancellationToken) -> bool {
        for attempt in 0..self.backoff.steps {
            let err = match self.refresh_once().await {
                Ok(count) => {
                    info!(devices = count, "Device inventory is ready");
                    return true;
                }
                Err(err) => err,
            };

            if !err.current_context().is_retryable() {
                error!("Device discovery failed permanently: {err:?}");
                return false;
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                attempt = attempt + 1,
                retry_in = ?delay,
                "Devices not available yet: {}",
                err.current_context()
            );
            select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        error!(
            steps = self.backoff.steps,
            "Gave up waiting for devices, continuing with periodic refresh"
        );
        false
    }

    /// Runs the startup wait and then refreshes periodically until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.wait_for_devices(&cancel).await;

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("Inventory refresher shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!("Inventory refresh failed, keeping last snapshot: {e:?}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use error_stack::Report;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::error::DiscoveryError;
    use crate::inventory::discovery::ChannelSource;
    use crate::inventory::DeviceSet;

    /// Fails a fixed number of times before succeeding
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> DiscoveryError,
    }

    #[async_trait]
    impl DeviceSource for FlakySource {
        async fn enumerate(&self) -> DiscoveryResult<DeviceSet> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Report::new((self.error)()));
            }
            Ok(ChannelSource::devices())
        }
    }

    fn fast_backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(4),
            steps: 5,
        }
    }

    #[test]
    fn default_backoff_doubles_up_to_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(7), Duration::from_secs(256));
        assert_eq!(backoff.delay(8), Duration::from_secs(300));
        assert_eq!(backoff.delay(40), Duration::from_secs(300));
    }

    #[test(tokio::test)]
    async fn retries_until_devices_appear() {
        let source = Arc::new(FlakySource {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || DiscoveryError::Empty {
                node_name: "node-a".to_string(),
            },
        });
        let inventory = Arc::new(DeviceInventory::new());
        let refresher =
            InventoryRefresher::new(source.clone(), inventory.clone(), Duration::from_secs(30))
                .with_backoff(fast_backoff());

        assert!(refresher.wait_for_devices(&CancellationToken::new()).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(inventory.current().is_some());
    }

    #[test(tokio::test)]
    async fn malformed_topology_stops_retrying() {
        let source = Arc::new(FlakySource {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: || DiscoveryError::Malformed {
                message: "bad".to_string(),
            },
        });
        let inventory = Arc::new(DeviceInventory::new());
        let refresher =
            InventoryRefresher::new(source.clone(), inventory.clone(), Duration::from_secs(30))
                .with_backoff(fast_backoff());

        assert!(!refresher.wait_for_devices(&CancellationToken::new()).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(inventory.current().is_none());
    }

    #[test(tokio::test)]
    async fn run_stops_on_cancel() {
        let inventory = Arc::new(DeviceInventory::new());
        let refresher = InventoryRefresher::new(
            Arc::new(ChannelSource),
            inventory.clone(),
            Duration::from_millis(5),
        );
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { refresher.run(cancel).await })
        };

        inventory.wait_ready(&cancel).await.expect("ready");
        cancel.cancel();
        handle.await.expect("refresher task");
    }
}
