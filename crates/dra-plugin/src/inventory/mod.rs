//! Allocatable devices of the local node.
//!
//! Discovery runs outside the engine lock and publishes immutable
//! [`DeviceSet`] snapshots. Readers clone the current `Arc` and never block
//! the publisher.

pub mod discovery;
pub mod refresher;

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::topology::NodeTopology;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::error::PluginResult;

/// Typed device attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    String(String),
}

/// Capacity in base units (bytes for memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(pub u64);

impl Quantity {
    pub fn from_mebibytes(mib: u64) -> Self {
        Self(mib.saturating_mul(1024 * 1024))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub capacity: BTreeMap<String, Quantity>,
}

/// One published enumeration result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSet {
    pub devices: BTreeMap<String, Device>,
    /// Raw topology the devices were derived from, if any
    pub topology: Option<NodeTopology>,
}

impl DeviceSet {
    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.name.clone(), device))
                .collect(),
            topology: None,
        }
    }

    pub fn contains(&self, device_name: &str) -> bool {
        self.devices.contains_key(device_name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Latest device snapshot, swapped atomically on every refresh
#[derive(Debug)]
pub struct DeviceInventory {
    tx: watch::Sender<Option<Arc<DeviceSet>>>,
}

impl Default for DeviceInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceInventory {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Creates an inventory that is ready from the start.
    pub fn with_devices(devices: DeviceSet) -> Self {
        let inventory = Self::new();
        inventory.publish(devices);
        inventory
    }

    pub fn publish(&self, devices: DeviceSet) {
        tracing::debug!(devices = devices.len(), "Publishing device inventory");
        self.tx.send_replace(Some(Arc::new(devices)));
    }

    pub fn current(&self) -> Option<Arc<DeviceSet>> {
        self.tx.borrow().clone()
    }

    /// Waits until a first snapshot has been published.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Cancelled`] if `cancel` fires first
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> PluginResult<Arc<DeviceSet>> {
        if let Some(devices) = self.current() {
            return Ok(devices);
        }

        let mut rx = self.tx.subscribe();
        select! {
            _ = cancel.cancelled() => Err(Report::new(PluginError::Cancelled)
                .attach_printable("cancelled while waiting for device inventory")),
            ready = rx.wait_for(Option::is_some) => {
                let snapshot = match ready {
                    Ok(value) => (*value).clone(),
                    Err(_) => None,
                };
                snapshot.ok_or_else(|| {
                    Report::new(PluginError::DiscoveryUnavailable {
                        message: "device inventory closed before first snapshot".to_string(),
                    })
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn gpu(name: &str) -> Device {
        Device {
            name: name.to_string(),
            attributes: BTreeMap::new(),
            capacity: BTreeMap::from([("memory".to_string(), Quantity::from_mebibytes(1))]),
        }
    }

    #[test(tokio::test)]
    async fn wait_ready_returns_published_snapshot() {
        let inventory = Arc::new(DeviceInventory::new());
        let cancel = CancellationToken::new();

        let publisher = {
            let inventory = inventory.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                inventory.publish(DeviceSet::from_devices([gpu("gpu-0")]));
            })
        };

        let devices = inventory.wait_ready(&cancel).await.expect("ready");
        assert!(devices.contains("gpu-0"));
        publisher.await.expect("publisher");
    }

    #[test(tokio::test)]
    async fn wait_ready_aborts_on_cancel() {
        let inventory = DeviceInventory::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = inventory.wait_ready(&cancel).await.expect_err("cancelled");
        assert!(matches!(err.current_context(), PluginError::Cancelled));
    }

    #[test]
    fn publish_replaces_snapshot() {
        let inventory = DeviceInventory::with_devices(DeviceSet::from_devices([gpu("gpu-0")]));
        inventory.publish(DeviceSet::from_devices([gpu("gpu-1"), gpu("gpu-2")]));

        let current = inventory.current().expect("snapshot");
        assert_eq!(current.len(), 2);
        assert!(!current.contains("gpu-0"));
    }

    #[test]
    fn memory_quantity_in_bytes() {
        assert_eq!(Quantity::from_mebibytes(40960), Quantity(42_949_672_960));
    }
}
