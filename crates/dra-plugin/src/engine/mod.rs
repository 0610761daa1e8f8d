//! Claim preparation state machine.
//!
//! A claim is either absent from the checkpoint or prepared. Every checkpoint
//! read-modify-write happens under the engine lock and reloads the checkpoint
//! from disk, so retries from the kubelet and restarts of the plugin converge
//! on what the checkpoint says. Only a new claim waiting for the first device
//! inventory does so outside the lock.

pub mod compute_domain;
pub mod gpu;

use std::sync::Arc;
use std::time::Duration;

use api_types::Claim;
use api_types::ContainerEdits;
use api_types::PreparedDevice;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cdi::CdiHandler;
use crate::checkpoint::Checkpoint;
use crate::checkpoint::CheckpointStore;
use crate::checkpoint::CheckpointV1;
use crate::domain::DomainAggregator;
use crate::domain::PodRef;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::inventory::DeviceInventory;
use crate::inventory::DeviceSet;

pub use compute_domain::ComputeDomainPreparer;
pub use gpu::GpuPreparer;

/// Driver specific half of claim preparation.
pub trait ClaimPreparer: Send + Sync + 'static {
    /// Edits of the `common` CDI device written at startup
    fn common_edits(&self) -> ContainerEdits;

    /// Env binding one prepared device to its claim in the claim spec
    fn claim_env(
        &self,
        claim_uid: &str,
        device: &PreparedDevice,
        devices: &DeviceSet,
    ) -> Vec<String>;

    /// Builds the prepared devices of a claim that is not prepared yet.
    ///
    /// `state` is the freshly loaded checkpoint payload; changes to it are
    /// persisted together with the new claim entry or dropped on failure.
    fn prepare_devices(
        &self,
        claim: &Claim,
        devices: &DeviceSet,
        cdi: &CdiHandler,
        state: &mut CheckpointV1,
    ) -> PluginResult<Vec<PreparedDevice>>;

    /// Recreates host side artifacts referenced by already prepared devices.
    fn ensure_host_artifacts(&self, _devices: &[PreparedDevice]) {}
}

/// How long a new claim waits for the first device inventory by default
pub const DEFAULT_INVENTORY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PreparationEngine<P> {
    store: Mutex<CheckpointStore>,
    cdi: CdiHandler,
    inventory: Arc<DeviceInventory>,
    inventory_timeout: Duration,
    preparer: P,
}

impl<P: ClaimPreparer> PreparationEngine<P> {
    /// Writes the common CDI spec and opens (or creates) the checkpoint.
    ///
    /// # Errors
    ///
    /// Any error here is fatal for the plugin, including
    /// [`PluginError::ChecksumMismatch`] on a corrupted checkpoint.
    pub fn new(
        store: CheckpointStore,
        cdi: CdiHandler,
        inventory: Arc<DeviceInventory>,
        preparer: P,
    ) -> PluginResult<Self> {
        cdi.write_common_spec(preparer.common_edits())?;
        let checkpoint = store.open_or_create()?;
        info!(
            checkpoint = %store.path().display(),
            prepared_claims = checkpoint.v1.prepared_claims.len(),
            "Preparation engine ready"
        );

        Ok(Self {
            store: Mutex::new(store),
            cdi,
            inventory,
            inventory_timeout: DEFAULT_INVENTORY_TIMEOUT,
            preparer,
        })
    }

    /// Bounds the wait of a new claim for the first device inventory.
    pub fn with_inventory_timeout(mut self, timeout: Duration) -> Self {
        self.inventory_timeout = timeout;
        self
    }

    pub fn cdi(&self) -> &CdiHandler {
        &self.cdi
    }

    pub fn preparer(&self) -> &P {
        &self.preparer
    }

    /// Prepares a claim, returning the cached devices if it already is.
    ///
    /// Already prepared claims never wait for the device inventory. A new
    /// claim waits outside the lock for the first inventory, failing with
    /// [`PluginError::DiscoveryUnavailable`] after the inventory timeout or
    /// with [`PluginError::Cancelled`] when `cancel` fires.
    #[instrument(skip_all, fields(claim_uid = %claim.uid))]
    pub async fn prepare(
        &self,
        claim: &Claim,
        cancel: &CancellationToken,
    ) -> PluginResult<Vec<PreparedDevice>> {
        if let Some(prepared) = self.cached(&claim.uid).await? {
            return Ok(prepared);
        }

        let devices = self.wait_for_inventory(cancel).await?;

        let store = self.store.lock().await;
        let mut checkpoint = store.load()?.unwrap_or_default();

        // Another call may have prepared the claim while we were waiting.
        if let Some(prepared) = checkpoint.v1.prepared_claims.get(&claim.uid) {
            debug!("Claim prepared concurrently, re-deriving CDI spec");
            self.write_claim_artifacts(&claim.uid, prepared, &devices);
            return Ok(prepared.clone());
        }

        let prepared = self
            .preparer
            .prepare_devices(claim, &devices, &self.cdi, &mut checkpoint.v1)?;

        // A spec written here without a checkpoint entry is overwritten by the
        // next prepare of the same claim.
        self.write_claim_artifacts(&claim.uid, &prepared, &devices);

        checkpoint
            .v1
            .prepared_claims
            .insert(claim.uid.clone(), prepared.clone());
        store.save(&mut checkpoint)?;

        info!(devices = prepared.len(), "Prepared claim");
        Ok(prepared)
    }

    /// Cached devices of a prepared claim with its CDI spec re-derived.
    ///
    /// Without an inventory snapshot an existing spec is left as is and a
    /// missing one is written without inventory derived env.
    async fn cached(&self, claim_uid: &str) -> PluginResult<Option<Vec<PreparedDevice>>> {
        let store = self.store.lock().await;
        let Some(checkpoint) = store.load()? else {
            return Ok(None);
        };
        let Some(prepared) = checkpoint.v1.prepared_claims.get(claim_uid) else {
            return Ok(None);
        };

        match self.inventory.current() {
            Some(devices) => {
                debug!("Claim already prepared, re-deriving CDI spec");
                self.write_claim_artifacts(claim_uid, prepared, &devices);
            }
            None if self.cdi.spec_path(claim_uid).exists() => {
                debug!("Claim already prepared, no inventory yet, keeping CDI spec");
                self.preparer.ensure_host_artifacts(prepared);
            }
            None => {
                warn!(claim_uid, "Claim already prepared, writing CDI spec without inventory");
                self.write_claim_artifacts(claim_uid, prepared, &DeviceSet::default());
            }
        }
        Ok(Some(prepared.clone()))
    }

    async fn wait_for_inventory(
        &self,
        cancel: &CancellationToken,
    ) -> PluginResult<Arc<DeviceSet>> {
        let ready = self.inventory.wait_ready(cancel);
        match tokio::time::timeout(self.inventory_timeout, ready).await {
            Ok(devices) => devices,
            Err(_) => Err(Report::new(PluginError::DiscoveryUnavailable {
                message: format!("no device inventory after {:?}", self.inventory_timeout),
            })),
        }
    }

    /// Releases a claim. Unknown claims are a no-op.
    #[instrument(skip(self))]
    pub async fn unprepare(&self, claim_uid: &str) -> PluginResult<()> {
        let store = self.store.lock().await;
        let Some(mut checkpoint) = store.load()? else {
            return Ok(());
        };

        if !checkpoint.v1.prepared_claims.contains_key(claim_uid) {
            debug!("Claim not prepared, nothing to do");
            return Ok(());
        }

        DomainAggregator::new(&mut checkpoint.v1.domains).detach_claim_everywhere(claim_uid);
        checkpoint.v1.prepared_claims.remove(claim_uid);
        store.save(&mut checkpoint)?;

        if let Err(e) = self.cdi.delete_claim_spec(claim_uid) {
            warn!("Failed to delete CDI spec of unprepared claim: {e:?}");
        }

        info!("Unprepared claim");
        Ok(())
    }

    /// Current checkpoint as stored on disk
    pub async fn checkpoint(&self) -> PluginResult<Checkpoint> {
        let store = self.store.lock().await;
        Ok(store.load()?.unwrap_or_default())
    }

    /// Records a pod as a member of an existing domain.
    #[instrument(skip(self))]
    pub async fn attach_pod(&self, domain_id: &str, pod: PodRef) -> PluginResult<bool> {
        self.mutate_domains(|mut domains| domains.attach_pod(domain_id, pod))
            .await
    }

    #[instrument(skip(self))]
    pub async fn detach_pod(&self, domain_id: &str, pod: &PodRef) -> PluginResult<bool> {
        self.mutate_domains(|mut domains| domains.detach_pod(domain_id, pod))
            .await
    }

    async fn mutate_domains<F>(&self, mutate: F) -> PluginResult<bool>
    where
        F: FnOnce(DomainAggregator<'_>) -> bool,
    {
        let store = self.store.lock().await;
        let mut checkpoint = store.load()?.unwrap_or_default();
        let before = checkpoint.v1.domains.clone();
        let changed = mutate(DomainAggregator::new(&mut checkpoint.v1.domains));
        if checkpoint.v1.domains != before {
            store.save(&mut checkpoint)?;
        }
        Ok(changed)
    }

    fn write_claim_artifacts(
        &self,
        claim_uid: &str,
        prepared: &[PreparedDevice],
        devices: &DeviceSet,
    ) {
        self.preparer.ensure_host_artifacts(prepared);
        let written = self.cdi.write_claim_spec(claim_uid, prepared, |device| {
            self.preparer.claim_env(claim_uid, device, devices)
        });
        if let Err(e) = written {
            warn!(claim_uid, "Failed to write claim CDI spec: {e:?}");
        }
    }
}

/// Fails with [`PluginError::InvalidClaim`] carrying the claim UID.
pub(crate) fn invalid_claim<T>(claim: &Claim, message: impl Into<String>) -> PluginResult<T> {
    Err(Report::new(PluginError::invalid_claim(&claim.uid, message)))
}

/// Maps a config error onto [`PluginError::InvalidConfig`] for a claim.
pub(crate) fn config_context<T, E>(
    result: Result<T, E>,
    claim: &Claim,
    what: &str,
) -> PluginResult<T>
where
    E: core::error::Error + Send + Sync + 'static,
{
    result
        .change_context(PluginError::InvalidConfig {
            message: format!("{what} failed"),
        })
        .attach_printable_lazy(|| format!("claim: {}", claim.uid))
}
