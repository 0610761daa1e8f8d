//! Batch entry points called by the kubelet facing transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::Claim;
use api_types::ClaimRef;
use api_types::PrepareResult;
use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::engine::ClaimPreparer;
use crate::engine::PreparationEngine;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::health::HealthProbe;

pub struct Driver<P> {
    engine: Arc<PreparationEngine<P>>,
    /// Root token of the process, cancelled on unrecoverable errors
    cancel: CancellationToken,
}

impl<P: ClaimPreparer> Driver<P> {
    pub fn new(engine: Arc<PreparationEngine<P>>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    pub fn engine(&self) -> &Arc<PreparationEngine<P>> {
        &self.engine
    }

    /// Prepares every claim independently; one failure never aborts the
    /// others.
    pub async fn prepare_resource_claims(
        &self,
        claims: &[Claim],
    ) -> BTreeMap<String, PrepareResult> {
        if !claims.is_empty() {
            info!(claims = claims.len(), "PrepareResourceClaims called");
        }

        let mut results = BTreeMap::new();
        for claim in claims {
            let result = match self.engine.prepare(claim, &self.cancel).await {
                Ok(devices) => {
                    PrepareResult::prepared(devices.iter().map(|d| d.to_claim_device()).collect())
                }
                Err(report) => {
                    let report = report.attach_printable(format!(
                        "error preparing devices for claim {}/{}:{}",
                        claim.namespace, claim.name, claim.uid
                    ));
                    self.handle_error(&report);
                    PrepareResult::failed(format!("{report:#}"))
                }
            };
            results.insert(claim.uid.clone(), result);
        }
        results
    }

    /// Unprepares every claim independently. `None` marks success.
    pub async fn unprepare_resource_claims(
        &self,
        claims: &[ClaimRef],
    ) -> BTreeMap<String, Option<String>> {
        if !claims.is_empty() {
            info!(claims = claims.len(), "UnprepareResourceClaims called");
        }

        let mut results = BTreeMap::new();
        for claim in claims {
            let outcome = match self.engine.unprepare(&claim.uid).await {
                Ok(()) => None,
                Err(report) => {
                    let report = report.attach_printable(format!(
                        "error unpreparing devices for claim {}/{}:{}",
                        claim.namespace, claim.name, claim.uid
                    ));
                    self.handle_error(&report);
                    Some(format!("{report:#}"))
                }
            };
            results.insert(claim.uid.clone(), outcome);
        }
        results
    }

    /// Logs recoverable errors and shuts the process down on anything else.
    pub fn handle_error(&self, report: &Report<PluginError>) {
        if report.current_context().is_recoverable() {
            warn!("Recoverable plugin error: {report:?}");
            return;
        }
        error!("Unrecoverable plugin error, shutting down: {report:?}");
        self.cancel.cancel();
    }
}

#[async_trait]
impl<P: ClaimPreparer> HealthProbe for Driver<P> {
    async fn check(&self) -> PluginResult<()> {
        // An empty batch exercises the request path without touching state.
        let results = self.prepare_resource_claims(&[]).await;
        if !results.is_empty() {
            return Err(Report::new(PluginError::CheckpointIo {
                message: "empty prepare batch returned results".to_string(),
            }));
        }
        self.engine.checkpoint().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use api_types::AllocationResult;
    use api_types::DeviceRequest;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cdi::CdiHandler;
    use crate::checkpoint::CheckpointStore;
    use crate::engine::GpuPreparer;
    use crate::inventory::Device;
    use crate::inventory::DeviceInventory;
    use crate::inventory::DeviceSet;

    const DRIVER: &str = "gpu.nvidia.com";

    fn driver(dir: &std::path::Path, cancel: CancellationToken) -> Driver<GpuPreparer> {
        let inventory = DeviceInventory::with_devices(DeviceSet::from_devices([Device {
            name: "gpu-0".to_string(),
            attributes: Default::default(),
            capacity: Default::default(),
        }]));
        let engine = PreparationEngine::new(
            CheckpointStore::new(dir.join("plugin"), "checkpoint.json"),
            CdiHandler::new(dir.join("cdi"), "k8s.gpu.nvidia.com", "gpu").with_common_device_id(),
            Arc::new(inventory),
            GpuPreparer::new(DRIVER),
        )
        .expect("engine");
        Driver::new(Arc::new(engine), cancel)
    }

    fn gpu_claim(uid: &str, device: &str) -> Claim {
        Claim {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: format!("{uid}-claim"),
            device_requests: vec![DeviceRequest {
                name: "gpu".to_string(),
                device_class_name: Some(DRIVER.to_string()),
            }],
            allocation_results: vec![AllocationResult {
                request: "gpu".to_string(),
                driver: DRIVER.to_string(),
                pool: "node-a".to_string(),
                device: device.to_string(),
            }],
            opaque_configs: vec![],
        }
    }

    #[test(tokio::test)]
    async fn one_failing_claim_does_not_abort_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        let driver = driver(dir.path(), cancel.clone());

        let results = driver
            .prepare_resource_claims(&[gpu_claim("good", "gpu-0"), gpu_claim("bad", "gpu-9")])
            .await;

        assert!(results["good"].is_ok());
        assert_eq!(results["good"].devices[0].device_name, "gpu-0");
        let error = results["bad"].error.as_deref().expect("bad claim fails");
        assert!(error.contains("bad"), "error should name the claim: {error}");
        assert!(!cancel.is_cancelled());
    }

    #[test(tokio::test)]
    async fn unprepare_of_unknown_claims_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = driver(dir.path(), CancellationToken::new());

        let refs = [ClaimRef {
            uid: "missing".to_string(),
            namespace: "default".to_string(),
            name: "missing".to_string(),
        }];
        assert_eq!(driver.unprepare_resource_claims(&refs).await["missing"], None);
        assert_eq!(driver.unprepare_resource_claims(&refs).await["missing"], None);
    }

    #[test(tokio::test)]
    async fn checksum_mismatch_cancels_root_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        let driver = driver(dir.path(), cancel.clone());

        driver.handle_error(&Report::new(PluginError::InvalidConfig {
            message: "bad".to_string(),
        }));
        assert!(!cancel.is_cancelled());

        driver.handle_error(&Report::new(PluginError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        }));
        assert!(cancel.is_cancelled());
    }

    #[test(tokio::test)]
    async fn health_check_passes_on_healthy_driver() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = driver(dir.path(), CancellationToken::new());
        driver.check().await.expect("healthy");
    }
}
