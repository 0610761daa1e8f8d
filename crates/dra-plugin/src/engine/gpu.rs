//! Simulated GPU claims.

use api_types::config::DeviceConfig;
use api_types::config::GpuConfig;
use api_types::config::SharingStrategy;
use api_types::AllocationResult;
use api_types::Claim;
use api_types::ContainerEdits;
use api_types::Mount;
use api_types::PreparedDevice;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::warn;

use super::config_context;
use super::invalid_claim;
use super::ClaimPreparer;
use crate::cdi::CdiHandler;
use crate::checkpoint::CheckpointV1;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::inventory::DeviceSet;
use crate::resolver;

const NVIDIA_SMI_HOST_PATH: &str = "/var/lib/runai/bin/nvidia-smi";
const NVIDIA_SMI_CONTAINER_PATH: &str = "/bin/nvidia-smi";

/// Device names are lower case UUIDs; env names cannot carry hyphens.
fn env_device_id(device_name: &str) -> String {
    device_name.replace('-', "_")
}

/// Env describing one device under its resolved sharing config.
pub fn device_edits(config: &GpuConfig, device_name: &str) -> ContainerEdits {
    let id = env_device_id(device_name);
    let mut env = vec![format!("GPU_DEVICE_{id}={device_name}")];

    if let Some(sharing) = &config.sharing {
        env.push(format!("GPU_DEVICE_{id}_SHARING_STRATEGY={}", sharing.strategy));
        match sharing.strategy {
            SharingStrategy::TimeSlicing => {
                let interval = sharing
                    .time_slicing_config
                    .as_ref()
                    .map(|c| c.interval)
                    .unwrap_or_default();
                env.push(format!("GPU_DEVICE_{id}_TIMESLICE_INTERVAL={interval}"));
            }
            SharingStrategy::SpacePartitioning => {
                let count = sharing
                    .space_partitioning_config
                    .as_ref()
                    .map_or(1, |c| c.partition_count);
                env.push(format!("GPU_DEVICE_{id}_PARTITION_COUNT={count}"));
            }
        }
    }

    ContainerEdits::with_env(env)
}

pub struct GpuPreparer {
    driver_name: String,
}

impl GpuPreparer {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
        }
    }

    fn allocation_results<'c>(&self, claim: &'c Claim) -> PluginResult<Vec<&'c AllocationResult>> {
        if claim.allocation_results.is_empty() {
            return invalid_claim(claim, "claim not yet allocated");
        }
        let results: Vec<_> = claim
            .allocation_results
            .iter()
            .filter(|r| r.driver == self.driver_name)
            .collect();
        if results.is_empty() {
            return invalid_claim(
                claim,
                format!("no devices allocated from driver {}", self.driver_name),
            );
        }
        Ok(results)
    }
}

impl ClaimPreparer for GpuPreparer {
    fn common_edits(&self) -> ContainerEdits {
        ContainerEdits {
            mounts: vec![Mount {
                host_path: NVIDIA_SMI_HOST_PATH.to_string(),
                container_path: NVIDIA_SMI_CONTAINER_PATH.to_string(),
                options: vec!["ro".to_string(), "bind".to_string()],
            }],
            ..Default::default()
        }
    }

    fn claim_env(
        &self,
        claim_uid: &str,
        device: &PreparedDevice,
        devices: &DeviceSet,
    ) -> Vec<String> {
        let id = env_device_id(&device.device_name);
        let mut env = vec![format!("GPU_DEVICE_{id}_RESOURCE_CLAIM={claim_uid}")];

        if let Some(topology) = &devices.topology {
            match serde_json::to_string(topology) {
                Ok(json) => env.push(format!("GPU_TOPOLOGY_JSON={json}")),
                Err(e) => warn!(claim_uid, "Failed to serialize node topology: {e}"),
            }
        }
        env
    }

    fn prepare_devices(
        &self,
        claim: &Claim,
        devices: &DeviceSet,
        cdi: &CdiHandler,
        _state: &mut CheckpointV1,
    ) -> PluginResult<Vec<PreparedDevice>> {
        let results = self.allocation_results(claim)?;
        if let Some(missing) = results.iter().find(|r| !devices.contains(&r.device)) {
            return invalid_claim(
                claim,
                format!("requested GPU is not allocatable: {}", missing.device),
            );
        }

        let configs = resolver::driver_configs(&self.driver_name, &claim.opaque_configs)
            .attach_printable_lazy(|| format!("claim: {}", claim.uid))?;
        let owned: Vec<AllocationResult> = results.into_iter().cloned().collect();
        let groups = resolver::resolve(DeviceConfig::Gpu(GpuConfig::default()), configs, &owned);

        let mut edits: Vec<ContainerEdits> = vec![ContainerEdits::default(); owned.len()];
        for group in groups {
            let DeviceConfig::Gpu(mut config) = group.config else {
                return Err(Report::new(PluginError::InvalidConfig {
                    message: "config is not a GpuConfig".to_string(),
                })
                .attach_printable(format!("claim: {}", claim.uid)));
            };
            config_context(config.normalize(), claim, "normalizing GPU config")?;
            config_context(config.validate(), claim, "validating GPU config")?;
            debug!(
                claim_uid = %claim.uid,
                ?config,
                devices = group.results.len(),
                "Applying GPU config"
            );

            for (index, result) in group.results {
                edits[index] = device_edits(&config, &result.device);
            }
        }

        Ok(owned
            .iter()
            .zip(edits)
            .map(|(result, container_edits)| PreparedDevice {
                device_name: result.device.clone(),
                pool_name: result.pool.clone(),
                request_names: vec![result.request.clone()],
                cdi_device_ids: cdi.claim_device_ids(&claim.uid, &[&result.device]),
                container_edits,
            })
            .collect())
    }
}
