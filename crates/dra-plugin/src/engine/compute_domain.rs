//! Compute domain channel claims.
//!
//! A channel claim makes the node a member of a compute domain. Preparing it
//! records the membership in the checkpoint and hands the container a
//! per-domain channel device node.

use api_types::config::DeviceConfig;
use api_types::AllocationResult;
use api_types::Claim;
use api_types::ContainerEdits;
use api_types::PreparedDevice;
use error_stack::ResultExt;
use tracing::info;
use tracing::warn;

use super::invalid_claim;
use super::ClaimPreparer;
use crate::cdi::device_node::is_valid_domain_id;
use crate::cdi::device_node::ChannelDeviceNodes;
use crate::cdi::CdiHandler;
use crate::checkpoint::CheckpointV1;
use crate::domain::DomainAggregator;
use crate::error::PluginResult;
use crate::inventory::discovery::ChannelSource;
use crate::inventory::DeviceSet;
use crate::resolver;

/// Request name used when a claim carries no allocation results
pub const CHANNEL_REQUEST_NAME: &str = "channel";

pub struct ComputeDomainPreparer {
    driver_name: String,
    node_name: String,
    device_nodes: ChannelDeviceNodes,
}

impl ComputeDomainPreparer {
    pub fn new(
        driver_name: impl Into<String>,
        node_name: impl Into<String>,
        device_nodes: ChannelDeviceNodes,
    ) -> Self {
        Self {
            driver_name: driver_name.into(),
            node_name: node_name.into(),
            device_nodes,
        }
    }

    /// Domain ID from the highest precedence channel config of this driver.
    fn domain_id(&self, claim: &Claim) -> PluginResult<String> {
        let configs = resolver::driver_configs(&self.driver_name, &claim.opaque_configs)
            .attach_printable_lazy(|| format!("claim: {}", claim.uid))?;

        let domain_id = configs.into_iter().rev().find_map(|c| match c.config {
            DeviceConfig::ComputeDomainChannel(channel) if !channel.domain_id.is_empty() => {
                Some(channel.domain_id)
            }
            _ => None,
        });
        match domain_id {
            Some(domain_id) if is_valid_domain_id(&domain_id) => Ok(domain_id),
            Some(domain_id) => {
                invalid_claim(claim, format!("invalid compute domain ID {domain_id:?}"))
            }
            None => invalid_claim(claim, "unable to extract compute domain ID from claim"),
        }
    }

    fn allocated_channels(&self, claim: &Claim) -> Vec<AllocationResult> {
        let results: Vec<AllocationResult> = claim
            .allocation_results
            .iter()
            .filter(|r| r.driver.is_empty() || r.driver == self.driver_name)
            .cloned()
            .collect();
        if !results.is_empty() {
            return results;
        }

        vec![AllocationResult {
            request: CHANNEL_REQUEST_NAME.to_string(),
            driver: self.driver_name.clone(),
            pool: claim.namespace.clone(),
            device: ChannelSource::channel_name(0),
        }]
    }
}

impl ClaimPreparer for ComputeDomainPreparer {
    fn common_edits(&self) -> ContainerEdits {
        ContainerEdits::with_env(vec![
            format!("KUBERNETES_NODE_NAME={}", self.node_name),
            format!("DRA_RESOURCE_DRIVER_NAME={}", self.driver_name),
        ])
    }

    fn claim_env(
        &self,
        claim_uid: &str,
        device: &PreparedDevice,
        _devices: &DeviceSet,
    ) -> Vec<String> {
        vec![format!(
            "COMPUTE_DOMAIN_DEVICE_{}_RESOURCE_CLAIM={claim_uid}",
            device.device_name
        )]
    }

    fn prepare_devices(
        &self,
        claim: &Claim,
        devices: &DeviceSet,
        cdi: &CdiHandler,
        state: &mut CheckpointV1,
    ) -> PluginResult<Vec<PreparedDevice>> {
        if claim.device_class_name().is_none() {
            return invalid_claim(claim, "unable to determine device class from claim");
        }
        let domain_id = self.domain_id(claim)?;

        let channels = self.allocated_channels(claim);
        if let Some(unknown) = channels.iter().find(|c| !devices.contains(&c.device)) {
            return invalid_claim(claim, format!("unknown channel device {}", unknown.device));
        }

        DomainAggregator::new(&mut state.domains).attach_claim(
            &domain_id,
            &claim.uid,
            &self.node_name,
        );

        if let Err(e) = self.device_nodes.ensure(&domain_id) {
            warn!(claim_uid = %claim.uid, %domain_id, "Failed to create channel device node: {e}");
        }
        let edits = self.device_nodes.container_edits(&domain_id);

        info!(
            claim_uid = %claim.uid,
            %domain_id,
            channels = channels.len(),
            "Joined compute domain"
        );
        Ok(channels
            .into_iter()
            .map(|channel| PreparedDevice {
                cdi_device_ids: cdi.claim_device_ids(&claim.uid, &[&channel.device]),
                device_name: channel.device,
                pool_name: if channel.pool.is_empty() {
                    claim.namespace.clone()
                } else {
                    channel.pool
                },
                request_names: vec![channel.request],
                container_edits: edits.clone(),
            })
            .collect())
    }

    fn ensure_host_artifacts(&self, devices: &[PreparedDevice]) {
        for node in devices.iter().flat_map(|d| &d.container_edits.device_nodes) {
            let Some(domain_id) = self.device_nodes.domain_of(&node.path) else {
                continue;
            };
            if let Err(e) = self.device_nodes.ensure(&domain_id) {
                warn!(%domain_id, "Failed to recreate channel device node: {e}");
            }
        }
    }
}
