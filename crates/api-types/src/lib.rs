//! Shared API type definitions
//!
//! This crate contains the data types exchanged between the simulated DRA
//! plugins and their callers: resource claims with their allocation results,
//! the prepared devices handed back to the kubelet, CDI container edits, the
//! opaque device configuration schemas and the node topology published by
//! discovery.

pub mod cdi;
pub mod config;
pub mod topology;

use serde::Deserialize;
use serde::Serialize;

pub use cdi::ContainerEdits;
pub use cdi::DeviceNode;
pub use cdi::Mount;

/// Where an opaque config was attached.
///
/// Class-scoped configs are broad defaults coming from the device class,
/// claim-scoped configs are overrides written on the claim itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigScope {
    #[serde(rename = "FromClass")]
    Class,
    #[serde(rename = "FromClaim")]
    Claim,
}

/// Driver specific configuration attached to an allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueConfig {
    pub scope: ConfigScope,
    /// Driver the parameters are meant for
    pub driver: String,
    /// Request names this config applies to, empty means every request
    #[serde(default)]
    pub requests: Vec<String>,
    /// Raw parameters, decoded by the driver
    pub parameters: serde_json::Value,
}

/// A single device request of a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class_name: Option<String>,
}

/// Allocation decision made by the scheduler for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,
}

/// Resource claim as seen by the node plugin.
///
/// The scheduler has already allocated devices, so the plugin only has to
/// prepare what is listed in `allocation_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub uid: String,
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_requests: Vec<DeviceRequest>,
    #[serde(default)]
    pub allocation_results: Vec<AllocationResult>,
    /// Allocation configs in arrival order, class scoped before claim scoped
    #[serde(default)]
    pub opaque_configs: Vec<OpaqueConfig>,
}

impl Claim {
    /// Device class of the first request that names one
    pub fn device_class_name(&self) -> Option<&str> {
        self.device_requests
            .iter()
            .find_map(|req| req.device_class_name.as_deref())
    }
}

/// Identity of a claim passed to unprepare
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// Device prepared for a claim, persisted in the checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDevice {
    pub device_name: String,
    pub pool_name: String,
    pub request_names: Vec<String>,
    #[serde(rename = "cdiDeviceIDs", default)]
    pub cdi_device_ids: Vec<String>,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

impl PreparedDevice {
    /// View of the device returned to the kubelet
    pub fn to_claim_device(&self) -> ClaimDevice {
        ClaimDevice {
            requests: self.request_names.clone(),
            pool_name: self.pool_name.clone(),
            device_name: self.device_name.clone(),
            cdi_device_ids: self.cdi_device_ids.clone(),
        }
    }
}

/// Device as reported back in a prepare response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDevice {
    pub requests: Vec<String>,
    pub pool_name: String,
    pub device_name: String,
    #[serde(rename = "cdiDeviceIDs")]
    pub cdi_device_ids: Vec<String>,
}

/// Per claim outcome of a batch prepare call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<ClaimDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PrepareResult {
    pub fn prepared(devices: Vec<ClaimDevice>) -> Self {
        Self {
            devices,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            devices: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn claim_deserializes_from_camel_case() {
        let claim: Claim = serde_json::from_str(
            r#"{
                "uid": "c1",
                "namespace": "default",
                "deviceRequests": [{"name": "gpu", "deviceClassName": "gpu.nvidia.com"}],
                "allocationResults": [
                    {"request": "gpu", "driver": "gpu.nvidia.com", "pool": "node-a", "device": "gpu-0"}
                ],
                "opaqueConfigs": [
                    {"scope": "FromClaim", "driver": "gpu.nvidia.com", "requests": ["gpu"], "parameters": {}}
                ]
            }"#,
        )
        .expect("valid claim");

        assert_eq!(claim.device_class_name(), Some("gpu.nvidia.com"));
        assert_eq!(claim.allocation_results[0].device, "gpu-0");
        assert_eq!(claim.opaque_configs[0].scope, ConfigScope::Claim);
    }

    #[test]
    fn claim_without_class_has_no_device_class() {
        let claim = Claim {
            uid: "c1".to_string(),
            namespace: "default".to_string(),
            name: String::new(),
            device_requests: vec![DeviceRequest {
                name: "gpu".to_string(),
                device_class_name: None,
            }],
            allocation_results: vec![],
            opaque_configs: vec![],
        };
        assert_eq!(claim.device_class_name(), None);
    }
}
