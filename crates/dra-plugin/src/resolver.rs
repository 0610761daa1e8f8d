//! Opaque config decoding and per-device precedence resolution.
//!
//! Configs are ordered from lowest to highest precedence: class scoped
//! configs first, claim scoped configs after, each in arrival order. An
//! implicit default with an empty request filter sits in front of all of
//! them so that every allocation result binds to exactly one config.

use api_types::config::ComputeDomainChannelConfig;
use api_types::config::DeviceConfig;
use api_types::config::GpuConfig;
use api_types::config::TypeMeta;
use api_types::config::CHANNEL_CONFIG_API_VERSION;
use api_types::config::CHANNEL_CONFIG_KIND;
use api_types::config::GPU_CONFIG_API_VERSION;
use api_types::config::GPU_CONFIG_KIND;
use api_types::AllocationResult;
use api_types::ConfigScope;
use api_types::OpaqueConfig;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::Value;

use crate::error::PluginError;
use crate::error::PluginResult;

type DecodeFn = fn(Value) -> Result<DeviceConfig, serde_json::Error>;

fn decode_gpu(value: Value) -> Result<DeviceConfig, serde_json::Error> {
    serde_json::from_value::<GpuConfig>(value).map(DeviceConfig::Gpu)
}

fn decode_channel(value: Value) -> Result<DeviceConfig, serde_json::Error> {
    serde_json::from_value::<ComputeDomainChannelConfig>(value)
        .map(DeviceConfig::ComputeDomainChannel)
}

/// Known config schemas keyed by `apiVersion` and `kind`
const DECODERS: &[(&str, &str, DecodeFn)] = &[
    (GPU_CONFIG_API_VERSION, GPU_CONFIG_KIND, decode_gpu),
    (CHANNEL_CONFIG_API_VERSION, CHANNEL_CONFIG_KIND, decode_channel),
];

/// Decodes an opaque payload by its type discriminator.
///
/// # Errors
///
/// - [`PluginError::InvalidConfig`] for unknown kinds or payloads that do not
///   match their schema
pub fn decode_config(parameters: &Value) -> PluginResult<DeviceConfig> {
    let meta: TypeMeta =
        serde_json::from_value(parameters.clone()).change_context(PluginError::InvalidConfig {
            message: "config parameters carry no apiVersion/kind".to_string(),
        })?;

    let (_, _, decode) = DECODERS
        .iter()
        .find(|(api_version, kind, _)| *api_version == meta.api_version && *kind == meta.kind)
        .ok_or_else(|| {
            Report::new(PluginError::InvalidConfig {
                message: format!(
                    "unknown config type {}/{}",
                    meta.api_version, meta.kind
                ),
            })
        })?;

    decode(parameters.clone()).change_context(PluginError::InvalidConfig {
        message: format!("failed to decode {}/{}", meta.api_version, meta.kind),
    })
}

/// A decoded config and the requests it is restricted to
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueDeviceConfig {
    /// Empty means every request
    pub requests: Vec<String>,
    pub config: DeviceConfig,
}

impl OpaqueDeviceConfig {
    pub fn for_all_requests(config: DeviceConfig) -> Self {
        Self {
            requests: Vec::new(),
            config,
        }
    }

    fn matches(&self, request: &str) -> bool {
        self.requests.is_empty() || self.requests.iter().any(|r| r == request)
    }
}

/// Decodes the configs addressed to `driver`, lowest precedence first.
///
/// Configs for other drivers are skipped since a request may be satisfiable
/// by more than one driver.
pub fn driver_configs(
    driver: &str,
    configs: &[OpaqueConfig],
) -> PluginResult<Vec<OpaqueDeviceConfig>> {
    let class_scoped = configs.iter().filter(|c| c.scope == ConfigScope::Class);
    let claim_scoped = configs.iter().filter(|c| c.scope == ConfigScope::Claim);

    class_scoped
        .chain(claim_scoped)
        .filter(|c| c.driver == driver)
        .map(|c| {
            decode_config(&c.parameters).map(|config| OpaqueDeviceConfig {
                requests: c.requests.clone(),
                config,
            })
        })
        .collect()
}

/// Allocation results bound to one config
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigGroup<'r> {
    pub config: DeviceConfig,
    /// Results with their index in the allocation
    pub results: Vec<(usize, &'r AllocationResult)>,
}

/// Binds every allocation result to the highest precedence matching config.
///
/// Groups are returned in config order and only for configs that bound at
/// least one result.
pub fn resolve<'r>(
    default: DeviceConfig,
    configs: Vec<OpaqueDeviceConfig>,
    results: &'r [AllocationResult],
) -> Vec<ConfigGroup<'r>> {
    let mut candidates = Vec::with_capacity(configs.len() + 1);
    candidates.push(OpaqueDeviceConfig::for_all_requests(default));
    candidates.extend(configs);

    let mut bound: Vec<Vec<(usize, &'r AllocationResult)>> = vec![Vec::new(); candidates.len()];
    for (index, result) in results.iter().enumerate() {
        // The default at position 0 matches every request.
        let winner = candidates
            .iter()
            .rposition(|c| c.matches(&result.request))
            .unwrap_or(0);
        bound[winner].push((index, result));
    }

    candidates
        .into_iter()
        .zip(bound)
        .filter(|(_, results)| !results.is_empty())
        .map(|(candidate, results)| ConfigGroup {
            config: candidate.config,
            results,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use api_types::config::GpuSharing;
    use api_types::config::SharingStrategy;
    use api_types::config::SpacePartitioningConfig;
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const DRIVER: &str = "gpu.nvidia.com";

    fn result(request: &str, device: &str) -> AllocationResult {
        AllocationResult {
            request: request.to_string(),
            driver: DRIVER.to_string(),
            pool: "node-a".to_string(),
            device: device.to_string(),
        }
    }

    fn partitioned(count: u32) -> DeviceConfig {
        DeviceConfig::Gpu(GpuConfig {
            sharing: Some(GpuSharing {
                strategy: SharingStrategy::SpacePartitioning,
                time_slicing_config: None,
                space_partitioning_config: Some(SpacePartitioningConfig {
                    partition_count: count,
                }),
            }),
        })
    }

    fn opaque(scope: ConfigScope, driver: &str, requests: &[&str], count: u32) -> OpaqueConfig {
        OpaqueConfig {
            scope,
            driver: driver.to_string(),
            requests: requests.iter().map(|r| r.to_string()).collect(),
            parameters: json!({
                "apiVersion": GPU_CONFIG_API_VERSION,
                "kind": GPU_CONFIG_KIND,
                "sharing": {
                    "strategy": "SpacePartitioning",
                    "spacePartitioningConfig": {"partitionCount": count}
                }
            }),
        }
    }

    #[test]
    fn claim_config_wins_only_for_targeted_request() {
        let results = vec![result("r1", "gpu-0"), result("r2", "gpu-1")];
        let configs = vec![OpaqueDeviceConfig {
            requests: vec!["r1".to_string()],
            config: partitioned(4),
        }];

        let groups = resolve(DeviceConfig::Gpu(GpuConfig::default()), configs, &results);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].config, DeviceConfig::Gpu(GpuConfig::default()));
        assert_eq!(groups[0].results, vec![(1, &results[1])]);
        assert_eq!(groups[1].config, partitioned(4));
        assert_eq!(groups[1].results, vec![(0, &results[0])]);
    }

    #[test]
    fn later_configs_take_precedence() {
        let results = vec![result("r1", "gpu-0")];
        let configs = vec![
            OpaqueDeviceConfig::for_all_requests(partitioned(2)),
            OpaqueDeviceConfig::for_all_requests(partitioned(3)),
        ];

        let groups = resolve(DeviceConfig::Gpu(GpuConfig::default()), configs, &results);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].config, partitioned(3));
    }

    #[test]
    fn every_result_binds_exactly_once() {
        let results = vec![
            result("a", "gpu-0"),
            result("b", "gpu-1"),
            result("c", "gpu-2"),
        ];
        let configs = vec![OpaqueDeviceConfig {
            requests: vec!["b".to_string(), "c".to_string()],
            config: partitioned(2),
        }];

        let groups = resolve(DeviceConfig::Gpu(GpuConfig::default()), configs, &results);
        let mut indices: Vec<usize> = groups
            .iter()
            .flat_map(|g| g.results.iter().map(|(i, _)| *i))
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn class_configs_precede_claim_configs() {
        let configs = vec![
            opaque(ConfigScope::Claim, DRIVER, &[], 5),
            opaque(ConfigScope::Class, DRIVER, &[], 7),
        ];

        let decoded = driver_configs(DRIVER, &configs).expect("decode");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].config, partitioned(7));
        assert_eq!(decoded[1].config, partitioned(5));
    }

    #[test]
    fn configs_for_other_drivers_are_skipped() {
        let configs = vec![
            opaque(ConfigScope::Claim, "other.example.com", &[], 5),
            opaque(ConfigScope::Claim, DRIVER, &["r1"], 2),
        ];

        let decoded = driver_configs(DRIVER, &configs).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].requests, vec!["r1".to_string()]);
    }

    #[test]
    fn unknown_kind_is_invalid_config() {
        let err = decode_config(&json!({"apiVersion": "example.com/v1", "kind": "Mystery"}))
            .expect_err("unknown kind");
        assert!(matches!(
            err.current_context(),
            PluginError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn schema_mismatch_is_invalid_config() {
        let err = decode_config(&json!({
            "apiVersion": CHANNEL_CONFIG_API_VERSION,
            "kind": CHANNEL_CONFIG_KIND,
            "domainID": 42
        }))
        .expect_err("domainID must be a string");
        assert!(matches!(
            err.current_context(),
            PluginError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn channel_config_decodes() {
        let config = decode_config(&json!({
            "apiVersion": CHANNEL_CONFIG_API_VERSION,
            "kind": CHANNEL_CONFIG_KIND,
            "domainID": "d1"
        }))
        .expect("decode");
        assert_eq!(
            config,
            DeviceConfig::ComputeDomainChannel(ComputeDomainChannelConfig {
                domain_id: "d1".to_string()
            })
        );
    }
}
