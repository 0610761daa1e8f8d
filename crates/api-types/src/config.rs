//! Opaque device configuration schemas understood by the plugins

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// API group/version of [`GpuConfig`]
pub const GPU_CONFIG_API_VERSION: &str = "gpu.resource.example.com/v1alpha1";
pub const GPU_CONFIG_KIND: &str = "GpuConfig";

/// API group/version of [`ComputeDomainChannelConfig`]
pub const CHANNEL_CONFIG_API_VERSION: &str = "resource.nvidia.com/v1beta1";
pub const CHANNEL_CONFIG_KIND: &str = "ComputeDomainChannelConfig";

/// Type discriminator carried by every opaque payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

/// Errors raised by [`GpuConfig::normalize`] and [`GpuConfig::validate`]
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sharing strategy {strategy} does not accept {config}")]
    MismatchedSharingConfig {
        strategy: SharingStrategy,
        config: &'static str,
    },
    #[error("missing {config} for sharing strategy {strategy}")]
    MissingSharingConfig {
        strategy: SharingStrategy,
        config: &'static str,
    },
    #[error("partition count must be at least 1, got {0}")]
    InvalidPartitionCount(u32),
}

/// Every decoded config the plugins know about
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceConfig {
    Gpu(GpuConfig),
    ComputeDomainChannel(ComputeDomainChannelConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharingStrategy {
    TimeSlicing,
    SpacePartitioning,
}

impl fmt::Display for SharingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeSliceInterval {
    #[default]
    Default,
    Short,
    Medium,
    Long,
}

impl fmt::Display for TimeSliceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlicingConfig {
    #[serde(default)]
    pub interval: TimeSliceInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpacePartitioningConfig {
    pub partition_count: u32,
}

impl Default for SpacePartitioningConfig {
    fn default() -> Self {
        Self { partition_count: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuSharing {
    pub strategy: SharingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_slicing_config: Option<TimeSlicingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_partitioning_config: Option<SpacePartitioningConfig>,
}

/// Sharing configuration for simulated GPUs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<GpuSharing>,
}

impl Default for GpuConfig {
    /// Time-slicing with the default interval
    fn default() -> Self {
        Self {
            sharing: Some(GpuSharing {
                strategy: SharingStrategy::TimeSlicing,
                time_slicing_config: Some(TimeSlicingConfig::default()),
                space_partitioning_config: None,
            }),
        }
    }
}

impl GpuConfig {
    /// Fills in implied defaults.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        let Some(sharing) = self.sharing.as_mut() else {
            *self = Self::default();
            return Ok(());
        };

        match sharing.strategy {
            SharingStrategy::TimeSlicing if sharing.time_slicing_config.is_none() => {
                sharing.time_slicing_config = Some(TimeSlicingConfig::default());
            }
            SharingStrategy::SpacePartitioning if sharing.space_partitioning_config.is_none() => {
                sharing.space_partitioning_config = Some(SpacePartitioningConfig::default());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(sharing) = &self.sharing else {
            return Ok(());
        };

        match sharing.strategy {
            SharingStrategy::TimeSlicing => {
                if sharing.space_partitioning_config.is_some() {
                    return Err(ConfigError::MismatchedSharingConfig {
                        strategy: sharing.strategy,
                        config: "spacePartitioningConfig",
                    });
                }
                if sharing.time_slicing_config.is_none() {
                    return Err(ConfigError::MissingSharingConfig {
                        strategy: sharing.strategy,
                        config: "timeSlicingConfig",
                    });
                }
            }
            SharingStrategy::SpacePartitioning => {
                if sharing.time_slicing_config.is_some() {
                    return Err(ConfigError::MismatchedSharingConfig {
                        strategy: sharing.strategy,
                        config: "timeSlicingConfig",
                    });
                }
                match &sharing.space_partitioning_config {
                    None => {
                        return Err(ConfigError::MissingSharingConfig {
                            strategy: sharing.strategy,
                            config: "spacePartitioningConfig",
                        })
                    }
                    Some(cfg) if cfg.partition_count == 0 => {
                        return Err(ConfigError::InvalidPartitionCount(cfg.partition_count))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Binds a compute-domain channel claim to its domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDomainChannelConfig {
    #[serde(rename = "domainID")]
    pub domain_id: String,
}
