use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use error_stack::Report;
use error_stack::ResultExt;
use utils::logging::LogFormat;

use crate::error::PluginError;
use crate::error::PluginResult;

#[derive(Args, Debug, Clone)]
pub struct PluginArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this plugin instance serves"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "CDI_ROOT",
        default_value = "/etc/cdi",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the container runtime reads CDI specs from"
    )]
    pub cdi_root: PathBuf,

    #[arg(
        long,
        env = "KUBELET_PLUGINS_DIRECTORY_PATH",
        default_value = "/var/lib/kubelet/plugins",
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet plugin directory; plugin state lives in <dir>/<driver-name>"
    )]
    pub kubelet_plugins_dir: PathBuf,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "TOPOLOGY_SERVER_URL",
        value_hint = clap::ValueHint::Url,
        help = "Fetch the node topology over HTTP instead of reading the node annotation"
    )]
    pub topology_server_url: Option<String>,

    #[arg(
        long,
        env = "INVENTORY_REFRESH_SECS",
        default_value_t = 30,
        help = "Seconds between device inventory refreshes"
    )]
    pub inventory_refresh_secs: u64,

    #[arg(
        long,
        env = "INVENTORY_WAIT_SECS",
        default_value_t = 10,
        help = "Seconds a new claim waits for the first device inventory"
    )]
    pub inventory_wait_secs: u64,

    #[arg(
        long,
        env = "HEALTHCHECK_ADDR",
        help = "Listen address of the healthcheck server, e.g. 0.0.0.0:51515 (disabled when unset)"
    )]
    pub healthcheck_addr: Option<String>,

    #[arg(
        long,
        env = "LOG_FORMAT",
        default_value = "text",
        help = "Log output format: text or json"
    )]
    pub log_format: LogFormat,
}

impl PluginArgs {
    /// Per-driver state directory under the kubelet plugin directory.
    pub fn plugin_dir(&self, kind: PluginKind) -> PathBuf {
        self.kubelet_plugins_dir.join(kind.driver_name())
    }

    pub fn inventory_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_refresh_secs.max(1))
    }

    pub fn inventory_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.inventory_wait_secs)
    }

    /// Creates the plugin directory and the CDI root.
    ///
    /// # Errors
    ///
    /// - [`PluginError::CheckpointIo`] if the plugin directory cannot be created
    /// - [`PluginError::DescriptorIo`] if the CDI root cannot be created or is
    ///   not a directory
    pub fn ensure_directories(&self, kind: PluginKind) -> PluginResult<()> {
        let plugin_dir = self.plugin_dir(kind);
        fs::create_dir_all(&plugin_dir).change_context(PluginError::CheckpointIo {
            message: format!("failed to create plugin directory {}", plugin_dir.display()),
        })?;

        fs::create_dir_all(&self.cdi_root).change_context(PluginError::DescriptorIo {
            message: format!("failed to create CDI root {}", self.cdi_root.display()),
        })?;
        if !self.cdi_root.is_dir() {
            return Err(Report::new(PluginError::DescriptorIo {
                message: format!("CDI root {} is not a directory", self.cdi_root.display()),
            }));
        }
        Ok(())
    }
}

/// The two plugin flavors served by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PluginKind {
    #[display("gpu")]
    Gpu,
    #[display("compute-domain")]
    ComputeDomain,
}

impl PluginKind {
    pub fn driver_name(self) -> &'static str {
        match self {
            Self::Gpu => "gpu.nvidia.com",
            Self::ComputeDomain => "compute-domain.nvidia.com",
        }
    }

    pub fn cdi_vendor(self) -> &'static str {
        match self {
            Self::Gpu => "k8s.gpu.nvidia.com",
            Self::ComputeDomain => "k8s.compute-domain.nvidia.com",
        }
    }

    pub fn cdi_class(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::ComputeDomain => "computedomain",
        }
    }

    pub fn checkpoint_file(self) -> &'static str {
        match self {
            Self::Gpu => "checkpoint.json",
            Self::ComputeDomain => "computedomain-checkpoint.json",
        }
    }
}
