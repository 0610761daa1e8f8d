use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::error::DiscoveryError;

/// Builds the client used to read the node object.
///
/// An explicit kubeconfig wins, otherwise the in-cluster service account or
/// `~/.kube/config` is used.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<DiscoveryError>> {
    let Some(kubeconfig_path) = kubeconfig else {
        return Client::try_default()
            .await
            .change_context(DiscoveryError::Unreachable {
                message: "failed to create default Kubernetes client".to_string(),
            });
    };

    let kubeconfig =
        Kubeconfig::read_from(&kubeconfig_path).change_context(DiscoveryError::Unreachable {
            message: format!("failed to read kubeconfig {}", kubeconfig_path.display()),
        })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context(DiscoveryError::Unreachable {
            message: format!("invalid kubeconfig {}", kubeconfig_path.display()),
        })?;

    Client::try_from(config).change_context(DiscoveryError::Unreachable {
        message: "failed to create Kubernetes client from kubeconfig".to_string(),
    })
}
