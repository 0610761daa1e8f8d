use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::cdi::device_node::ChannelDeviceNodes;
use crate::cdi::CdiHandler;
use crate::checkpoint::CheckpointStore;
use crate::config::PluginArgs;
use crate::config::PluginKind;
use crate::driver::Driver;
use crate::engine::ClaimPreparer;
use crate::engine::ComputeDomainPreparer;
use crate::engine::GpuPreparer;
use crate::engine::PreparationEngine;
use crate::inventory::discovery::ChannelSource;
use crate::inventory::discovery::DeviceSource;
use crate::inventory::discovery::NodeAnnotationSource;
use crate::inventory::discovery::TopologyServerSource;
use crate::inventory::refresher::InventoryRefresher;
use crate::inventory::DeviceInventory;
use crate::kube_client::init_kube_client;

/// Application builder
pub struct ApplicationBuilder {
    args: PluginArgs,
}

impl ApplicationBuilder {
    pub fn new(args: PluginArgs) -> Self {
        Self { args }
    }

    /// Builds the simulated GPU plugin.
    pub async fn build_gpu(self) -> Result<Application<GpuPreparer>> {
        let kind = PluginKind::Gpu;
        let source = self.gpu_device_source().await?;
        let cdi = self.cdi_handler(kind).with_common_device_id();
        self.build(kind, GpuPreparer::new(kind.driver_name()), cdi, source)
    }

    /// Builds the compute domain plugin.
    pub async fn build_compute_domain(self) -> Result<Application<ComputeDomainPreparer>> {
        let kind = PluginKind::ComputeDomain;
        let preparer = ComputeDomainPreparer::new(
            kind.driver_name(),
            self.args.node_name.clone(),
            ChannelDeviceNodes::new(&self.args.plugin_dir(kind)),
        );
        let cdi = self.cdi_handler(kind);
        self.build(kind, preparer, cdi, Arc::new(ChannelSource))
    }

    fn build<P: ClaimPreparer>(
        self,
        kind: PluginKind,
        preparer: P,
        cdi: CdiHandler,
        source: Arc<dyn DeviceSource>,
    ) -> Result<Application<P>> {
        tracing::info!(
            plugin = %kind,
            node = %self.args.node_name,
            "Building application components..."
        );

        self.args
            .ensure_directories(kind)
            .map_err(|e| anyhow::anyhow!("Failed to prepare plugin directories: {e:?}"))?;

        let cancellation_token = CancellationToken::new();
        let inventory = Arc::new(DeviceInventory::new());
        let refresher = Arc::new(InventoryRefresher::new(
            source,
            inventory.clone(),
            self.args.inventory_refresh_interval(),
        ));

        let store = CheckpointStore::new(self.args.plugin_dir(kind), kind.checkpoint_file());
        let engine = PreparationEngine::new(store, cdi, inventory.clone(), preparer)
            .map_err(|e| anyhow::anyhow!("Failed to initialize preparation engine: {e:?}"))?
            .with_inventory_timeout(self.args.inventory_wait_timeout());
        let driver = Arc::new(Driver::new(Arc::new(engine), cancellation_token.clone()));

        let services = ApplicationServices {
            driver,
            inventory,
            refresher,
        };
        Ok(Application::new(services, self.args, kind, cancellation_token))
    }

    fn cdi_handler(&self, kind: PluginKind) -> CdiHandler {
        CdiHandler::new(&self.args.cdi_root, kind.cdi_vendor(), kind.cdi_class())
    }

    async fn gpu_device_source(&self) -> Result<Arc<dyn DeviceSource>> {
        if let Some(url) = &self.args.topology_server_url {
            tracing::info!(url = %url, "Discovering devices from topology server");
            return Ok(Arc::new(TopologyServerSource::new(
                url.clone(),
                self.args.node_name.clone(),
            )));
        }

        tracing::info!("Discovering devices from node annotation");
        let client = init_kube_client(self.args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize Kubernetes client: {e:?}"))?;
        Ok(Arc::new(NodeAnnotationSource::new(
            client,
            self.args.node_name.clone(),
        )))
    }
}
