use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::PluginArgs;
use crate::config::PluginKind;
use crate::engine::ClaimPreparer;

/// A fully built plugin process
pub struct Application<P> {
    services: ApplicationServices<P>,
    args: PluginArgs,
    kind: PluginKind,
    /// Root token; cancelled on shutdown signals and unrecoverable errors
    cancellation_token: CancellationToken,
}

impl<P: ClaimPreparer> Application<P> {
    pub fn new(
        services: ApplicationServices<P>,
        args: PluginArgs,
        kind: PluginKind,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            services,
            args,
            kind,
            cancellation_token,
        }
    }

    pub fn services(&self) -> &ApplicationServices<P> {
        &self.services
    }

    pub fn args(&self) -> &PluginArgs {
        &self.args
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!(plugin = %self.kind, "Starting all application tasks...");

        let mut tasks = Tasks::new(self.cancellation_token.clone());
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {e}");
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Logs the final checkpoint state. Claims stay prepared across restarts.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");

        match self.services.driver.engine().checkpoint().await {
            Ok(checkpoint) => tracing::info!(
                prepared_claims = checkpoint.v1.prepared_claims.len(),
                domains = checkpoint.v1.domains.len(),
                "Checkpoint state at shutdown"
            ),
            Err(e) => tracing::warn!("Failed to read checkpoint at shutdown: {e:?}"),
        }

        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
