use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::engine::ClaimPreparer;
use crate::health::HealthProbe;
use crate::health::HealthServer;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Tasks {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token,
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks<P: ClaimPreparer>(&mut self, app: &Application<P>) {
        let refresher_task = self.spawn_inventory_refresher_task(app);
        self.tasks.push(refresher_task);

        if let Some(listen_addr) = app.args().healthcheck_addr.clone() {
            let health_task = self.spawn_health_server_task(app, listen_addr);
            self.tasks.push(health_task);
        }
    }

    /// Wait for a shutdown signal, an unrecoverable error or a task exiting
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        let mut failure = None;
        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
            }
            _ = self.cancellation_token.cancelled() => {
                failure = Some(anyhow::anyhow!("plugin stopped after an unrecoverable error"));
            }
            result = futures::future::select_all(&mut self.tasks), if !self.tasks.is_empty() => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    failure = Some(e.into());
                } else {
                    tracing::warn!("Task completed unexpectedly");
                }
            }
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;

        failure.map_or(Ok(()), Err)
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        tokio::time::timeout(timeout, async {
            for task in tasks {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_inventory_refresher_task<P: ClaimPreparer>(
        &self,
        app: &Application<P>,
    ) -> JoinHandle<()> {
        let refresher = app.services().refresher.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting inventory refresher task");
            refresher.run(token).await;
            tracing::info!("Inventory refresher task completed");
        })
    }

    fn spawn_health_server_task<P: ClaimPreparer>(
        &self,
        app: &Application<P>,
        listen_addr: String,
    ) -> JoinHandle<()> {
        let probe: Arc<dyn HealthProbe> = app.services().driver.clone();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            let server = HealthServer::new(listen_addr, probe);
            if let Err(e) = server.run(token).await {
                tracing::error!("Healthcheck server failed: {e:?}");
            } else {
                tracing::info!("Healthcheck server completed");
            }
        })
    }
}
