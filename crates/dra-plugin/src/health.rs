//! HTTP liveness endpoints.

use core::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::PluginResult;

/// Something that can tell whether the plugin is serving.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self) -> PluginResult<()>;
}

#[derive(Debug, derive_more::Display)]
pub enum HealthError {
    #[display("Healthcheck server failed: {message}")]
    ServerError { message: String },
}

impl Error for HealthError {}

type SharedProbe = Arc<dyn HealthProbe>;

#[handler]
async fn healthz(Data(probe): Data<&SharedProbe>) -> StatusCode {
    match probe.check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("Healthcheck failed: {e:?}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub fn routes(probe: SharedProbe) -> impl poem::Endpoint {
    Route::new()
        .at("/healthz", get(healthz))
        .at("/liveness", get(healthz))
        .data(probe)
        .with(Tracing)
}

pub struct HealthServer {
    listen_addr: String,
    probe: SharedProbe,
}

impl HealthServer {
    pub fn new(listen_addr: impl Into<String>, probe: SharedProbe) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            probe,
        }
    }

    /// Serves until `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`HealthError::ServerError`] if the listener cannot bind or the
    ///   server stops on its own
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Report<HealthError>> {
        info!("Starting healthcheck server on {}", self.listen_addr);

        let server = Server::new(TcpListener::bind(&self.listen_addr));
        select! {
            result = server.run(routes(self.probe)) => {
                result.map_err(|e| {
                    error!("Healthcheck server failed: {e}");
                    Report::new(HealthError::ServerError {
                        message: e.to_string(),
                    })
                })
            }
            _ = cancel.cancelled() => {
                info!("Healthcheck server shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use poem::test::TestClient;
    use test_log::test;

    use super::*;
    use crate::error::PluginError;

    struct FixedProbe(bool);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn check(&self) -> PluginResult<()> {
            if self.0 {
                Ok(())
            } else {
                Err(Report::new(PluginError::CheckpointIo {
                    message: "unreadable".to_string(),
                }))
            }
        }
    }

    #[test(tokio::test)]
    async fn healthy_probe_returns_ok() {
        let client = TestClient::new(routes(Arc::new(FixedProbe(true))));
        client.get("/healthz").send().await.assert_status_is_ok();
        client.get("/liveness").send().await.assert_status_is_ok();
    }

    #[test(tokio::test)]
    async fn failing_probe_returns_unavailable() {
        let client = TestClient::new(routes(Arc::new(FixedProbe(false))));
        client
            .get("/healthz")
            .send()
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }
}
