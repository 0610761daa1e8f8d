//! provides logging helpers

use std::str::FromStr;

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Output format of the stderr log layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}`, expected `text` or `json`")),
        }
    }
}

/// initiate the global tracing subscriber
///
/// The level defaults to `INFO` and can be overridden through `RUST_LOG`.
pub fn init(format: LogFormat) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    match format {
        LogFormat::Text => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter);
            registry().with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_filter(env_filter);
            registry().with(fmt_layer).init();
        }
    }
}
