use anyhow::Result;
use clap::Parser;
use dra_plugin::app::ApplicationBuilder;
use dra_plugin::config::Cli;
use dra_plugin::config::Commands;
use dra_plugin::config::PluginArgs;
use dra_plugin::config::PluginKind;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gpu(args) => run_gpu(args).await,
        Commands::ComputeDomain(args) => run_compute_domain(args).await,
    }
}

fn init_logging(args: &PluginArgs, kind: PluginKind) {
    logging::init(args.log_format);
    tracing::info!(
        "Starting {kind} DRA plugin {} on node {}",
        &**version::VERSION,
        args.node_name
    );
}

async fn run_gpu(args: PluginArgs) -> Result<()> {
    init_logging(&args, PluginKind::Gpu);

    let app = ApplicationBuilder::new(args).build_gpu().await?;
    app.run().await?;
    app.shutdown().await?;
    Ok(())
}

async fn run_compute_domain(args: PluginArgs) -> Result<()> {
    init_logging(&args, PluginKind::ComputeDomain);

    let app = ApplicationBuilder::new(args).build_compute_domain().await?;
    app.run().await?;
    app.shutdown().await?;
    Ok(())
}
