use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::plugin::PluginArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the simulated GPU DRA plugin
    Gpu(PluginArgs),
    /// Run the compute domain DRA plugin
    #[command(name = "compute-domain")]
    ComputeDomain(PluginArgs),
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::plugin::PluginKind;

    #[test]
    fn parses_compute_domain_subcommand() {
        let cli = Cli::try_parse_from([
            "fake-dra-plugin",
            "compute-domain",
            "--node-name",
            "node-a",
            "--inventory-refresh-secs",
            "5",
        ])
        .expect("valid arguments");

        let Commands::ComputeDomain(args) = cli.command else {
            panic!("expected compute-domain subcommand");
        };
        assert_eq!(args.node_name, "node-a");
        assert_eq!(args.inventory_refresh_secs, 5);
        assert_eq!(
            args.plugin_dir(PluginKind::ComputeDomain),
            std::path::PathBuf::from("/var/lib/kubelet/plugins/compute-domain.nvidia.com")
        );
    }

    #[test]
    fn gpu_defaults() {
        let cli = Cli::try_parse_from(["fake-dra-plugin", "gpu", "--node-name", "node-a"])
            .expect("valid arguments");
        let Commands::Gpu(args) = cli.command else {
            panic!("expected gpu subcommand");
        };
        assert_eq!(args.cdi_root, std::path::PathBuf::from("/etc/cdi"));
        assert_eq!(args.healthcheck_addr, None);
        assert_eq!(args.topology_server_url, None);
    }
}
