//! proxcri - Proxmox LXC container runtime CLI
//!
//! Thin operator front-end over the library: inspects the cluster, manages
//! the local image store and runs a pod manifest to completion.
//!
//! ## Usage
//!
//! ```sh
//! proxcri --config /etc/proxcri/config.yaml nodes
//! proxcri guests
//! proxcri pull docker.io/library/nginx:1.27
//! proxcri images
//! proxcri inspect <image-id>
//! proxcri rmi <image-id>
//! proxcri prune
//! proxcri export <image-id> --dir /var/lib/vz/template/cache
//! proxcri run pod.yaml [--rm]
//! ```
//!
//! Logging goes to stderr and honors `RUST_LOG`; command output goes to
//! stdout as JSON or tab-separated tables.

use clap::{Parser, Subcommand};
use proxcri::{
    Config, HypervisorGateway, ImagePipeline, OciRegistryFetcher, OrchestrationManager,
    PodRuntime, PodSpec,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/proxcri/config.yaml";

#[derive(Debug, Parser)]
#[command(name = "proxcri", version, about = "CRI semantics on Proxmox VE LXC guests")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, env = "PROXCRI_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List cluster nodes.
    Nodes,
    /// List LXC guests on every online node.
    Guests,
    /// Pull an image into the local store.
    Pull { reference: String },
    /// List stored images.
    Images,
    /// Print an image's metadata.
    Inspect { id: String },
    /// Remove a stored image.
    Rmi { id: String },
    /// Remove layer blobs no image references.
    Prune,
    /// Package an image's rootfs as an LXC template.
    Export {
        id: String,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Create and start a pod from a manifest, print its status.
    Run {
        manifest: PathBuf,
        /// Wait for Ctrl-C, then stop and delete the pod.
        #[arg(long)]
        rm: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> proxcri::Result<Config> {
    Config::load(path)
}

fn image_pipeline(config: &Config) -> proxcri::Result<Arc<ImagePipeline>> {
    let fetcher = Arc::new(OciRegistryFetcher::new());
    Ok(Arc::new(ImagePipeline::new(&config.images, fetcher)?))
}

fn print_json<T: serde::Serialize>(value: &T) -> proxcri::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| proxcri::Error::Serialization(e.to_string()))?;
    println!("{json}");
    Ok(())
}

async fn run(cli: Cli) -> proxcri::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Nodes => {
            let gateway = HypervisorGateway::new(&config.gateway)?;
            println!("NODE\tSTATUS");
            for node in gateway.get_nodes().await? {
                println!("{}\t{}", node.name, node.status);
            }
        }
        Command::Guests => {
            let gateway = HypervisorGateway::new(&config.gateway)?;
            println!("VMID\tNAME\tNODE\tSTATUS");
            for guest in gateway.list_guests().await? {
                println!("{}\t{}\t{}\t{}", guest.vmid, guest.name, guest.node, guest.status);
            }
        }
        Command::Pull { reference } => {
            let image = image_pipeline(&config)?.pull(&reference).await?;
            print_json(&image)?;
        }
        Command::Images => {
            println!("ID\tNAME\tTAG\tSIZE");
            for image in image_pipeline(&config)?.list_images()? {
                let short = image.id.get(..12).unwrap_or(&image.id);
                println!("{}\t{}\t{}\t{}", short, image.name, image.tag, image.size);
            }
        }
        Command::Inspect { id } => {
            print_json(&image_pipeline(&config)?.inspect(&id)?)?;
        }
        Command::Rmi { id } => {
            image_pipeline(&config)?.remove_image(&id)?;
            eprintln!("Removed image {id}");
        }
        Command::Prune => {
            let stats = image_pipeline(&config)?.prune_layers().await?;
            eprintln!(
                "Removed {} layers ({} bytes), {} partial downloads",
                stats.removed_count, stats.freed_bytes, stats.removed_partials
            );
        }
        Command::Export { id, dir } => {
            let path = image_pipeline(&config)?.export_template(&id, &dir).await?;
            println!("{}", path.display());
        }
        Command::Run { manifest, rm } => {
            let raw = std::fs::read(&manifest)?;
            let spec = PodSpec::from_yaml(&raw)?;
            let gateway = Arc::new(HypervisorGateway::new(&config.gateway)?);
            let images = image_pipeline(&config)?;
            let manager = OrchestrationManager::new(gateway, images, config.runtime)?;

            let created = manager.create_pod(&spec).await?;
            manager.start_pod(&created.id).await?;
            print_json(&manager.refresh_pod(&created.id).await?)?;

            if rm {
                info!(pod = %created.id, "Waiting for Ctrl-C");
                tokio::signal::ctrl_c().await?;
                if let Err(e) = manager.stop_pod(&created.id).await {
                    warn!(pod = %created.id, "stop failed: {e}");
                }
                manager.delete_pod(&created.id).await?;
                eprintln!("Deleted pod {}", created.id);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
