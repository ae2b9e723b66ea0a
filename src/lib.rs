//! # proxcri
//!
//! **Container Runtime Interface semantics on top of Proxmox VE LXC guests**
//!
//! This crate turns a Proxmox VE cluster into a pod/container backend. OCI
//! images are pulled, verified and flattened into LXC templates; each
//! container becomes one LXC guest; pods group guests under a shared
//! lifecycle with hooks, port forwards and namespace sharing.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              proxcri                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │              PodRuntime (OrchestrationManager)              │    │
//! │  │  create_pod → start_pod → stop_pod → delete_pod             │    │
//! │  │  hooks │ port forwards │ apply_resources │ share_namespace   │    │
//! │  └──────────────┬──────────────────────────────┬───────────────┘    │
//! │                 │                              │                    │
//! │  ┌──────────────┴──────────────┐  ┌────────────┴───────────────┐    │
//! │  │        ImagePipeline        │  │     HypervisorGateway      │    │
//! │  │  resolve → fetch → verify   │  │  host failover │ retries   │    │
//! │  │  layer cache │ rootfs       │  │  node cache │ task polling │    │
//! │  │  whiteouts │ template export│  │  LXC guest operations      │    │
//! │  └──────────────┬──────────────┘  └────────────┬───────────────┘    │
//! ├─────────────────┼──────────────────────────────┼────────────────────┤
//! │          OCI registries               Proxmox VE REST API           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐   create   ┌─────────┐   start   ┌─────────┐
//!   │ (none)  │ ─────────► │ Created │ ────────► │ Running │ ◄──┐
//!   └─────────┘            └─────────┘           └────┬────┘    │
//!                               │                     │ stop    │ start
//!                               │ delete              ▼         │
//!                               │                ┌─────────┐    │
//!                               ▼                │ Stopped │ ───┘
//!                          ┌─────────┐  delete   └─────────┘
//!                          │ Deleted │ ◄──────────────┘
//!                          └─────────┘
//! ```
//!
//! `Unknown` is entered when the hypervisor reports something the manager
//! cannot map; start and stop are both permitted from it.
//!
//! # Security Model
//!
//! - **Path Traversal Protection**: layer extraction resolves every entry
//!   inside the rootfs and rejects `..` and symlink escapes
//!   (see [`rootfs::resolve_in_root`]).
//! - **Size Limits**: bounded constants cap manifests, layers and the
//!   flattened rootfs (see [`constants`]).
//! - **Digest Verification**: blobs are hashed before they enter the layer
//!   cache (see [`storage::LayerCache`]).
//! - **Timeouts**: every API call, pull and hook is bounded.
//!
//! # Example
//!
//! ```rust,ignore
//! use proxcri::{
//!     Config, HypervisorGateway, ImagePipeline, OciRegistryFetcher, OrchestrationManager,
//!     PodRuntime, PodSpec,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> proxcri::Result<()> {
//!     let config = Config::load("/etc/proxcri/config.yaml".as_ref())?;
//!     let gateway = Arc::new(HypervisorGateway::new(&config.gateway)?);
//!     let fetcher = Arc::new(OciRegistryFetcher::new());
//!     let images = Arc::new(ImagePipeline::new(&config.images, fetcher)?);
//!     let manager = OrchestrationManager::new(gateway, images, config.runtime)?;
//!
//!     let spec = PodSpec::from_yaml(&std::fs::read("pod.yaml")?)?;
//!     let pod = manager.create_pod(&spec).await?;
//!     manager.start_pod(&pod.id).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod gateway;
pub mod image;
pub mod pod;
pub mod registry;
pub mod rootfs;
pub mod storage;

// Re-exports
pub use config::{Config, GatewayConfig, ImageStoreConfig, RuntimeConfig};
pub use constants::*;
pub use error::{Error, Result};
pub use gateway::{Guest, GuestConfig, GuestState, HypervisorGateway, NodeInfo, Transport};
pub use image::{Image, ImageMetadata, ImagePipeline};
pub use pod::{
    ContainerId, ContainerInfo, ContainerSpec, ContainerStatus, NamespaceKind, OrchestrationManager,
    PodId, PodPhase, PodRuntime, PodSpec, PodStatus, PodSummary,
};
pub use registry::{OciRegistryFetcher, RegistryFetcher};
pub use storage::LayerCache;
