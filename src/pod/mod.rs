//! # Pod Orchestration
//!
//! Kubernetes-style pods and containers realized as Proxmox LXC guests.
//! Each container is one guest; a pod is an ordered group of containers
//! sharing lifecycle, port forwards and, optionally, namespaces.
//!
//! ## Lifecycle
//!
//! ```text
//! create_pod(spec)                     container state machine
//! ────────────────                     ───────────────────────
//! validate spec                          Created ──▶ Running ⇄ Stopped
//! prestart hooks                            │                    │
//! per container:                            └────────────────────┴──▶ deleted
//!   prepare image ─▶ allocate vmid ─▶ create guest
//!   (failure: delete guests created so far)
//! register pod (Pending)
//! poststart hooks
//! ```
//!
//! The pod phase is never stored; it is computed from the members:
//!
//! | Members                | Phase     |
//! |------------------------|-----------|
//! | all `Created`          | `Pending` |
//! | all `Running`          | `Running` |
//! | all `Stopped`          | `Stopped` |
//! | anything else          | `Unknown` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use proxcri::pod::{OrchestrationManager, PodRuntime, PodSpec};
//!
//! let manager = OrchestrationManager::new(gateway, images, config.runtime)?;
//! let spec = PodSpec::from_yaml(manifest)?;
//!
//! let status = manager.create_pod(&spec).await?;   // Pending
//! manager.start_pod(&status.id).await?;            // Running
//! manager.delete_pod(&status.id).await?;
//! ```

mod hooks;
mod manager;
pub mod portforward;
mod spec;
mod state;
mod traits;
mod vmid;

pub use hooks::{HookPayload, HookRunner};
pub use manager::OrchestrationManager;
pub use portforward::{
    ForwardRule, IptablesBackend, PortForwarder, PortMapping, Protocol, RuleBackend,
};
pub use spec::{
    ContainerPort, ContainerSpec, HookSpec, Hooks, MAX_CONTAINER_NAME_LEN, MAX_CONTAINERS_PER_POD,
    MAX_ENV_VALUE_LEN, MAX_ENV_VARS_PER_CONTAINER, MAX_HOOKS_PER_STAGE, MAX_LABEL_KEY_LEN,
    MAX_LABEL_VALUE_LEN, MAX_LABELS_PER_POD, MAX_MANIFEST_SIZE, MAX_NAME_LEN, MAX_NAMESPACE_LEN,
    MountSpec, NetworkSpec, PodSpec, ResourceLimits,
};
pub use state::{
    Container, ContainerId, ContainerInfo, ContainerStatus, NamespaceKind, NamespaceShare,
    Operation, Pod, PodId, PodPhase, PodStatus, PodSummary,
};
pub use traits::PodRuntime;
pub use vmid::VmidAllocator;
