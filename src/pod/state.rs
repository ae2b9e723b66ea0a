//! Pod state types.
//!
//! This module defines the runtime state kept in the orchestration registry:
//! - `PodId`: Deterministic pod identifier
//! - `ContainerId`: Container identifier derived from the guest vmid
//! - `ContainerStatus`: Per-container lifecycle state
//! - `PodPhase`: Pod state computed from its members
//! - `Container` / `Pod`: Registry entries
//! - `ContainerInfo` / `PodStatus` / `PodSummary`: Snapshots handed to callers

use crate::constants::CONTAINER_ID_PREFIX;
use crate::error::{Error, Result};
use crate::gateway::{GuestConfig, GuestState};
use crate::pod::{ContainerSpec, Hooks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Pod ID
// =============================================================================

/// Unique identifier for a pod.
///
/// Pod IDs are deterministically derived from namespace/name using SHA256,
/// so the same pair always maps to the same ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId(uuid::Uuid);

impl PodId {
    /// Creates a pod ID from namespace and name (deterministic).
    #[must_use]
    pub fn from_pod(namespace: &str, name: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b"/");
        hasher.update(name.as_bytes());
        let hash = hasher.finalize();

        // Use first 16 bytes of hash as UUID
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);

        // Set version (4) and variant (RFC 4122)
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;

        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Parses the string form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::PodNotFound(s.to_string()))
    }

    /// Returns the UUID as a string.
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Container ID
// =============================================================================

/// Identifier of a container: `ct-<vmid>`.
///
/// Never reused while the guest exists, because the vmid is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    #[must_use]
    pub fn from_vmid(vmid: u32) -> Self {
        Self(format!("{CONTAINER_ID_PREFIX}{vmid}"))
    }

    /// Parses `ct-<vmid>`.
    pub fn parse(s: &str) -> Result<Self> {
        s.strip_prefix(CONTAINER_ID_PREFIX)
            .and_then(|n| n.parse::<u32>().ok())
            .map(Self::from_vmid)
            .ok_or_else(|| Error::ContainerNotFound(s.to_string()))
    }

    /// The guest vmid encoded in this id.
    #[must_use]
    pub fn vmid(&self) -> Option<u32> {
        self.0.strip_prefix(CONTAINER_ID_PREFIX)?.parse().ok()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Container Status
// =============================================================================

/// Lifecycle state of a container.
///
/// ```text
///   Created ──▶ Running ⇄ Stopped
///      │                    │
///      └────────────────────┴──▶ (deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ContainerStatus {
    /// Guest exists and has never been started.
    #[default]
    Created,
    Running,
    Stopped,
    /// The hypervisor reported something unexpected.
    Unknown,
}

impl ContainerStatus {
    /// Checks that `operation` is legal from this state.
    ///
    /// `Unknown` permits start and stop so an operator can recover.
    pub fn check(self, id: &ContainerId, operation: Operation) -> Result<()> {
        let allowed = match operation {
            Operation::Start => matches!(self, Self::Created | Self::Stopped | Self::Unknown),
            Operation::Stop => matches!(self, Self::Running | Self::Unknown),
            Operation::Delete => matches!(self, Self::Created | Self::Stopped),
        };
        if allowed {
            return Ok(());
        }
        Err(Error::InvalidState {
            id: id.to_string(),
            state: self.to_string(),
            operation: operation.to_string(),
        })
    }

    /// Maps a hypervisor report onto the registry state.
    ///
    /// A stopped guest that was never started stays `Created`.
    #[must_use]
    pub fn observe(self, guest: GuestState) -> Self {
        match guest {
            GuestState::Running => Self::Running,
            GuestState::Stopped if self == Self::Created => Self::Created,
            GuestState::Stopped => Self::Stopped,
            GuestState::Unknown => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Container lifecycle operations subject to state checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// =============================================================================
// Pod Phase
// =============================================================================

/// Pod state, always computed from the member containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PodPhase {
    /// Every container is freshly created.
    #[default]
    Pending,
    /// Every container is running.
    Running,
    /// Every container is stopped.
    Stopped,
    /// Mixed or unknown member states.
    Unknown,
}

impl PodPhase {
    /// Derives the phase from member states.
    #[must_use]
    pub fn derive(statuses: &[ContainerStatus]) -> Self {
        let all = |s: ContainerStatus| !statuses.is_empty() && statuses.iter().all(|c| *c == s);
        if all(ContainerStatus::Running) {
            Self::Running
        } else if all(ContainerStatus::Stopped) {
            Self::Stopped
        } else if all(ContainerStatus::Created) {
            Self::Pending
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Stopped => write!(f, "Stopped"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Namespace Sharing
// =============================================================================

/// Kernel namespace kinds a pod can share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Network,
    Ipc,
    Uts,
    Pid,
    Mount,
}

impl NamespaceKind {
    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Network => "net",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Mount => "mnt",
        }
    }
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// A namespace owned by the first container and joined by the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceShare {
    pub kind: NamespaceKind,
    pub owner: ContainerId,
    /// Host pid of the owner's init process.
    pub owner_pid: u32,
    /// `/proc/<pid>/ns/<kind>`.
    pub path: String,
    pub members: Vec<ContainerId>,
}

// =============================================================================
// Registry Entries
// =============================================================================

/// A container realized as one guest.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    pub vmid: u32,
    pub status: ContainerStatus,
    /// Owning pod; `None` for standalone containers.
    pub pod: Option<PodId>,
    pub image_id: String,
    pub spec: ContainerSpec,
    /// Configuration the guest was created with, updated by resource changes.
    pub config: GuestConfig,
    pub created_at: DateTime<Utc>,
}

impl Container {
    #[must_use]
    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            vmid: self.vmid,
            status: self.status,
            pod: self.pod.clone(),
            image: self.spec.image.clone(),
            image_id: self.image_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// A registered pod. The container list is fixed at creation.
#[derive(Debug, Clone)]
pub struct Pod {
    pub id: PodId,
    pub namespace: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub containers: Vec<Container>,
    pub hooks: Hooks,
    pub shared_namespaces: Vec<NamespaceShare>,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    #[must_use]
    pub fn phase(&self) -> PodPhase {
        let statuses: Vec<ContainerStatus> = self.containers.iter().map(|c| c.status).collect();
        PodPhase::derive(&statuses)
    }

    pub fn container_mut(&mut self, id: &ContainerId) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| &c.id == id)
    }

    #[must_use]
    pub fn status(&self) -> PodStatus {
        PodStatus {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            phase: self.phase(),
            labels: self.labels.clone(),
            containers: self.containers.iter().map(Container::info).collect(),
            shared_namespaces: self.shared_namespaces.clone(),
            created_at: self.created_at,
        }
    }

    #[must_use]
    pub fn summary(&self) -> PodSummary {
        PodSummary {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            phase: self.phase(),
            container_count: self.containers.len(),
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub vmid: u32,
    pub status: ContainerStatus,
    pub pod: Option<PodId>,
    pub image: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
}

/// Detailed status of a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub id: PodId,
    pub namespace: String,
    pub name: String,
    /// High-level phase.
    pub phase: PodPhase,
    pub labels: HashMap<String, String>,
    /// Member containers in declaration order.
    pub containers: Vec<ContainerInfo>,
    pub shared_namespaces: Vec<NamespaceShare>,
    pub created_at: DateTime<Utc>,
}

/// Lightweight pod information for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub id: PodId,
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub container_count: usize,
}
