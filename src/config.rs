//! Runtime configuration.
//!
//! A single YAML document with three sections. Every field has a default
//! except the gateway's `hosts`, `token` and `node`; the token may also come
//! from the `PROXCRI_TOKEN` environment variable.
//!
//! ```yaml
//! gateway:
//!   hosts: ["pve1.lan", "pve2.lan"]
//!   token: "root@pam!cri=0000-...."
//!   node: pve1
//! images:
//!   store_dir: /var/lib/proxcri/images
//! runtime:
//!   vmid_start: 20000
//!   vmid_end: 20999
//! ```

use crate::constants::{
    DEFAULT_API_PORT, DEFAULT_BRIDGE, DEFAULT_HOOK_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_NODE_CACHE_TTL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_BACKOFF,
    DEFAULT_ROOTFS_SIZE_GB, DEFAULT_ROOTFS_STORAGE, DEFAULT_TASK_TIMEOUT,
    DEFAULT_TEMPLATE_STORAGE, DEFAULT_VMID_END, DEFAULT_VMID_START, IMAGE_STORE_DIR,
    LAYER_CACHE_DIR, MIN_VMID, STATE_DIR_NAME,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `gateway.token`.
pub const TOKEN_ENV_VAR: &str = "PROXCRI_TOKEN";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor connection settings.
    pub gateway: GatewayConfig,
    /// Image store settings.
    pub images: ImageStoreConfig,
    /// Orchestration defaults.
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Loads, applies environment overrides and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&raw)?;
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR)
            && !token.is_empty()
        {
            config.gateway.token = token;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses a config document without validating it.
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(raw).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;
        self.runtime.validate()
    }
}

/// Resolved gateway settings handed to [`HypervisorGateway::new`].
///
/// [`HypervisorGateway::new`]: crate::gateway::HypervisorGateway::new
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host names or addresses, in failover order.
    pub hosts: Vec<String>,
    /// API port shared by all hosts.
    pub port: u16,
    /// API token (`user@realm!tokenid=secret`).
    pub token: String,
    /// Node on which guests are created.
    pub node: String,
    /// Node cache lifetime in seconds.
    pub node_cache_ttl_secs: u64,
    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,
    /// Attempts per logical call.
    pub max_attempts: u32,
    /// Pause between failed sweeps in milliseconds.
    pub retry_backoff_ms: u64,
    /// Verify TLS certificates (Proxmox ships self-signed ones).
    pub verify_tls: bool,
    /// Upper bound for asynchronous task completion in seconds.
    pub task_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: DEFAULT_API_PORT,
            token: String::new(),
            node: String::new(),
            node_cache_ttl_secs: DEFAULT_NODE_CACHE_TTL.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            verify_tls: false,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT.as_secs(),
        }
    }
}

impl GatewayConfig {
    /// Creates a config with the required fields and defaults elsewhere.
    pub fn new(hosts: Vec<String>, token: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            hosts,
            token: token.into(),
            node: node.into(),
            ..Self::default()
        }
    }

    /// Rejects configs no gateway can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::Configuration("at least one host is required".to_string()));
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(Error::Configuration("host entries cannot be empty".to_string()));
        }
        if self.token.trim().is_empty() {
            return Err(Error::Configuration("API token cannot be empty".to_string()));
        }
        if self.node.trim().is_empty() {
            return Err(Error::Configuration("target node cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("port cannot be 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn node_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.node_cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Image store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageStoreConfig {
    /// Directory of assembled images (`<store>/<imageId>/rootfs`).
    pub store_dir: PathBuf,
    /// Directory of digest-keyed layer blobs.
    pub layer_cache_dir: PathBuf,
    /// OCI architecture selected from multi-platform indexes.
    pub architecture: String,
    /// OCI os selected from multi-platform indexes.
    pub os: String,
}

impl Default for ImageStoreConfig {
    fn default() -> Self {
        let base = default_state_dir();
        Self {
            store_dir: base.join(IMAGE_STORE_DIR),
            layer_cache_dir: base.join(LAYER_CACHE_DIR),
            architecture: host_oci_arch().to_string(),
            os: "linux".to_string(),
        }
    }
}

/// Orchestration defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// First vmid this process may allocate.
    pub vmid_start: u32,
    /// Last vmid this process may allocate.
    pub vmid_end: u32,
    /// Advance the allocator past `/cluster/nextid` before handing out ids.
    pub consult_cluster_nextid: bool,
    /// Storage for guest root filesystems.
    pub rootfs_storage: String,
    /// Root filesystem size in GB.
    pub rootfs_size_gb: u32,
    /// Storage holding LXC templates.
    pub template_storage: String,
    /// Local directory backing `template_storage`'s `vztmpl` content, if any.
    pub template_dir: Option<PathBuf>,
    /// Bridge for the primary interface when a container names none.
    pub bridge: String,
    /// Default hook timeout in seconds.
    pub hook_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            vmid_start: DEFAULT_VMID_START,
            vmid_end: DEFAULT_VMID_END,
            consult_cluster_nextid: true,
            rootfs_storage: DEFAULT_ROOTFS_STORAGE.to_string(),
            rootfs_size_gb: DEFAULT_ROOTFS_SIZE_GB,
            template_storage: DEFAULT_TEMPLATE_STORAGE.to_string(),
            template_dir: None,
            bridge: DEFAULT_BRIDGE.to_string(),
            hook_timeout_secs: DEFAULT_HOOK_TIMEOUT.as_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Rejects empty or out-of-bounds vmid ranges.
    pub fn validate(&self) -> Result<()> {
        if self.vmid_start < MIN_VMID {
            return Err(Error::Configuration(format!(
                "vmid_start must be at least {MIN_VMID}"
            )));
        }
        if self.vmid_end < self.vmid_start {
            return Err(Error::Configuration(
                "vmid_end must not be below vmid_start".to_string(),
            ));
        }
        if self.rootfs_size_gb == 0 {
            return Err(Error::Configuration("rootfs_size_gb must be positive".to_string()));
        }
        Ok(())
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}

/// Returns `~/.proxcri`, or a relative `.proxcri` without a home directory.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(STATE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(STATE_DIR_NAME))
}

/// Maps the compile-time architecture to its OCI name.
pub fn host_oci_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        _ => "amd64",
    }
}
