//! Pod specification types.
//!
//! This module provides Kubernetes-style pod manifest parsing with
//! validation. Specs can also be built directly and checked with
//! [`PodSpec::validate`]; parsing always validates.
//!
//! # Supported Formats
//!
//! - **YAML**: Primary format, parsed via `serde_yaml`
//! - **JSON**: Also supported (YAML is a superset of JSON)
//!
//! # Example
//!
//! ```yaml
//! metadata:
//!   name: web
//!   namespace: default
//! spec:
//!   hooks:
//!     prestart:
//!       - path: /usr/local/bin/check-quota
//!         timeoutSecs: 10
//!   containers:
//!     - name: nginx
//!       image: nginx:1.25
//!       resources:
//!         limits: { cpu: "2", memory: 1Gi }
//!       ports:
//!         - containerPort: 80
//!           hostPort: 8080
//!       network:
//!         address: 10.0.0.5/24
//!         gateway: 10.0.0.1
//! ```

use crate::constants::MAX_MOUNT_POINTS;
use crate::error::{Error, Result};
use crate::gateway::Features;
use crate::pod::portforward::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Constants for Manifest Validation
// =============================================================================

/// Maximum size of a pod manifest in bytes (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum number of containers per pod.
pub const MAX_CONTAINERS_PER_POD: usize = 16;

/// Maximum length for pod names (RFC 1123 DNS subdomain).
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length for namespace names.
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Maximum length for container names within a pod.
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maximum number of environment variables per container.
pub const MAX_ENV_VARS_PER_CONTAINER: usize = 256;

/// Maximum length of an environment variable value (32 KiB).
pub const MAX_ENV_VALUE_LEN: usize = 32 * 1024;

/// Maximum number of labels per pod.
pub const MAX_LABELS_PER_POD: usize = 64;

/// Maximum length for label keys.
pub const MAX_LABEL_KEY_LEN: usize = 253;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 63 * 1024;

/// Maximum number of hooks per stage.
pub const MAX_HOOKS_PER_STAGE: usize = 16;

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates a Kubernetes-compatible name (RFC 1123 DNS label).
fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidSpec("name cannot be empty".to_string()));
    }

    if name.len() > max_len {
        return Err(Error::InvalidSpec(format!(
            "name '{}' exceeds maximum length of {}",
            name, max_len
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::InvalidSpec(format!(
            "name '{}' must contain only lowercase alphanumeric characters or '-'",
            name
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::InvalidSpec(format!(
            "name '{}' cannot start or end with '-'",
            name
        )));
    }

    Ok(())
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidSpec(msg.into())
}

// =============================================================================
// Pod Specification
// =============================================================================

/// Pod specification.
///
/// The primary input of pod creation. Container order is significant:
/// creation, start and stop walk containers in declaration order, and the
/// first container owns shared namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Namespace (defaults to "default" if not specified).
    pub namespace: String,
    /// Pod name (unique within namespace).
    pub name: String,
    /// Labels for selection and organization.
    pub labels: HashMap<String, String>,
    /// Container specifications (at least one required).
    pub containers: Vec<ContainerSpec>,
    /// Lifecycle hooks.
    pub hooks: Hooks,
}

impl PodSpec {
    /// Pod in the `default` namespace with the given containers.
    pub fn new(name: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            namespace: "default".to_string(),
            name: name.into(),
            labels: HashMap::new(),
            containers,
            hooks: Hooks::default(),
        }
    }

    /// Parses and validates a pod spec from YAML bytes.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_MANIFEST_SIZE`
    /// - YAML parsing fails
    /// - Any [`PodSpec::validate`] failure
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_MANIFEST_SIZE {
            return Err(invalid(format!(
                "manifest size {} exceeds limit of {}",
                yaml.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let doc: serde_yaml::Value =
            serde_yaml::from_slice(yaml).map_err(|e| Error::InvalidSpec(e.to_string()))?;

        let spec = Self::from_value(&doc)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parses a pod spec from a `serde_yaml::Value` without validating it.
    pub fn from_value(doc: &serde_yaml::Value) -> Result<Self> {
        let metadata = doc.get("metadata");

        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(|n| n.as_str())
            .unwrap_or("default")
            .to_string();

        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| invalid("missing metadata.name"))?
            .to_string();

        let labels = parse_string_map(metadata.and_then(|m| m.get("labels")), "label")?;

        let spec = doc.get("spec");

        let containers_seq = spec
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.as_sequence())
            .ok_or_else(|| invalid("missing spec.containers"))?;

        if containers_seq.len() > MAX_CONTAINERS_PER_POD {
            return Err(invalid(format!(
                "too many containers: {} (max {})",
                containers_seq.len(),
                MAX_CONTAINERS_PER_POD
            )));
        }

        let containers = containers_seq
            .iter()
            .map(ContainerSpec::from_value)
            .collect::<Result<Vec<_>>>()?;

        let hooks = Hooks::from_value(spec.and_then(|s| s.get("hooks")))?;

        Ok(Self {
            namespace,
            name,
            labels,
            containers,
            hooks,
        })
    }

    /// Checks every rule pod creation relies on.
    ///
    /// Runs before any side effect, so a failure here leaves nothing behind.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.namespace, MAX_NAMESPACE_LEN)?;
        validate_name(&self.name, MAX_NAME_LEN)?;

        if self.containers.is_empty() {
            return Err(invalid("at least one container required"));
        }
        if self.containers.len() > MAX_CONTAINERS_PER_POD {
            return Err(invalid(format!(
                "too many containers: {} (max {})",
                self.containers.len(),
                MAX_CONTAINERS_PER_POD
            )));
        }

        if self.labels.len() > MAX_LABELS_PER_POD {
            return Err(invalid(format!(
                "too many labels: {} (max {})",
                self.labels.len(),
                MAX_LABELS_PER_POD
            )));
        }
        for (key, value) in &self.labels {
            if key.is_empty() || key.len() > MAX_LABEL_KEY_LEN {
                return Err(invalid(format!("invalid label key '{key}'")));
            }
            if value.len() > MAX_LABEL_VALUE_LEN {
                return Err(invalid(format!(
                    "label value for '{key}' exceeds max length {MAX_LABEL_VALUE_LEN}"
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for container in &self.containers {
            container.validate()?;
            if !names.insert(container.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate container name '{}'",
                    container.name
                )));
            }
        }

        self.hooks.validate()
    }
}

fn parse_string_map(
    value: Option<&serde_yaml::Value>,
    kind: &str,
) -> Result<HashMap<String, String>> {
    let Some(mapping) = value.and_then(|v| v.as_mapping()) else {
        return Ok(HashMap::new());
    };

    let mut result = HashMap::new();
    for (k, v) in mapping.iter() {
        let key = k
            .as_str()
            .ok_or_else(|| invalid(format!("{} key must be a string", kind)))?;
        let val = v
            .as_str()
            .ok_or_else(|| invalid(format!("{} value must be a string", kind)))?;
        result.insert(key.to_string(), val.to_string());
    }
    Ok(result)
}

fn parse_string_list(value: Option<&serde_yaml::Value>) -> Option<Vec<String>> {
    value.and_then(|v| v.as_sequence()).map(|seq| {
        seq.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    })
}

// =============================================================================
// Container Specification
// =============================================================================

/// Container specification.
///
/// Each container becomes one LXC guest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name (unique within pod, RFC 1123 label).
    pub name: String,
    /// Image reference (e.g., "nginx:1.25", "ghcr.io/user/app:v1").
    pub image: String,
    /// Override of the image entrypoint (recorded).
    pub command: Option<Vec<String>>,
    /// Arguments to the entrypoint (recorded).
    pub args: Option<Vec<String>>,
    /// Environment variables (recorded).
    pub env: HashMap<String, String>,
    /// Exposed ports.
    pub ports: Vec<ContainerPort>,
    /// Host paths or storage volumes mounted into the guest.
    pub mounts: Vec<MountSpec>,
    /// CPU and memory limits.
    pub resources: ResourceLimits,
    /// Primary interface settings.
    pub network: NetworkSpec,
    /// LXC feature toggles.
    pub features: Features,
    /// Run as a privileged guest.
    pub privileged: bool,
    /// Guest hostname; defaults to `<pod>-<container>`.
    pub hostname: Option<String>,
}

impl ContainerSpec {
    /// Container with defaults for everything but name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    /// Parses from a YAML value.
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| invalid("missing container name"))?
            .to_string();

        let image = value
            .get("image")
            .and_then(|i| i.as_str())
            .ok_or_else(|| invalid(format!("container '{name}' is missing image")))?
            .to_string();

        let command = parse_string_list(value.get("command"));
        let args = parse_string_list(value.get("args"));
        let env = parse_env_vars(value.get("env"), &name)?;
        let ports = parse_ports(value.get("ports"))?;
        let mounts = parse_mounts(value.get("mounts"))?;
        let resources = parse_resources(value.get("resources"))?;
        let network = NetworkSpec::from_value(value.get("network"));

        let features = match value.get("features") {
            Some(f) => serde_yaml::from_value(f.clone())
                .map_err(|e| invalid(format!("container '{name}' features: {e}")))?,
            None => Features::default(),
        };

        let privileged = value
            .get("securityContext")
            .and_then(|s| s.get("privileged"))
            .and_then(|p| p.as_bool())
            .unwrap_or(false);

        let hostname = value
            .get("hostname")
            .and_then(|h| h.as_str())
            .map(String::from);

        Ok(Self {
            name,
            image,
            command,
            args,
            env,
            ports,
            mounts,
            resources,
            network,
            features,
            privileged,
            hostname,
        })
    }

    /// Checks the container-level rules.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name, MAX_CONTAINER_NAME_LEN)?;

        if self.image.trim().is_empty() {
            return Err(invalid(format!("container '{}' has an empty image", self.name)));
        }

        if self.env.len() > MAX_ENV_VARS_PER_CONTAINER {
            return Err(invalid(format!(
                "too many environment variables in container {}: {} (max {})",
                self.name,
                self.env.len(),
                MAX_ENV_VARS_PER_CONTAINER
            )));
        }
        if let Some((key, _)) = self.env.iter().find(|(_, v)| v.len() > MAX_ENV_VALUE_LEN) {
            return Err(invalid(format!(
                "env variable {} value exceeds limit of {} bytes",
                key, MAX_ENV_VALUE_LEN
            )));
        }

        if self.mounts.len() > MAX_MOUNT_POINTS {
            return Err(invalid(format!(
                "container '{}' has {} mounts (max {})",
                self.name,
                self.mounts.len(),
                MAX_MOUNT_POINTS
            )));
        }
        for mount in &self.mounts {
            mount.validate(&self.name)?;
        }

        for port in &self.ports {
            if port.container_port == 0 || port.host_port == Some(0) {
                return Err(invalid(format!(
                    "container '{}': port 0 is not allowed",
                    self.name
                )));
            }
        }

        if self.resources.cores == Some(0) || self.resources.memory_mb == Some(0) {
            return Err(invalid(format!(
                "container '{}': cpu and memory limits must be positive",
                self.name
            )));
        }

        if let Some(hostname) = &self.hostname {
            validate_name(hostname, MAX_CONTAINER_NAME_LEN)?;
        }

        self.network.validate(&self.name)
    }
}

fn parse_env_vars(
    value: Option<&serde_yaml::Value>,
    container_name: &str,
) -> Result<HashMap<String, String>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(HashMap::new());
    };

    if seq.len() > MAX_ENV_VARS_PER_CONTAINER {
        return Err(invalid(format!(
            "too many environment variables in container {}: {} (max {})",
            container_name,
            seq.len(),
            MAX_ENV_VARS_PER_CONTAINER
        )));
    }

    let mut map = HashMap::new();
    for item in seq {
        let env_name = item
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| invalid("missing env name"))?;
        let val = item.get("value").and_then(|v| v.as_str()).unwrap_or("");
        map.insert(env_name.to_string(), val.to_string());
    }
    Ok(map)
}

fn parse_ports(value: Option<&serde_yaml::Value>) -> Result<Vec<ContainerPort>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    seq.iter()
        .map(|p| {
            let container_port = p
                .get("containerPort")
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok())
                .ok_or_else(|| invalid("port entry needs a containerPort in 1..=65535"))?;
            let host_port = match p.get("hostPort") {
                Some(hp) => Some(
                    hp.as_u64()
                        .and_then(|hp| u16::try_from(hp).ok())
                        .ok_or_else(|| invalid("hostPort must be in 1..=65535"))?,
                ),
                None => None,
            };
            let protocol = match p.get("protocol").and_then(|pr| pr.as_str()) {
                Some(pr) => pr.parse()?,
                None => Protocol::Tcp,
            };
            let name = p.get("name").and_then(|n| n.as_str()).map(String::from);
            Ok(ContainerPort {
                name,
                container_port,
                host_port,
                protocol,
            })
        })
        .collect()
}

fn parse_mounts(value: Option<&serde_yaml::Value>) -> Result<Vec<MountSpec>> {
    let Some(seq) = value.and_then(|v| v.as_sequence()) else {
        return Ok(Vec::new());
    };

    seq.iter()
        .map(|m| {
            let field = |key: &str| {
                m.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            Ok(MountSpec {
                source: field("source"),
                destination: field("destination"),
                read_only: m.get("readOnly").and_then(|r| r.as_bool()).unwrap_or(false),
            })
        })
        .collect()
}

fn parse_resources(value: Option<&serde_yaml::Value>) -> Result<ResourceLimits> {
    let Some(r) = value else {
        return Ok(ResourceLimits::default());
    };
    let limits = r.get("limits").or_else(|| r.get("requests"));

    let memory_mb = match limits.and_then(|l| l.get("memory")) {
        Some(m) => Some(parse_memory_mb(&yaml_scalar(m))?),
        None => None,
    };
    let swap_mb = match limits.and_then(|l| l.get("swap")) {
        Some(s) => Some(parse_memory_mb(&yaml_scalar(s))?),
        None => None,
    };
    let cores = match limits.and_then(|l| l.get("cpu")) {
        Some(c) => Some(parse_cpu_cores(&yaml_scalar(c))?),
        None => None,
    };

    Ok(ResourceLimits {
        cores,
        memory_mb,
        swap_mb,
    })
}

/// Renders a YAML scalar as text so `cpu: 2` and `cpu: "2"` parse alike.
fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// Container port definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    /// Optional name for the port.
    pub name: Option<String>,
    /// Port number inside the container (1-65535).
    pub container_port: u16,
    /// Host port to forward; ports without one are not exposed.
    pub host_port: Option<u16>,
    /// Protocol (defaults to TCP).
    pub protocol: Protocol,
}

impl ContainerPort {
    /// TCP port forwarded from `host_port`.
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            name: None,
            container_port,
            host_port: Some(host_port),
            protocol: Protocol::Tcp,
        }
    }
}

/// Mount of a host path or storage volume into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path or `storage:volume`.
    pub source: String,
    /// Absolute path inside the guest.
    pub destination: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl MountSpec {
    fn validate(&self, container: &str) -> Result<()> {
        if self.source.trim().is_empty() || self.destination.trim().is_empty() {
            return Err(invalid(format!(
                "container '{container}': mount source and destination must be set"
            )));
        }
        if !self.destination.starts_with('/') {
            return Err(invalid(format!(
                "container '{container}': mount destination '{}' must be absolute",
                self.destination
            )));
        }
        if self.destination.split('/').any(|c| c == "..")
            || self.source.split('/').any(|c| c == "..")
        {
            return Err(invalid(format!(
                "container '{container}': mount paths cannot contain '..'"
            )));
        }
        Ok(())
    }
}

/// CPU and memory limits. Unset fields fall back to runtime defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Whole cores.
    pub cores: Option<u32>,
    /// Memory in MiB.
    pub memory_mb: Option<u64>,
    /// Swap in MiB.
    pub swap_mb: Option<u64>,
}

impl ResourceLimits {
    /// Returns true if no limit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cores.is_none() && self.memory_mb.is_none() && self.swap_mb.is_none()
    }
}

/// Primary interface settings.
///
/// No address means DHCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Bridge; defaults to the runtime bridge.
    pub bridge: Option<String>,
    /// Static address with prefix length (`10.0.0.5/24`).
    pub address: Option<String>,
    /// Default gateway for a static address.
    pub gateway: Option<String>,
}

impl NetworkSpec {
    fn from_value(value: Option<&serde_yaml::Value>) -> Self {
        let field = |key: &str| {
            value
                .and_then(|v| v.get(key))
                .and_then(|v| v.as_str())
                .map(String::from)
        };
        Self {
            bridge: field("bridge"),
            address: field("address"),
            gateway: field("gateway"),
        }
    }

    fn validate(&self, container: &str) -> Result<()> {
        if let Some(address) = &self.address {
            let (ip, prefix) = address.split_once('/').ok_or_else(|| {
                invalid(format!(
                    "container '{container}': address '{address}' needs a prefix length"
                ))
            })?;
            let valid_ip = ip.parse::<std::net::Ipv4Addr>().is_ok();
            let valid_prefix = prefix.parse::<u8>().is_ok_and(|p| p <= 32);
            if !valid_ip || !valid_prefix {
                return Err(invalid(format!(
                    "container '{container}': invalid address '{address}'"
                )));
            }
        } else if self.gateway.is_some() {
            return Err(invalid(format!(
                "container '{container}': gateway requires a static address"
            )));
        }
        if let Some(gateway) = &self.gateway
            && gateway.parse::<std::net::Ipv4Addr>().is_err()
        {
            return Err(invalid(format!(
                "container '{container}': invalid gateway '{gateway}'"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Hooks run around pod creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    /// Run before any guest is created; a failure aborts creation.
    pub prestart: Vec<HookSpec>,
    /// Run after the pod is registered.
    pub poststart: Vec<HookSpec>,
}

impl Hooks {
    fn from_value(value: Option<&serde_yaml::Value>) -> Result<Self> {
        let stage = |key: &str| -> Result<Vec<HookSpec>> {
            let Some(seq) = value.and_then(|v| v.get(key)).and_then(|s| s.as_sequence()) else {
                return Ok(Vec::new());
            };
            seq.iter().map(HookSpec::from_value).collect()
        };
        Ok(Self {
            prestart: stage("prestart")?,
            poststart: stage("poststart")?,
        })
    }

    fn validate(&self) -> Result<()> {
        for (stage, hooks) in [("prestart", &self.prestart), ("poststart", &self.poststart)] {
            if hooks.len() > MAX_HOOKS_PER_STAGE {
                return Err(invalid(format!(
                    "too many {stage} hooks: {} (max {MAX_HOOKS_PER_STAGE})",
                    hooks.len()
                )));
            }
            if hooks.iter().any(|h| h.path.trim().is_empty()) {
                return Err(invalid(format!("{stage} hook has an empty path")));
            }
            if hooks.iter().any(|h| h.timeout_secs == Some(0)) {
                return Err(invalid(format!("{stage} hook timeout must be positive")));
            }
        }
        Ok(())
    }
}

/// One external hook program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Executable path.
    pub path: String,
    pub args: Vec<String>,
    /// Extra environment on top of the runtime's own.
    pub env: HashMap<String, String>,
    /// Overrides the runtime hook timeout.
    pub timeout_secs: Option<u64>,
}

impl HookSpec {
    /// Hook running `path` with no arguments.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    fn from_value(value: &serde_yaml::Value) -> Result<Self> {
        let path = value
            .get("path")
            .and_then(|p| p.as_str())
            .unwrap_or_default()
            .to_string();
        let args = parse_string_list(value.get("args")).unwrap_or_default();
        let env = parse_string_map(value.get("env"), "hook env")?;
        let timeout_secs = value.get("timeoutSecs").and_then(|t| t.as_u64());
        Ok(Self {
            path,
            args,
            env,
            timeout_secs,
        })
    }
}

// =============================================================================
// Resource Parsing Helpers
// =============================================================================

/// Parses Kubernetes memory strings to MiB, rounding up.
fn parse_memory_mb(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, multiplier): (&str, u64) = if let Some(val) = s.strip_suffix("Gi") {
        (val, 1024 * 1024 * 1024)
    } else if let Some(val) = s.strip_suffix("Mi") {
        (val, 1024 * 1024)
    } else if let Some(val) = s.strip_suffix("Ki") {
        (val, 1024)
    } else if let Some(val) = s.strip_suffix('G') {
        (val, 1_000_000_000)
    } else if let Some(val) = s.strip_suffix('M') {
        (val, 1_000_000)
    } else if let Some(val) = s.strip_suffix('K') {
        (val, 1_000)
    } else {
        (s, 1)
    };

    let value = digits
        .parse::<u64>()
        .map_err(|_| invalid(format!("invalid memory quantity '{s}'")))?;
    let bytes = value.saturating_mul(multiplier);
    Ok(bytes.div_ceil(1024 * 1024))
}

/// Parses Kubernetes CPU strings to whole cores, rounding up.
fn parse_cpu_cores(s: &str) -> Result<u32> {
    let s = s.trim();
    let millicores = match s.strip_suffix('m') {
        Some(val) => val.parse::<u64>().ok(),
        None => s.parse::<f64>().ok().filter(|c| *c >= 0.0).map(|cores| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millicores = (cores * 1000.0).ceil() as u64;
            millicores
        }),
    };
    let millicores = millicores.ok_or_else(|| invalid(format!("invalid cpu quantity '{s}'")))?;

    u32::try_from(millicores.div_ceil(1000))
        .map_err(|_| invalid(format!("cpu quantity '{s}' too large")))
}
