//! Proxmox API data types.
//!
//! Request types render themselves into the flat parameter maps the LXC
//! endpoints expect; response types decode the `data` payloads.

use crate::constants::{MAX_MOUNT_POINTS, MIN_VMID};
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Cluster Topology
// =============================================================================

/// A cluster member as reported by `/cluster/resources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name (e.g. `pve1`).
    pub name: String,
    /// Reported status (`online`, `offline`, `unknown`).
    pub status: String,
    /// Resource kind; always `node` once filtered.
    pub kind: String,
}

impl NodeInfo {
    /// Returns true if the cluster reports the node as online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// One heterogeneous entry of `/cluster/resources`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClusterResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ClusterResource {
    pub(crate) fn into_node(self) -> Option<NodeInfo> {
        if self.kind != "node" {
            return None;
        }
        Some(NodeInfo {
            name: self.node?,
            status: self.status.unwrap_or_else(|| "unknown".to_string()),
            kind: self.kind,
        })
    }
}

// =============================================================================
// Guest State
// =============================================================================

/// Power state of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestState {
    Running,
    Stopped,
    Unknown,
}

impl From<&str> for GuestState {
    fn from(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

fn de_guest_state<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<GuestState, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.as_deref().map_or(GuestState::Unknown, GuestState::from))
}

/// Accepts a vmid encoded either as a number or as a numeric string.
pub(crate) fn de_vmid<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    use serde::de::Error as _;
    match Value::deserialize(d)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| D::Error::custom("vmid out of range")),
        Value::String(s) => s.parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("unexpected vmid {other}"))),
    }
}

/// A guest as seen by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    /// Numeric hypervisor identity.
    pub vmid: u32,
    /// Guest hostname.
    pub name: String,
    /// Node currently hosting the guest.
    pub node: String,
    /// Power state at the time of the call.
    pub status: GuestState,
}

/// Entry of `/nodes/{node}/lxc`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GuestListEntry {
    #[serde(deserialize_with = "de_vmid")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_guest_state")]
    pub status: GuestState,
}

impl Default for GuestState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Payload of `/nodes/{node}/lxc/{vmid}/status/current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestStatus {
    #[serde(deserialize_with = "de_vmid")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de_guest_state")]
    pub status: GuestState,
    /// Init process PID on the host (running guests only).
    #[serde(default, deserialize_with = "de_opt_pid")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
}

fn de_opt_pid<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Network interface reported by `/nodes/{node}/lxc/{vmid}/interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(default)]
    pub hwaddr: Option<String>,
    /// IPv4 address with prefix (`10.0.0.5/24`).
    #[serde(default)]
    pub inet: Option<String>,
    #[serde(default)]
    pub inet6: Option<String>,
}

/// Returns the first non-loopback IPv4 address without its prefix length.
#[must_use]
pub fn primary_ipv4(interfaces: &[GuestInterface]) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| i.name != "lo")
        .filter_map(|i| i.inet.as_deref())
        .map(|inet| inet.split('/').next().unwrap_or(inet).to_string())
        .find(|ip| !ip.is_empty())
}

/// A guest snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub snaptime: Option<u64>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Payload of `/nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

// =============================================================================
// Guest Configuration
// =============================================================================

/// Root filesystem allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsSpec {
    /// Storage id (e.g. `local-lvm`).
    pub storage: String,
    /// Size in GB.
    pub size_gb: u32,
}

/// Address mode of the primary interface.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpConfig {
    #[default]
    Dhcp,
    Static {
        /// Address with prefix length (`10.0.0.5/24`).
        cidr: String,
        gateway: Option<String>,
    },
}

/// Primary network interface (`net0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub bridge: String,
    pub ip: IpConfig,
    pub firewall: bool,
}

impl NetworkConfig {
    /// DHCP interface `eth0` on `bridge`.
    pub fn dhcp(bridge: impl Into<String>) -> Self {
        Self {
            name: "eth0".to_string(),
            bridge: bridge.into(),
            ip: IpConfig::Dhcp,
            firewall: false,
        }
    }

    /// Static address, if configured, without the prefix length.
    #[must_use]
    pub fn static_address(&self) -> Option<&str> {
        match &self.ip {
            IpConfig::Static { cidr, .. } => cidr.split('/').next(),
            IpConfig::Dhcp => None,
        }
    }

    fn render(&self) -> String {
        let mut out = format!("name={},bridge={}", self.name, self.bridge);
        match &self.ip {
            IpConfig::Dhcp => out.push_str(",ip=dhcp"),
            IpConfig::Static { cidr, gateway } => {
                out.push_str(&format!(",ip={cidr}"));
                if let Some(gw) = gateway {
                    out.push_str(&format!(",gw={gw}"));
                }
            }
        }
        if self.firewall {
            out.push_str(",firewall=1");
        }
        out
    }
}

/// LXC feature toggles.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub nesting: bool,
    pub fuse: bool,
    pub keyctl: bool,
    pub mknod: bool,
    /// Allowed mount types (`nfs`, `cifs`, ...).
    pub mount: Vec<String>,
}

impl Features {
    fn render(&self) -> Option<String> {
        let mut parts = Vec::new();
        for (name, on) in [
            ("nesting", self.nesting),
            ("fuse", self.fuse),
            ("keyctl", self.keyctl),
            ("mknod", self.mknod),
        ] {
            if on {
                parts.push(format!("{name}=1"));
            }
        }
        if !self.mount.is_empty() {
            parts.push(format!("mount={}", self.mount.join(";")));
        }
        (!parts.is_empty()).then(|| parts.join(","))
    }
}

/// Auxiliary mount point (`mpN`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Storage volume or host path.
    pub volume: String,
    /// Path inside the guest.
    pub path: String,
    pub read_only: bool,
    pub backup: bool,
}

impl MountPoint {
    fn render(&self) -> String {
        let mut out = format!("{},mp={}", self.volume, self.path);
        if self.read_only {
            out.push_str(",ro=1");
        }
        if !self.backup {
            out.push_str(",backup=0");
        }
        out
    }
}

/// Hypervisor-native container definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub vmid: u32,
    pub hostname: String,
    /// Template volume (`local:vztmpl/<name>.tar.gz`).
    pub ostemplate: Option<String>,
    pub ostype: Option<String>,
    pub memory_mb: u64,
    pub swap_mb: u64,
    pub cores: u32,
    pub rootfs: RootfsSpec,
    pub net: NetworkConfig,
    pub onboot: bool,
    pub protection: bool,
    pub template: bool,
    pub unprivileged: bool,
    pub features: Features,
    pub mounts: Vec<MountPoint>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl GuestConfig {
    /// Checks the invariants the hypervisor would otherwise reject late.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::InvalidSpec("guest hostname cannot be empty".to_string()));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidSpec("guest memory must be positive".to_string()));
        }
        if self.cores == 0 {
            return Err(Error::InvalidSpec("guest core count must be positive".to_string()));
        }
        if self.vmid < MIN_VMID {
            return Err(Error::InvalidSpec(format!(
                "vmid {} is below {MIN_VMID}",
                self.vmid
            )));
        }
        if self.mounts.len() > MAX_MOUNT_POINTS {
            return Err(Error::InvalidSpec(format!(
                "too many mount points: {} (max {MAX_MOUNT_POINTS})",
                self.mounts.len()
            )));
        }
        Ok(())
    }

    /// Renders the parameter map for `POST /nodes/{node}/lxc`.
    #[must_use]
    pub fn to_params(&self) -> Map<String, Value> {
        let mut p = Map::new();
        p.insert("vmid".into(), self.vmid.into());
        p.insert("hostname".into(), self.hostname.clone().into());
        if let Some(t) = &self.ostemplate {
            p.insert("ostemplate".into(), t.clone().into());
        }
        if let Some(t) = &self.ostype {
            p.insert("ostype".into(), t.clone().into());
        }
        p.insert("memory".into(), self.memory_mb.into());
        p.insert("swap".into(), self.swap_mb.into());
        p.insert("cores".into(), self.cores.into());
        p.insert(
            "rootfs".into(),
            format!("{}:{}", self.rootfs.storage, self.rootfs.size_gb).into(),
        );
        p.insert("net0".into(), self.net.render().into());
        p.insert("onboot".into(), flag(self.onboot));
        p.insert("protection".into(), flag(self.protection));
        p.insert("template".into(), flag(self.template));
        p.insert("unprivileged".into(), flag(self.unprivileged));
        if let Some(features) = self.features.render() {
            p.insert("features".into(), features.into());
        }
        for (i, mount) in self.mounts.iter().enumerate() {
            p.insert(format!("mp{i}"), mount.render().into());
        }
        if let Some(d) = &self.description {
            p.insert("description".into(), d.clone().into());
        }
        if !self.tags.is_empty() {
            p.insert("tags".into(), self.tags.join(";").into());
        }
        p
    }
}

fn flag(on: bool) -> Value {
    Value::from(u8::from(on))
}

/// Partial update for `PUT /nodes/{node}/lxc/{vmid}/config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub swap_mb: Option<u64>,
    pub hostname: Option<String>,
    pub description: Option<String>,
}

impl ConfigUpdate {
    /// Returns true if the update would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_params().is_empty()
    }

    #[must_use]
    pub fn to_params(&self) -> Map<String, Value> {
        let mut p = Map::new();
        if let Some(c) = self.cores {
            p.insert("cores".into(), c.into());
        }
        if let Some(m) = self.memory_mb {
            p.insert("memory".into(), m.into());
        }
        if let Some(s) = self.swap_mb {
            p.insert("swap".into(), s.into());
        }
        if let Some(h) = &self.hostname {
            p.insert("hostname".into(), h.clone().into());
        }
        if let Some(d) = &self.description {
            p.insert("description".into(), d.clone().into());
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GuestConfig {
        GuestConfig {
            vmid: 10000,
            hostname: "web".to_string(),
            ostemplate: Some("local:vztmpl/abc.tar.gz".to_string()),
            ostype: None,
            memory_mb: 512,
            swap_mb: 256,
            cores: 2,
            rootfs: RootfsSpec {
                storage: "local-lvm".to_string(),
                size_gb: 8,
            },
            net: NetworkConfig::dhcp("vmbr0"),
            onboot: false,
            protection: false,
            template: false,
            unprivileged: true,
            features: Features {
                nesting: true,
                mount: vec!["nfs".to_string(), "cifs".to_string()],
                ..Features::default()
            },
            mounts: vec![MountPoint {
                volume: "/srv/data".to_string(),
                path: "/data".to_string(),
                read_only: true,
                backup: false,
            }],
            description: None,
            tags: vec!["proxcri".to_string()],
        }
    }

    #[test]
    fn renders_proxmox_params() {
        let p = sample().to_params();
        assert_eq!(p["rootfs"], "local-lvm:8");
        assert_eq!(p["net0"], "name=eth0,bridge=vmbr0,ip=dhcp");
        assert_eq!(p["features"], "nesting=1,mount=nfs;cifs");
        assert_eq!(p["mp0"], "/srv/data,mp=/data,ro=1,backup=0");
        assert_eq!(p["unprivileged"], 1);
        assert_eq!(p["onboot"], 0);
        assert_eq!(p["tags"], "proxcri");
    }

    #[test]
    fn static_network_renders_gateway() {
        let net = NetworkConfig {
            name: "eth0".to_string(),
            bridge: "vmbr1".to_string(),
            ip: IpConfig::Static {
                cidr: "10.0.0.5/24".to_string(),
                gateway: Some("10.0.0.1".to_string()),
            },
            firewall: true,
        };
        assert_eq!(
            net.render(),
            "name=eth0,bridge=vmbr1,ip=10.0.0.5/24,gw=10.0.0.1,firewall=1"
        );
        assert_eq!(net.static_address(), Some("10.0.0.5"));
    }

    #[test]
    fn validate_rejects_empty_hostname_and_zero_resources() {
        let mut c = sample();
        c.hostname.clear();
        assert!(c.validate().is_err());

        let mut c = sample();
        c.memory_mb = 0;
        assert!(c.validate().is_err());

        let mut c = sample();
        c.cores = 0;
        assert!(c.validate().is_err());

        let mut c = sample();
        c.mounts = vec![c.mounts[0].clone(); MAX_MOUNT_POINTS + 1];
        assert!(c.validate().is_err());
    }

    #[test]
    fn vmid_accepts_string_or_number() {
        let a: GuestListEntry =
            serde_json::from_str(r#"{"vmid":"101","status":"running"}"#).unwrap();
        let b: GuestListEntry = serde_json::from_str(r#"{"vmid":102}"#).unwrap();
        assert_eq!(a.vmid, 101);
        assert_eq!(a.status, GuestState::Running);
        assert_eq!(b.vmid, 102);
        assert_eq!(b.status, GuestState::Unknown);
    }

    #[test]
    fn primary_ipv4_skips_loopback() {
        let ifaces = vec![
            GuestInterface {
                name: "lo".to_string(),
                hwaddr: None,
                inet: Some("127.0.0.1/8".to_string()),
                inet6: None,
            },
            GuestInterface {
                name: "eth0".to_string(),
                hwaddr: None,
                inet: Some("10.1.2.3/24".to_string()),
                inet6: None,
            },
        ];
        assert_eq!(primary_ipv4(&ifaces).as_deref(), Some("10.1.2.3"));
    }
}
