//! Port forwarding for pods.
//!
//! Host ports declared by pod containers are forwarded to the guest addresses
//! with NAT rules. The [`PortForwarder`] remembers every rule it installed,
//! per pod, and teardown removes exactly that list. Live firewall state is
//! never consulted to decide what to delete.
//!
//! Rules go through a [`RuleBackend`]; production uses [`IptablesBackend`].

use crate::error::{Error, Result};
use crate::pod::{ContainerSpec, PodId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of port mappings per pod.
pub const MAX_PORT_MAPPINGS: usize = 1024;

/// Comment prefix tagging every installed rule with its pod.
pub const RULE_COMMENT_PREFIX: &str = "proxcri:";

// =============================================================================
// Protocol
// =============================================================================

/// Network protocol for port forwarding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP port forwarding.
    #[default]
    Tcp,
    /// UDP port forwarding.
    Udp,
}

impl Protocol {
    /// Lowercase name as iptables expects it.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            other => Err(Error::InvalidSpec(format!(
                "unsupported protocol '{other}' (expected TCP or UDP)"
            ))),
        }
    }
}

// =============================================================================
// PortMapping
// =============================================================================

/// A single port mapping from host to guest.
///
/// Also the identity of a rule within a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Protocol (TCP or UDP).
    pub protocol: Protocol,
    /// Port on the host to listen on.
    pub host_port: u16,
    /// Port inside the guest to forward to.
    pub container_port: u16,
}

impl PortMapping {
    /// Creates a TCP port mapping.
    #[must_use]
    pub const fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host_port,
            container_port,
        }
    }

    /// Creates a UDP port mapping.
    #[must_use]
    pub const fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            host_port,
            container_port,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.protocol, self.host_port, self.container_port
        )
    }
}

// =============================================================================
// Port Mapping Extraction
// =============================================================================

/// A mapping together with the container it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMapping {
    /// Container name within the pod.
    pub container: String,
    pub mapping: PortMapping,
}

/// Result of port mapping extraction.
#[derive(Debug)]
pub struct PortMappingResult {
    /// Valid port mappings, in declaration order.
    pub mappings: Vec<ContainerMapping>,
    /// Number of invalid mappings skipped.
    pub skipped_invalid: usize,
    /// Number of duplicate mappings skipped.
    pub skipped_duplicates: usize,
    /// Whether the limit was reached.
    pub limit_reached: bool,
}

/// Extracts and validates port mappings from container specs.
///
/// Only ports with an explicit `hostPort` are forwarded. Mappings are
/// deduplicated by `(host_port, protocol)` across the pod; the first wins.
pub fn extract_port_mappings(containers: &[ContainerSpec]) -> PortMappingResult {
    let mut mappings = Vec::new();
    let mut seen: HashSet<(u16, Protocol)> = HashSet::new();
    let mut skipped_invalid = 0;
    let mut skipped_duplicates = 0;
    let mut limit_reached = false;

    'outer: for container in containers {
        for port in &container.ports {
            let Some(host_port) = port.host_port else {
                continue;
            };

            if host_port == 0 || port.container_port == 0 {
                warn!(
                    container = %container.name,
                    host_port = host_port,
                    container_port = port.container_port,
                    "Skipping invalid port mapping: port 0 is not allowed"
                );
                skipped_invalid += 1;
                continue;
            }

            let key = (host_port, port.protocol);
            if seen.contains(&key) {
                warn!(
                    container = %container.name,
                    host_port = host_port,
                    protocol = %port.protocol,
                    "Skipping duplicate port mapping"
                );
                skipped_duplicates += 1;
                continue;
            }

            if mappings.len() >= MAX_PORT_MAPPINGS {
                warn!(
                    max = MAX_PORT_MAPPINGS,
                    "Maximum port mappings reached, ignoring remaining"
                );
                limit_reached = true;
                break 'outer;
            }

            seen.insert(key);
            mappings.push(ContainerMapping {
                container: container.name.clone(),
                mapping: PortMapping {
                    protocol: port.protocol,
                    host_port,
                    container_port: port.container_port,
                },
            });
        }
    }

    PortMappingResult {
        mappings,
        skipped_invalid,
        skipped_duplicates,
        limit_reached,
    }
}

// =============================================================================
// Rules and Backends
// =============================================================================

/// An installed (or to-be-installed) NAT rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardRule {
    pub mapping: PortMapping,
    /// Guest address traffic is forwarded to.
    pub target: Ipv4Addr,
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{}",
            self.mapping.protocol, self.mapping.host_port, self.target, self.mapping.container_port
        )
    }
}

/// Applies NAT rules to the host firewall.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Installs one rule tagged with `pod`.
    async fn install(&self, pod: &PodId, rule: &ForwardRule) -> Result<()>;

    /// Removes one rule previously installed for `pod`.
    async fn remove(&self, pod: &PodId, rule: &ForwardRule) -> Result<()>;
}

/// `iptables -t nat` DNAT rules in `PREROUTING`, tagged with a comment.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: String,
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self {
            program: "iptables".to_string(),
        }
    }
}

impl IptablesBackend {
    /// Backend running a specific iptables binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for appending (`-A`) or deleting (`-D`) a rule.
    #[must_use]
    pub fn rule_args(action: &str, pod: &PodId, rule: &ForwardRule) -> Vec<String> {
        vec![
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
            "PREROUTING".to_string(),
            "-p".to_string(),
            rule.mapping.protocol.as_arg().to_string(),
            "--dport".to_string(),
            rule.mapping.host_port.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("{RULE_COMMENT_PREFIX}{pod}"),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", rule.target, rule.mapping.container_port),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::Internal(format!(
            "{} {} exited with {}: {}",
            self.program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl RuleBackend for IptablesBackend {
    async fn install(&self, pod: &PodId, rule: &ForwardRule) -> Result<()> {
        self.run(Self::rule_args("-A", pod, rule)).await
    }

    async fn remove(&self, pod: &PodId, rule: &ForwardRule) -> Result<()> {
        self.run(Self::rule_args("-D", pod, rule)).await
    }
}

// =============================================================================
// PortForwarder
// =============================================================================

/// Tracks the rules installed for each pod.
pub struct PortForwarder {
    backend: Arc<dyn RuleBackend>,
    rules: Mutex<HashMap<PodId, Vec<ForwardRule>>>,
}

impl fmt::Debug for PortForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForwarder").finish_non_exhaustive()
    }
}

impl PortForwarder {
    pub fn new(backend: Arc<dyn RuleBackend>) -> Self {
        Self {
            backend,
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Rules currently tracked for `pod`.
    pub fn rules(&self, pod: &PodId) -> Result<Vec<ForwardRule>> {
        let rules = self.rules.lock().map_err(|_| Error::lock_poisoned())?;
        Ok(rules.get(pod).cloned().unwrap_or_default())
    }

    /// Installs `wanted` for `pod`.
    ///
    /// Rules the pod already has are skipped. A host port held by another pod
    /// fails the call before anything is installed; a backend failure removes
    /// the rules this call installed.
    pub async fn install(&self, pod: &PodId, wanted: &[ForwardRule]) -> Result<usize> {
        let fresh = {
            let mut rules = self.rules.lock().map_err(|_| Error::lock_poisoned())?;

            for (owner, installed) in rules.iter() {
                if owner == pod {
                    continue;
                }
                if let Some(taken) = wanted.iter().find(|w| {
                    installed.iter().any(|r| {
                        r.mapping.host_port == w.mapping.host_port
                            && r.mapping.protocol == w.mapping.protocol
                    })
                }) {
                    return Err(Error::NetworkSetupFailed {
                        pod: pod.to_string(),
                        reason: format!(
                            "host port {}/{} is forwarded for pod {owner}",
                            taken.mapping.host_port, taken.mapping.protocol
                        ),
                    });
                }
            }

            let entry = rules.entry(pod.clone()).or_default();
            let fresh: Vec<ForwardRule> = wanted
                .iter()
                .filter(|w| !entry.iter().any(|r| r.mapping == w.mapping))
                .copied()
                .collect();
            // Tracked before installing: concurrent installs see these ports as taken.
            entry.extend(fresh.iter().copied());
            fresh
        };

        let mut done = Vec::new();
        for rule in &fresh {
            if let Err(e) = self.backend.install(pod, rule).await {
                warn!(pod = %pod, rule = %rule, "Port forward failed: {}", e);
                for installed in &done {
                    if let Err(e) = self.backend.remove(pod, installed).await {
                        warn!(pod = %pod, rule = %installed, "Rollback of port forward failed: {}", e);
                    }
                }
                self.untrack(pod, &fresh)?;
                return Err(Error::NetworkSetupFailed {
                    pod: pod.to_string(),
                    reason: format!("{rule}: {e}"),
                });
            }
            debug!(pod = %pod, rule = %rule, "Installed port forward");
            done.push(*rule);
        }

        if !fresh.is_empty() {
            info!(pod = %pod, count = fresh.len(), "Port forwarding configured");
        }
        Ok(fresh.len())
    }

    /// Removes every rule tracked for `pod`.
    ///
    /// Rules whose removal fails stay tracked so a later call can retry them.
    pub async fn remove_pod(&self, pod: &PodId) -> Result<usize> {
        let tracked = {
            let mut rules = self.rules.lock().map_err(|_| Error::lock_poisoned())?;
            rules.remove(pod).unwrap_or_default()
        };

        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for rule in &tracked {
            match self.backend.remove(pod, rule).await {
                Ok(()) => debug!(pod = %pod, rule = %rule, "Removed port forward"),
                Err(e) => {
                    reasons.push(format!("{rule}: {e}"));
                    failed.push(*rule);
                }
            }
        }

        let removed = tracked.len() - failed.len();
        if failed.is_empty() {
            return Ok(removed);
        }

        let mut rules = self.rules.lock().map_err(|_| Error::lock_poisoned())?;
        rules.entry(pod.clone()).or_default().extend(failed);
        Err(Error::NetworkCleanupFailed {
            pod: pod.to_string(),
            reason: reasons.join("; "),
        })
    }

    fn untrack(&self, pod: &PodId, stale: &[ForwardRule]) -> Result<()> {
        let mut rules = self.rules.lock().map_err(|_| Error::lock_poisoned())?;
        if let Some(entry) = rules.get_mut(pod) {
            entry.retain(|r| !stale.contains(r));
            if entry.is_empty() {
                rules.remove(pod);
            }
        }
        Ok(())
    }
}
