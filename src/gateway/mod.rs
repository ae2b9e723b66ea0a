//! # Hypervisor Gateway
//!
//! The single path by which the rest of the crate talks to Proxmox VE. Every
//! call is authenticated with an API token and routed through an ordered list
//! of cluster hosts.
//!
//! ## Failover
//!
//! The gateway keeps a cursor into the host list. One *attempt* is a sweep
//! that starts at the cursor and walks forward:
//!
//! - A retryable failure (connection error, timeout, any non-2xx status other
//!   than 401/403/404) advances the cursor to the next host.
//! - Running off the end of the list resets the cursor to host 0 and ends the
//!   sweep as failed.
//! - A successful answer ends the call and leaves the cursor where it is, so
//!   later calls keep using the host that worked.
//! - 401, 403 and 404 are answered by the cluster, not by a broken host, and
//!   fail the call immediately.
//!
//! A call makes at most `max_attempts` sweeps with a short backoff in between.
//!
//! ## Asynchronous Tasks
//!
//! Lifecycle endpoints answer with a task id (`UPID:...`) before the work is
//! done. Operations that return a UPID wait for the task to stop and fail with
//! [`Error::TaskFailed`] unless its exit status is `OK`.
//!
//! ## Node Cache
//!
//! The cluster's node list is cached for `node_cache_ttl`; see [`NodeCache`].

mod cache;
mod transport;
mod types;

pub use cache::NodeCache;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
pub use types::{
    ConfigUpdate, Features, Guest, GuestConfig, GuestInterface, GuestState, GuestStatus,
    IpConfig, MountPoint, NetworkConfig, NodeInfo, RootfsSpec, Snapshot, primary_ipv4,
};

use crate::config::GatewayConfig;
use crate::constants::TASK_POLL_INTERVAL;
use crate::error::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use types::{ClusterResource, GuestListEntry, TaskStatus};

/// Ordered hosts with a shared failover cursor.
#[derive(Debug)]
struct HostSet {
    hosts: Vec<String>,
    current: AtomicUsize,
}

impl HostSet {
    fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            current: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn set(&self, index: usize) {
        self.current.store(index, Ordering::SeqCst);
    }
}

/// Envelope every Proxmox answer is wrapped in.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Authenticated, failover-aware Proxmox API client.
pub struct HypervisorGateway {
    hosts: HostSet,
    port: u16,
    token: String,
    node: String,
    request_timeout: Duration,
    max_attempts: u32,
    retry_backoff: Duration,
    task_timeout: Duration,
    transport: Arc<dyn Transport>,
    nodes: NodeCache,
}

impl std::fmt::Debug for HypervisorGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorGateway")
            .field("hosts", &self.hosts.hosts)
            .field("current", &self.hosts.current())
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl HypervisorGateway {
    /// Builds a gateway over HTTPS.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an empty host list, token or node.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config.verify_tls)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Builds a gateway over a caller-supplied transport.
    pub fn with_transport(config: &GatewayConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        info!(
            "Hypervisor gateway: {} host(s), target node {}",
            config.hosts.len(),
            config.node
        );
        Ok(Self {
            hosts: HostSet::new(config.hosts.clone()),
            port: config.port,
            token: config.token.clone(),
            node: config.node.clone(),
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff(),
            task_timeout: config.task_timeout(),
            transport,
            nodes: NodeCache::new(config.node_cache_ttl()),
        })
    }

    /// Node on which guests are created.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Index of the host the next call will try first.
    #[must_use]
    pub fn current_host_index(&self) -> usize {
        self.hosts.current()
    }

    /// The node cache (exposed for inspection).
    #[must_use]
    pub fn node_cache(&self) -> &NodeCache {
        &self.nodes
    }

    // =========================================================================
    // Request Core
    // =========================================================================

    /// Performs one logical API call with failover and retry.
    ///
    /// Returns the raw 2xx body.
    pub async fn authenticated_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Vec<u8>> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.sweep(method, path, body.as_ref()).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "{} {} failed on every host (attempt {}/{}): {}",
                        method, path, attempt, self.max_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts && !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Internal("no attempt was made".to_string())))
    }

    /// One pass from the cursor to the end of the host list.
    async fn sweep(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Vec<u8>> {
        let mut index = self.hosts.current().min(self.hosts.len().saturating_sub(1));
        let mut last_error = None;

        while index < self.hosts.len() {
            let request = ApiRequest {
                host: self.hosts.hosts[index].clone(),
                port: self.port,
                method,
                path: path.to_string(),
                token: self.token.clone(),
                body: body.cloned(),
                timeout: self.request_timeout,
            };

            match self.attempt(&request).await {
                Ok(bytes) => {
                    self.hosts.set(index);
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() => {
                    debug!("{} via {} failed: {}", request.operation(), request.host, e);
                    last_error = Some(e);
                    index += 1;
                    if index < self.hosts.len() {
                        self.hosts.set(index);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.hosts.set(0);
        Err(last_error.unwrap_or_else(|| Error::Internal("empty host list".to_string())))
    }

    async fn attempt(&self, request: &ApiRequest) -> Result<Vec<u8>> {
        let response = self.transport.send(request).await?;
        match response.status {
            200..=299 => Ok(response.body),
            401 => Err(Error::AuthFailed {
                host: request.host.clone(),
            }),
            403 => Err(Error::PermissionDenied {
                path: request.path.clone(),
            }),
            404 => Err(Error::NotFound {
                path: request.path.clone(),
            }),
            408 => Err(Error::Timeout {
                operation: request.operation(),
                duration: request.timeout,
            }),
            status => Err(Error::OperationFailed {
                status,
                message: error_message(&response.body),
            }),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let bytes = self.authenticated_request(method, path, body).await?;
        decode_data(&bytes)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(Method::Get, path, None).await
    }

    /// Issues a call that may answer with a task id and waits for the task.
    async fn call_task(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        let upid: Option<String> = self.call(method, path, body).await?;
        match upid {
            Some(upid) if upid.starts_with("UPID:") => self.wait_task(&upid).await,
            _ => Ok(()),
        }
    }

    /// Polls a task until it stops.
    pub async fn wait_task(&self, upid: &str) -> Result<()> {
        let node = upid_node(upid).unwrap_or(&self.node);
        let path = format!("/nodes/{node}/tasks/{upid}/status");
        let deadline = tokio::time::Instant::now() + self.task_timeout;

        loop {
            let status: TaskStatus = self.get(&path).await?;
            if status.status == "stopped" {
                let exit = status.exitstatus.unwrap_or_else(|| "unknown".to_string());
                if exit == "OK" {
                    debug!("Task {} completed", upid);
                    return Ok(());
                }
                return Err(Error::TaskFailed {
                    upid: upid.to_string(),
                    status: exit,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("task {upid}"),
                    duration: self.task_timeout,
                });
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    // =========================================================================
    // Cluster
    // =========================================================================

    /// Cluster nodes, served from the cache while fresh.
    pub async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.nodes
            .get_or_refresh(|| async {
                let resources: Vec<ClusterResource> = self.get("/cluster/resources").await?;
                Ok(resources
                    .into_iter()
                    .filter_map(ClusterResource::into_node)
                    .collect())
            })
            .await
    }

    /// Next free vmid as reported by the cluster.
    pub async fn next_vmid(&self) -> Result<u32> {
        #[derive(Deserialize)]
        struct NextId(#[serde(deserialize_with = "types::de_vmid")] u32);
        let NextId(id) = self.get("/cluster/nextid").await?;
        Ok(id)
    }

    // =========================================================================
    // Guests
    // =========================================================================

    /// Guests on every online node. Nodes whose listing fails are skipped.
    pub async fn list_guests(&self) -> Result<Vec<Guest>> {
        let nodes = self.get_nodes().await?;
        let mut guests = Vec::new();
        for node in nodes.iter().filter(|n| n.is_online()) {
            let path = format!("/nodes/{}/lxc", node.name);
            let entries: Vec<GuestListEntry> = match self.get(&path).await {
                Ok(entries) => entries,
                Err(e @ (Error::AuthFailed { .. } | Error::PermissionDenied { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("Skipping node {}: {}", node.name, e);
                    continue;
                }
            };
            guests.extend(entries.into_iter().map(|entry| Guest {
                vmid: entry.vmid,
                name: entry.name.unwrap_or_default(),
                node: node.name.clone(),
                status: entry.status,
            }));
        }
        Ok(guests)
    }

    /// Creates a stopped guest on the target node and waits for the task.
    ///
    /// The request is retried like any other, so a failure can still leave
    /// the guest behind when an earlier attempt's answer was lost.
    pub async fn create_guest(&self, config: &GuestConfig) -> Result<Guest> {
        config.validate()?;
        let path = format!("/nodes/{}/lxc", self.node);
        self.call_task(Method::Post, &path, Some(Value::Object(config.to_params())))
            .await?;
        info!("Created guest {} ({})", config.vmid, config.hostname);
        Ok(Guest {
            vmid: config.vmid,
            name: config.hostname.clone(),
            node: self.node.clone(),
            status: GuestState::Stopped,
        })
    }

    pub async fn start_guest(&self, vmid: u32) -> Result<()> {
        let path = format!("{}/status/start", self.guest_path(vmid));
        self.call_task(Method::Post, &path, None).await?;
        info!("Started guest {}", vmid);
        Ok(())
    }

    pub async fn stop_guest(&self, vmid: u32) -> Result<()> {
        let path = format!("{}/status/stop", self.guest_path(vmid));
        self.call_task(Method::Post, &path, None).await?;
        info!("Stopped guest {}", vmid);
        Ok(())
    }

    /// Graceful shutdown with a timeout in seconds; `force` stops the guest
    /// once the timeout passes.
    pub async fn shutdown_guest(&self, vmid: u32, timeout_secs: u64, force: bool) -> Result<()> {
        let path = format!("{}/status/shutdown", self.guest_path(vmid));
        let body = json!({ "timeout": timeout_secs, "forceStop": u8::from(force) });
        self.call_task(Method::Post, &path, Some(body)).await
    }

    pub async fn delete_guest(&self, vmid: u32) -> Result<()> {
        self.destroy_guest(vmid, false).await
    }

    /// Deletes a guest. With `force` Proxmox destroys it even while running.
    pub async fn destroy_guest(&self, vmid: u32, force: bool) -> Result<()> {
        let mut path = self.guest_path(vmid);
        if force {
            path.push_str("?force=1");
        }
        self.call_task(Method::Delete, &path, None).await?;
        info!("Deleted guest {}", vmid);
        Ok(())
    }

    pub async fn guest_status(&self, vmid: u32) -> Result<GuestStatus> {
        self.get(&format!("{}/status/current", self.guest_path(vmid)))
            .await
    }

    /// Raw guest configuration as the flat key/value map Proxmox returns.
    pub async fn guest_config(&self, vmid: u32) -> Result<Map<String, Value>> {
        self.get(&format!("{}/config", self.guest_path(vmid))).await
    }

    /// Applies a partial configuration update.
    pub async fn update_config(&self, vmid: u32, update: &ConfigUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let path = format!("{}/config", self.guest_path(vmid));
        self.call_task(Method::Put, &path, Some(Value::Object(update.to_params())))
            .await
    }

    /// Network interfaces reported by a running guest.
    pub async fn guest_interfaces(&self, vmid: u32) -> Result<Vec<GuestInterface>> {
        let data: Option<Vec<GuestInterface>> = self
            .get(&format!("{}/interfaces", self.guest_path(vmid)))
            .await?;
        Ok(data.unwrap_or_default())
    }

    // =========================================================================
    // Snapshots, Clones, Migration
    // =========================================================================

    pub async fn create_snapshot(
        &self,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let path = format!("{}/snapshot", self.guest_path(vmid));
        let mut body = json!({ "snapname": name });
        if let Some(d) = description {
            body["description"] = Value::from(d);
        }
        self.call_task(Method::Post, &path, Some(body)).await
    }

    /// Snapshots of a guest, excluding the synthetic `current` entry.
    pub async fn list_snapshots(&self, vmid: u32) -> Result<Vec<Snapshot>> {
        let snapshots: Vec<Snapshot> = self
            .get(&format!("{}/snapshot", self.guest_path(vmid)))
            .await?;
        Ok(snapshots
            .into_iter()
            .filter(|s| s.name != "current")
            .collect())
    }

    pub async fn delete_snapshot(&self, vmid: u32, name: &str) -> Result<()> {
        let path = format!("{}/snapshot/{name}", self.guest_path(vmid));
        self.call_task(Method::Delete, &path, None).await
    }

    pub async fn rollback_snapshot(&self, vmid: u32, name: &str) -> Result<()> {
        let path = format!("{}/snapshot/{name}/rollback", self.guest_path(vmid));
        self.call_task(Method::Post, &path, None).await
    }

    /// Full clone of `vmid` into `new_vmid`.
    pub async fn clone_guest(&self, vmid: u32, new_vmid: u32, hostname: &str) -> Result<Guest> {
        let path = format!("{}/clone", self.guest_path(vmid));
        let body = json!({ "newid": new_vmid, "hostname": hostname, "full": 1 });
        self.call_task(Method::Post, &path, Some(body)).await?;
        Ok(Guest {
            vmid: new_vmid,
            name: hostname.to_string(),
            node: self.node.clone(),
            status: GuestState::Stopped,
        })
    }

    /// Migrates a guest to `target`. Running guests are restarted there.
    pub async fn migrate_guest(&self, vmid: u32, target: &str, restart: bool) -> Result<()> {
        let path = format!("{}/migrate", self.guest_path(vmid));
        let body = json!({ "target": target, "restart": u8::from(restart) });
        self.call_task(Method::Post, &path, Some(body)).await?;
        info!("Migrated guest {} to {}", vmid, target);
        Ok(())
    }

    /// Turns a stopped guest into a template.
    pub async fn convert_to_template(&self, vmid: u32) -> Result<()> {
        let path = format!("{}/template", self.guest_path(vmid));
        self.call_task(Method::Post, &path, None).await
    }

    fn guest_path(&self, vmid: u32) -> String {
        format!("/nodes/{}/lxc/{vmid}", self.node)
    }
}

/// Decodes the `data` member of an answer. An empty body decodes as `null`.
fn decode_data<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let bytes = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"{\"data\":null}".as_slice()
    } else {
        bytes
    };
    serde_json::from_slice::<Envelope<T>>(bytes)
        .map(|e| e.data)
        .map_err(Error::serialization)
}

/// Best-effort error text from a non-2xx body.
fn error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.trim().to_string();
        }
        if let Some(errors) = value.get("errors").filter(|e| !e.is_null()) {
            return errors.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "no error detail".to_string()
    } else {
        text.chars().take(512).collect()
    }
}

/// Node name embedded in a UPID (`UPID:<node>:...`).
fn upid_node(upid: &str) -> Option<&str> {
    upid.strip_prefix("UPID:")?
        .split(':')
        .next()
        .filter(|n| !n.is_empty())
}
