//! In-process stand-ins for Proxmox, an OCI registry and the host firewall.
//!
//! Each fake implements the crate's seam trait so the gateway, image pipeline
//! and orchestration manager run their real code paths in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use proxcri::config::{GatewayConfig, ImageStoreConfig, RuntimeConfig};
use proxcri::error::{Error, Result};
use proxcri::gateway::{ApiRequest, ApiResponse, HypervisorGateway, Method, Transport};
use proxcri::image::ImagePipeline;
use proxcri::pod::{ForwardRule, OrchestrationManager, PodId, RuleBackend};
use proxcri::registry::{Layer, RegistryFetcher, sha256_digest};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub const NODE: &str = "pve1";

// =============================================================================
// Fake Proxmox
// =============================================================================

/// One request as the fake saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub method: Method,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct FakeGuest {
    pub name: String,
    pub running: bool,
    pub config: Map<String, Value>,
    pub snapshots: Vec<String>,
}

#[derive(Debug, Default)]
struct ProxmoxState {
    down: HashSet<String>,
    host_status: HashMap<String, u16>,
    calls: Vec<Call>,
    nodes: Vec<(String, String)>,
    guests: BTreeMap<u32, FakeGuest>,
    tasks: HashMap<String, String>,
    task_seq: u32,
    creates: usize,
    failing_creates: HashSet<usize>,
    failing_starts: HashSet<u32>,
    failing_stops: HashSet<u32>,
    failing_updates: HashSet<u32>,
    failing_deletes: HashSet<u32>,
    next_id: u32,
}

/// A single-node cluster answering the subset of the API the crate uses.
#[derive(Debug)]
pub struct FakeProxmox {
    state: Mutex<ProxmoxState>,
}

impl Default for FakeProxmox {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProxmox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProxmoxState {
                nodes: vec![(NODE.to_string(), "online".to_string())],
                next_id: 100,
                ..ProxmoxState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProxmoxState> {
        self.state.lock().unwrap()
    }

    /// Makes `host` refuse connections.
    pub fn set_down(&self, host: &str, down: bool) {
        let mut state = self.state();
        if down {
            state.down.insert(host.to_string());
        } else {
            state.down.remove(host);
        }
    }

    /// Makes `host` answer every request with `status`.
    pub fn answer_with(&self, host: &str, status: u16) {
        self.state().host_status.insert(host.to_string(), status);
    }

    pub fn set_nodes(&self, nodes: &[(&str, &str)]) {
        self.state().nodes = nodes
            .iter()
            .map(|(n, s)| (n.to_string(), s.to_string()))
            .collect();
    }

    pub fn set_next_id(&self, id: u32) {
        self.state().next_id = id;
    }

    /// The `n`th guest creation (1-based) ends in a failed task.
    pub fn fail_create(&self, n: usize) {
        self.state().failing_creates.insert(n);
    }

    pub fn fail_start(&self, vmid: u32) {
        self.state().failing_starts.insert(vmid);
    }

    pub fn fail_stop(&self, vmid: u32) {
        self.state().failing_stops.insert(vmid);
    }

    pub fn fail_update(&self, vmid: u32) {
        self.state().failing_updates.insert(vmid);
    }

    pub fn fail_delete(&self, vmid: u32) {
        self.state().failing_deletes.insert(vmid);
    }

    /// Creates a guest behind the crate's back.
    pub fn insert_guest(&self, vmid: u32, name: &str, running: bool) {
        self.state().guests.insert(
            vmid,
            FakeGuest {
                name: name.to_string(),
                running,
                config: Map::new(),
                snapshots: Vec::new(),
            },
        );
    }

    /// Removes a guest behind the crate's back.
    pub fn remove_guest(&self, vmid: u32) {
        self.state().guests.remove(&vmid);
    }

    pub fn guest(&self, vmid: u32) -> Option<FakeGuest> {
        self.state().guests.get(&vmid).cloned()
    }

    pub fn guests(&self) -> Vec<u32> {
        self.state().guests.keys().copied().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of requests whose method matches and whose path ends with `suffix`.
    pub fn count(&self, method: Method, suffix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path.ends_with(suffix))
            .count()
    }

    /// Hosts contacted, in order.
    pub fn hosts_called(&self) -> Vec<String> {
        self.state().calls.iter().map(|c| c.host.clone()).collect()
    }

    fn task(state: &mut ProxmoxState, kind: &str, vmid: u32, exit: &str) -> ApiResponse {
        state.task_seq += 1;
        let upid = format!(
            "UPID:{NODE}:{:08X}:00000000:00000000:{kind}:{vmid}:root@pam:",
            state.task_seq
        );
        state.tasks.insert(upid.clone(), exit.to_string());
        ApiResponse::ok(&json!({ "data": upid }))
    }

    fn not_found() -> ApiResponse {
        ApiResponse {
            status: 404,
            body: br#"{"data":null,"message":"no such resource"}"#.to_vec(),
        }
    }

    fn route(state: &mut ProxmoxState, request: &ApiRequest) -> ApiResponse {
        let (path, query) = request
            .path
            .split_once('?')
            .unwrap_or((request.path.as_str(), ""));
        let force = query.split('&').any(|p| p == "force=1");
        let method = request.method;

        match (method, path) {
            (Method::Get, "/cluster/resources") => {
                let mut resources: Vec<Value> = state
                    .nodes
                    .iter()
                    .map(|(n, s)| json!({ "type": "node", "node": n, "status": s }))
                    .collect();
                resources.push(json!({ "type": "storage", "node": NODE, "storage": "local" }));
                return ApiResponse::ok(&json!({ "data": resources }));
            }
            (Method::Get, "/cluster/nextid") => {
                return ApiResponse::ok(&json!({ "data": state.next_id.to_string() }));
            }
            _ => {}
        }

        let Some(rest) = path.strip_prefix("/nodes/") else {
            return Self::not_found();
        };
        let Some((_node, rest)) = rest.split_once('/') else {
            return Self::not_found();
        };

        if let Some(task) = rest.strip_prefix("tasks/") {
            let upid = task.strip_suffix("/status").unwrap_or(task);
            return match state.tasks.get(upid) {
                Some(exit) => ApiResponse::ok(&json!({
                    "data": { "status": "stopped", "exitstatus": exit }
                })),
                None => Self::not_found(),
            };
        }

        if rest == "lxc" {
            return match method {
                Method::Get => {
                    let list: Vec<Value> = state
                        .guests
                        .iter()
                        .map(|(vmid, g)| {
                            json!({
                                "vmid": vmid.to_string(),
                                "name": g.name,
                                "status": if g.running { "running" } else { "stopped" },
                            })
                        })
                        .collect();
                    ApiResponse::ok(&json!({ "data": list }))
                }
                Method::Post => {
                    let params = request
                        .body
                        .as_ref()
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    let vmid = params
                        .get("vmid")
                        .and_then(Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(0);
                    state.creates += 1;
                    if state.failing_creates.contains(&state.creates) {
                        return Self::task(state, "vzcreate", vmid, "unable to create CT - no space");
                    }
                    if state.guests.contains_key(&vmid) {
                        return Self::task(state, "vzcreate", vmid, "CT already exists");
                    }
                    let name = params
                        .get("hostname")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    state.guests.insert(
                        vmid,
                        FakeGuest {
                            name,
                            running: false,
                            config: params,
                            snapshots: Vec::new(),
                        },
                    );
                    Self::task(state, "vzcreate", vmid, "OK")
                }
                _ => Self::not_found(),
            };
        }

        let Some(rest) = rest.strip_prefix("lxc/") else {
            return Self::not_found();
        };
        let (vmid, action) = rest.split_once('/').unwrap_or((rest, ""));
        let Ok(vmid) = vmid.parse::<u32>() else {
            return Self::not_found();
        };
        if !state.guests.contains_key(&vmid) {
            return Self::not_found();
        }

        match (method, action) {
            (Method::Delete, "") => {
                if state.failing_deletes.contains(&vmid) {
                    return Self::task(state, "vzdestroy", vmid, "storage busy");
                }
                if state.guests[&vmid].running && !force {
                    return Self::task(state, "vzdestroy", vmid, "CT is running");
                }
                state.guests.remove(&vmid);
                Self::task(state, "vzdestroy", vmid, "OK")
            }
            (Method::Post, "status/start") => {
                if state.failing_starts.contains(&vmid) {
                    return Self::task(state, "vzstart", vmid, "startup for container failed");
                }
                if let Some(g) = state.guests.get_mut(&vmid) {
                    g.running = true;
                }
                Self::task(state, "vzstart", vmid, "OK")
            }
            (Method::Post, "status/stop") => {
                if state.failing_stops.contains(&vmid) {
                    return Self::task(state, "vzstop", vmid, "command 'lxc-stop' failed");
                }
                if let Some(g) = state.guests.get_mut(&vmid) {
                    g.running = false;
                }
                Self::task(state, "vzstop", vmid, "OK")
            }
            (Method::Get, "status/current") => {
                let g = &state.guests[&vmid];
                let mut data = json!({
                    "vmid": vmid,
                    "name": g.name,
                    "status": if g.running { "running" } else { "stopped" },
                    "uptime": 0,
                });
                if g.running {
                    data["pid"] = json!(40_000 + vmid);
                }
                ApiResponse::ok(&json!({ "data": data }))
            }
            (Method::Get, "config") => {
                ApiResponse::ok(&json!({ "data": state.guests[&vmid].config }))
            }
            (Method::Put, "config") => {
                if state.failing_updates.contains(&vmid) {
                    return ApiResponse {
                        status: 500,
                        body: br#"{"data":null,"message":"update failed: lock timeout"}"#.to_vec(),
                    };
                }
                let update = request
                    .body
                    .as_ref()
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                if let Some(g) = state.guests.get_mut(&vmid) {
                    g.config.extend(update);
                }
                ApiResponse::ok(&json!({ "data": null }))
            }
            (Method::Get, "interfaces") => {
                if !state.guests[&vmid].running {
                    return ApiResponse::ok(&json!({ "data": null }));
                }
                let inet = format!("10.0.{}.{}/24", vmid / 250, vmid % 250 + 2);
                ApiResponse::ok(&json!({
                    "data": [
                        { "name": "lo", "inet": "127.0.0.1/8" },
                        { "name": "eth0", "hwaddr": "bc:24:11:00:00:01", "inet": inet },
                    ]
                }))
            }
            (Method::Post, "snapshot") => {
                let name = body_str(request, "snapname");
                if let Some(g) = state.guests.get_mut(&vmid) {
                    g.snapshots.push(name);
                }
                Self::task(state, "vzsnapshot", vmid, "OK")
            }
            (Method::Get, "snapshot") => {
                let mut list: Vec<Value> = state.guests[&vmid]
                    .snapshots
                    .iter()
                    .map(|s| json!({ "name": s, "description": "" }))
                    .collect();
                list.push(json!({ "name": "current", "description": "You are here!" }));
                ApiResponse::ok(&json!({ "data": list }))
            }
            (Method::Post, "clone") => {
                let new_vmid = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("newid"))
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0);
                let name = body_str(request, "hostname");
                let config = state.guests[&vmid].config.clone();
                state.guests.insert(
                    new_vmid,
                    FakeGuest {
                        name,
                        running: false,
                        config,
                        snapshots: Vec::new(),
                    },
                );
                Self::task(state, "vzclone", vmid, "OK")
            }
            (Method::Post, "template") => {
                if let Some(g) = state.guests.get_mut(&vmid) {
                    g.config.insert("template".to_string(), json!(1));
                }
                Self::task(state, "vztemplate", vmid, "OK")
            }
            (Method::Post, "migrate") => Self::task(state, "vzmigrate", vmid, "OK"),
            (_, action) if action.starts_with("snapshot/") => {
                let rest = &action["snapshot/".len()..];
                let (name, rollback) = match rest.strip_suffix("/rollback") {
                    Some(name) => (name, true),
                    None => (rest, false),
                };
                let known = state.guests[&vmid].snapshots.iter().any(|s| s == name);
                match (method, rollback) {
                    (Method::Post, true) if known => Self::task(state, "vzrollback", vmid, "OK"),
                    (Method::Delete, false) if known => {
                        if let Some(g) = state.guests.get_mut(&vmid) {
                            g.snapshots.retain(|s| s != name);
                        }
                        Self::task(state, "vzdelsnapshot", vmid, "OK")
                    }
                    (Method::Post, true) | (Method::Delete, false) => Self::task(
                        state,
                        "vzrollback",
                        vmid,
                        "snapshot does not exist",
                    ),
                    _ => Self::not_found(),
                }
            }
            _ => Self::not_found(),
        }
    }
}

fn body_str(request: &ApiRequest, key: &str) -> String {
    request
        .body
        .as_ref()
        .and_then(|b| b.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Transport for FakeProxmox {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut state = self.state();
        state.calls.push(Call {
            host: request.host.clone(),
            method: request.method,
            path: request.path.clone(),
        });
        if state.down.contains(&request.host) {
            return Err(Error::ConnectionFailed {
                host: request.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(status) = state.host_status.get(&request.host) {
            return Ok(ApiResponse::status(*status));
        }
        Ok(Self::route(&mut state, request))
    }
}

/// Forwards to a [`FakeProxmox`] but loses the answer to one guest creation.
///
/// The `n`th `POST /nodes/<node>/lxc` (1-based) reaches the fake, which
/// creates the guest, and then fails with a timeout as if the reply never
/// arrived.
#[derive(Debug)]
pub struct LossyTransport {
    pub inner: Arc<FakeProxmox>,
    lose_create: usize,
    creates: Mutex<usize>,
}

impl LossyTransport {
    pub fn new(inner: Arc<FakeProxmox>, lose_create: usize) -> Self {
        Self {
            inner,
            lose_create,
            creates: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Transport for LossyTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let response = self.inner.send(request).await?;
        if request.method == Method::Post && request.path == format!("/nodes/{NODE}/lxc") {
            let mut creates = self.creates.lock().unwrap();
            *creates += 1;
            if *creates == self.lose_create {
                return Err(Error::Timeout {
                    operation: request.operation(),
                    duration: request.timeout,
                });
            }
        }
        Ok(response)
    }
}

/// Gateway settings for tests: no backoff, two attempts per call.
pub fn gateway_config(hosts: &[&str]) -> GatewayConfig {
    GatewayConfig {
        max_attempts: 2,
        retry_backoff_ms: 0,
        ..GatewayConfig::new(
            hosts.iter().map(|h| h.to_string()).collect(),
            "root@pam!test=00000000-0000-0000-0000-000000000000",
            NODE,
        )
    }
}

pub fn gateway(fake: &Arc<FakeProxmox>, hosts: &[&str]) -> HypervisorGateway {
    HypervisorGateway::with_transport(&gateway_config(hosts), fake.clone()).unwrap()
}

// =============================================================================
// Fake Registry
// =============================================================================

/// Files of one layer: `(path, contents)`; a path ending in `/` is a directory.
pub type LayerFiles<'a> = &'a [(&'a str, &'a str)];

/// Builds a gzip-compressed tar layer.
pub fn gz_layer(files: LayerFiles<'_>) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        if let Some(dir) = path.strip_suffix('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, dir, std::io::empty())
                .unwrap();
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[derive(Debug, Default)]
struct RegistryState {
    manifests: HashMap<(String, String), Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    corrupt: HashSet<String>,
}

/// Digests of a published image.
#[derive(Debug, Clone)]
pub struct Published {
    pub manifest_digest: String,
    pub config_digest: String,
    pub layers: Vec<String>,
}

/// Registry serving manifests and blobs from memory.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
    layer_fetches: AtomicU64,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap()
    }

    /// Publishes a single-platform image under `repository:tag`.
    pub fn publish(&self, repository: &str, tag: &str, layers: &[LayerFiles<'_>]) -> Published {
        let (manifest, published) = self.build_manifest(repository, "amd64", layers);
        let mut state = self.state();
        state
            .manifests
            .insert((repository.to_string(), tag.to_string()), manifest.clone());
        state
            .manifests
            .insert((repository.to_string(), published.manifest_digest.clone()), manifest);
        published
    }

    /// Publishes an index with one image per architecture.
    pub fn publish_index(
        &self,
        repository: &str,
        tag: &str,
        images: &[(&str, &[LayerFiles<'_>])],
    ) -> Vec<Published> {
        let mut entries = Vec::new();
        let mut published = Vec::new();
        for (arch, layers) in images {
            let (manifest, image) = self.build_manifest(repository, arch, layers);
            entries.push(json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": image.manifest_digest,
                "size": manifest.len(),
                "platform": { "os": "linux", "architecture": arch },
            }));
            self.state()
                .manifests
                .insert((repository.to_string(), image.manifest_digest.clone()), manifest);
            published.push(image);
        }
        let index = json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": entries,
        });
        self.state().manifests.insert(
            (repository.to_string(), tag.to_string()),
            serde_json::to_vec(&index).unwrap(),
        );
        published
    }

    fn build_manifest(
        &self,
        repository: &str,
        arch: &str,
        layers: &[LayerFiles<'_>],
    ) -> (Vec<u8>, Published) {
        let config = serde_json::to_vec(&json!({
            "architecture": arch,
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin:/bin"],
                "Cmd": ["/bin/sh"],
                "WorkingDir": "/",
                "Labels": { "repository": repository },
            },
            "rootfs": { "type": "layers", "diff_ids": [] },
        }))
        .unwrap();
        let config_digest = sha256_digest(&config);

        let mut state = self.state();
        state.blobs.insert(config_digest.clone(), config.clone());

        let mut descriptors = Vec::new();
        let mut digests = Vec::new();
        for files in layers {
            let blob = gz_layer(files);
            let digest = sha256_digest(&blob);
            descriptors.push(json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": blob.len(),
            }));
            state.blobs.insert(digest.clone(), blob);
            digests.push(digest);
        }

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": descriptors,
        }))
        .unwrap();

        let published = Published {
            manifest_digest: sha256_digest(&manifest),
            config_digest,
            layers: digests,
        };
        (manifest, published)
    }

    /// Serves altered bytes for `digest` from now on.
    pub fn corrupt(&self, digest: &str) {
        self.state().corrupt.insert(digest.to_string());
    }

    pub fn repair(&self, digest: &str) {
        self.state().corrupt.remove(digest);
    }

    /// Layer blobs served so far.
    pub fn layer_fetches(&self) -> u64 {
        self.layer_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryFetcher for FakeRegistry {
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<Vec<u8>> {
        self.state()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| Error::ManifestFetchFailed {
                reference: format!("{repository}:{reference}"),
                reason: "manifest unknown".to_string(),
            })
    }

    async fn fetch_config(&self, _repository: &str, digest: &str, _size: u64) -> Result<Vec<u8>> {
        self.state()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::ConfigFetchFailed {
                digest: digest.to_string(),
                reason: "blob unknown".to_string(),
            })
    }

    async fn fetch_layer(&self, _repository: &str, layer: &Layer, dest: &Path) -> Result<()> {
        self.layer_fetches.fetch_add(1, Ordering::SeqCst);
        let (mut data, corrupt) = {
            let state = self.state();
            let data = state
                .blobs
                .get(&layer.digest)
                .cloned()
                .ok_or_else(|| Error::LayerDownloadFailed {
                    digest: layer.digest.clone(),
                    reason: "blob unknown".to_string(),
                })?;
            (data, state.corrupt.contains(&layer.digest))
        };
        if corrupt {
            data.push(0);
        }
        tokio::fs::write(dest, data).await?;
        Ok(())
    }
}

/// Serves a [`FakeRegistry`], holding every layer download open until
/// released.
///
/// The blob is already written to the download path when `started` fires, so
/// the partial file sits in the layer cache while the download waits.
#[derive(Debug)]
pub struct GatedRegistry {
    inner: Arc<FakeRegistry>,
    pub started: Notify,
    pub release: Notify,
}

impl GatedRegistry {
    pub fn new(inner: Arc<FakeRegistry>) -> Self {
        Self {
            inner,
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl RegistryFetcher for GatedRegistry {
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<Vec<u8>> {
        self.inner.fetch_manifest(repository, reference).await
    }

    async fn fetch_config(&self, repository: &str, digest: &str, size: u64) -> Result<Vec<u8>> {
        self.inner.fetch_config(repository, digest, size).await
    }

    async fn fetch_layer(&self, repository: &str, layer: &Layer, dest: &Path) -> Result<()> {
        self.inner.fetch_layer(repository, layer, dest).await?;
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Pipeline over a temporary store for `amd64`.
pub fn image_pipeline(registry: &Arc<FakeRegistry>, dir: &TempDir) -> ImagePipeline {
    image_pipeline_with(registry.clone(), dir)
}

pub fn image_pipeline_with(fetcher: Arc<dyn RegistryFetcher>, dir: &TempDir) -> ImagePipeline {
    let config = ImageStoreConfig {
        store_dir: dir.path().join("images"),
        layer_cache_dir: dir.path().join("layers"),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
    };
    ImagePipeline::new(&config, fetcher).unwrap()
}

// =============================================================================
// Fake Firewall
// =============================================================================

/// Records rule changes instead of touching the host firewall.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub installed: Mutex<Vec<(PodId, ForwardRule)>>,
    pub removed: Mutex<Vec<(PodId, ForwardRule)>>,
    pub failing_host_ports: Mutex<HashSet<u16>>,
}

impl RecordingBackend {
    pub fn installed(&self) -> Vec<(PodId, ForwardRule)> {
        self.installed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<(PodId, ForwardRule)> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_host_port(&self, port: u16) {
        self.failing_host_ports.lock().unwrap().insert(port);
    }
}

#[async_trait]
impl RuleBackend for RecordingBackend {
    async fn install(&self, pod: &PodId, rule: &ForwardRule) -> Result<()> {
        if self
            .failing_host_ports
            .lock()
            .unwrap()
            .contains(&rule.mapping.host_port)
        {
            return Err(Error::NetworkSetupFailed {
                pod: pod.to_string(),
                reason: format!("cannot bind {}", rule.mapping.host_port),
            });
        }
        self.installed.lock().unwrap().push((pod.clone(), *rule));
        Ok(())
    }

    async fn remove(&self, pod: &PodId, rule: &ForwardRule) -> Result<()> {
        self.removed.lock().unwrap().push((pod.clone(), *rule));
        Ok(())
    }
}

// =============================================================================
// Assembled Stack
// =============================================================================

/// Everything a manager test needs, kept alive together.
pub struct Harness {
    pub proxmox: Arc<FakeProxmox>,
    pub registry: Arc<FakeRegistry>,
    pub firewall: Arc<RecordingBackend>,
    pub manager: OrchestrationManager,
    pub dir: TempDir,
}

pub fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        vmid_start: 200,
        vmid_end: 299,
        hook_timeout_secs: 5,
        ..RuntimeConfig::default()
    }
}

/// Manager over two API hosts with `alpine:3.19` and `nginx:1.27` published.
pub fn harness() -> Harness {
    harness_with(runtime_config())
}

pub fn harness_with(settings: RuntimeConfig) -> Harness {
    let proxmox = Arc::new(FakeProxmox::new());
    harness_over(proxmox.clone(), proxmox, settings)
}

/// Harness whose gateway talks to `proxmox` through `transport`.
pub fn harness_over(
    proxmox: Arc<FakeProxmox>,
    transport: Arc<dyn Transport>,
    settings: RuntimeConfig,
) -> Harness {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish(
        "alpine",
        "3.19",
        &[&[("etc/", ""), ("etc/os-release", "ID=alpine\n"), ("bin/sh", "#!")]],
    );
    registry.publish(
        "nginx",
        "1.27",
        &[
            &[("etc/", ""), ("etc/os-release", "ID=debian\n")],
            &[("usr/sbin/", ""), ("usr/sbin/nginx", "ELF")],
        ],
    );
    let firewall = Arc::new(RecordingBackend::default());
    let dir = TempDir::new().unwrap();

    let gateway = Arc::new(
        HypervisorGateway::with_transport(&gateway_config(&["pve1.lan", "pve2.lan"]), transport)
            .unwrap(),
    );
    let images = Arc::new(image_pipeline(&registry, &dir));
    let manager =
        OrchestrationManager::with_rule_backend(gateway, images, settings, firewall.clone())
            .unwrap();

    Harness {
        proxmox,
        registry,
        firewall,
        manager,
        dir,
    }
}
