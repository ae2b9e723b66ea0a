//! Orchestration manager.
//!
//! Owns the pod/container registry and drives multi-step lifecycle
//! operations against the [`HypervisorGateway`], materializing rootfs content
//! through the [`ImagePipeline`].
//!
//! # Registry
//!
//! One `RwLock` guards the whole registry. It is never held across an
//! `.await`: operations snapshot what they need, talk to the hypervisor, then
//! write results back. Pods being created are reserved in the registry up
//! front so two callers cannot create guests for the same pod.
//!
//! # Failure Handling
//!
//! | Operation      | On failure                                              |
//! |----------------|---------------------------------------------------------|
//! | `create_pod`   | guests created so far are deleted, error returned       |
//! | `create_pod`   | a guest left by a failed create request is deleted too  |
//! | `start_pod`    | stops at the failing member, others keep their state    |
//! | `stop_pod`     | stops at the failing member, others keep their state    |
//! | `delete_pod`   | a guest that failed to stop is force-deleted            |

use crate::config::RuntimeConfig;
use crate::constants::{DEFAULT_CORES, DEFAULT_MEMORY_MB, DEFAULT_SWAP_MB};
use crate::error::{Error, HookStage, Result, Step};
use crate::gateway::{
    ConfigUpdate, GuestConfig, HypervisorGateway, IpConfig, MountPoint, NetworkConfig, RootfsSpec,
    primary_ipv4,
};
use crate::image::ImagePipeline;
use crate::pod::hooks::{HookPayload, HookRunner};
use crate::pod::portforward::{
    ForwardRule, IptablesBackend, PortForwarder, RuleBackend, extract_port_mappings,
};
use crate::pod::vmid::VmidAllocator;
use crate::pod::{
    Container, ContainerId, ContainerInfo, ContainerSpec, ContainerStatus, NamespaceKind,
    NamespaceShare, Operation, Pod, PodId, PodRuntime, PodSpec, PodStatus, PodSummary,
    ResourceLimits,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const MAX_HOSTNAME_LEN: usize = 63;

#[derive(Debug, Default)]
struct Registry {
    pods: HashMap<PodId, Pod>,
    standalone: HashMap<ContainerId, Container>,
    /// Pods whose creation is in progress.
    creating: HashSet<PodId>,
}

impl Registry {
    fn container(&self, id: &ContainerId) -> Option<&Container> {
        self.standalone.get(id).or_else(|| {
            self.pods
                .values()
                .find_map(|p| p.containers.iter().find(|c| &c.id == id))
        })
    }

    fn container_mut(&mut self, id: &ContainerId) -> Option<&mut Container> {
        if let Some(c) = self.standalone.get_mut(id) {
            return Some(c);
        }
        self.pods.values_mut().find_map(|p| p.container_mut(id))
    }
}

/// Removes a creation reservation when creation ends, however it ends.
struct Reservation<'a> {
    registry: &'a RwLock<Registry>,
    id: PodId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.write() {
            registry.creating.remove(&self.id);
        }
    }
}

/// Member snapshot used while the registry lock is released.
#[derive(Debug, Clone)]
struct Member {
    id: ContainerId,
    name: String,
    vmid: u32,
    status: ContainerStatus,
    static_address: Option<String>,
    spec: ContainerSpec,
}

/// Pod and container lifecycle on top of LXC guests.
pub struct OrchestrationManager {
    gateway: Arc<HypervisorGateway>,
    images: Arc<ImagePipeline>,
    settings: RuntimeConfig,
    vmids: VmidAllocator,
    hooks: HookRunner,
    forwarder: PortForwarder,
    registry: RwLock<Registry>,
}

impl std::fmt::Debug for OrchestrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationManager")
            .field("gateway", &self.gateway)
            .field("vmids", &self.vmids.range())
            .finish_non_exhaustive()
    }
}

impl OrchestrationManager {
    /// Builds a manager that forwards ports with iptables.
    pub fn new(
        gateway: Arc<HypervisorGateway>,
        images: Arc<ImagePipeline>,
        settings: RuntimeConfig,
    ) -> Result<Self> {
        Self::with_rule_backend(
            gateway,
            images,
            settings,
            Arc::new(IptablesBackend::default()),
        )
    }

    /// Builds a manager over a caller-supplied firewall backend.
    pub fn with_rule_backend(
        gateway: Arc<HypervisorGateway>,
        images: Arc<ImagePipeline>,
        settings: RuntimeConfig,
        backend: Arc<dyn RuleBackend>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            vmids: VmidAllocator::new(settings.vmid_start, settings.vmid_end)?,
            hooks: HookRunner::new(settings.hook_timeout()),
            forwarder: PortForwarder::new(backend),
            registry: RwLock::new(Registry::default()),
            gateway,
            images,
            settings,
        })
    }

    #[must_use]
    pub fn gateway(&self) -> &HypervisorGateway {
        &self.gateway
    }

    #[must_use]
    pub fn images(&self) -> &ImagePipeline {
        &self.images
    }

    #[must_use]
    pub fn forwarder(&self) -> &PortForwarder {
        &self.forwarder
    }

    /// Looks a pod up by namespace and name.
    pub async fn find_pod(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        self.get_pod_status(&PodId::from_pod(namespace, name)).await
    }

    // =========================================================================
    // Registry Access
    // =========================================================================

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry.read().map_err(|_| Error::lock_poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry.write().map_err(|_| Error::lock_poisoned())
    }

    fn reserve(&self, id: &PodId) -> Result<Reservation<'_>> {
        let mut registry = self.write()?;
        if registry.pods.contains_key(id) || !registry.creating.insert(id.clone()) {
            return Err(Error::PodAlreadyExists(id.to_string()));
        }
        Ok(Reservation {
            registry: &self.registry,
            id: id.clone(),
        })
    }

    fn members(&self, id: &PodId) -> Result<Vec<Member>> {
        let registry = self.read()?;
        let pod = registry
            .pods
            .get(id)
            .ok_or_else(|| Error::PodNotFound(id.to_string()))?;
        Ok(pod
            .containers
            .iter()
            .map(|c| Member {
                id: c.id.clone(),
                name: c.name.clone(),
                vmid: c.vmid,
                status: c.status,
                static_address: c.config.net.static_address().map(String::from),
                spec: c.spec.clone(),
            })
            .collect())
    }

    fn find_container(&self, id: &ContainerId) -> Result<Container> {
        self.read()?
            .container(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    /// Records a new status. A container deleted meanwhile is ignored.
    fn set_status(&self, id: &ContainerId, status: ContainerStatus) -> Result<()> {
        if let Some(c) = self.write()?.container_mut(id) {
            c.status = status;
        }
        Ok(())
    }

    // =========================================================================
    // Guest Creation
    // =========================================================================

    async fn allocate_vmid(&self) -> Result<u32> {
        let floor = if self.settings.consult_cluster_nextid {
            Some(self.gateway.next_vmid().await?)
        } else {
            None
        };
        self.vmids.allocate(floor)
    }

    /// Template volume for an image, exported first when the template
    /// directory is local.
    async fn template_for(&self, image_id: &str) -> Result<String> {
        if let Some(dir) = &self.settings.template_dir {
            self.images.export_template(image_id, dir).await?;
        }
        Ok(format!(
            "{}:vztmpl/{}.tar.gz",
            self.settings.template_storage, image_id
        ))
    }

    fn guest_config(
        &self,
        vmid: u32,
        owner: Option<&PodSpec>,
        spec: &ContainerSpec,
        ostemplate: String,
    ) -> GuestConfig {
        let hostname = spec.hostname.clone().unwrap_or_else(|| match owner {
            Some(pod) => hostname_for(&pod.name, &spec.name),
            None => spec.name.clone(),
        });
        let ip = match &spec.network.address {
            Some(cidr) => IpConfig::Static {
                cidr: cidr.clone(),
                gateway: spec.network.gateway.clone(),
            },
            None => IpConfig::Dhcp,
        };
        let description = match owner {
            Some(pod) => format!(
                "proxcri pod {}/{} container {}",
                pod.namespace, pod.name, spec.name
            ),
            None => format!("proxcri container {}", spec.name),
        };

        GuestConfig {
            vmid,
            hostname,
            ostemplate: Some(ostemplate),
            ostype: Some("unmanaged".to_string()),
            memory_mb: spec.resources.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            swap_mb: spec.resources.swap_mb.unwrap_or(DEFAULT_SWAP_MB),
            cores: spec.resources.cores.unwrap_or(DEFAULT_CORES),
            rootfs: RootfsSpec {
                storage: self.settings.rootfs_storage.clone(),
                size_gb: self.settings.rootfs_size_gb,
            },
            net: NetworkConfig {
                ip,
                ..NetworkConfig::dhcp(
                    spec.network
                        .bridge
                        .clone()
                        .unwrap_or_else(|| self.settings.bridge.clone()),
                )
            },
            onboot: false,
            protection: false,
            template: false,
            unprivileged: !spec.privileged,
            features: spec.features.clone(),
            mounts: spec
                .mounts
                .iter()
                .map(|m| MountPoint {
                    volume: m.source.clone(),
                    path: m.destination.clone(),
                    read_only: m.read_only,
                    backup: false,
                })
                .collect(),
            description: Some(description),
            tags: vec!["proxcri".to_string()],
        }
    }

    /// Prepares the image and creates one stopped guest.
    async fn create_guest_for(
        &self,
        owner: Option<&PodSpec>,
        spec: &ContainerSpec,
    ) -> Result<Container> {
        let label = match owner {
            Some(pod) => format!("{}/{}/{}", pod.namespace, pod.name, spec.name),
            None => spec.name.clone(),
        };
        let fail = |step: Step, e: Error| Error::CreationFailed {
            id: label.clone(),
            step,
            source: Box::new(e),
        };

        let image = self
            .images
            .prepare(&spec.image)
            .await
            .map_err(|e| fail(Step::PrepareImage, e))?;
        let ostemplate = self
            .template_for(&image.id)
            .await
            .map_err(|e| fail(Step::PrepareImage, e))?;
        let vmid = self
            .allocate_vmid()
            .await
            .map_err(|e| fail(Step::AllocateVmid, e))?;

        let config = self.guest_config(vmid, owner, spec, ostemplate);
        if let Err(e) = self.gateway.create_guest(&config).await {
            if self.discard_failed_create(&config).await {
                self.vmids.release(vmid);
            }
            return Err(fail(Step::CreateGuest, e));
        }
        debug!(container = %label, vmid = vmid, "Guest created");

        Ok(Container {
            id: ContainerId::from_vmid(vmid),
            name: spec.name.clone(),
            vmid,
            status: ContainerStatus::Created,
            pod: owner.map(|p| PodId::from_pod(&p.namespace, &p.name)),
            image_id: image.id,
            spec: spec.clone(),
            config,
            created_at: Utc::now(),
        })
    }

    /// Deletes the guest a failed create request may have left behind.
    ///
    /// An earlier attempt can succeed on the hypervisor even though its
    /// answer never arrived. A guest under the vmid is only deleted when its
    /// hostname and description are the ones this create sent. Returns true
    /// when the vmid is free afterwards.
    async fn discard_failed_create(&self, config: &GuestConfig) -> bool {
        let vmid = config.vmid;
        let existing = match self.gateway.guest_config(vmid).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                warn!(vmid = vmid, "Cannot check for a half-created guest: {}", e);
                return false;
            }
        };

        let field = |key: &str| existing.get(key).and_then(Value::as_str).map(str::trim_end);
        let ours = field("hostname") == Some(config.hostname.as_str())
            && field("description") == config.description.as_deref().map(str::trim_end);
        if !ours {
            warn!(vmid = vmid, "vmid is held by a guest this runtime did not create");
            return false;
        }

        match self.gateway.delete_guest(vmid).await {
            Ok(()) => {
                info!(vmid = vmid, "Deleted guest left by a failed create");
                true
            }
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(vmid = vmid, "Could not delete half-created guest: {}", e);
                false
            }
        }
    }

    /// Deletes guests of a pod whose creation failed.
    async fn rollback(&self, pod: &PodId, created: &[Container]) {
        for container in created.iter().rev() {
            match self.gateway.delete_guest(container.vmid).await {
                Ok(()) => self.vmids.release(container.vmid),
                Err(e) => warn!(
                    pod = %pod,
                    vmid = container.vmid,
                    "Rollback could not delete guest: {}",
                    e
                ),
            }
        }
    }

    // =========================================================================
    // Networking
    // =========================================================================

    async fn member_address(&self, pod: &PodId, member: &Member) -> Result<Ipv4Addr> {
        let setup_failed = |reason: String| Error::NetworkSetupFailed {
            pod: pod.to_string(),
            reason,
        };

        let address = match &member.static_address {
            Some(address) => address.clone(),
            None => {
                let interfaces = self
                    .gateway
                    .guest_interfaces(member.vmid)
                    .await
                    .map_err(|e| setup_failed(format!("{}: {e}", member.id)))?;
                primary_ipv4(&interfaces).ok_or_else(|| {
                    setup_failed(format!("{} reports no IPv4 address", member.id))
                })?
            }
        };
        address
            .parse()
            .map_err(|_| setup_failed(format!("{}: invalid address '{address}'", member.id)))
    }

    async fn forward_ports(&self, id: &PodId, members: &[Member]) -> Result<()> {
        let specs: Vec<ContainerSpec> = members.iter().map(|m| m.spec.clone()).collect();
        let extracted = extract_port_mappings(&specs);
        if extracted.mappings.is_empty() {
            return Ok(());
        }

        let mut addresses: HashMap<&str, Ipv4Addr> = HashMap::new();
        let mut rules = Vec::with_capacity(extracted.mappings.len());
        for entry in &extracted.mappings {
            let target = match addresses.get(entry.container.as_str()) {
                Some(address) => *address,
                None => {
                    let Some(member) = members.iter().find(|m| m.name == entry.container) else {
                        continue;
                    };
                    let address = self.member_address(id, member).await?;
                    addresses.insert(member.name.as_str(), address);
                    address
                }
            };
            rules.push(ForwardRule {
                mapping: entry.mapping,
                target,
            });
        }

        self.forwarder.install(id, &rules).await?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Re-reads every member's hypervisor state into the registry.
    ///
    /// A guest that no longer exists is recorded as `Unknown`.
    pub async fn refresh_pod(&self, id: &PodId) -> Result<PodStatus> {
        for member in self.members(id)? {
            let observed = match self.gateway.guest_status(member.vmid).await {
                Ok(guest) => member.status.observe(guest.status),
                Err(e) if e.is_not_found() => ContainerStatus::Unknown,
                Err(e) => return Err(e),
            };
            if observed != member.status {
                debug!(
                    pod = %id,
                    container = %member.id,
                    "Status {} -> {}",
                    member.status,
                    observed
                );
            }
            self.set_status(&member.id, observed)?;
        }
        self.get_pod_status(id).await
    }

    /// Pushes CPU and memory limits to every member in declaration order.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceUpdateFailed`] names the member that failed and the
    /// members already updated.
    pub async fn apply_resources(&self, id: &PodId, limits: &ResourceLimits) -> Result<()> {
        if limits.cores == Some(0) || limits.memory_mb == Some(0) {
            return Err(Error::InvalidSpec(
                "cpu and memory limits must be positive".to_string(),
            ));
        }
        let update = ConfigUpdate {
            cores: limits.cores,
            memory_mb: limits.memory_mb,
            swap_mb: limits.swap_mb,
            ..ConfigUpdate::default()
        };

        let mut succeeded = Vec::new();
        for member in self.members(id)? {
            if let Err(e) = self.gateway.update_config(member.vmid, &update).await {
                warn!(pod = %id, container = %member.id, "Resource update failed: {}", e);
                return Err(Error::ResourceUpdateFailed {
                    pod: id.to_string(),
                    succeeded,
                    failed: member.id.to_string(),
                    source: Box::new(e),
                });
            }

            if let Some(c) = self.write()?.container_mut(&member.id) {
                if let Some(cores) = limits.cores {
                    c.config.cores = cores;
                    c.spec.resources.cores = Some(cores);
                }
                if let Some(memory) = limits.memory_mb {
                    c.config.memory_mb = memory;
                    c.spec.resources.memory_mb = Some(memory);
                }
                if let Some(swap) = limits.swap_mb {
                    c.config.swap_mb = swap;
                    c.spec.resources.swap_mb = Some(swap);
                }
            }
            succeeded.push(member.id.to_string());
        }

        info!(pod = %id, containers = succeeded.len(), "Resources applied");
        Ok(())
    }

    /// Records the first container as the owner of a `kind` namespace for
    /// the rest of the pod.
    ///
    /// This is bookkeeping only: the share is stored on the pod and reported
    /// in its status, but no guest configuration changes and the joiners'
    /// kernel namespaces stay their own. Callers that need the namespace
    /// entered use the returned `/proc/<pid>/ns/<kind>` path themselves.
    ///
    /// Returns `None` for pods with fewer than two containers. The owner must
    /// be running so its init pid can be referenced.
    pub async fn share_namespace(
        &self,
        id: &PodId,
        kind: NamespaceKind,
    ) -> Result<Option<NamespaceShare>> {
        let members = self.members(id)?;
        let Some((owner, joiners)) = members.split_first() else {
            return Ok(None);
        };
        if joiners.is_empty() {
            debug!(pod = %id, "Single-container pod, nothing to share");
            return Ok(None);
        }

        let operation = format!("share {kind} namespace of");
        if owner.status != ContainerStatus::Running {
            return Err(Error::InvalidState {
                id: owner.id.to_string(),
                state: owner.status.to_string(),
                operation,
            });
        }
        let guest = self.gateway.guest_status(owner.vmid).await?;
        let pid = guest.pid.ok_or_else(|| Error::InvalidState {
            id: owner.id.to_string(),
            state: "no init pid".to_string(),
            operation,
        })?;

        let share = NamespaceShare {
            kind,
            owner: owner.id.clone(),
            owner_pid: pid,
            path: format!("/proc/{pid}/ns/{}", kind.proc_name()),
            members: joiners.iter().map(|m| m.id.clone()).collect(),
        };

        if let Some(pod) = self.write()?.pods.get_mut(id) {
            pod.shared_namespaces.retain(|s| s.kind != kind);
            pod.shared_namespaces.push(share.clone());
        }
        info!(pod = %id, kind = %kind, owner = %share.owner, "Namespace shared");
        Ok(Some(share))
    }
}

#[async_trait]
impl PodRuntime for OrchestrationManager {
    async fn create_pod(&self, spec: &PodSpec) -> Result<PodStatus> {
        spec.validate()?;
        let id = PodId::from_pod(&spec.namespace, &spec.name);
        let _reservation = self.reserve(&id)?;
        info!(pod = %id, "Creating pod {}/{}", spec.namespace, spec.name);

        let payload = HookPayload {
            stage: "prestart",
            id: &id,
            namespace: &spec.namespace,
            name: &spec.name,
            containers: &[],
        }
        .to_json()?;
        self.hooks
            .run_all(HookStage::Prestart, &spec.hooks.prestart, &payload)
            .await?;

        let mut created = Vec::with_capacity(spec.containers.len());
        for container in &spec.containers {
            match self.create_guest_for(Some(spec), container).await {
                Ok(c) => created.push(c),
                Err(e) => {
                    warn!(pod = %id, "Pod creation failed, rolling back: {}", e);
                    self.rollback(&id, &created).await;
                    return Err(e);
                }
            }
        }

        let pod = Pod {
            id: id.clone(),
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            containers: created,
            hooks: spec.hooks.clone(),
            shared_namespaces: Vec::new(),
            created_at: Utc::now(),
        };
        let status = pod.status();
        let unregistered = match self.write() {
            Ok(mut registry) => {
                registry.pods.insert(id.clone(), pod);
                None
            }
            Err(e) => Some((e, pod)),
        };
        if let Some((e, pod)) = unregistered {
            self.rollback(&id, &pod.containers).await;
            return Err(e);
        }
        info!(pod = %id, containers = status.containers.len(), "Pod created");

        let payload = HookPayload {
            stage: "poststart",
            id: &id,
            namespace: &spec.namespace,
            name: &spec.name,
            containers: &status.containers,
        }
        .to_json()?;
        if let Err(e) = self
            .hooks
            .run_all(HookStage::Poststart, &spec.hooks.poststart, &payload)
            .await
        {
            warn!(pod = %id, "Poststart hook failed, pod kept: {}", e);
            return Err(e);
        }

        Ok(status)
    }

    async fn delete_pod(&self, id: &PodId) -> Result<()> {
        let members = self.members(id)?;
        info!(pod = %id, "Deleting pod");

        if let Err(e) = self.forwarder.remove_pod(id).await {
            warn!(pod = %id, "Port forward cleanup failed: {}", e);
        }

        let mut first_error = None;
        for member in &members {
            let mut force = false;
            if matches!(
                member.status,
                ContainerStatus::Running | ContainerStatus::Unknown
            ) {
                match self.gateway.stop_guest(member.vmid).await {
                    Ok(()) => self.set_status(&member.id, ContainerStatus::Stopped)?,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(pod = %id, container = %member.id, "Stop before delete failed, forcing: {}", e);
                        force = true;
                    }
                }
            }

            match self.gateway.destroy_guest(member.vmid, force).await {
                Ok(()) => self.vmids.release(member.vmid),
                Err(e) if e.is_not_found() => {
                    debug!(container = %member.id, "Guest already gone");
                    self.vmids.release(member.vmid);
                }
                Err(e) => {
                    warn!(pod = %id, container = %member.id, "Guest deletion failed: {}", e);
                    first_error.get_or_insert(Error::DeletionFailed {
                        id: member.id.to_string(),
                        step: Step::DeleteGuest,
                        source: Box::new(e),
                    });
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        self.write()?.pods.remove(id);
        info!(pod = %id, "Pod deleted");
        Ok(())
    }

    async fn start_pod(&self, id: &PodId) -> Result<()> {
        let members = self.members(id)?;
        for member in &members {
            if member.status == ContainerStatus::Running {
                continue;
            }
            self.gateway
                .start_guest(member.vmid)
                .await
                .map_err(|e| Error::StartFailed {
                    id: member.id.to_string(),
                    step: Step::StartGuest,
                    source: Box::new(e),
                })?;
            self.set_status(&member.id, ContainerStatus::Running)?;
        }
        info!(pod = %id, "Pod started");

        self.forward_ports(id, &members).await
    }

    async fn stop_pod(&self, id: &PodId) -> Result<()> {
        let members = self.members(id)?;
        let live = |m: &Member| {
            matches!(
                m.status,
                ContainerStatus::Running | ContainerStatus::Unknown
            )
        };
        if !members.iter().any(live)
            && let Some(never_started) = members
                .iter()
                .find(|m| m.status == ContainerStatus::Created)
        {
            return Err(Error::InvalidState {
                id: never_started.id.to_string(),
                state: never_started.status.to_string(),
                operation: Operation::Stop.to_string(),
            });
        }

        let cleanup = self.forwarder.remove_pod(id).await;
        if let Err(e) = &cleanup {
            warn!(pod = %id, "Port forward cleanup failed: {}", e);
        }

        for member in members.iter().filter(|m| live(*m)) {
            self.gateway
                .stop_guest(member.vmid)
                .await
                .map_err(|e| Error::StopFailed {
                    id: member.id.to_string(),
                    step: Step::StopGuest,
                    source: Box::new(e),
                })?;
            self.set_status(&member.id, ContainerStatus::Stopped)?;
        }
        info!(pod = %id, "Pod stopped");

        cleanup.map(|_| ())
    }

    async fn get_pod_status(&self, id: &PodId) -> Result<PodStatus> {
        self.read()?
            .pods
            .get(id)
            .map(Pod::status)
            .ok_or_else(|| Error::PodNotFound(id.to_string()))
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let mut pods: Vec<PodSummary> = self.read()?.pods.values().map(Pod::summary).collect();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(pods)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo> {
        spec.validate()?;
        let container = self.create_guest_for(None, spec).await?;
        let info = container.info();
        self.write()?
            .standalone
            .insert(container.id.clone(), container);
        info!(container = %info.id, "Container created");
        Ok(info)
    }

    async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        let container = self.find_container(id)?;
        if let Some(pod) = &container.pod {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: format!("member of pod {pod}"),
                operation: Operation::Delete.to_string(),
            });
        }
        container.status.check(id, Operation::Delete)?;

        match self.gateway.delete_guest(container.vmid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(container = %id, "Guest already gone"),
            Err(e) => {
                return Err(Error::DeletionFailed {
                    id: id.to_string(),
                    step: Step::DeleteGuest,
                    source: Box::new(e),
                });
            }
        }
        self.write()?.standalone.remove(id);
        self.vmids.release(container.vmid);
        info!(container = %id, "Container deleted");
        Ok(())
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        let container = self.find_container(id)?;
        container.status.check(id, Operation::Start)?;
        self.gateway
            .start_guest(container.vmid)
            .await
            .map_err(|e| Error::StartFailed {
                id: id.to_string(),
                step: Step::StartGuest,
                source: Box::new(e),
            })?;
        self.set_status(id, ContainerStatus::Running)
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<()> {
        let container = self.find_container(id)?;
        container.status.check(id, Operation::Stop)?;
        self.gateway
            .stop_guest(container.vmid)
            .await
            .map_err(|e| Error::StopFailed {
                id: id.to_string(),
                step: Step::StopGuest,
                source: Box::new(e),
            })?;
        self.set_status(id, ContainerStatus::Stopped)
    }

    async fn get_container_status(&self, id: &ContainerId) -> Result<ContainerInfo> {
        Ok(self.find_container(id)?.info())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let registry = self.read()?;
        let mut containers: Vec<ContainerInfo> = registry
            .pods
            .values()
            .flat_map(|p| p.containers.iter())
            .chain(registry.standalone.values())
            .map(Container::info)
            .collect();
        containers.sort_by_key(|c| c.vmid);
        Ok(containers)
    }
}

/// `<pod>-<container>`, cut to a valid hostname length.
fn hostname_for(pod: &str, container: &str) -> String {
    let mut name = format!("{pod}-{container}");
    name.truncate(MAX_HOSTNAME_LEN);
    name.trim_end_matches('-').to_string()
}
