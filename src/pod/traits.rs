//! Pod Runtime Interface trait definition.
//!
//! This module defines the `PodRuntime` trait, the lifecycle API a CRI
//! transport adapter drives. The adapter depends on this trait only.

use super::{ContainerId, ContainerInfo, ContainerSpec, PodId, PodSpec, PodStatus, PodSummary};
use crate::error::Result;
use async_trait::async_trait;

/// Pod and container lifecycle management.
///
/// Every method fails with one kind of [`crate::Error`]; raw transport
/// failures are wrapped with the pod or container and the failing step.
///
/// # Atomicity Guarantees
///
/// Implementations **MUST** ensure:
///
/// 1. `create_pod()` either registers the whole pod or leaves no guest behind
/// 2. `start_pod()` / `stop_pod()` stop at the first failure and keep the
///    state of members already transitioned; the computed phase shows the mix
/// 3. `delete_pod()` is best-effort: a failed stop does not prevent deletion
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` for use in async contexts.
#[async_trait]
pub trait PodRuntime: Send + Sync {
    /// Creates a pod: hooks, images, one guest per container.
    ///
    /// The pod is returned in phase `Pending`.
    ///
    /// # Errors
    ///
    /// - `InvalidSpec` before any side effect
    /// - `PodAlreadyExists` if the namespace/name pair is taken
    /// - `HookFailed` / `HookTimeout` from hooks
    /// - `CreationFailed` naming the container and step
    async fn create_pod(&self, spec: &PodSpec) -> Result<PodStatus>;

    /// Stops and deletes every member guest, then forgets the pod.
    async fn delete_pod(&self, id: &PodId) -> Result<()>;

    /// Starts members in declaration order and installs port forwards.
    async fn start_pod(&self, id: &PodId) -> Result<()>;

    /// Removes port forwards and stops members in declaration order.
    async fn stop_pod(&self, id: &PodId) -> Result<()>;

    /// Returns the recorded status of a pod.
    async fn get_pod_status(&self, id: &PodId) -> Result<PodStatus>;

    /// Lists all pods.
    async fn list_pods(&self) -> Result<Vec<PodSummary>>;

    /// Creates a container not owned by any pod.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerInfo>;

    /// Deletes a standalone container that is not running.
    async fn delete_container(&self, id: &ContainerId) -> Result<()>;

    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    async fn stop_container(&self, id: &ContainerId) -> Result<()>;

    async fn get_container_status(&self, id: &ContainerId) -> Result<ContainerInfo>;

    /// Lists pod members and standalone containers.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
}
