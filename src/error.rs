//! Error types shared by the gateway, the image pipeline and the orchestration layer.
//!
//! Every public operation fails with exactly one of these kinds. The
//! orchestration layer wraps gateway errors with lifecycle context instead of
//! flattening them into strings, so callers can match on the kind.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle step reported by the wrapping orchestration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Resolving or pulling the container image.
    PrepareImage,
    /// Allocating a numeric guest id.
    AllocateVmid,
    /// Creating the hypervisor guest.
    CreateGuest,
    /// Starting the guest.
    StartGuest,
    /// Stopping the guest.
    StopGuest,
    /// Deleting the guest.
    DeleteGuest,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PrepareImage => "prepare image",
            Self::AllocateVmid => "allocate vmid",
            Self::CreateGuest => "create guest",
            Self::StartGuest => "start guest",
            Self::StopGuest => "stop guest",
            Self::DeleteGuest => "delete guest",
        };
        f.write_str(s)
    }
}

/// Hook stage reported by hook errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    /// Runs before any guest is created.
    Prestart,
    /// Runs after the pod is registered.
    Poststart,
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prestart => f.write_str("prestart"),
            Self::Poststart => f.write_str("poststart"),
        }
    }
}

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Missing or invalid configuration. No component is built.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    // =========================================================================
    // Gateway Errors
    // =========================================================================
    /// The API token was rejected (HTTP 401).
    #[error("authentication failed against {host}")]
    AuthFailed { host: String },

    /// The token lacks the privilege for this call (HTTP 403).
    #[error("permission denied for {path}")]
    PermissionDenied { path: String },

    /// The addressed API object does not exist (HTTP 404).
    #[error("not found: {path}")]
    NotFound { path: String },

    /// HTTP 408 or a local deadline was exceeded.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Any other non-2xx answer.
    #[error("operation failed with status {status}: {message}")]
    OperationFailed { status: u16, message: String },

    /// Network-level failure (refused, DNS, TLS).
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// An asynchronous hypervisor task ended with a non-OK exit status.
    #[error("task {upid} failed: {status}")]
    TaskFailed { upid: String, status: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// Pod or container spec failed validation. Nothing was changed.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// A pod with the same derived id is registered or being created.
    #[error("pod already exists: {0}")]
    PodAlreadyExists(String),

    /// Pod not registered.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// Container not registered.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Illegal lifecycle transition.
    #[error("cannot {operation} container '{id}' in state '{state}'")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// Container creation failed at `step`.
    #[error("failed to create container '{id}' ({step}): {source}")]
    CreationFailed {
        id: String,
        step: Step,
        #[source]
        source: Box<Error>,
    },

    /// Container start failed.
    #[error("failed to start container '{id}' ({step}): {source}")]
    StartFailed {
        id: String,
        step: Step,
        #[source]
        source: Box<Error>,
    },

    /// Container stop failed.
    #[error("failed to stop container '{id}' ({step}): {source}")]
    StopFailed {
        id: String,
        step: Step,
        #[source]
        source: Box<Error>,
    },

    /// Container deletion failed.
    #[error("failed to delete container '{id}' ({step}): {source}")]
    DeletionFailed {
        id: String,
        step: Step,
        #[source]
        source: Box<Error>,
    },

    /// Resource update stopped at `failed`; `succeeded` were already updated.
    #[error("resource update for pod '{pod}' failed at '{failed}' (updated: {succeeded:?}): {source}")]
    ResourceUpdateFailed {
        pod: String,
        succeeded: Vec<String>,
        failed: String,
        #[source]
        source: Box<Error>,
    },

    /// A hook exited non-zero or could not be spawned.
    #[error("{stage} hook '{path}' failed: {reason}")]
    HookFailed {
        stage: HookStage,
        path: String,
        reason: String,
    },

    /// A hook exceeded its wall-clock budget and was killed.
    #[error("{stage} hook '{path}' timed out after {timeout:?}")]
    HookTimeout {
        stage: HookStage,
        path: String,
        timeout: Duration,
    },

    /// Installing a port-forwarding rule failed.
    #[error("network setup failed for pod '{pod}': {reason}")]
    NetworkSetupFailed { pod: String, reason: String },

    /// Removing a port-forwarding rule failed.
    #[error("network cleanup failed for pod '{pod}': {reason}")]
    NetworkCleanupFailed { pod: String, reason: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Malformed image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Manifest could not be fetched.
    #[error("failed to fetch manifest for '{reference}': {reason}")]
    ManifestFetchFailed { reference: String, reason: String },

    /// Manifest is missing required fields or cannot be parsed.
    #[error("invalid manifest for '{reference}': {reason}")]
    InvalidManifest { reference: String, reason: String },

    /// Config blob could not be fetched.
    #[error("failed to fetch config {digest}: {reason}")]
    ConfigFetchFailed { digest: String, reason: String },

    /// Config blob is missing required fields or cannot be parsed.
    #[error("invalid image config {digest}: {reason}")]
    InvalidConfig { digest: String, reason: String },

    /// Layer download failed.
    #[error("failed to download layer {digest}: {reason}")]
    LayerDownloadFailed { digest: String, reason: String },

    /// Downloaded bytes do not hash to the layer digest.
    #[error("layer {digest} failed verification: computed {actual}")]
    LayerVerificationFailed { digest: String, actual: String },

    /// Layer could not be unpacked.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Tar entry escapes the extraction root.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Layer or image exceeds configured limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// No stored image with this id (or name/tag).
    #[error("image not found: {0}")]
    ImageNotFound(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage directory could not be created.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the gateway may retry the call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::OperationFailed { .. } | Self::ConnectionFailed { .. }
        )
    }

    /// Returns true for the answers that mean "this pod or container id is not registered".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::PodNotFound(_)
                | Self::ContainerNotFound(_)
                | Self::ImageNotFound(_)
        )
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub(crate) fn lock_poisoned() -> Self {
        Self::Internal("lock poisoned".to_string())
    }
}
