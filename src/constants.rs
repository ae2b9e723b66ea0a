//! # Runtime Constants
//!
//! Limits, timeouts, defaults and wire constants used across the gateway, the
//! image pipeline and the orchestration layer. Configuration values default to
//! these; limits are not configurable.
//!
//! ## Cross-References
//!
//! - [`crate::gateway`]: retry bound, timeouts, cache TTL, API paths
//! - [`crate::image`] / [`crate::registry`]: size limits, media types
//! - [`crate::pod`]: vmid range, guest defaults, hook timeout

use std::time::Duration;

// =============================================================================
// Gateway
// =============================================================================

/// Default Proxmox VE API port.
pub const DEFAULT_API_PORT: u16 = 8006;

/// Path prefix of the Proxmox JSON API.
pub const API_BASE_PATH: &str = "/api2/json";

/// Header carrying the API token.
pub const AUTH_HEADER: &str = "Authorization";

/// Prefix of the token header value (`PVEAPIToken=user@realm!id=secret`).
pub const AUTH_TOKEN_PREFIX: &str = "PVEAPIToken=";

/// Attempts per logical gateway call. Each attempt is one failover sweep.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Deadline for one HTTP request against one host.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between failed sweeps.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Lifetime of the cached cluster node list.
pub const DEFAULT_NODE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Upper bound for waiting on an asynchronous hypervisor task.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval for asynchronous hypervisor tasks.
pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum auxiliary mount points per guest (`mp0`..`mp7`).
pub const MAX_MOUNT_POINTS: usize = 8;

// =============================================================================
// Orchestration
// =============================================================================

/// First numeric guest id handed out by this process (inclusive).
pub const DEFAULT_VMID_START: u32 = 10_000;

/// Last numeric guest id handed out by this process (inclusive).
pub const DEFAULT_VMID_END: u32 = 19_999;

/// Smallest vmid Proxmox accepts.
pub const MIN_VMID: u32 = 100;

/// Default wall-clock budget for one hook.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default guest memory in MB when the container spec sets none.
pub const DEFAULT_MEMORY_MB: u64 = 512;

/// Default guest swap in MB.
pub const DEFAULT_SWAP_MB: u64 = 512;

/// Default guest core count.
pub const DEFAULT_CORES: u32 = 1;

/// Default storage for guest root filesystems.
pub const DEFAULT_ROOTFS_STORAGE: &str = "local-lvm";

/// Default root filesystem size in GB.
pub const DEFAULT_ROOTFS_SIZE_GB: u32 = 8;

/// Default storage holding LXC templates.
pub const DEFAULT_TEMPLATE_STORAGE: &str = "local";

/// Default bridge for the primary guest interface.
pub const DEFAULT_BRIDGE: &str = "vmbr0";

/// Prefix of container ids derived from vmids (`ct-<vmid>`).
pub const CONTAINER_ID_PREFIX: &str = "ct-";

// =============================================================================
// Image Size Limits
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers in one image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum unpacked size of one image (8 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Deadline for one registry request.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Prefix marking a deleted path in a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry marking a directory whose lower-layer contents are hidden.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Allowed characters in image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789/:.-_@";

/// Tag used when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Storage Paths
// =============================================================================

/// Root of all local state under the user's home directory.
pub const STATE_DIR_NAME: &str = ".proxcri";

/// Subdirectory holding assembled images.
pub const IMAGE_STORE_DIR: &str = "images";

/// Subdirectory holding digest-keyed layer blobs.
pub const LAYER_CACHE_DIR: &str = "layers";

/// Name of the rootfs directory inside an image directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// Name of the metadata file inside an image directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Age after which a partial layer download counts as abandoned.
///
/// Longer than [`IMAGE_PULL_TIMEOUT`], so no live download is that old.
pub const PARTIAL_DOWNLOAD_MAX_AGE: Duration = Duration::from_secs(3600);

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI image manifest.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index (multi-platform).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI image config.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI gzip layer.
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI uncompressed layer.
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Docker v2 schema 2 manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker v2 manifest list (multi-platform).
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker gzip layer.
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Manifest media types sent in the `Accept` header, most specific first.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];
