//! # OCI Registry Access
//!
//! Everything the image pipeline needs to know about registries: reference
//! parsing, manifest and config decoding, and the [`RegistryFetcher`] seam
//! that performs the actual HTTP work.
//!
//! ## Reference Validation
//!
//! References are checked before any network access:
//! - Non-empty and at most `MAX_IMAGE_REF_LEN` (512) bytes
//! - Character allowlist (alphanumeric + `/:.-_@`)
//! - A colon followed by a segment containing `/` is a registry port, not a tag
//!   (`registry:5000/app` has the default tag)
//! - `name@sha256:<hex>` is a digest reference; the digest stands in for the tag
//!
//! ## Manifest Resolution
//!
//! A multi-platform index (OCI index or Docker manifest list) is resolved to
//! the entry matching the configured os/architecture, and that manifest is
//! fetched by digest. Nested indexes are rejected. If no entry matches, the
//! error lists the platforms the index offers.
//!
//! ## Fetching
//!
//! [`OciRegistryFetcher`] is the production implementation on top of
//! `oci-distribution`. Layer blobs are streamed to a caller-provided file so
//! they can be verified before entering the layer cache; they are never held
//! in memory as a whole.

use crate::constants::{
    ACCEPTED_MANIFEST_MEDIA_TYPES, DEFAULT_TAG, DOCKER_LAYER_MEDIA_TYPE_GZIP,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN,
    MAX_LAYER_SIZE, MAX_LAYERS, MAX_MANIFEST_SIZE, OCI_IMAGE_CONFIG_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYER_MEDIA_TYPE_TAR,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

// =============================================================================
// References
// =============================================================================

/// Checks length and characters of a raw reference.
pub fn validate_reference(reference: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidImageReference {
        reference: reference.to_string(),
        reason,
    };

    if reference.is_empty() {
        return Err(invalid("reference is empty".to_string()));
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid(format!("exceeds {MAX_IMAGE_REF_LEN} bytes")));
    }
    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(invalid("contains invalid characters".to_string()));
    }
    Ok(())
}

/// Splits a reference into `(name, tag)`.
///
/// The tag defaults to `latest`. A trailing colon with nothing after it is
/// rejected. For digest references the digest is returned as the tag.
pub fn resolve_reference(reference: &str) -> Result<(String, String)> {
    validate_reference(reference)?;
    let invalid = |reason: &str| Error::InvalidImageReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    if let Some((name, digest)) = reference.split_once('@') {
        if !is_sha256_digest(digest) {
            return Err(invalid("digest must be sha256:<64 hex>"));
        }
        let (name, _) = split_tag(name);
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        return Ok((name.to_string(), digest.to_string()));
    }

    match split_tag(reference) {
        (name, Some(tag)) => {
            if tag.is_empty() {
                return Err(invalid("tag is empty"));
            }
            if name.is_empty() {
                return Err(invalid("name is empty"));
            }
            Ok((name.to_string(), tag.to_string()))
        }
        (name, None) => {
            if name.ends_with('/') {
                return Err(invalid("name ends with '/'"));
            }
            Ok((name.to_string(), DEFAULT_TAG.to_string()))
        }
    }
}

/// Splits on the last colon unless what follows it is a `host:port/path`.
fn split_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (reference, None),
    }
}

/// Returns true for `sha256:` followed by 64 lowercase hex characters.
pub fn is_sha256_digest(digest: &str) -> bool {
    digest.strip_prefix("sha256:").is_some_and(|hex| {
        hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    })
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Re-joins a name with a tag or digest into a pullable reference.
pub fn join_reference(name: &str, tag_or_digest: &str) -> String {
    if tag_or_digest.starts_with("sha256:") {
        format!("{name}@{tag_or_digest}")
    } else {
        format!("{name}:{tag_or_digest}")
    }
}

// =============================================================================
// Manifests
// =============================================================================

/// Metadata about one image layer. `layers[0]` is the base layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Digest of the compressed blob.
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
    pub media_type: String,
}

impl Layer {
    /// Returns true if the blob is gzip-compressed.
    pub fn is_gzip(&self) -> bool {
        self.media_type == OCI_LAYER_MEDIA_TYPE_GZIP
            || self.media_type == DOCKER_LAYER_MEDIA_TYPE_GZIP
    }
}

/// A single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    pub config_digest: String,
    pub config_size: u64,
    pub layers: Vec<Layer>,
}

/// Entry of a multi-platform index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry {
    pub digest: String,
    pub os: String,
    pub architecture: String,
}

/// A decoded manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Image(ImageManifest),
    Index(Vec<PlatformEntry>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<RawDescriptor>,
    layers: Option<Vec<RawDescriptor>>,
    manifests: Option<Vec<RawDescriptor>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    media_type: Option<String>,
    digest: Option<String>,
    size: Option<i64>,
    platform: Option<RawPlatform>,
}

#[derive(Deserialize)]
struct RawPlatform {
    os: String,
    architecture: String,
}

/// Decodes a manifest or index. Missing required fields are reported as
/// [`Error::InvalidManifest`].
pub fn parse_manifest(reference: &str, data: &[u8]) -> Result<Manifest> {
    let invalid = |reason: String| Error::InvalidManifest {
        reference: reference.to_string(),
        reason,
    };

    if data.len() > MAX_MANIFEST_SIZE {
        return Err(invalid(format!(
            "manifest is {} bytes (max {MAX_MANIFEST_SIZE})",
            data.len()
        )));
    }
    let raw: RawManifest =
        serde_json::from_slice(data).map_err(|e| invalid(format!("malformed JSON: {e}")))?;

    match raw.schema_version {
        Some(2) => {}
        Some(v) => return Err(invalid(format!("unsupported schemaVersion {v}"))),
        None => return Err(invalid("missing schemaVersion".to_string())),
    }

    let is_index = matches!(
        raw.media_type.as_deref(),
        Some(OCI_IMAGE_INDEX_MEDIA_TYPE | DOCKER_MANIFEST_LIST_MEDIA_TYPE)
    ) || (raw.manifests.is_some() && raw.layers.is_none());

    if is_index {
        let entries = raw
            .manifests
            .ok_or_else(|| invalid("index without manifests".to_string()))?
            .into_iter()
            .filter_map(|d| {
                let platform = d.platform?;
                Some(PlatformEntry {
                    digest: d.digest?,
                    os: platform.os,
                    architecture: platform.architecture,
                })
            })
            .collect();
        return Ok(Manifest::Index(entries));
    }

    let config = raw
        .config
        .ok_or_else(|| invalid("missing config descriptor".to_string()))?;
    let config_digest = config
        .digest
        .filter(|d| is_sha256_digest(d))
        .ok_or_else(|| invalid("config descriptor has no valid digest".to_string()))?;
    let config_size = config.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0);

    let raw_layers = raw
        .layers
        .ok_or_else(|| invalid("missing layers".to_string()))?;
    if raw_layers.len() > MAX_LAYERS {
        return Err(invalid(format!(
            "too many layers: {} > {MAX_LAYERS}",
            raw_layers.len()
        )));
    }

    let mut layers = Vec::with_capacity(raw_layers.len());
    for (i, d) in raw_layers.into_iter().enumerate() {
        let digest = d
            .digest
            .filter(|d| is_sha256_digest(d))
            .ok_or_else(|| invalid(format!("layer {i} has no valid digest")))?;
        let size = d
            .size
            .and_then(|s| u64::try_from(s).ok())
            .ok_or_else(|| invalid(format!("layer {i} has no valid size")))?;
        if size > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size,
                limit: MAX_LAYER_SIZE,
            });
        }
        let media_type = d
            .media_type
            .unwrap_or_else(|| OCI_LAYER_MEDIA_TYPE_GZIP.to_string());
        if ![
            OCI_LAYER_MEDIA_TYPE_GZIP,
            OCI_LAYER_MEDIA_TYPE_TAR,
            DOCKER_LAYER_MEDIA_TYPE_GZIP,
        ]
        .contains(&media_type.as_str())
        {
            return Err(invalid(format!("unsupported layer media type {media_type}")));
        }
        layers.push(Layer {
            digest,
            size,
            media_type,
        });
    }

    Ok(Manifest::Image(ImageManifest {
        config_digest,
        config_size,
        layers,
    }))
}

/// Picks the index entry for `os`/`architecture`.
pub fn select_platform<'a>(
    reference: &str,
    entries: &'a [PlatformEntry],
    os: &str,
    architecture: &str,
) -> Result<&'a PlatformEntry> {
    entries
        .iter()
        .find(|e| e.os == os && e.architecture == architecture)
        .ok_or_else(|| {
            let available: Vec<String> = entries
                .iter()
                .map(|e| format!("{}/{}", e.os, e.architecture))
                .collect();
            Error::InvalidManifest {
                reference: reference.to_string(),
                reason: format!(
                    "no manifest for {os}/{architecture}. Available: {}",
                    available.join(", ")
                ),
            }
        })
}

// =============================================================================
// Image Config
// =============================================================================

/// Runtime defaults recorded in the image config blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Deserialize)]
struct RawConfig {
    architecture: Option<String>,
    os: Option<String>,
    #[serde(default)]
    config: Option<RawRuntime>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRuntime {
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    user: Option<String>,
}

/// Decodes a config blob and checks it against its digest.
pub fn parse_config(digest: &str, data: &[u8]) -> Result<ImageConfig> {
    let invalid = |reason: String| Error::InvalidConfig {
        digest: digest.to_string(),
        reason,
    };

    if data.len() > MAX_CONFIG_SIZE {
        return Err(invalid(format!(
            "config is {} bytes (max {MAX_CONFIG_SIZE})",
            data.len()
        )));
    }
    let actual = sha256_digest(data);
    if actual != digest {
        return Err(invalid(format!("content hashes to {actual}")));
    }

    let raw: RawConfig =
        serde_json::from_slice(data).map_err(|e| invalid(format!("malformed JSON: {e}")))?;
    let architecture = raw
        .architecture
        .filter(|a| !a.is_empty())
        .ok_or_else(|| invalid("missing architecture".to_string()))?;
    let os = raw
        .os
        .filter(|o| !o.is_empty())
        .ok_or_else(|| invalid("missing os".to_string()))?;

    let runtime = raw.config;
    let (env, cmd, entrypoint, working_dir, user) = match runtime {
        Some(r) => (
            r.env.unwrap_or_default(),
            r.cmd.unwrap_or_default(),
            r.entrypoint.unwrap_or_default(),
            r.working_dir.filter(|w| !w.is_empty()),
            r.user.filter(|u| !u.is_empty()),
        ),
        None => Default::default(),
    };

    Ok(ImageConfig {
        architecture,
        os,
        env,
        cmd,
        entrypoint,
        working_dir,
        user,
    })
}

// =============================================================================
// Fetching
// =============================================================================

/// Registry HTTP operations used by the image pipeline.
///
/// `repository` is the name half of a resolved reference (`nginx`,
/// `ghcr.io/org/app`); `reference` is a tag or a `sha256:` digest.
#[async_trait]
pub trait RegistryFetcher: Send + Sync {
    /// Raw manifest or index bytes.
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<Vec<u8>>;

    /// Raw config blob bytes.
    async fn fetch_config(&self, repository: &str, digest: &str, size: u64) -> Result<Vec<u8>>;

    /// Streams a layer blob into `dest`, creating or truncating it.
    async fn fetch_layer(&self, repository: &str, layer: &Layer, dest: &Path) -> Result<()>;
}

/// `oci-distribution` backed fetcher.
pub struct OciRegistryFetcher {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistryFetcher {
    /// Anonymous access over HTTPS.
    pub fn new() -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }

    /// Basic authentication over HTTPS.
    pub fn with_auth(username: &str, password: &str) -> Self {
        Self {
            auth: RegistryAuth::Basic(username.to_string(), password.to_string()),
            ..Self::new()
        }
    }

    fn parse(&self, repository: &str, reference: &str) -> Result<Reference> {
        let full = join_reference(repository, reference);
        full.parse().map_err(|e| Error::InvalidImageReference {
            reference: full.clone(),
            reason: format!("{e}"),
        })
    }

    async fn authenticate(&self, reference: &Reference) -> Result<()> {
        self.client
            .auth(reference, &self.auth, RegistryOperation::Pull)
            .await
            .map(|_| ())
            .map_err(|e| Error::ManifestFetchFailed {
                reference: reference.to_string(),
                reason: format!("authentication: {e}"),
            })
    }

    fn descriptor(digest: &str, size: u64, media_type: &str) -> oci_distribution::manifest::OciDescriptor {
        oci_distribution::manifest::OciDescriptor {
            digest: digest.to_string(),
            size: i64::try_from(size).unwrap_or(i64::MAX),
            media_type: media_type.to_string(),
            urls: None,
            annotations: None,
        }
    }
}

impl Default for OciRegistryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryFetcher for OciRegistryFetcher {
    async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<Vec<u8>> {
        let image = self.parse(repository, reference)?;
        self.authenticate(&image).await?;
        debug!("Fetching manifest {}", image);

        let (data, _digest) = tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client
                .pull_manifest_raw(&image, &self.auth, ACCEPTED_MANIFEST_MEDIA_TYPES),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {image}"),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ManifestFetchFailed {
            reference: image.to_string(),
            reason: e.to_string(),
        })?;
        Ok(data.to_vec())
    }

    async fn fetch_config(&self, repository: &str, digest: &str, size: u64) -> Result<Vec<u8>> {
        let image = self.parse(repository, digest)?;
        let descriptor = Self::descriptor(digest, size, OCI_IMAGE_CONFIG_MEDIA_TYPE);
        let mut data = Vec::new();
        tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client.pull_blob(&image, &descriptor, &mut data),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull config {digest}"),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ConfigFetchFailed {
            digest: digest.to_string(),
            reason: e.to_string(),
        })?;
        Ok(data)
    }

    async fn fetch_layer(&self, repository: &str, layer: &Layer, dest: &Path) -> Result<()> {
        let image = self.parse(repository, &layer.digest)?;
        let descriptor = Self::descriptor(&layer.digest, layer.size, &layer.media_type);
        let mut file = tokio::fs::File::create(dest).await?;

        tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client.pull_blob(&image, &descriptor, &mut file),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull layer {}", layer.digest),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::LayerDownloadFailed {
            digest: layer.digest.clone(),
            reason: e.to_string(),
        })?;

        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }
}
