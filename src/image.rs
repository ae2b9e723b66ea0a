//! # Image Pipeline
//!
//! Turns an image reference into a ready root filesystem on local disk.
//!
//! | Operation               | Method                                  |
//! |-------------------------|-----------------------------------------|
//! | Resolve reference       | [`crate::registry::resolve_reference`]  |
//! | Pull                    | [`ImagePipeline::pull`]                 |
//! | Pull unless present     | [`ImagePipeline::prepare`]              |
//! | List / inspect          | [`ImagePipeline::list_images`], [`ImagePipeline::get_image`] |
//! | Remove                  | [`ImagePipeline::remove_image`]         |
//! | Lookup by name          | [`ImagePipeline::get_image_id_by_name`] |
//! | Drop unused layers      | [`ImagePipeline::prune_layers`]         |
//! | LXC template            | [`ImagePipeline::export_template`]      |
//!
//! ## Store Layout
//!
//! ```text
//! <store_dir>/
//! ├── <imageId>/
//! │   ├── metadata.json
//! │   └── rootfs/
//! └── .staging-<random>/      # pull in progress
//! ```
//!
//! An image is assembled in a staging directory and renamed to `<imageId>`
//! only after every layer is applied and the metadata is written. The
//! presence of `<store_dir>/<imageId>` is the only "installed" marker.
//!
//! ## Image Identity
//!
//! `imageId = hex(sha256(configDigest ‖ layerDigest_1 ‖ … ‖ layerDigest_n))`
//! over the digest strings as they appear in the manifest. Pulling the same
//! content under any name yields the same id.
//!
//! ## Layers
//!
//! Layers are downloaded into the [`LayerCache`] (verify, then atomic rename)
//! and applied strictly in manifest order. A cached layer is never
//! downloaded again, whichever image references it.
//!
//! Pulls and [`ImagePipeline::prune_layers`] exclude each other: a pull holds
//! a shared guard from its first download until its image is renamed into
//! place, and prune takes the guard exclusively. A blob committed by a pull
//! is therefore never pruned before its image references it.

use crate::config::ImageStoreConfig;
use crate::constants::{MAX_ROOTFS_SIZE, METADATA_FILE, PARTIAL_DOWNLOAD_MAX_AGE, ROOTFS_DIR};
use crate::error::{Error, Result};
use crate::registry::{
    ImageConfig, ImageManifest, Layer, Manifest, RegistryFetcher, join_reference,
    parse_config, parse_manifest, resolve_reference, select_platform, sha256_digest,
};
use crate::rootfs;
use crate::storage::{LayerCache, PruneStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A locally stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Content-derived id (64 hex characters).
    pub id: String,
    pub name: String,
    /// Tag, or the digest for digest references.
    pub tag: String,
    /// Digest of the resolved platform manifest.
    pub digest: String,
    /// Sum of compressed layer sizes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub rootfs_path: PathBuf,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub digest: String,
    pub config_digest: String,
    pub layers: Vec<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Runtime defaults from the image config.
    pub config: ImageConfig,
}

/// Computes the content-derived image id.
pub fn compute_image_id(config_digest: &str, layers: &[Layer]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_digest.as_bytes());
    for layer in layers {
        hasher.update(layer.digest.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Pull, store and look up images.
pub struct ImagePipeline {
    store_dir: PathBuf,
    layers: LayerCache,
    fetcher: Arc<dyn RegistryFetcher>,
    os: String,
    architecture: String,
    downloads: AtomicU64,
    /// Shared by pulls, held exclusively by prune.
    gc: RwLock<()>,
}

impl ImagePipeline {
    /// Opens the store and layer cache named by `config`.
    pub fn new(config: &ImageStoreConfig, fetcher: Arc<dyn RegistryFetcher>) -> Result<Self> {
        fs::create_dir_all(&config.store_dir).map_err(|e| Error::StorageInitFailed {
            path: config.store_dir.clone(),
            reason: e.to_string(),
        })?;
        let layers = LayerCache::new(&config.layer_cache_dir)?;
        info!("Image store initialized at: {}", config.store_dir.display());
        Ok(Self {
            store_dir: config.store_dir.clone(),
            layers,
            fetcher,
            os: config.os.clone(),
            architecture: config.architecture.clone(),
            downloads: AtomicU64::new(0),
            gc: RwLock::new(()),
        })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn layer_cache(&self) -> &LayerCache {
        &self.layers
    }

    /// Layer downloads performed by this pipeline so far.
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Returns the stored image for `reference`, pulling it if absent.
    pub async fn prepare(&self, reference: &str) -> Result<Image> {
        let (name, tag) = resolve_reference(reference)?;
        match self.get_image_id_by_name(&name, &tag) {
            Ok(id) => {
                debug!("Image {} already present as {}", reference, id);
                self.get_image(&id)
            }
            Err(Error::ImageNotFound(_)) => self.pull(reference).await,
            Err(e) => Err(e),
        }
    }

    /// Pulls `reference` and stores it under its content-derived id.
    pub async fn pull(&self, reference: &str) -> Result<Image> {
        let (name, tag) = resolve_reference(reference)?;
        let _pulling = self.gc.read().await;
        info!("Pulling image: {}", join_reference(&name, &tag));

        let (manifest, digest) = self.fetch_manifest(&name, &tag).await?;

        let config_data = self
            .fetcher
            .fetch_config(&name, &manifest.config_digest, manifest.config_size)
            .await?;
        let config = parse_config(&manifest.config_digest, &config_data)?;

        let id = compute_image_id(&manifest.config_digest, &manifest.layers);
        let image_dir = self.image_dir(&id)?;
        if image_dir.is_dir() {
            match self.load_metadata(&id) {
                Ok(meta) => {
                    info!("Image {} already stored as {}", reference, id);
                    return Ok(self.to_image(meta));
                }
                Err(e) => {
                    warn!("Replacing unreadable image {}: {}", id, e);
                    fs::remove_dir_all(&image_dir)?;
                }
            }
        }

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.store_dir)
            .map_err(|e| Error::StorageWriteFailed(format!("staging directory: {e}")))?;
        let staged_rootfs = staging.path().join(ROOTFS_DIR);
        fs::create_dir(&staged_rootfs)?;

        let mut budget = MAX_ROOTFS_SIZE;
        for layer in &manifest.layers {
            let blob = self.ensure_layer(&name, layer).await?;
            let layer = layer.clone();
            let target = staged_rootfs.clone();
            let added = tokio::task::spawn_blocking(move || {
                rootfs::extract_layer(&blob, &layer, &target, budget)
            })
            .await
            .map_err(|e| Error::Internal(format!("extraction task: {e}")))??;
            budget -= added;
        }

        let metadata = ImageMetadata {
            id: id.clone(),
            name,
            tag,
            digest,
            config_digest: manifest.config_digest.clone(),
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            size: manifest.layers.iter().map(|l| l.size).sum(),
            created_at: Utc::now(),
            config,
        };
        let encoded = serde_json::to_vec_pretty(&metadata).map_err(Error::serialization)?;
        fs::write(staging.path().join(METADATA_FILE), encoded)?;

        if let Err(e) = fs::rename(staging.path(), &image_dir) {
            if image_dir.is_dir() {
                debug!("Image {} stored concurrently", id);
                return self.get_image(&id);
            }
            return Err(Error::StorageWriteFailed(format!("install image {id}: {e}")));
        }

        info!(
            "Pulled {} as {} ({} layers, {} bytes)",
            reference,
            id,
            metadata.layers.len(),
            metadata.size
        );
        Ok(self.to_image(metadata))
    }

    /// Fetches the manifest for `tag`, resolving a multi-platform index.
    async fn fetch_manifest(&self, name: &str, tag: &str) -> Result<(ImageManifest, String)> {
        let reference = join_reference(name, tag);
        let data = self.fetcher.fetch_manifest(name, tag).await?;
        match parse_manifest(&reference, &data)? {
            Manifest::Image(m) => Ok((m, sha256_digest(&data))),
            Manifest::Index(entries) => {
                let entry = select_platform(&reference, &entries, &self.os, &self.architecture)?;
                if !crate::registry::is_sha256_digest(&entry.digest) {
                    return Err(Error::InvalidManifest {
                        reference,
                        reason: format!("index entry has invalid digest {}", entry.digest),
                    });
                }
                debug!(
                    "Resolved {} for {}/{} to {}",
                    reference, self.os, self.architecture, entry.digest
                );
                let data = self.fetcher.fetch_manifest(name, &entry.digest).await?;
                match parse_manifest(&reference, &data)? {
                    Manifest::Image(m) => Ok((m, sha256_digest(&data))),
                    Manifest::Index(_) => Err(Error::InvalidManifest {
                        reference,
                        reason: "nested image index not supported".to_string(),
                    }),
                }
            }
        }
    }

    /// Returns the cached blob for `layer`, downloading it if needed.
    async fn ensure_layer(&self, name: &str, layer: &Layer) -> Result<PathBuf> {
        if self.layers.contains(&layer.digest) {
            debug!("Layer {} already cached", layer.digest);
            return self.layers.layer_path(&layer.digest);
        }

        debug!("Pulling layer: {} ({} bytes)", layer.digest, layer.size);
        let temp = self.layers.temp_path(&layer.digest)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.fetcher.fetch_layer(name, layer, &temp).await {
            let _ = fs::remove_file(&temp);
            return Err(match e {
                Error::LayerDownloadFailed { .. } | Error::Timeout { .. } => e,
                other => Error::LayerDownloadFailed {
                    digest: layer.digest.clone(),
                    reason: other.to_string(),
                },
            });
        }
        self.layers.commit(&layer.digest, &temp)
    }

    // =========================================================================
    // Local Store
    // =========================================================================

    /// All stored images, oldest first. Unreadable entries are skipped.
    pub fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for entry in fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if id.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            match self.load_metadata(&id) {
                Ok(meta) => images.push(self.to_image(meta)),
                Err(e) => warn!("Skipping image {}: {}", id, e),
            }
        }
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    pub fn get_image(&self, id: &str) -> Result<Image> {
        self.load_metadata(id).map(|m| self.to_image(m))
    }

    /// Full metadata, including layer digests and runtime defaults.
    pub fn inspect(&self, id: &str) -> Result<ImageMetadata> {
        self.load_metadata(id)
    }

    /// Deletes an image directory. A missing image is [`Error::ImageNotFound`].
    pub fn remove_image(&self, id: &str) -> Result<()> {
        let dir = self.image_dir(id)?;
        if !dir.is_dir() {
            return Err(Error::ImageNotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::StorageWriteFailed(format!("remove image {id}: {e}")))?;
        info!("Removed image {}", id);
        Ok(())
    }

    /// Linear scan for the image stored under `name:tag`.
    pub fn get_image_id_by_name(&self, name: &str, tag: &str) -> Result<String> {
        self.list_images()?
            .into_iter()
            .find(|i| i.name == name && i.tag == tag)
            .map(|i| i.id)
            .ok_or_else(|| Error::ImageNotFound(join_reference(name, tag)))
    }

    /// Removes cached layers that no stored image references, and partial
    /// downloads abandoned for longer than [`PARTIAL_DOWNLOAD_MAX_AGE`].
    ///
    /// Waits for pulls in progress to finish.
    pub async fn prune_layers(&self) -> Result<PruneStats> {
        let _exclusive = self.gc.write().await;
        let mut referenced = HashSet::new();
        for image in self.list_images()? {
            referenced.extend(self.load_metadata(&image.id)?.layers);
        }
        self.layers.prune(&referenced, PARTIAL_DOWNLOAD_MAX_AGE)
    }

    /// Packs an image rootfs into `<dir>/<imageId>.tar.gz`.
    pub async fn export_template(&self, id: &str, dir: &Path) -> Result<PathBuf> {
        let image = self.get_image(id)?;
        let dir = dir.to_path_buf();
        let id = image.id.clone();
        tokio::task::spawn_blocking(move || rootfs::export_template(&image.rootfs_path, &dir, &id))
            .await
            .map_err(|e| Error::Internal(format!("export task: {e}")))?
    }

    fn image_dir(&self, id: &str) -> Result<PathBuf> {
        if id.len() != 64 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::ImageNotFound(id.to_string()));
        }
        Ok(self.store_dir.join(id))
    }

    fn load_metadata(&self, id: &str) -> Result<ImageMetadata> {
        let path = self.image_dir(id)?.join(METADATA_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ImageNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(Error::serialization)
    }

    fn to_image(&self, meta: ImageMetadata) -> Image {
        let rootfs_path = self.store_dir.join(&meta.id).join(ROOTFS_DIR);
        Image {
            id: meta.id,
            name: meta.name,
            tag: meta.tag,
            digest: meta.digest,
            size: meta.size,
            created_at: meta.created_at,
            rootfs_path,
        }
    }
}
