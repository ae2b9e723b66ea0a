//! # Layer Cache
//!
//! Digest-keyed store of compressed layer blobs, shared by every image that
//! references the layer.
//!
//! ## Layout
//!
//! ```text
//! <layer_cache_dir>/
//! ├── sha256/
//! │   └── <hex>            # verified blob
//! └── tmp/
//!     └── <hex>.<uuid>     # download in progress
//! ```
//!
//! ## Write Protocol
//!
//! Blobs enter the cache only through [`LayerCache::commit`]:
//! 1. The caller downloads to a path from [`LayerCache::temp_path`]
//! 2. The file is hashed and compared with the expected digest
//! 3. On mismatch the file is deleted and the commit fails with
//!    [`Error::LayerVerificationFailed`]
//! 4. On match the file is renamed into `sha256/`, which is atomic on the
//!    same filesystem
//!
//! A blob path therefore either does not exist or holds verified content.
//! Partial downloads are only pruned once they are older than a caller-given
//! age, so a download in progress keeps its file.
//!
//! ## Digest Handling
//!
//! Only `sha256:<64 lowercase hex>` digests map to paths. Anything else is
//! rejected before touching the filesystem, so a digest can never name a
//! path outside the cache.

use crate::error::{Error, Result};
use crate::registry::is_sha256_digest;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const BLOB_DIR: &str = "sha256";
const TEMP_DIR: &str = "tmp";

/// Digest-keyed layer blob store.
#[derive(Debug)]
pub struct LayerCache {
    base_dir: PathBuf,
}

impl LayerCache {
    /// Opens (creating if needed) a cache rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for dir in [base_dir.join(BLOB_DIR), base_dir.join(TEMP_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        info!("Layer cache initialized at: {}", base_dir.display());
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the verified blob for `digest`.
    pub fn layer_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(BLOB_DIR).join(hex_part(digest)?))
    }

    /// Returns true if a verified blob for `digest` is cached.
    pub fn contains(&self, digest: &str) -> bool {
        self.layer_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Unique download path for `digest`, on the cache's filesystem.
    pub fn temp_path(&self, digest: &str) -> Result<PathBuf> {
        let name = format!("{}.{}", hex_part(digest)?, uuid::Uuid::now_v7());
        Ok(self.base_dir.join(TEMP_DIR).join(name))
    }

    /// Verifies a downloaded file and moves it into the cache.
    ///
    /// The temporary file is gone afterwards, whatever the outcome.
    pub fn commit(&self, digest: &str, temp: &Path) -> Result<PathBuf> {
        let dest = self.layer_path(digest)?;

        let actual = match hash_file(temp) {
            Ok(actual) => actual,
            Err(e) => {
                discard(temp);
                return Err(e);
            }
        };
        if actual != digest {
            discard(temp);
            warn!("Layer {} failed verification (computed {})", digest, actual);
            return Err(Error::LayerVerificationFailed {
                digest: digest.to_string(),
                actual,
            });
        }

        fs::rename(temp, &dest).map_err(|e| {
            discard(temp);
            Error::StorageWriteFailed(format!("commit {digest}: {e}"))
        })?;
        debug!("Stored layer {} (verified)", digest);
        Ok(dest)
    }

    /// Digests of all cached blobs.
    pub fn list_layers(&self) -> Result<Vec<String>> {
        let dir = self.base_dir.join(BLOB_DIR);
        let mut digests = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let digest = format!("sha256:{name}");
                if is_sha256_digest(&digest) {
                    digests.push(digest);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Removes one blob. Returns false if it was not cached.
    pub fn remove_layer(&self, digest: &str) -> Result<bool> {
        let path = self.layer_path(digest)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::StorageWriteFailed(e.to_string())),
        }
    }

    /// Total size of cached blobs in bytes.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for digest in self.list_layers()? {
            total += fs::metadata(self.layer_path(&digest)?)?.len();
        }
        Ok(total)
    }

    /// Removes every blob not in `referenced` and every partial download
    /// last written more than `partial_age` ago.
    ///
    /// Younger partials may belong to a download still in progress.
    pub fn prune(&self, referenced: &HashSet<String>, partial_age: Duration) -> Result<PruneStats> {
        let mut stats = PruneStats::default();

        for digest in self.list_layers()? {
            if referenced.contains(&digest) {
                continue;
            }
            let path = self.layer_path(&digest)?;
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if self.remove_layer(&digest)? {
                stats.removed_count += 1;
                stats.freed_bytes += size;
            }
        }

        let now = SystemTime::now();
        for entry in fs::read_dir(self.base_dir.join(TEMP_DIR))? {
            let entry = entry?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default());
            match age {
                Ok(age) if age >= partial_age => {}
                _ => continue,
            }
            if fs::remove_file(entry.path()).is_ok() {
                stats.removed_partials += 1;
            }
        }

        info!(
            "Prune: removed {} layers, freed {} bytes",
            stats.removed_count, stats.freed_bytes
        );
        Ok(stats)
    }
}

/// Result of [`LayerCache::prune`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Number of layer blobs removed.
    pub removed_count: u64,
    /// Bytes freed by removed blobs.
    pub freed_bytes: u64,
    /// Interrupted downloads removed.
    pub removed_partials: u64,
}

fn hex_part(digest: &str) -> Result<&str> {
    if !is_sha256_digest(digest) {
        return Err(Error::StorageWriteFailed(format!(
            "unsupported digest '{digest}': only sha256 is supported"
        )));
    }
    Ok(&digest["sha256:".len()..])
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}
