//! # Root Filesystem Assembly
//!
//! Applies cached layer blobs onto an image rootfs, and packs a finished
//! rootfs into an LXC template archive.
//!
//! ## Extraction
//!
//! One layer is applied in two phases:
//!
//! 1. **Unpack** the (gzip-)tar stream into a scratch directory next to the
//!    rootfs. Whiteout entries are not unpacked; they are applied to the rootfs
//!    immediately, since they delete content of lower layers:
//!    - `.wh.<name>` removes `<name>`
//!    - `.wh..wh..opq` empties the directory it lives in
//! 2. **Apply** the scratch tree onto the rootfs: directories are created,
//!    regular files copied, symlinks recreated with their original target
//!    (never followed). An existing entry of a different kind is replaced.
//!
//! The scratch directory is a [`TempDir`] and is removed on every exit path.
//!
//! ## Ownership
//!
//! Unpacking records the uid/gid of every tar header. When running as root,
//! phase 2 sets them on the rootfs entries (symlinks included, never
//! followed), so the packed template keeps files such as `www-data`-owned
//! content with their owners. Unprivileged pulls cannot chown and leave every
//! file owned by the pulling user.
//!
//! ## Path Confinement
//!
//! - Tar entries with absolute paths or `..` components fail with
//!   [`Error::PathTraversal`]
//! - Destination paths are resolved component by component; symlinks already
//!   in the rootfs are followed *inside* the rootfs, so an absolute link such
//!   as `var/run -> /run` lands in `<rootfs>/run` and never on the host
//!
//! Device nodes and FIFOs are skipped; unprivileged guests cannot use them
//! from a template anyway.

use crate::constants::{MAX_ROOTFS_SIZE, WHITEOUT_OPAQUE, WHITEOUT_PREFIX};
use crate::error::{Error, Result};
use crate::registry::Layer;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::os::unix::fs::lchown;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// Symlink hops allowed while resolving one destination path.
const MAX_SYMLINK_HOPS: usize = 40;

/// `(uid, gid)` per layer-relative path, as recorded in the tar headers.
type Owners = HashMap<PathBuf, (u32, u32)>;

/// Applies one cached layer blob onto `rootfs`.
///
/// `budget` is the number of bytes the rootfs may still grow by; the bytes
/// this layer added are returned.
pub fn extract_layer(blob: &Path, layer: &Layer, rootfs: &Path, budget: u64) -> Result<u64> {
    debug!("Extracting layer: {}", layer.digest);
    let failed = |reason: String| Error::LayerExtractionFailed {
        digest: layer.digest.clone(),
        reason,
    };

    let parent = rootfs.parent().unwrap_or(rootfs);
    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)
        .map_err(|e| failed(format!("scratch directory: {e}")))?;

    let file = fs::File::open(blob).map_err(|e| failed(e.to_string()))?;
    let reader: Box<dyn Read> = if is_gzip(layer, blob)? {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let (size, owners) = unpack(reader, layer, rootfs, &scratch, budget)?;
    apply_tree(scratch.path(), rootfs, &owners).map_err(|e| match e {
        Error::PathTraversal { .. } => e,
        other => failed(other.to_string()),
    })?;
    Ok(size)
}

fn is_gzip(layer: &Layer, blob: &Path) -> Result<bool> {
    if layer.is_gzip() {
        return Ok(true);
    }
    let mut magic = [0u8; 2];
    let mut file = fs::File::open(blob)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

/// Phase 1: unpack into `scratch`, applying whiteouts to `rootfs`.
fn unpack(
    reader: Box<dyn Read>,
    layer: &Layer,
    rootfs: &Path,
    scratch: &TempDir,
    budget: u64,
) -> Result<(u64, Owners)> {
    let failed = |reason: String| Error::LayerExtractionFailed {
        digest: layer.digest.clone(),
        reason,
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    let mut total = 0u64;
    let mut owners = Owners::new();
    for entry in archive.entries().map_err(|e| failed(e.to_string()))? {
        let mut entry = entry.map_err(|e| failed(e.to_string()))?;
        let path = entry.path().map_err(|e| failed(e.to_string()))?.into_owned();
        check_relative(&path)?;

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == WHITEOUT_OPAQUE {
            let dir = resolve_in_root(rootfs, path.parent().unwrap_or(Path::new("")))?;
            clear_dir(&dir)?;
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            let rel = path.parent().unwrap_or(Path::new("")).join(target);
            remove_any(&resolve_in_root(rootfs, &rel)?)?;
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                debug!("Skipping special file {}", path.display());
                continue;
            }
            _ => {}
        }

        total += entry.size();
        if total > budget {
            return Err(Error::ImageTooLarge {
                size: MAX_ROOTFS_SIZE.saturating_sub(budget).saturating_add(total),
                limit: MAX_ROOTFS_SIZE,
            });
        }

        let header = entry.header();
        if let (Ok(uid), Ok(gid)) = (header.uid(), header.gid())
            && let (Ok(uid), Ok(gid)) = (u32::try_from(uid), u32::try_from(gid))
        {
            owners.insert(normalized(&path), (uid, gid));
        }

        entry
            .unpack_in(scratch.path())
            .map_err(|e| failed(format!("{}: {e}", path.display())))?;
    }
    Ok((total, owners))
}

/// `path` without `.` components, as walked back from the scratch tree.
fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn check_relative(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Phase 2: copy the scratch tree onto the rootfs.
///
/// Directory modes are applied last so read-only directories can still be
/// filled.
fn apply_tree(scratch: &Path, rootfs: &Path, owners: &Owners) -> Result<()> {
    let chown = |dest: &Path, rel: &Path| -> Result<()> {
        if let Some(&(uid, gid)) = owners.get(rel) {
            lchown(dest, Some(uid), Some(gid))?;
        }
        Ok(())
    };
    let keep_owner = running_as_root();
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(scratch)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(scratch)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let dest = resolve_in_root(rootfs, rel)?;
        let file_type = entry.file_type();
        let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;

        if file_type.is_dir() {
            if fs::symlink_metadata(&dest).is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&dest)?;
            }
            fs::create_dir_all(&dest)?;
            if keep_owner {
                chown(&dest, rel)?;
            }
            dir_modes.push((dest, meta.permissions()));
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            remove_any(&dest)?;
            std::os::unix::fs::symlink(&target, &dest)?;
            if keep_owner {
                chown(&dest, rel)?;
            }
        } else if file_type.is_file() {
            remove_any(&dest)?;
            fs::copy(entry.path(), &dest)?;
            if keep_owner {
                chown(&dest, rel)?;
                // chown clears setuid/setgid.
                fs::set_permissions(&dest, meta.permissions())?;
            }
        }
    }
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, mode)?;
    }
    Ok(())
}

fn running_as_root() -> bool {
    // SAFETY: geteuid(2) takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Resolves `rel` under `root`, following existing symlinks without leaving
/// `root`. The final component is not followed.
pub fn resolve_in_root(root: &Path, rel: &Path) -> Result<PathBuf> {
    check_relative(rel)?;

    let mut resolved: Vec<std::ffi::OsString> = Vec::new();
    let mut pending: VecDeque<std::ffi::OsString> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_os_string()),
            _ => None,
        })
        .collect();
    let mut hops = 0;

    while let Some(component) = pending.pop_front() {
        if pending.is_empty() {
            if component == ".." {
                resolved.pop();
            } else {
                resolved.push(component);
            }
            break;
        }

        let mut candidate = root.to_path_buf();
        candidate.extend(&resolved);
        candidate.push(&component);

        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::PathTraversal {
                        path: rel.display().to_string(),
                    });
                }
                let target = fs::read_link(&candidate)?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for c in target.components().rev() {
                    match c {
                        Component::Normal(n) => pending.push_front(n.to_os_string()),
                        Component::ParentDir => pending.push_front("..".into()),
                        _ => {}
                    }
                }
            }
            _ if component == ".." => {
                resolved.pop();
            }
            _ => resolved.push(component),
        }
    }

    let mut path = root.to_path_buf();
    path.extend(&resolved);
    Ok(path)
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !fs::symlink_metadata(dir).is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

// =============================================================================
// Template Export
// =============================================================================

/// Packs `rootfs` into `<dir>/<name>.tar.gz`.
///
/// An existing archive is reused. The archive is written under a temporary
/// name and renamed into place when complete.
pub fn export_template(rootfs: &Path, dir: &Path, name: &str) -> Result<PathBuf> {
    let dest = dir.join(format!("{name}.tar.gz"));
    if dest.is_file() {
        debug!("Template {} already exists", dest.display());
        return Ok(dest);
    }
    fs::create_dir_all(dir).map_err(|e| Error::StorageInitFailed {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let temp = tempfile::Builder::new()
        .prefix(".template-")
        .suffix(".tar.gz")
        .tempfile_in(dir)?;
    {
        let encoder = GzEncoder::new(temp.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", rootfs)?;
        builder.into_inner()?.finish()?;
    }
    temp.persist(&dest)
        .map_err(|e| Error::StorageWriteFailed(format!("{}: {e}", dest.display())))?;
    debug!("Exported template {}", dest.display());
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;

    fn gz_layer(dir: &Path, build: impl FnOnce(&mut tar::Builder<GzEncoder<fs::File>>)) -> (PathBuf, Layer) {
        let path = dir.join(format!("layer-{}", uuid::Uuid::new_v4()));
        let file = fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        build(&mut builder);
        builder.into_inner().unwrap().finish().unwrap();
        let layer = Layer {
            digest: "sha256:test".to_string(),
            size: fs::metadata(&path).unwrap().len(),
            media_type: crate::constants::OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
        };
        (path, layer)
    }

    fn add_file<W: std::io::Write>(b: &mut tar::Builder<W>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        b.append_data(&mut header, path, data).unwrap();
    }

    fn add_symlink<W: std::io::Write>(b: &mut tar::Builder<W>, path: &str, target: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_entry_type(EntryType::Symlink);
        b.append_link(&mut header, path, target).unwrap();
    }

    #[test]
    fn later_layers_overwrite_and_whiteout() {
        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        let (base, base_layer) = gz_layer(work.path(), |b| {
            add_file(b, "etc/motd", b"base");
            add_file(b, "etc/removed", b"gone soon");
            add_file(b, "var/cache/a", b"a");
        });
        let (top, top_layer) = gz_layer(work.path(), |b| {
            add_file(b, "etc/motd", b"top");
            add_file(b, "etc/.wh.removed", b"");
            add_file(b, "var/cache/.wh..wh..opq", b"");
            add_file(b, "var/cache/b", b"b");
        });

        extract_layer(&base, &base_layer, &rootfs, MAX_ROOTFS_SIZE).unwrap();
        extract_layer(&top, &top_layer, &rootfs, MAX_ROOTFS_SIZE).unwrap();

        assert_eq!(fs::read(rootfs.join("etc/motd")).unwrap(), b"top");
        assert!(!rootfs.join("etc/removed").exists());
        assert!(!rootfs.join("var/cache/a").exists());
        assert_eq!(fs::read(rootfs.join("var/cache/b")).unwrap(), b"b");

        let leftovers: Vec<_> = fs::read_dir(work.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".extract-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn symlinks_are_recreated_not_followed() {
        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        let (blob, layer) = gz_layer(work.path(), |b| {
            add_file(b, "usr/lib/libc.so", b"elf");
            add_symlink(b, "lib", "usr/lib");
            add_symlink(b, "etc/hostfile", "/etc/hostname");
        });
        extract_layer(&blob, &layer, &rootfs, MAX_ROOTFS_SIZE).unwrap();

        assert_eq!(fs::read_link(rootfs.join("lib")).unwrap(), Path::new("usr/lib"));
        assert_eq!(
            fs::read_link(rootfs.join("etc/hostfile")).unwrap(),
            Path::new("/etc/hostname")
        );
    }

    #[test]
    fn ownership_survives_extraction_as_root() {
        use std::os::unix::fs::MetadataExt;

        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        let (blob, layer) = gz_layer(work.path(), |b| {
            let entries: [(&str, EntryType, &[u8], u32); 2] = [
                ("var/www", EntryType::Directory, b"", 0o755),
                ("var/www/index.html", EntryType::Regular, b"hi", 0o644),
            ];
            for (path, kind, data, mode) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(kind);
                header.set_size(data.len() as u64);
                header.set_mode(mode);
                header.set_uid(33);
                header.set_gid(33);
                b.append_data(&mut header, path, data).unwrap();
            }
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_uid(33);
            header.set_gid(34);
            b.append_link(&mut header, "var/www/current", "index.html").unwrap();
        });
        extract_layer(&blob, &layer, &rootfs, MAX_ROOTFS_SIZE).unwrap();

        let file = fs::symlink_metadata(rootfs.join("var/www/index.html")).unwrap();
        assert_eq!(fs::read(rootfs.join("var/www/index.html")).unwrap(), b"hi");
        if !running_as_root() {
            // Unprivileged extraction still succeeds; owners are the caller's.
            assert_eq!(file.uid(), unsafe { libc::geteuid() });
            return;
        }
        assert_eq!((file.uid(), file.gid()), (33, 33));
        assert_eq!(file.mode() & 0o7777, 0o644);
        let dir = fs::symlink_metadata(rootfs.join("var/www")).unwrap();
        assert_eq!((dir.uid(), dir.gid()), (33, 33));
        let link = fs::symlink_metadata(rootfs.join("var/www/current")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!((link.uid(), link.gid()), (33, 34));
    }

    #[test]
    fn absolute_symlink_dirs_stay_inside_rootfs() {
        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir_all(rootfs.join("run")).unwrap();
        std::os::unix::fs::symlink("/run", rootfs.join("varrun")).unwrap();

        let resolved = resolve_in_root(&rootfs, Path::new("varrun/pid")).unwrap();
        assert_eq!(resolved, rootfs.join("run/pid"));

        std::os::unix::fs::symlink("../../..", rootfs.join("up")).unwrap();
        let resolved = resolve_in_root(&rootfs, Path::new("up/etc/passwd")).unwrap();
        assert_eq!(resolved, rootfs.join("etc/passwd"));
    }

    #[test]
    fn rejects_traversal_entries() {
        assert!(matches!(
            check_relative(Path::new("../etc/passwd")),
            Err(Error::PathTraversal { .. })
        ));
        assert!(check_relative(Path::new("/etc/passwd")).is_err());
        assert!(check_relative(Path::new("etc/passwd")).is_ok());
    }

    #[test]
    fn enforces_size_budget() {
        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();
        let (blob, layer) = gz_layer(work.path(), |b| add_file(b, "big", &[0u8; 1024]));

        let err = extract_layer(&blob, &layer, &rootfs, 100).unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge { .. }));
    }

    #[test]
    fn export_is_idempotent() {
        let work = TempDir::new().unwrap();
        let rootfs = work.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/os-release"), b"ID=test").unwrap();

        let out = work.path().join("templates");
        let first = export_template(&rootfs, &out, "abc").unwrap();
        let modified = fs::metadata(&first).unwrap().modified().unwrap();
        let second = export_template(&rootfs, &out, "abc").unwrap();

        assert_eq!(first, out.join("abc.tar.gz"));
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&second).unwrap().modified().unwrap(), modified);

        let mut names = Vec::new();
        let mut archive = Archive::new(GzDecoder::new(fs::File::open(&first).unwrap()));
        for entry in archive.entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert!(names.iter().any(|n| n.ends_with("etc/os-release")));
    }
}
