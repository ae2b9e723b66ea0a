//! Integration tests for the image pipeline.
//!
//! Images are served by an in-memory registry; the store, layer cache and
//! rootfs assembly run against a temporary directory.

mod common;

use common::{FakeRegistry, GatedRegistry, image_pipeline, image_pipeline_with};
use proxcri::error::Error;
use proxcri::image::compute_image_id;
use proxcri::registry::Layer;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BASE: &[(&str, &str)] = &[
    ("etc/", ""),
    ("etc/os-release", "ID=alpine\n"),
    ("etc/motd", "welcome\n"),
    ("bin/", ""),
    ("bin/sh", "#!"),
];

fn layers_of(digests: &[String]) -> Vec<Layer> {
    digests
        .iter()
        .map(|d| Layer {
            digest: d.clone(),
            size: 0,
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
        })
        .collect()
}

// =============================================================================
// Pull
// =============================================================================

#[tokio::test]
async fn test_pull_assembles_rootfs_and_metadata() {
    let registry = Arc::new(FakeRegistry::new());
    let published = registry.publish(
        "alpine",
        "3.19",
        &[BASE, &[("etc/motd", "patched\n"), ("app/", ""), ("app/run", "go")]],
    );
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let image = images.pull("alpine:3.19").await.unwrap();
    assert_eq!(image.name, "alpine");
    assert_eq!(image.tag, "3.19");
    assert_eq!(image.digest, published.manifest_digest);
    assert_eq!(
        image.id,
        compute_image_id(&published.config_digest, &layers_of(&published.layers))
    );

    let rootfs = &image.rootfs_path;
    assert_eq!(fs::read_to_string(rootfs.join("etc/motd")).unwrap(), "patched\n");
    assert_eq!(fs::read_to_string(rootfs.join("app/run")).unwrap(), "go");
    assert!(rootfs.join("bin/sh").is_file());

    let meta = images.inspect(&image.id).unwrap();
    assert_eq!(meta.layers, published.layers);
    assert_eq!(meta.config.architecture, "amd64");
    assert_eq!(meta.config.cmd, vec!["/bin/sh"]);
    assert_eq!(meta.config.working_dir.as_deref(), Some("/"));
}

#[tokio::test]
async fn test_whiteouts_remove_lower_layer_files() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "slim", &[BASE, &[("etc/.wh.motd", "")]]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let image = images.pull("alpine:slim").await.unwrap();
    assert!(!image.rootfs_path.join("etc/motd").exists());
    assert!(!image.rootfs_path.join("etc/.wh.motd").exists());
    assert!(image.rootfs_path.join("etc/os-release").exists());
}

#[tokio::test]
async fn test_repeated_pull_downloads_nothing() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let first = images.pull("alpine:3.19").await.unwrap();
    assert_eq!(registry.layer_fetches(), 1);

    let second = images.pull("alpine:3.19").await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(registry.layer_fetches(), 1);
    assert_eq!(images.download_count(), 1);
    assert_eq!(images.list_images().unwrap().len(), 1);
}

#[tokio::test]
async fn test_shared_layers_are_downloaded_once() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    registry.publish("app", "1.0", &[BASE, &[("app/", ""), ("app/run", "go")]]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    images.pull("alpine:3.19").await.unwrap();
    images.pull("app:1.0").await.unwrap();
    assert_eq!(registry.layer_fetches(), 2);
    assert_eq!(images.layer_cache().list_layers().unwrap().len(), 2);
}

#[tokio::test]
async fn test_prepare_reuses_stored_image() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let pulled = images.prepare("alpine:3.19").await.unwrap();
    let prepared = images.prepare("alpine:3.19").await.unwrap();
    assert_eq!(prepared.id, pulled.id);
    assert_eq!(prepared.rootfs_path, pulled.rootfs_path);
    assert_eq!(registry.layer_fetches(), 1);
    assert_eq!(
        images.get_image_id_by_name("alpine", "3.19").unwrap(),
        pulled.id
    );
}

#[tokio::test]
async fn test_default_tag_is_latest() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("busybox", "latest", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let image = images.pull("busybox").await.unwrap();
    assert_eq!(image.tag, "latest");
}

#[tokio::test]
async fn test_pull_by_digest() {
    let registry = Arc::new(FakeRegistry::new());
    let published = registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let reference = format!("alpine@{}", published.manifest_digest);
    let image = images.pull(&reference).await.unwrap();
    assert_eq!(image.tag, published.manifest_digest);
    assert_eq!(image.digest, published.manifest_digest);
}

// =============================================================================
// Verification and Failures
// =============================================================================

#[tokio::test]
async fn test_corrupted_layer_is_rejected_and_not_cached() {
    let registry = Arc::new(FakeRegistry::new());
    let published = registry.publish("alpine", "3.19", &[BASE]);
    let layer = published.layers[0].clone();
    registry.corrupt(&layer);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let err = images.pull("alpine:3.19").await.unwrap_err();
    match err {
        Error::LayerVerificationFailed { digest, actual } => {
            assert_eq!(digest, layer);
            assert_ne!(actual, layer);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!images.layer_cache().contains(&layer));
    assert!(images.list_images().unwrap().is_empty());
    assert_eq!(images.prune_layers().await.unwrap().removed_partials, 0);

    // A clean retry succeeds.
    registry.repair(&layer);
    images.pull("alpine:3.19").await.unwrap();
    assert!(images.layer_cache().contains(&layer));
}

#[tokio::test]
async fn test_invalid_reference_fetches_nothing() {
    let registry = Arc::new(FakeRegistry::new());
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    for reference in ["", "alpine:", "alpine;rm -rf /", "alpine@sha256:short"] {
        let err = images.pull(reference).await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidImageReference { .. }),
            "{reference}: {err}"
        );
    }
    assert_eq!(registry.layer_fetches(), 0);
}

#[tokio::test]
async fn test_unknown_image_is_manifest_fetch_failure() {
    let registry = Arc::new(FakeRegistry::new());
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let err = images.pull("ghost:1.0").await.unwrap_err();
    assert!(matches!(err, Error::ManifestFetchFailed { .. }));
}

// =============================================================================
// Multi-Platform Indexes
// =============================================================================

#[tokio::test]
async fn test_index_resolves_host_platform() {
    let registry = Arc::new(FakeRegistry::new());
    let published = registry.publish_index(
        "alpine",
        "3.19",
        &[
            ("arm64", &[&[("arch", "arm64")]]),
            ("amd64", &[&[("arch", "amd64")]]),
        ],
    );
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let image = images.pull("alpine:3.19").await.unwrap();
    assert_eq!(image.digest, published[1].manifest_digest);
    assert_eq!(
        fs::read_to_string(image.rootfs_path.join("arch")).unwrap(),
        "amd64"
    );
    assert_eq!(images.inspect(&image.id).unwrap().config.architecture, "amd64");
}

#[tokio::test]
async fn test_index_without_matching_platform_fails() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish_index("alpine", "3.19", &[("s390x", &[&[("arch", "s390x")]])]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let err = images.pull("alpine:3.19").await.unwrap_err();
    match err {
        Error::InvalidManifest { reason, .. } => {
            assert!(reason.contains("linux/s390x"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// =============================================================================
// Store Management
// =============================================================================

#[tokio::test]
async fn test_remove_image() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);
    let image = images.pull("alpine:3.19").await.unwrap();

    images.remove_image(&image.id).unwrap();
    assert!(!image.rootfs_path.exists());
    assert!(matches!(images.get_image(&image.id), Err(Error::ImageNotFound(_))));
    assert!(matches!(images.remove_image(&image.id), Err(Error::ImageNotFound(_))));
    assert!(matches!(images.remove_image("../etc"), Err(Error::ImageNotFound(_))));
}

#[tokio::test]
async fn test_prune_removes_only_unreferenced_layers() {
    let registry = Arc::new(FakeRegistry::new());
    let base = registry.publish("alpine", "3.19", &[BASE]);
    let app = registry.publish("app", "1.0", &[BASE, &[("app/", ""), ("app/run", "go")]]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    images.pull("alpine:3.19").await.unwrap();
    let app_image = images.pull("app:1.0").await.unwrap();

    assert_eq!(images.prune_layers().await.unwrap().removed_count, 0);

    images.remove_image(&app_image.id).unwrap();
    let stats = images.prune_layers().await.unwrap();
    assert_eq!(stats.removed_count, 1);
    assert!(stats.freed_bytes > 0);

    let remaining: HashSet<String> =
        images.layer_cache().list_layers().unwrap().into_iter().collect();
    assert!(remaining.contains(&base.layers[0]));
    assert!(!remaining.contains(&app.layers[1]));
}

#[tokio::test]
async fn test_prune_waits_for_pull_in_progress() {
    let registry = Arc::new(FakeRegistry::new());
    let published = registry.publish("alpine", "3.19", &[BASE]);
    let gated = Arc::new(GatedRegistry::new(registry));
    let dir = TempDir::new().unwrap();
    let images = Arc::new(image_pipeline_with(gated.clone(), &dir));

    let pull = tokio::spawn({
        let images = images.clone();
        async move { images.pull("alpine:3.19").await }
    });
    gated.started.notified().await;

    // The download sits in the cache's tmp/ directory; prune must not run.
    let blocked = tokio::time::timeout(Duration::from_millis(50), images.prune_layers()).await;
    assert!(blocked.is_err(), "prune ran during a pull");

    gated.release.notify_one();
    let image = pull.await.unwrap().unwrap();
    assert!(image.rootfs_path.join("etc/os-release").is_file());

    let stats = images.prune_layers().await.unwrap();
    assert_eq!(stats.removed_count, 0);
    assert_eq!(stats.removed_partials, 0);
    assert!(images.layer_cache().contains(&published.layers[0]));
}

#[tokio::test]
async fn test_list_images_skips_staging_and_garbage() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);
    images.pull("alpine:3.19").await.unwrap();

    fs::create_dir(images.store_dir().join(".staging-leftover")).unwrap();
    fs::create_dir(images.store_dir().join("f".repeat(64))).unwrap();

    let listed = images.list_images().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "alpine");
}

// =============================================================================
// Template Export
// =============================================================================

#[tokio::test]
async fn test_export_template_packs_rootfs() {
    let registry = Arc::new(FakeRegistry::new());
    registry.publish("alpine", "3.19", &[BASE]);
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);
    let image = images.pull("alpine:3.19").await.unwrap();

    let templates = dir.path().join("vztmpl");
    let path = images.export_template(&image.id, &templates).await.unwrap();
    assert_eq!(path, templates.join(format!("{}.tar.gz", image.id)));

    let file = fs::File::open(&path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("etc/os-release")), "{names:?}");

    let again = images.export_template(&image.id, &templates).await.unwrap();
    assert_eq!(again, path);
}

#[tokio::test]
async fn test_export_unknown_image_fails() {
    let registry = Arc::new(FakeRegistry::new());
    let dir = TempDir::new().unwrap();
    let images = image_pipeline(&registry, &dir);

    let err = images
        .export_template(&"0".repeat(64), dir.path())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImageNotFound(_)));
}
