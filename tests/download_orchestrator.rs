// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration tests with an in-memory artifact source.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulp_tool::utils::sha256_hex;
use pulp_tool::{
    ArtifactFetcher, Category, ContentType, DownloadOrchestrator, Manifest, ManifestEntry,
    ManifestFilter, OutputLayout, PulpError, PulpResult,
};
use tempfile::TempDir;

// =============================================================================
// FAKE ARTIFACT SOURCE
// =============================================================================

#[derive(Default)]
struct FakeSource {
    files: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with_file(mut self, url: &str, contents: &[u8]) -> Self {
        self.files.insert(url.to_string(), contents.to_vec());
        self
    }

    fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    fn requested(&self) -> Vec<String> {
        let mut urls = self.requested.lock().unwrap().clone();
        urls.sort();
        urls
    }
}

#[async_trait]
impl ArtifactFetcher for FakeSource {
    async fn fetch_to(&self, url: &str, dest: &Path) -> PulpResult<u64> {
        self.requested.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(url).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        let result = match self.files.get(url) {
            Some(bytes) => tokio::fs::write(dest, bytes)
                .await
                .map(|_| bytes.len() as u64)
                .map_err(PulpError::from),
            None => Err(PulpError::Api {
                status: 404,
                operation: format!("download {}", url),
                body: "not found".to_string(),
            }),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn fetch_bytes(&self, url: &str) -> PulpResult<Vec<u8>> {
        self.files.get(url).cloned().ok_or_else(|| PulpError::Api {
            status: 404,
            operation: format!("fetch {}", url),
            body: "not found".to_string(),
        })
    }
}

fn entry(url: &str, content_type: ContentType, arch: &str, checksum: Option<String>) -> ManifestEntry {
    ManifestEntry {
        url: url.to_string(),
        content_type,
        arch: arch.to_string(),
        checksum,
    }
}

fn manifest(entries: Vec<ManifestEntry>) -> Manifest {
    Manifest { entries }
}

// =============================================================================
// PLACEMENT AND VERIFICATION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_downloads_land_by_content_type() {
    let out = TempDir::new().unwrap();
    let source = FakeSource::default()
        .with_file("https://cdn/rpms/Packages/l/a.rpm", b"rpm bytes")
        .with_file("https://cdn/logs/aarch64/b.log", b"log bytes");
    let manifest = manifest(vec![
        entry("https://cdn/rpms/Packages/l/a.rpm", ContentType::Rpm, "x86_64", None),
        entry(
            "https://cdn/logs/aarch64/b.log",
            ContentType::Log,
            "aarch64",
            Some(format!("sha256:{}", sha256_hex(b"log bytes"))),
        ),
    ]);

    let report = DownloadOrchestrator::new(Arc::new(source))
        .with_max_workers(2)
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    assert!(report.success, "{}", report.summary());
    assert_eq!(std::fs::read(out.path().join("a.rpm")).unwrap(), b"rpm bytes");
    assert_eq!(
        std::fs::read(out.path().join("logs").join("aarch64").join("b.log")).unwrap(),
        b"log bytes"
    );

    let rpms = report.category(Category::Rpms);
    assert_eq!(rpms.len(), 1);
    assert_eq!(rpms[0].checksum.as_deref(), Some(sha256_hex(b"rpm bytes").as_str()));
    assert_eq!(report.category(Category::Logs)[0].arch.as_deref(), Some("aarch64"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checksum_mismatch_fails_only_that_entry() {
    let out = TempDir::new().unwrap();
    let source = FakeSource::default()
        .with_file("https://cdn/good.rpm", b"good")
        .with_file("https://cdn/tampered.rpm", b"tampered");
    let manifest = manifest(vec![
        entry("https://cdn/good.rpm", ContentType::Rpm, "x86_64", Some(sha256_hex(b"good"))),
        entry(
            "https://cdn/tampered.rpm",
            ContentType::Rpm,
            "x86_64",
            Some(format!("sha256:{}", sha256_hex(b"original"))),
        ),
    ]);

    let report = DownloadOrchestrator::new(Arc::new(source))
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    assert!(!report.success);
    let rpms = report.category(Category::Rpms);
    assert!(rpms[0].success);
    assert_eq!(rpms[1].id, "tampered.rpm");
    assert_eq!(rpms[1].error_kind.as_deref(), Some("integrity_mismatch"));

    assert!(out.path().join("good.rpm").exists());
    assert!(!out.path().join("tampered.rpm").exists());
    assert!(!out.path().join("tampered.rpm.part").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_artifact_is_isolated() {
    let out = TempDir::new().unwrap();
    let source = FakeSource::default().with_file("https://cdn/sbom.json", b"{}");
    let manifest = manifest(vec![
        entry("https://cdn/gone.rpm", ContentType::Rpm, "x86_64", None),
        entry("https://cdn/sbom.json", ContentType::Sbom, "noarch", None),
    ]);

    let report = DownloadOrchestrator::new(Arc::new(source))
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    assert!(!report.success);
    assert_eq!(report.category(Category::Rpms)[0].error_kind.as_deref(), Some("api_error"));
    assert!(report.category(Category::Sbom)[0].success);
    assert_eq!(report.failures().count(), 1);
    assert!(!out.path().join("gone.rpm.part").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_destination_fails_later_entry_only() {
    let out = TempDir::new().unwrap();
    let x86 = b"x86_64 checksums";
    let arm = b"aarch64 checksums";
    let source = FakeSource::default()
        .with_file("https://h/x86_64/checksums.txt", x86)
        .with_file("https://h/aarch64/checksums.txt", arm);
    let manifest = manifest(vec![
        entry("https://h/x86_64/checksums.txt", ContentType::File, "x86_64", Some(sha256_hex(x86))),
        entry("https://h/aarch64/checksums.txt", ContentType::File, "aarch64", Some(sha256_hex(arm))),
    ]);
    let source = Arc::new(source);

    let report = DownloadOrchestrator::new(Arc::clone(&source))
        .with_max_workers(2)
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    let files = report.category(Category::Files);
    assert!(files[0].success, "{:?}", files[0].error);
    assert!(!files[1].success);
    assert_eq!(files[1].error_kind.as_deref(), Some("destination_conflict"));
    assert_eq!(std::fs::read(out.path().join("checksums.txt")).unwrap(), x86);
    assert!(!out.path().join("checksums.txt.part").exists());
    // The conflicting entry is never fetched.
    assert_eq!(source.requested(), vec!["https://h/x86_64/checksums.txt".to_string()]);
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_limit_is_respected() {
    let out = TempDir::new().unwrap();
    let mut source = FakeSource {
        default_delay: Duration::from_millis(40),
        ..Default::default()
    };
    let mut entries = Vec::new();
    for i in 0..10 {
        let url = format!("https://cdn/pkg-{}.rpm", i);
        source = source.with_file(&url, format!("package {}", i).as_bytes());
        entries.push(entry(&url, ContentType::Rpm, "x86_64", None));
    }
    let source = Arc::new(source);

    let report = DownloadOrchestrator::new(Arc::clone(&source))
        .with_max_workers(3)
        .download_batch(&manifest(entries), &OutputLayout::new(out.path()))
        .await;

    assert!(report.success);
    assert_eq!(report.len(), 10);
    let peak = source.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded the limit", peak);
    assert!(peak >= 1);

    // Results keep manifest order regardless of completion order.
    let ids: Vec<_> = report.category(Category::Rpms).iter().map(|r| r.id.clone()).collect();
    let expected: Vec<_> = (0..10).map(|i| format!("pkg-{}.rpm", i)).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_workers_still_downloads() {
    let out = TempDir::new().unwrap();
    let source = FakeSource::default().with_file("https://cdn/a.rpm", b"a");

    let report = DownloadOrchestrator::new(Arc::new(source))
        .with_max_workers(0)
        .download_batch(
            &manifest(vec![entry("https://cdn/a.rpm", ContentType::Rpm, "noarch", None)]),
            &OutputLayout::new(out.path()),
        )
        .await;

    assert!(report.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_fails_slow_entries() {
    let out = TempDir::new().unwrap();
    let source = FakeSource::default()
        .with_file("https://cdn/fast.rpm", b"fast")
        .with_file("https://cdn/slow.rpm", b"slow")
        .with_delay("https://cdn/slow.rpm", Duration::from_secs(30));
    let manifest = manifest(vec![
        entry("https://cdn/slow.rpm", ContentType::Rpm, "x86_64", None),
        entry("https://cdn/fast.rpm", ContentType::Rpm, "x86_64", None),
    ]);

    let started = std::time::Instant::now();
    let report = DownloadOrchestrator::new(Arc::new(source))
        .with_max_workers(2)
        .with_deadline(Some(Duration::from_millis(300)))
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let rpms = report.category(Category::Rpms);
    assert_eq!(rpms.len(), 2);
    assert_eq!(rpms[0].error_kind.as_deref(), Some("deadline_exceeded"));
    assert!(rpms[1].success);
    assert!(!out.path().join("slow.rpm").exists());
    assert!(!out.path().join("slow.rpm.part").exists());
}

// =============================================================================
// MANIFEST SOURCES
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_filtered_manifest_from_url() {
    let out = TempDir::new().unwrap();
    let document = br#"[
        {"url": "https://cdn/x.rpm", "content_type": "rpm", "arch": "x86_64"},
        {"url": "https://cdn/y.rpm", "content_type": "rpm", "arch": "aarch64"},
        {"url": "https://cdn/x86_64/z.log", "content_type": "log", "arch": "x86_64"}
    ]"#;
    let source = Arc::new(
        FakeSource::default()
            .with_file("https://cdn/manifest.json", document)
            .with_file("https://cdn/x.rpm", b"x")
            .with_file("https://cdn/y.rpm", b"y")
            .with_file("https://cdn/x86_64/z.log", b"z"),
    );

    let manifest = Manifest::load("https://cdn/manifest.json", source.as_ref())
        .await
        .unwrap()
        .filtered(&ManifestFilter {
            content_types: vec![ContentType::Rpm],
            archs: vec!["x86_64".to_string()],
        });
    let report = DownloadOrchestrator::new(Arc::clone(&source))
        .download_batch(&manifest, &OutputLayout::new(out.path()))
        .await;

    assert!(report.success);
    assert_eq!(report.len(), 1);
    assert_eq!(source.requested(), vec!["https://cdn/x.rpm".to_string()]);
    assert!(report.category(Category::Logs).is_empty());
}

#[tokio::test]
async fn test_manifest_from_local_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, br#"{"artifacts": [{"url": "https://cdn/a.rpm", "type": "rpm"}]}"#).unwrap();

    let manifest = Manifest::load(path.to_str().unwrap(), &FakeSource::default())
        .await
        .unwrap();
    assert_eq!(manifest.len(), 1);

    let missing = Manifest::load(dir.path().join("nope.json").to_str().unwrap(), &FakeSource::default()).await;
    assert!(matches!(missing, Err(PulpError::Manifest(_))));
}
