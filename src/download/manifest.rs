// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Artifact manifests.
//!
//! Three shapes are accepted:
//!
//! ```text
//! [ {"url": .., "content_type": "rpm", "arch": "x86_64", "checksum": ..}, .. ]
//! { "artifacts": [ <entries> ] }
//! { "artifacts": { "<name>": {"content_type": .., "url": .., "labels": {"arch": ..}, "sha256": ..} },
//!   "distributions": {"rpms": <url>, "logs": <url>, "sbom": <url>} }
//! ```
//!
//! The last one is the results document written by `upload-files`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ArtifactFetcher;
use crate::errors::{PulpError, PulpResult};
use crate::types::ContentType;
use crate::utils::file_name_from_url;

fn default_arch() -> String {
    "noarch".to_string()
}

/// One artifact to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    #[serde(alias = "type")]
    pub content_type: ContentType,
    #[serde(default = "default_arch")]
    pub arch: String,
    /// `sha256:<hex>` or bare hex
    #[serde(default, alias = "sha256")]
    pub checksum: Option<String>,
}

impl ManifestEntry {
    /// Local file name: the last URL segment.
    pub fn file_name(&self) -> PulpResult<&str> {
        file_name_from_url(&self.url)
            .ok_or_else(|| PulpError::Manifest(format!("no file name in url '{}'", self.url)))
    }

    fn validate(&self) -> PulpResult<()> {
        if self.url.trim().is_empty() {
            return Err(PulpError::Manifest("entry with empty url".to_string()));
        }
        self.file_name()?;
        // Used as a directory name for logs.
        if self.arch.is_empty()
            || self.arch.contains(['/', '\\'])
            || self.arch == "."
            || self.arch == ".."
        {
            return Err(PulpError::Manifest(format!(
                "invalid arch '{}' for {}",
                self.arch, self.url
            )));
        }
        Ok(())
    }
}

/// Which entries to download.
#[derive(Debug, Clone, Default)]
pub struct ManifestFilter {
    /// Empty means every type
    pub content_types: Vec<ContentType>,
    /// Empty means every architecture
    pub archs: Vec<String>,
}

impl ManifestFilter {
    pub fn matches(&self, entry: &ManifestEntry) -> bool {
        (self.content_types.is_empty() || self.content_types.contains(&entry.content_type))
            && (self.archs.is_empty() || self.archs.iter().any(|a| a == &entry.arch))
    }
}

/// A validated list of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Read from a local path or an http(s) URL.
    pub async fn load<F: ArtifactFetcher + ?Sized>(location: &str, fetcher: &F) -> PulpResult<Self> {
        let bytes = if location.starts_with("http://") || location.starts_with("https://") {
            tracing::info!("Fetching manifest from {}", location);
            fetcher
                .fetch_bytes(location)
                .await
                .map_err(|e| PulpError::Manifest(format!("cannot fetch {}: {}", location, e)))?
        } else {
            let path = Path::new(location);
            tokio::fs::read(path)
                .await
                .map_err(|e| PulpError::Manifest(format!("cannot read {}: {}", path.display(), e)))?
        };
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> PulpResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| PulpError::Manifest(format!("not valid JSON: {}", e)))?;

        let entries = match &value {
            Value::Array(_) => entries_from_list(value)?,
            Value::Object(map) => match map.get("artifacts") {
                Some(Value::Array(list)) => entries_from_list(Value::Array(list.clone()))?,
                Some(Value::Object(artifacts)) => {
                    let distributions = map
                        .get("distributions")
                        .and_then(Value::as_object)
                        .ok_or_else(|| {
                            PulpError::Manifest("results document without 'distributions'".to_string())
                        })?;
                    entries_from_results(artifacts, distributions)?
                }
                _ => {
                    return Err(PulpError::Manifest(
                        "expected an 'artifacts' list or map".to_string(),
                    ))
                }
            },
            _ => return Err(PulpError::Manifest("expected a JSON array or object".to_string())),
        };

        for entry in &entries {
            entry.validate()?;
        }
        Ok(Self { entries })
    }

    /// Keep only entries matching `filter`.
    pub fn filtered(self, filter: &ManifestFilter) -> Self {
        let before = self.entries.len();
        let entries: Vec<_> = self.entries.into_iter().filter(|e| filter.matches(e)).collect();
        tracing::debug!("Filter kept {} of {} manifest entries", entries.len(), before);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn entries_from_list(list: Value) -> PulpResult<Vec<ManifestEntry>> {
    serde_json::from_value(list).map_err(|e| PulpError::Manifest(format!("invalid entry: {}", e)))
}

/// Derive entries from a results document. The stored `content_type` and
/// `url` win; older documents without them fall back to guessing from the
/// name and the distribution URLs. Names with no type either way are skipped.
fn entries_from_results(
    artifacts: &serde_json::Map<String, Value>,
    distributions: &serde_json::Map<String, Value>,
) -> PulpResult<Vec<ManifestEntry>> {
    let distro = |key: &str| distributions.get(key).and_then(Value::as_str).unwrap_or("");
    let mut entries = Vec::with_capacity(artifacts.len());

    for (name, meta) in artifacts {
        let stored_type = match meta.get("content_type").and_then(Value::as_str) {
            Some(text) => Some(text.parse::<ContentType>().map_err(|e| {
                PulpError::Manifest(format!("artifact {}: {}", name, e))
            })?),
            None => None,
        };
        let Some(content_type) = stored_type.or_else(|| ContentType::detect(name)) else {
            tracing::debug!("Skipping {}: could not determine artifact type", name);
            continue;
        };
        let url = match meta.get("url").and_then(Value::as_str).filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => match content_type {
                ContentType::Rpm => format!("{}Packages/l/{}", distro("rpms"), name),
                ContentType::Log => format!("{}{}", distro("logs"), name),
                ContentType::Sbom => format!("{}{}", distro("sbom"), name),
                ContentType::File => format!("{}{}", distro("artifacts"), name),
            },
        };
        let arch = meta
            .pointer("/labels/arch")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_arch);
        let checksum = meta.get("sha256").and_then(Value::as_str).map(str::to_string);
        entries.push(ManifestEntry {
            url,
            content_type,
            arch,
            checksum,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_list() {
        let manifest = Manifest::parse(
            br#"[{"url": "https://h/a.rpm", "content_type": "rpm", "arch": "x86_64"},
                 {"url": "https://h/b.log", "content_type": "log", "arch": "aarch64", "checksum": "sha256:ab"}]"#,
        )
        .unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries[1].checksum.as_deref(), Some("sha256:ab"));
        assert_eq!(manifest.entries[0].file_name().unwrap(), "a.rpm");
    }

    #[test]
    fn test_parse_wrapped_list_defaults_arch() {
        let manifest =
            Manifest::parse(br#"{"artifacts": [{"url": "https://h/sbom.json", "type": "sbom"}]}"#).unwrap();
        assert_eq!(manifest.entries[0].arch, "noarch");
        assert_eq!(manifest.entries[0].content_type, ContentType::Sbom);
    }

    #[test]
    fn test_parse_results_document() {
        let manifest = Manifest::parse(
            br#"{
                "artifacts": {
                    "pkg-1.0-1.x86_64.rpm": {"labels": {"arch": "x86_64"}, "sha256": "aa"},
                    "aarch64/build.log": {"labels": {"arch": "aarch64"}},
                    "cyclonedx-sbom.json": {"labels": {}},
                    "README": {"labels": {}}
                },
                "distributions": {
                    "rpms": "https://h/ns/pkg/rpms/",
                    "logs": "https://h/ns/pkg/logs/",
                    "sbom": "https://h/ns/pkg/sbom/"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.len(), 3);

        let rpm = manifest.entries.iter().find(|e| e.content_type == ContentType::Rpm).unwrap();
        assert_eq!(rpm.url, "https://h/ns/pkg/rpms/Packages/l/pkg-1.0-1.x86_64.rpm");
        assert_eq!(rpm.checksum.as_deref(), Some("aa"));

        let log = manifest.entries.iter().find(|e| e.content_type == ContentType::Log).unwrap();
        assert_eq!(log.url, "https://h/ns/pkg/logs/aarch64/build.log");
        assert_eq!(log.arch, "aarch64");
        assert_eq!(log.file_name().unwrap(), "build.log");
    }

    #[test]
    fn test_results_document_prefers_stored_type_and_url() {
        let manifest = Manifest::parse(
            br#"{
                "artifacts": {
                    "changelog.txt": {"content_type": "file", "url": "https://h/ns/p/artifacts/changelog.txt",
                                      "labels": {"arch": "noarch"}},
                    "notes.txt": {"content_type": "file", "url": "https://h/ns/p/artifacts/notes.txt",
                                  "labels": {"arch": "noarch"}},
                    "python-sbom-tools-1.0-1.noarch.rpm": {"content_type": "rpm",
                        "url": "https://h/ns/p/rpms/Packages/l/python-sbom-tools-1.0-1.noarch.rpm",
                        "labels": {"arch": "noarch"}}
                },
                "distributions": {"rpms": "https://h/ns/p/rpms/", "logs": "https://h/ns/p/logs/"}
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.len(), 3);

        let by_name = |name: &str| {
            manifest
                .entries
                .iter()
                .find(|e| e.file_name().unwrap() == name)
                .unwrap()
                .clone()
        };
        let changelog = by_name("changelog.txt");
        assert_eq!(changelog.content_type, ContentType::File);
        assert_eq!(changelog.url, "https://h/ns/p/artifacts/changelog.txt");
        assert_eq!(by_name("notes.txt").content_type, ContentType::File);

        let rpm = by_name("python-sbom-tools-1.0-1.noarch.rpm");
        assert_eq!(rpm.content_type, ContentType::Rpm);
        assert!(rpm.url.starts_with("https://h/ns/p/rpms/"));
    }

    #[test]
    fn test_results_document_rejects_unknown_stored_type() {
        let err = Manifest::parse(
            br#"{"artifacts": {"a.bin": {"content_type": "tarball"}}, "distributions": {}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PulpError::Manifest(_)));
    }

    #[test]
    fn test_malformed_manifests() {
        let cases: [&[u8]; 8] = [
            b"not json",
            br#""a string""#,
            br#"{"something": []}"#,
            br#"[{"url": "https://h/a.rpm"}]"#,
            br#"[{"url": "https://h/a.rpm", "content_type": "tarball"}]"#,
            br#"[{"url": "", "content_type": "rpm"}]"#,
            br#"[{"url": "https://h/b.log", "content_type": "log", "arch": "../etc"}]"#,
            br#"{"artifacts": {"a.rpm": {}}}"#,
        ];
        for bad in cases {
            let err = Manifest::parse(bad).unwrap_err();
            assert!(matches!(err, PulpError::Manifest(_)), "accepted {:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn test_filter() {
        let manifest = Manifest::parse(
            br#"[{"url": "a.rpm", "content_type": "rpm", "arch": "x86_64"},
                 {"url": "b.rpm", "content_type": "rpm", "arch": "aarch64"},
                 {"url": "c.log", "content_type": "log", "arch": "x86_64"}]"#,
        )
        .unwrap();

        let by_type = manifest.clone().filtered(&ManifestFilter {
            content_types: vec![ContentType::Rpm],
            archs: vec![],
        });
        assert_eq!(by_type.len(), 2);

        let by_both = manifest.clone().filtered(&ManifestFilter {
            content_types: vec![ContentType::Rpm],
            archs: vec!["x86_64".into()],
        });
        assert_eq!(by_both.entries[0].url, "a.rpm");
        assert_eq!(by_both.len(), 1);

        assert_eq!(manifest.clone().filtered(&ManifestFilter::default()), manifest);
    }
}
