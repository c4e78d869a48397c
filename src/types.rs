// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across pulp-tool.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Architectures the build system produces.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &["x86_64", "aarch64", "ppc64le", "s390x", "noarch"];

/// Returns true if `arch` is one of [`SUPPORTED_ARCHITECTURES`].
pub fn is_supported_arch(arch: &str) -> bool {
    SUPPORTED_ARCHITECTURES.contains(&arch)
}

/// Kind of artifact being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Rpm,
    Log,
    Sbom,
    File,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::Log => "log",
            Self::Sbom => "sbom",
            Self::File => "file",
        }
    }

    /// Report category this content type is grouped under.
    pub fn category(&self) -> Category {
        match self {
            Self::Rpm => Category::Rpms,
            Self::Log => Category::Logs,
            Self::Sbom => Category::Sbom,
            Self::File => Category::Files,
        }
    }

    /// Guess the type from a file name. Checked in order sbom, log, rpm,
    /// so `build-sbom.log.json` is an SBOM.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.contains("sbom") {
            Some(Self::Sbom)
        } else if lower.contains("log") {
            Some(Self::Log)
        } else if lower.contains("rpm") {
            Some(Self::Rpm)
        } else {
            None
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rpm" | "rpms" => Ok(Self::Rpm),
            "log" | "logs" => Ok(Self::Log),
            "sbom" => Ok(Self::Sbom),
            "file" | "files" => Ok(Self::File),
            other => Err(format!(
                "unknown content type '{}' (expected rpm, log, sbom or file)",
                other
            )),
        }
    }
}

/// Report grouping. Declaration order is the output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Rpms,
    Logs,
    Sbom,
    Files,
}

impl Category {
    pub const ALL: [Category; 4] = [Category::Rpms, Category::Logs, Category::Sbom, Category::Files];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rpms => "rpms",
            Self::Logs => "logs",
            Self::Sbom => "sbom",
            Self::Files => "files",
        }
    }
}

/// Labels attached to uploaded content so builds can be found again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new(build_id: &str, arch: &str, namespace: &str, parent_package: &str, date: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert("date".to_string(), date.to_string());
        map.insert("build_id".to_string(), build_id.to_string());
        map.insert("arch".to_string(), arch.to_string());
        map.insert("namespace".to_string(), namespace.to_string());
        map.insert("parent_package".to_string(), parent_package.to_string());
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// JSON text as the content API expects in the `pulp_labels` form field.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}
