// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Where downloaded files land.

use std::path::PathBuf;

use super::manifest::ManifestEntry;
use crate::errors::PulpResult;
use crate::types::ContentType;

/// Directory for logs, below the output root.
pub const LOGS_DIR: &str = "logs";

/// Maps manifest entries to local paths. Placement depends only on the
/// content type: logs go to `logs/<arch>/`, everything else to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, entry: &ManifestEntry) -> PulpResult<PathBuf> {
        let name = entry.file_name()?;
        Ok(match entry.content_type {
            ContentType::Log => self.root.join(LOGS_DIR).join(&entry.arch).join(name),
            ContentType::Rpm | ContentType::Sbom | ContentType::File => self.root.join(name),
        })
    }
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::new(".")
    }
}
