// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Human-readable error output for the CLI.
//!
//! [`describe`] turns a [`PulpError`] into a [`Diagnosis`]: the error line,
//! likely causes and numbered fixes, rendered via `Display`.

use std::fmt;

use crate::errors::PulpError;

/// Footer of every rendered diagnosis.
pub const HELP_HINT: &str = "Re-run with --debug to see request details.";

/// An error with likely causes and suggested fixes.
///
/// ```
/// use pulp_tool::error::Diagnosis;
///
/// let text = Diagnosis::new("Failed to reach the content API")
///     .cause("VPN not connected")
///     .fix("Retry once connected")
///     .to_string();
/// assert!(text.contains("Possible causes:"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub title: String,
    pub causes: Vec<&'static str>,
    pub fixes: Vec<&'static str>,
}

impl Diagnosis {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: &'static str) -> Self {
        self.causes.push(cause);
        self
    }

    pub fn fix(mut self, fix: &'static str) -> Self {
        self.fixes.push(fix);
        self
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[✗] {}", self.title)?;
        if !self.causes.is_empty() {
            writeln!(f, "\nPossible causes:")?;
            for cause in &self.causes {
                writeln!(f, "  - {}", cause)?;
            }
        }
        if !self.fixes.is_empty() {
            writeln!(f, "\nTry these fixes:")?;
            for (n, fix) in self.fixes.iter().enumerate() {
                writeln!(f, "  {}. {}", n + 1, fix)?;
            }
        }
        write!(f, "\n{}", HELP_HINT)
    }
}

/// Causes and fixes that fit the error's kind.
pub fn describe(err: &PulpError) -> Diagnosis {
    let diagnosis = Diagnosis::new(err.to_string());
    match err {
        PulpError::Config(_) => diagnosis
            .cause("Config file missing or not valid JSON")
            .cause("base_url not set and PULP_BASE_URL not exported")
            .fix("Pass --config <path> or a base64-encoded config")
            .fix("Export PULP_BASE_URL=https://pulp.example.com"),
        PulpError::Manifest(_) => diagnosis
            .cause("Artifact location is not a JSON manifest")
            .cause("Entry missing url or content_type, or with an invalid arch")
            .fix("Validate the manifest with: jq . <file>"),
        PulpError::TransientRequest { .. } => diagnosis
            .cause("Content API unreachable")
            .cause("DNS, proxy or VPN interference")
            .fix("Check connectivity to base_url")
            .fix("Retry the command"),
        PulpError::Api { status: 401 | 403, .. } => diagnosis
            .cause("Invalid or expired credentials")
            .cause("Credentials lack access to this domain")
            .fix("Check username/password or token in config"),
        PulpError::Api { status: 404, .. } => diagnosis
            .cause("Wrong domain or api_root")
            .fix("Compare domain and api_root with the server's API root"),
        PulpError::TaskTimeout { .. } => diagnosis
            .cause("Server task queue is backed up")
            .fix("Increase --task-timeout")
            .fix("Check the task later with: pulp-tool wait-task <href>"),
        PulpError::DestinationConflict { .. } => diagnosis
            .cause("Two artifacts with the same file name land in one directory")
            .fix("Narrow the download with --archs or --content-types"),
        PulpError::TaskFailed { .. } => {
            diagnosis.fix("Inspect the task with: pulp-tool wait-task <href> --debug")
        }
        _ => diagnosis,
    }
}
