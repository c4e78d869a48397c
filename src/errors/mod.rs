// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for pulp-tool operations.
//!
//! Per-item failures (an upload that the server rejected, a download whose
//! checksum disagrees) are captured into a [`crate::report::Report`] using
//! [`PulpError::kind`] as a stable tag. Configuration and manifest errors are
//! returned to the caller before any item is processed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library.
pub type PulpResult<T> = std::result::Result<T, PulpError>;

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors produced by the API client, the task poller and the orchestrators.
#[derive(Debug, Error)]
pub enum PulpError {
    /// Network-level failure (connect, timeout, reset). Retryable.
    #[error("transient request error during {operation} after {attempts} attempt(s): {message}")]
    TransientRequest {
        operation: String,
        message: String,
        attempts: u32,
    },

    /// A task did not reach a terminal state in time.
    #[error("timed out waiting for task {task} after {}s ({polls} polls)", waited.as_secs())]
    TaskTimeout {
        task: String,
        waited: Duration,
        polls: u32,
    },

    /// A task finished as failed or canceled.
    #[error("task {task} {state}: {detail}")]
    TaskFailed {
        task: String,
        state: String,
        detail: String,
    },

    /// No architecture was supplied and none could be derived from the file.
    #[error("could not determine architecture for {}", path.display())]
    ArchitectureUndetectable { path: PathBuf },

    /// Downloaded bytes do not match the manifest checksum.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Two manifest entries would be written to the same local path.
    #[error("{url} conflicts with an earlier entry for {}", path.display())]
    DestinationConflict { url: String, path: PathBuf },

    /// The overall operation deadline passed before this item resolved.
    #[error("deadline exceeded before {operation} completed")]
    DeadlineExceeded { operation: String },

    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} during {operation}: {body}")]
    Api {
        status: u16,
        operation: String,
        body: String,
    },

    /// The server answered with a body we could not decode.
    #[error("invalid response during {operation}: {message}")]
    InvalidResponse { operation: String, message: String },

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Manifest could not be read or parsed.
    #[error("malformed manifest: {0}")]
    Manifest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PulpError {
    /// Stable snake_case tag stored alongside failed items in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientRequest { .. } => "transient_request_error",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::TaskFailed { .. } => "task_failed",
            Self::ArchitectureUndetectable { .. } => "architecture_undetectable",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::DestinationConflict { .. } => "destination_conflict",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Api { .. } => "api_error",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Config(_) => "config_error",
            Self::Manifest(_) => "manifest_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientRequest { .. } => true,
            // Gateway hiccups behind a load balancer.
            Self::Api { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }

    /// Map a reqwest error to the taxonomy.
    pub fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Api {
                status: status.as_u16(),
                operation: operation.to_string(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return Self::InvalidResponse {
                operation: operation.to_string(),
                message: err.to_string(),
            };
        }
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        Self::TransientRequest {
            operation: operation.to_string(),
            message,
            attempts: 1,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
