// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire models for the content API.
//!
//! Task and creation responses come back in several shapes. They are decoded
//! explicitly into tagged enums here so the rest of the crate never pokes at
//! raw JSON maps.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PulpError, PulpResult};

// =============================================================================
// TASKS
// =============================================================================

/// Server href of an asynchronous task, e.g. `/pulp/api/v3/tasks/<uuid>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHref(pub String);

impl TaskHref {
    pub fn new(href: impl Into<String>) -> Self {
        Self(href.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Queued, not started
    Waiting,
    /// Executing (or being canceled)
    Running,
    /// Finished successfully
    Completed {
        created_resources: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Finished with an error
    Failed { detail: String },
    /// Canceled or skipped by the server
    Canceled {
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl TaskState {
    /// Returns true once the server will not change the state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Canceled { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Completed { .. } => "completed",
            TaskState::Failed { .. } => "failed",
            TaskState::Canceled { .. } => "canceled",
        }
    }
}

/// A task as reported by the task-status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    pub href: TaskHref,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub state: TaskState,
}

impl Task {
    /// Hrefs of resources created by a completed task (empty otherwise).
    pub fn created_resources(&self) -> &[String] {
        match &self.state {
            TaskState::Completed { created_resources, .. } => created_resources,
            _ => &[],
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTask {
    pulp_href: String,
    state: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_resources: Vec<Option<String>>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
}

impl TryFrom<RawTask> for Task {
    type Error = String;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let detail = raw.error.as_ref().and_then(error_detail);
        let state = match raw.state.as_str() {
            "waiting" => TaskState::Waiting,
            "running" | "canceling" => TaskState::Running,
            "completed" => TaskState::Completed {
                created_resources: raw.created_resources.into_iter().flatten().collect(),
                result: raw.result,
            },
            "failed" => TaskState::Failed {
                detail: detail.unwrap_or_else(|| "no error detail reported".to_string()),
            },
            "canceled" => TaskState::Canceled { detail },
            "skipped" => TaskState::Canceled {
                detail: Some(detail.unwrap_or_else(|| "skipped".to_string())),
            },
            other => return Err(format!("unknown task state '{}'", other)),
        };
        Ok(Task {
            href: TaskHref(raw.pulp_href),
            name: raw.name,
            state,
        })
    }
}

/// Pull a human-readable message out of a task `error` payload.
fn error_detail(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(error.to_string())),
        other => Some(other.to_string()),
    }
}

// =============================================================================
// CREATION RESPONSES
// =============================================================================

/// Result of a create/upload/modify call.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateResponse {
    /// The server accepted the work and will finish it asynchronously.
    Task(TaskHref),
    /// The server finished synchronously and returned the resource.
    Resource { href: String, body: Value },
}

impl CreateResponse {
    pub fn from_json(body: Value, operation: &str) -> PulpResult<Self> {
        if let Some(task) = body.get("task").and_then(Value::as_str) {
            return Ok(Self::Task(TaskHref::new(task)));
        }
        if let Some(href) = body.get("pulp_href").and_then(Value::as_str) {
            return Ok(Self::Resource {
                href: href.to_string(),
                body,
            });
        }
        Err(PulpError::InvalidResponse {
            operation: operation.to_string(),
            message: "response has neither 'task' nor 'pulp_href'".to_string(),
        })
    }
}

// =============================================================================
// REPOSITORIES & DISTRIBUTIONS
// =============================================================================

/// Plugin flavour of a repository or distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Rpm,
    File,
}

impl RepositoryKind {
    pub fn repository_endpoint(&self) -> &'static str {
        match self {
            Self::Rpm => "api/v3/repositories/rpm/rpm/",
            Self::File => "api/v3/repositories/file/file/",
        }
    }

    pub fn distribution_endpoint(&self) -> &'static str {
        match self {
            Self::Rpm => "api/v3/distributions/rpm/rpm/",
            Self::File => "api/v3/distributions/file/file/",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub pulp_href: String,
    pub name: String,
    #[serde(default)]
    pub prn: Option<String>,
}

impl Repository {
    /// Identifier accepted by content-creation endpoints.
    pub fn content_target(&self) -> &str {
        self.prn.as_deref().unwrap_or(&self.pulp_href)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub pulp_href: String,
    pub name: String,
    pub base_path: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// One page of a list endpoint.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: u64,
    pub results: Vec<T>,
}

/// Bytes for a file-content upload.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Read from disk at upload time
    Path(PathBuf),
    /// Already in memory (generated reports)
    Bytes { name: String, data: Vec<u8> },
}
