// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Get-or-create of the per-package repositories and their distributions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use super::models::{CreateResponse, Distribution, Repository, RepositoryKind};
use super::{DistributionApi, RepositoryApi, TaskApi};
use crate::errors::{PulpError, PulpResult};
use crate::tasks::TaskPoller;
use crate::types::ContentType;

/// Repository suffixes and their plugin flavour, in creation order.
const REPOSITORY_SUFFIXES: [(&str, RepositoryKind); 4] = [
    ("rpms", RepositoryKind::Rpm),
    ("logs", RepositoryKind::File),
    ("sbom", RepositoryKind::File),
    ("artifacts", RepositoryKind::File),
];

/// A ready-to-use repository with its distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryTarget {
    pub kind: RepositoryKind,
    pub name: String,
    pub repository_href: String,
    /// Identifier for content-creation calls (PRN when the server has them).
    pub content_target: String,
    pub base_path: String,
    /// Public URL of the distribution, when the server reports one.
    pub distribution_url: Option<String>,
}

/// The four repositories a package build publishes into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryRefs {
    pub rpms: RepositoryTarget,
    pub logs: RepositoryTarget,
    pub sbom: RepositoryTarget,
    pub artifacts: RepositoryTarget,
}

impl RepositoryRefs {
    /// Destination repository for a content type.
    pub fn for_content(&self, content_type: ContentType) -> &RepositoryTarget {
        match content_type {
            ContentType::Rpm => &self.rpms,
            ContentType::Log => &self.logs,
            ContentType::Sbom => &self.sbom,
            ContentType::File => &self.artifacts,
        }
    }

    /// Distribution URLs keyed by suffix, as written into results files.
    pub fn distribution_urls(&self) -> BTreeMap<String, String> {
        [
            ("rpms", &self.rpms),
            ("logs", &self.logs),
            ("sbom", &self.sbom),
            ("artifacts", &self.artifacts),
        ]
        .into_iter()
        .filter_map(|(key, target)| {
            target
                .distribution_url
                .as_ref()
                .map(|url| (key.to_string(), url.clone()))
        })
        .collect()
    }
}

impl RepositoryRefs {
    fn from_targets(mut targets: Vec<RepositoryTarget>) -> PulpResult<Self> {
        if targets.len() != REPOSITORY_SUFFIXES.len() {
            return Err(PulpError::InvalidResponse {
                operation: "ensure repositories".to_string(),
                message: format!("expected 4 repositories, got {}", targets.len()),
            });
        }
        let artifacts = targets.remove(3);
        let sbom = targets.remove(2);
        let logs = targets.remove(1);
        let rpms = targets.remove(0);
        Ok(Self { rpms, logs, sbom, artifacts })
    }
}

/// Ensures repositories and distributions exist for a package.
pub struct RepositoryManager<'a, G: ?Sized> {
    gateway: &'a G,
    task_timeout: Duration,
}

impl<'a, G> RepositoryManager<'a, G>
where
    G: TaskApi + RepositoryApi + DistributionApi + ?Sized,
{
    pub fn new(gateway: &'a G, task_timeout: Duration) -> Self {
        Self { gateway, task_timeout }
    }

    /// Look up or create `<parent_package>-{rpms,logs,sbom,artifacts}`, each
    /// with a distribution at `<namespace>/<parent_package>/<suffix>`.
    pub async fn ensure(&self, parent_package: &str, namespace: &str) -> PulpResult<RepositoryRefs> {
        let mut targets = Vec::with_capacity(REPOSITORY_SUFFIXES.len());
        for (suffix, kind) in REPOSITORY_SUFFIXES {
            let name = format!("{}-{}", parent_package, suffix);
            let base_path = format!("{}/{}/{}", namespace, parent_package, suffix);
            targets.push(self.ensure_one(kind, &name, &base_path).await?);
        }
        RepositoryRefs::from_targets(targets)
    }

    async fn ensure_one(
        &self,
        kind: RepositoryKind,
        name: &str,
        base_path: &str,
    ) -> PulpResult<RepositoryTarget> {
        let repository = match self.gateway.find_repository(kind, name).await? {
            Some(repo) => {
                tracing::debug!("Repository {} exists at {}", name, repo.pulp_href);
                repo
            }
            None => {
                tracing::info!("Creating repository {}", name);
                let response = self.gateway.create_repository(kind, name).await?;
                self.resolve_repository(response, name).await?
            }
        };

        let distribution = match self.gateway.find_distribution(kind, name).await? {
            Some(dist) => dist,
            None => {
                tracing::info!("Creating distribution {} at {}", name, base_path);
                let response = self
                    .gateway
                    .create_distribution(kind, name, base_path, &repository.pulp_href)
                    .await?;
                self.resolve_distribution(response, kind, name).await?
            }
        };

        Ok(RepositoryTarget {
            kind,
            name: name.to_string(),
            content_target: repository.content_target().to_string(),
            repository_href: repository.pulp_href,
            base_path: distribution.base_path,
            distribution_url: distribution.base_url,
        })
    }

    async fn resolve_repository(&self, response: CreateResponse, name: &str) -> PulpResult<Repository> {
        if let CreateResponse::Resource { body, .. } = &response {
            if let Ok(repo) = serde_json::from_value::<Repository>(body.clone()) {
                return Ok(repo);
            }
        }
        let hrefs = TaskPoller::new(self.gateway)
            .created_hrefs(response, self.task_timeout)
            .await?;
        let href = hrefs.into_iter().next().ok_or_else(|| PulpError::InvalidResponse {
            operation: format!("create repository {}", name),
            message: "no repository href returned".to_string(),
        })?;
        self.gateway.get_repository(&href).await
    }

    async fn resolve_distribution(
        &self,
        response: CreateResponse,
        kind: RepositoryKind,
        name: &str,
    ) -> PulpResult<Distribution> {
        if let CreateResponse::Resource { body, .. } = &response {
            if let Ok(dist) = serde_json::from_value::<Distribution>(body.clone()) {
                return Ok(dist);
            }
        }
        TaskPoller::new(self.gateway)
            .created_hrefs(response, self.task_timeout)
            .await?;
        // Creation tasks only report the href; read back to learn the base URL.
        self.gateway
            .find_distribution(kind, name)
            .await?
            .ok_or_else(|| PulpError::InvalidResponse {
                operation: format!("create distribution {}", name),
                message: "distribution not found after creation".to_string(),
            })
    }
}
