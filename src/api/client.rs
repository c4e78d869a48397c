// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP implementation of the gateway traits.
//!
//! One `reqwest::Client` is created per [`PulpClient`]; clones share its
//! connection pool, so download workers can each hold a clone.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use super::models::{
    CreateResponse, Distribution, FileSource, Page, Repository, RepositoryKind, Task, TaskHref,
};
use super::{ArtifactFetcher, ContentApi, DistributionApi, RepositoryApi, TaskApi};
use crate::config::Config;
use crate::errors::{PulpError, PulpResult};
use crate::types::Labels;
use crate::utils::mask_sensitive;

/// Maximum attempts for transient request errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Connect timeout; whole-request timeouts are per call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in an `Api` error.
const MAX_ERROR_BODY: usize = 500;

const USER_AGENT: &str = concat!("pulp-tool/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

/// Client for the content-management REST API.
#[derive(Clone)]
pub struct PulpClient {
    http: reqwest::Client,
    base_url: String,
    api_prefix: String,
    auth: Auth,
    timeout: Duration,
}

impl std::fmt::Debug for PulpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match &self.auth {
            Auth::None => "none".to_string(),
            Auth::Basic { username, .. } => format!("basic({})", username),
            Auth::Bearer(token) => format!("bearer({})", mask_sensitive(token, 4)),
        };
        f.debug_struct("PulpClient")
            .field("base_url", &self.base_url)
            .field("api_prefix", &self.api_prefix)
            .field("auth", &auth)
            .finish()
    }
}

impl PulpClient {
    /// Build a client from validated configuration.
    pub fn new(config: &Config) -> PulpResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_tls);

        if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
            let cert_pem = std::fs::read(cert).map_err(|e| {
                PulpError::Config(format!("cannot read cert {}: {}", cert.display(), e))
            })?;
            let key_pem = std::fs::read(key).map_err(|e| {
                PulpError::Config(format!("cannot read key {}: {}", key.display(), e))
            })?;
            let identity = reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)
                .map_err(|e| PulpError::Config(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| PulpError::Config(format!("failed to build HTTP client: {}", e)))?;

        let auth = match (&config.token, &config.username, &config.password) {
            (Some(token), _, _) => Auth::Bearer(token.clone()),
            (None, Some(username), Some(password)) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Auth::None,
        };

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let api_prefix = api_prefix(&base_url, &config.api_root, config.domain.as_deref());
        tracing::debug!("Content API prefix: {}", api_prefix);

        Ok(Self {
            http,
            base_url,
            api_prefix,
            auth,
            timeout: config.request_timeout(),
        })
    }

    /// Absolute URL for an endpoint relative to the API prefix.
    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_prefix, endpoint.trim_start_matches('/'))
    }

    /// Absolute URL for a server href (already rooted) or a full URL.
    pub fn href_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Send a request built by `build`, retrying transient failures with
    /// exponential backoff. `build` is called once per attempt.
    async fn send_with_retry<F>(&self, operation: &str, build: F) -> PulpResult<Response>
    where
        F: Fn() -> PulpResult<RequestBuilder>,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // 1000ms, 2000ms, ... capped at 10s
                let delay = std::cmp::min(RETRY_BASE_DELAY_MS * (1 << attempt), RETRY_MAX_DELAY_MS);
                tracing::debug!("{}: retry attempt {} after {}ms", operation, attempt + 1, delay);
                sleep(Duration::from_millis(delay)).await;
            }

            match self.send_once(operation, build()?).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => {
                    tracing::debug!("{}: transient failure: {}", operation, err);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(match last_error {
            Some(PulpError::TransientRequest { message, .. }) => PulpError::TransientRequest {
                operation: operation.to_string(),
                message,
                attempts: MAX_RETRIES,
            },
            Some(other) => other,
            None => PulpError::TransientRequest {
                operation: operation.to_string(),
                message: "no attempt made".to_string(),
                attempts: 0,
            },
        })
    }

    /// Single attempt: send and map non-success statuses to `Api` errors.
    async fn send_once(&self, operation: &str, request: RequestBuilder) -> PulpResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PulpError::from_reqwest(operation, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            body.truncate(cut);
            body.push_str("...");
        }
        Err(PulpError::Api {
            status: status.as_u16(),
            operation: operation.to_string(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> PulpResult<T> {
        let text = response
            .text()
            .await
            .map_err(|e| PulpError::from_reqwest(operation, e))?;
        serde_json::from_str(&text).map_err(|e| PulpError::InvalidResponse {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    async fn post_json(&self, operation: &str, url: &str, body: &Value) -> PulpResult<CreateResponse> {
        let response = self
            .send_with_retry(operation, || {
                Ok(self.http.post(url).json(body).timeout(self.timeout))
            })
            .await?;
        let value: Value = Self::decode(operation, response).await?;
        CreateResponse::from_json(value, operation)
    }

    async fn post_form<F>(&self, operation: &str, url: &str, form: F) -> PulpResult<CreateResponse>
    where
        F: Fn() -> PulpResult<Form>,
    {
        let response = self
            .send_with_retry(operation, || {
                Ok(self.http.post(url).multipart(form()?).timeout(self.timeout))
            })
            .await?;
        let value: Value = Self::decode(operation, response).await?;
        CreateResponse::from_json(value, operation)
    }

    /// First match of a `?name=` lookup on a list endpoint.
    async fn find_by_name<T: DeserializeOwned>(
        &self,
        operation: &str,
        endpoint: &str,
        name: &str,
    ) -> PulpResult<Option<T>> {
        let url = self.url(endpoint);
        let response = self
            .send_with_retry(operation, || {
                Ok(self
                    .http
                    .get(&url)
                    .query(&[("name", name), ("offset", "0"), ("limit", "1")])
                    .timeout(self.timeout))
            })
            .await?;
        let page: Page<T> = Self::decode(operation, response).await?;
        Ok(page.results.into_iter().next())
    }
}

fn api_prefix(base_url: &str, api_root: &str, domain: Option<&str>) -> String {
    let root = api_root.trim_matches('/');
    let mut prefix = format!("{}/{}/", base_url, root);
    if let Some(domain) = domain.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty()) {
        prefix.push_str(domain);
        prefix.push('/');
    }
    prefix
}

/// File contents read once per upload; every retry attempt shares the buffer.
async fn read_payload(path: &Path) -> PulpResult<Bytes> {
    Ok(Bytes::from(tokio::fs::read(path).await?))
}

fn file_part(data: &Bytes, name: &str) -> Part {
    Part::stream_with_length(data.clone(), data.len() as u64).file_name(name.to_string())
}

// =============================================================================
// TRAIT IMPLEMENTATIONS
// =============================================================================

#[async_trait]
impl TaskApi for PulpClient {
    async fn get_task(&self, href: &TaskHref) -> PulpResult<Task> {
        let operation = "get task";
        let request = self.http.get(self.href_url(href.as_str())).timeout(self.timeout);
        let response = self.send_once(operation, request).await?;
        Self::decode(operation, response).await
    }
}

#[async_trait]
impl ContentApi for PulpClient {
    async fn upload_rpm(
        &self,
        path: &Path,
        relative_path: &str,
        labels: &Labels,
    ) -> PulpResult<CreateResponse> {
        let data = read_payload(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.to_string());
        let url = self.url("api/v3/content/rpm/packages/upload/");
        let label_json = labels.to_json();

        tracing::debug!("Uploading RPM {} ({} bytes)", name, data.len());
        self.post_form("upload rpm", &url, || {
            Ok(Form::new()
                .text("relative_path", relative_path.to_string())
                .text("pulp_labels", label_json.clone())
                .part("file", file_part(&data, &name)))
        })
        .await
    }

    async fn create_file_content(
        &self,
        repository: Option<&str>,
        source: FileSource,
        relative_path: &str,
        labels: &Labels,
    ) -> PulpResult<CreateResponse> {
        let (name, data) = match source {
            FileSource::Path(path) => {
                let data = read_payload(&path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| relative_path.to_string());
                (name, data)
            }
            FileSource::Bytes { name, data } => (name, Bytes::from(data)),
        };
        let url = self.url("api/v3/content/file/files/");
        let label_json = labels.to_json();

        tracing::debug!("Creating file content {} ({} bytes)", relative_path, data.len());
        self.post_form("create file content", &url, || {
            let mut form = Form::new()
                .text("relative_path", relative_path.to_string())
                .text("pulp_labels", label_json.clone())
                .part("file", file_part(&data, &name));
            if let Some(repo) = repository {
                form = form.text("repository", repo.to_string());
            }
            Ok(form)
        })
        .await
    }
}

#[async_trait]
impl RepositoryApi for PulpClient {
    async fn find_repository(
        &self,
        kind: RepositoryKind,
        name: &str,
    ) -> PulpResult<Option<Repository>> {
        self.find_by_name("find repository", kind.repository_endpoint(), name).await
    }

    async fn create_repository(&self, kind: RepositoryKind, name: &str) -> PulpResult<CreateResponse> {
        let mut body = json!({ "name": name });
        if kind == RepositoryKind::Rpm {
            body["autopublish"] = json!(true);
        }
        let url = self.url(kind.repository_endpoint());
        self.post_json("create repository", &url, &body).await
    }

    async fn add_content(
        &self,
        repository_href: &str,
        content_hrefs: &[String],
    ) -> PulpResult<CreateResponse> {
        let url = self.href_url(&format!("{}/modify/", repository_href.trim_end_matches('/')));
        let body = json!({ "add_content_units": content_hrefs });
        self.post_json("modify repository", &url, &body).await
    }

    async fn get_repository(&self, href: &str) -> PulpResult<Repository> {
        let operation = "get repository";
        let url = self.href_url(href);
        let response = self
            .send_with_retry(operation, || Ok(self.http.get(&url).timeout(self.timeout)))
            .await?;
        Self::decode(operation, response).await
    }
}

#[async_trait]
impl DistributionApi for PulpClient {
    async fn find_distribution(
        &self,
        kind: RepositoryKind,
        name: &str,
    ) -> PulpResult<Option<Distribution>> {
        self.find_by_name("find distribution", kind.distribution_endpoint(), name).await
    }

    async fn create_distribution(
        &self,
        kind: RepositoryKind,
        name: &str,
        base_path: &str,
        repository_href: &str,
    ) -> PulpResult<CreateResponse> {
        let url = self.url(kind.distribution_endpoint());
        let body = json!({
            "name": name,
            "base_path": base_path,
            "repository": repository_href,
        });
        self.post_json("create distribution", &url, &body).await
    }
}

#[async_trait]
impl ArtifactFetcher for PulpClient {
    async fn fetch_to(&self, url: &str, dest: &Path) -> PulpResult<u64> {
        let operation = format!("download {}", url);
        let target = self.href_url(url);
        // No whole-request timeout: large artifacts are bounded by the caller's deadline.
        let response = self
            .send_with_retry(&operation, || Ok(self.http.get(&target)))
            .await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PulpError::from_reqwest(&operation, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn fetch_bytes(&self, url: &str) -> PulpResult<Vec<u8>> {
        let operation = "fetch manifest";
        let target = self.href_url(url);
        let response = self
            .send_with_retry(operation, || Ok(self.http.get(&target).timeout(self.timeout)))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PulpError::from_reqwest(operation, e))?;
        Ok(bytes.to_vec())
    }
}
