//! HTTP transport to the registry (spec §4.A "Registry Client").
//!
//! Implements the ACR-flavored distribution API: paginated listing with
//! attributes via `/acr/v1/<repo>/_tags` and `/acr/v1/<repo>/_manifests`,
//! manifest fetch/delete via the standard `/v2/<repo>/manifests/<ref>`, and
//! lock/unlock via `PATCH .../changeableAttributes` (spec §6 "Wire
//! protocol"). 404/405 on delete are normalized to idempotent success here
//! so every caller above this layer can treat deletion as pure (spec §7).

use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::{AuthMode, Authorizer};
use crate::error::{PurgeError, Result};
use crate::models::{ChangeableAttributes, Credential, Manifest, Tag, ALL_MANIFEST_MEDIA_TYPES};

const PAGE_SIZE: usize = 100;
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Outcome of a delete call once 404/405 have been normalized (spec §7
/// table: `NotFound`/`MethodNotAllowed` both become idempotent success,
/// distinguished only for the human-readable log line in spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    SkippedNotFound,
    SkippedNotAllowed,
}

impl DeleteOutcome {
    pub fn was_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted)
    }
}

#[derive(Debug, Deserialize)]
struct AcrTagsResponse {
    tags: Option<Vec<Tag>>,
}

#[derive(Debug, Deserialize)]
struct AcrManifestsResponse {
    manifests: Option<Vec<Manifest>>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChangeableAttributesPatch {
    #[serde(rename = "deleteEnabled")]
    delete_enabled: bool,
    #[serde(rename = "writeEnabled")]
    write_enabled: bool,
}

impl From<ChangeableAttributes> for ChangeableAttributesPatch {
    fn from(attrs: ChangeableAttributes) -> Self {
        Self {
            delete_enabled: attrs.delete_enabled,
            write_enabled: attrs.write_enabled,
        }
    }
}

/// HTTP client for one registry host. Safe for concurrent use (spec §4.A
/// "Concurrency"): the only mutable shared state is inside [`Authorizer`],
/// which serializes refreshes behind its own mutex.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    auth: AuthMode,
    authorizer: Option<std::sync::Arc<Authorizer>>,
    verbose: bool,
}

impl RegistryClient {
    pub fn new(registry_host: &str, credential: Option<Credential>) -> Result<Self> {
        Self::with_options(registry_host, credential, false)
    }

    pub fn with_options(
        registry_host: &str,
        credential: Option<Credential>,
        verbose: bool,
    ) -> Result<Self> {
        let base_url = normalize_base_url(registry_host);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| PurgeError::Transport(e.to_string()))?;

        let auth = AuthMode::from_credential(credential.as_ref());
        let authorizer = match &auth {
            AuthMode::RefreshToken { secret } => Some(std::sync::Arc::new(Authorizer::new(
                http.clone(),
                format!("{base_url}/oauth2/token"),
                secret.clone(),
            ))),
            _ => None,
        };

        Ok(Self {
            http,
            base_url,
            auth,
            authorizer,
            verbose,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The registry host without scheme, for the `<host>/<repo>:<tag>`
    /// machine-grep-able output lines (spec §6).
    pub fn display_host(&self) -> &str {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Pre-fetches a single token scoped to every repository in `repos` in
    /// one exchange, instead of letting the first request to each
    /// repository trigger its own refresh (spec §4.A "scope-aware
    /// refresh"). A no-op under [`AuthMode::Anonymous`]/[`AuthMode::Basic`].
    pub async fn warm_token(&self, repos: &[String]) -> Result<()> {
        if let Some(authorizer) = &self.authorizer {
            authorizer.token_for_any(repos).await?;
        }
        Ok(())
    }

    fn log(&self, line: impl AsRef<str>) {
        if self.verbose {
            eprintln!("[DEBUG] {}", line.as_ref());
        }
    }

    async fn authorize(&self, request: reqwest::RequestBuilder, repo: Option<&str>) -> Result<reqwest::RequestBuilder> {
        match &self.auth {
            AuthMode::Anonymous => Ok(request),
            AuthMode::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            AuthMode::RefreshToken { .. } => {
                let authorizer = self
                    .authorizer
                    .as_ref()
                    .expect("authorizer set alongside RefreshToken mode");
                let token = authorizer.token_for(repo).await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    async fn send_with_retries<F>(build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = match build().try_clone() {
                Some(r) => r,
                None => build(),
            };
            match request.send().await {
                Ok(resp) if resp.status().is_server_error() && attempt < MAX_RETRY_ATTEMPTS => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < MAX_RETRY_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => return Err(PurgeError::Transport(e.to_string())),
            }
        }
    }

    /// GET `/v2/_catalog`, one page (spec §4.A pagination contract).
    pub async fn list_repositories(&self, page_token: Option<&str>) -> Result<(Vec<String>, Option<String>)> {
        let mut url = format!("{}/v2/_catalog?n={}", self.base_url, PAGE_SIZE);
        if let Some(token) = page_token {
            url.push_str(&format!("&last={token}"));
        }
        self.log(format!("GET {url}"));

        let request = self.authorize(self.http.get(&url), None).await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        let next = extract_next_last_param(response.headers());
        let response = Self::check_status(response, None).await?;
        let body: CatalogResponse = response.json().await?;
        Ok((body.repositories, next))
    }

    /// GET `/acr/v1/<repo>/_tags`, one page (spec §4.A `ListTags`).
    pub async fn list_tags(&self, repo: &str, page_token: Option<&str>) -> Result<(Vec<Tag>, Option<String>)> {
        let mut url = format!("{}/acr/v1/{repo}/_tags?n={}", self.base_url, PAGE_SIZE);
        if let Some(token) = page_token {
            url.push_str(&format!("&last={token}"));
        }
        self.log(format!("GET {url}"));

        let request = self.authorize(self.http.get(&url), Some(repo)).await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        let next = extract_next_last_param(response.headers());
        let response = Self::check_status(response, Some(repo)).await?;
        let body: AcrTagsResponse = response.json().await?;
        Ok((body.tags.unwrap_or_default(), next))
    }

    /// GET `/acr/v1/<repo>/_manifests`, one page (spec §4.A `ListManifests`).
    pub async fn list_manifests(&self, repo: &str, page_token: Option<&str>) -> Result<(Vec<Manifest>, Option<String>)> {
        let mut url = format!("{}/acr/v1/{repo}/_manifests?n={}", self.base_url, PAGE_SIZE);
        if let Some(token) = page_token {
            url.push_str(&format!("&last={token}"));
        }
        self.log(format!("GET {url}"));

        let request = self.authorize(self.http.get(&url), Some(repo)).await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        let next = extract_next_last_param(response.headers());
        let response = Self::check_status(response, Some(repo)).await?;
        let body: AcrManifestsResponse = response.json().await?;
        Ok((body.manifests.unwrap_or_default(), next))
    }

    /// GET `/v2/<repo>/manifests/<reference>`, `Accept` covering every
    /// known media type (spec §4.A `GetManifestBytes`).
    pub async fn get_manifest_bytes(&self, repo: &str, reference: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.base_url);
        self.log(format!("GET {url}"));

        let accept = ALL_MANIFEST_MEDIA_TYPES.join(", ");
        let request = self
            .authorize(
                self.http.get(&url).header(header::ACCEPT, accept),
                Some(repo),
            )
            .await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        let response = Self::check_status(response, Some(repo)).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `DELETE /acr/v1/<repo>/_tags/<tag>` — untags without touching
    /// manifest bytes (spec §3 invariant 1, §4.A `DeleteTag`).
    pub async fn delete_tag(&self, repo: &str, tag: &str) -> Result<DeleteOutcome> {
        let url = format!("{}/acr/v1/{repo}/_tags/{tag}", self.base_url);
        self.log(format!("DELETE {url}"));

        let request = self.authorize(self.http.delete(&url), Some(repo)).await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        Self::check_delete_status(response).await
    }

    /// `DELETE /v2/<repo>/manifests/<digest>` (spec §4.A `DeleteManifest`).
    pub async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<DeleteOutcome> {
        let url = format!("{}/v2/{repo}/manifests/{digest}", self.base_url);
        self.log(format!("DELETE {url}"));

        let request = self.authorize(self.http.delete(&url), Some(repo)).await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        Self::check_delete_status(response).await
    }

    /// `PATCH /acr/v1/<repo>/_tags/<tag>/changeableAttributes` (spec §4.A
    /// `UpdateTagAttributes`, used only when `includeLocked=true`).
    pub async fn update_tag_attributes(
        &self,
        repo: &str,
        tag: &str,
        attrs: ChangeableAttributes,
    ) -> Result<()> {
        let url = format!(
            "{}/acr/v1/{repo}/_tags/{tag}/changeableAttributes",
            self.base_url
        );
        self.log(format!("PATCH {url}"));

        let patch: ChangeableAttributesPatch = attrs.into();
        let request = self
            .authorize(self.http.patch(&url).json(&patch), Some(repo))
            .await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(PurgeError::Transport(format!(
                "unlock of tag {repo}:{tag} failed with HTTP {status}"
            ))),
        }
    }

    /// `PATCH /acr/v1/<repo>/_manifests/<digest>/changeableAttributes`
    /// (spec §4.A `UpdateManifestAttributes`).
    pub async fn update_manifest_attributes(
        &self,
        repo: &str,
        digest: &str,
        attrs: ChangeableAttributes,
    ) -> Result<()> {
        let url = format!(
            "{}/acr/v1/{repo}/_manifests/{digest}/changeableAttributes",
            self.base_url
        );
        self.log(format!("PATCH {url}"));

        let patch: ChangeableAttributesPatch = attrs.into();
        let request = self
            .authorize(self.http.patch(&url).json(&patch), Some(repo))
            .await?;
        let response = Self::send_with_retries(|| request.try_clone().expect("cloneable request")).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            status => Err(PurgeError::Transport(format!(
                "unlock of manifest {repo}@{digest} failed with HTTP {status}"
            ))),
        }
    }

    async fn check_status(response: reqwest::Response, repo: Option<&str>) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        if response.status() == StatusCode::NOT_FOUND {
            let what = repo.unwrap_or("catalog");
            return Err(PurgeError::NotFound(what.to_string()));
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(PurgeError::Transport(format!("HTTP {status}: {body}")))
    }

    async fn check_delete_status(response: reqwest::Response) -> Result<DeleteOutcome> {
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(DeleteOutcome::Deleted)
            }
            StatusCode::NOT_FOUND => Ok(DeleteOutcome::SkippedNotFound),
            StatusCode::METHOD_NOT_ALLOWED => Ok(DeleteOutcome::SkippedNotAllowed),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PurgeError::Transport(format!("HTTP {status}: {body}")))
            }
        }
    }
}

fn normalize_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let millis = 200u64.saturating_mul(1u64 << attempt.min(8));
    Duration::from_millis(millis)
}

/// Extracts the `last=` cursor from a `Link: </v2/_catalog?n=100&last=x>;
/// rel="next"` style header (spec §4.A pagination: "caller loops until
/// nextToken=\"\"").
fn extract_next_last_param(headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get(header::LINK)?.to_str().ok()?;
    if !link.contains("rel=\"next\"") {
        return None;
    }
    let start = link.find('<')? + 1;
    let end = link.find('>')?;
    let path = &link[start..end];
    let query = path.split('?').nth(1)?;
    query.split('&').find_map(|kv| {
        let mut parts = kv.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some("last"), Some(v)) => Some(v.to_string()),
            _ => None,
        }
    })
}
