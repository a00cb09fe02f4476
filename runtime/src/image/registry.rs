//! Registry client for the distribution v2 protocol.
//!
//! Speaks the protocol directly over `reqwest`: pull-scoped bearer tokens,
//! manifest negotiation across Docker and OCI media types, and streaming
//! blob downloads verified against their digest.

use std::path::Path;
use std::time::Duration;

use a3s_ctr_core::config::{Platform, RegistryConfig};
use a3s_ctr_core::error::{CtrError, Result};
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::manifest::{manifest_accept_header, ConfigBlob, ImageManifest, Manifest};
use super::reference::ImageReference;

/// Credentials presented to the token endpoint.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`; anonymous if
    /// either is missing.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Per-repository connection state: where to go and which token to send.
#[derive(Debug, Clone)]
pub struct RegistrySession {
    pub base_url: String,
    pub registry: String,
    pub repository: String,
    token: Option<String>,
}

impl RegistrySession {
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, kind: &str, reference: &str) -> String {
        format!("{}/v2/{}/{}/{}", self.base_url, self.repository, kind, reference)
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// HTTP client for one registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    config: RegistryConfig,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("a3s-ctr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CtrError::NetworkError(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config: config.clone(),
            auth: RegistryAuth::from_env(),
        })
    }

    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.config.platform
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let insecure = self
            .config
            .insecure_registries
            .iter()
            .any(|host| host == &reference.registry);
        if !reference.is_docker_hub() && insecure {
            format!("http://{}", reference.registry)
        } else {
            reference.registry_url(&self.config.url)
        }
    }

    fn registry_error(&self, registry: &str, message: impl Into<String>) -> CtrError {
        CtrError::RegistryError {
            registry: registry.to_string(),
            message: message.into(),
        }
    }

    /// Open a session for `reference`, acquiring a pull token.
    ///
    /// Docker Hub always goes through the configured auth endpoint. Other
    /// registries are checked at `/v2/` and only asked for a token when they
    /// answer with a bearer challenge.
    pub async fn session(&self, reference: &ImageReference) -> Result<RegistrySession> {
        let mut session = RegistrySession {
            base_url: self.base_url(reference),
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            token: None,
        };

        if reference.is_docker_hub() {
            let token = self
                .fetch_token(
                    &reference.registry,
                    &self.config.auth_url,
                    Some(&self.config.service),
                    &reference.repository,
                )
                .await?;
            session.token = Some(token);
            return Ok(session);
        }

        let ping = self
            .http
            .get(format!("{}/v2/", session.base_url))
            .send()
            .await
            .map_err(|e| self.registry_error(&reference.registry, format!("unreachable: {}", e)))?;

        if ping.status() != StatusCode::UNAUTHORIZED {
            return Ok(session);
        }

        let challenge = ping
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some((realm, service)) = challenge else {
            return Err(self.registry_error(
                &reference.registry,
                "registry requires authentication without a bearer challenge",
            ));
        };

        match self
            .fetch_token(&reference.registry, &realm, service.as_deref(), &reference.repository)
            .await
        {
            Ok(token) => session.token = Some(token),
            Err(CtrError::NetworkError(reason)) => {
                tracing::warn!(
                    registry = %reference.registry,
                    realm = %realm,
                    reason = %reason,
                    "Auth endpoint unreachable, continuing without token"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(session)
    }

    /// Request a pull-only token: `<auth_url>?service=..&scope=repository:<repo>:pull`.
    async fn fetch_token(
        &self,
        registry: &str,
        auth_url: &str,
        service: Option<&str>,
        repository: &str,
    ) -> Result<String> {
        let scope = format!("repository:{}:pull", repository);
        let mut query: Vec<(&str, &str)> = vec![("scope", scope.as_str())];
        if let Some(service) = service {
            query.insert(0, ("service", service));
        }

        let mut request = self.http.get(auth_url).query(&query);
        if let Some((user, pass)) = self.auth.credentials() {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| {
            CtrError::NetworkError(format!("token request to {} failed: {}", auth_url, e))
        })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(self.registry_error(
                    registry,
                    format!("authentication failed for repository {}", repository),
                ))
            }
            status => {
                return Err(self.registry_error(
                    registry,
                    format!("auth request failed with status {}", status),
                ))
            }
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.registry_error(registry, format!("invalid token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.registry_error(registry, "token response carried no token"))
    }

    fn authorized(
        &self,
        session: &RegistrySession,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match &session.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Fetch and classify one manifest by tag or digest.
    pub async fn fetch_manifest(
        &self,
        session: &RegistrySession,
        reference: &str,
    ) -> Result<Manifest> {
        let url = session.url("manifests", reference);
        let response = self
            .authorized(session, self.http.get(&url))
            .header(ACCEPT, manifest_accept_header())
            .send()
            .await
            .map_err(|e| self.registry_error(&session.registry, format!("manifest request failed: {}", e)))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(CtrError::not_found(
                    "manifest",
                    &format!("{}:{}", session.repository, reference),
                ))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(self.registry_error(
                    &session.registry,
                    format!("access denied to {}", session.repository),
                ))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(self.registry_error(
                    &session.registry,
                    format!("manifest request failed with status {}: {}", status, body),
                ));
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| {
            self.registry_error(&session.registry, format!("failed to read manifest: {}", e))
        })?;
        Manifest::parse(content_type.as_deref(), &body)
    }

    /// Resolve a reference to a single-platform manifest, following one
    /// level of manifest list.
    pub async fn resolve_manifest(
        &self,
        session: &RegistrySession,
        reference: &str,
    ) -> Result<ImageManifest> {
        match self.fetch_manifest(session, reference).await? {
            Manifest::Image(manifest) => Ok(manifest),
            Manifest::List(list) => {
                let entry = list.select_platform(&self.config.platform)?;
                tracing::debug!(
                    repository = %session.repository,
                    digest = %entry.digest,
                    platform = %self.config.platform,
                    "Resolved manifest list entry"
                );
                match self.fetch_manifest(session, &entry.digest).await? {
                    Manifest::Image(manifest) => Ok(manifest),
                    Manifest::List(_) => Err(CtrError::ImageError(format!(
                        "nested manifest list at {}",
                        entry.digest
                    ))),
                }
            }
        }
    }

    /// Fetch and decode the image config blob.
    pub async fn fetch_config(&self, session: &RegistrySession, digest: &str) -> Result<ConfigBlob> {
        let bytes = self.fetch_blob_bytes(session, digest).await?;
        verify_digest(digest, &hex::encode(Sha256::digest(&bytes)))
            .map_err(|m| self.registry_error(&session.registry, m))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CtrError::ImageError(format!("failed to decode config blob: {}", e)))
    }

    async fn blob_response(
        &self,
        session: &RegistrySession,
        digest: &str,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorized(session, self.http.get(session.url("blobs", digest)))
            .send()
            .await
            .map_err(|e| self.registry_error(&session.registry, format!("blob request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.registry_error(
                &session.registry,
                format!("blob {} request failed with status {}", digest, response.status()),
            ));
        }
        Ok(response)
    }

    async fn fetch_blob_bytes(&self, session: &RegistrySession, digest: &str) -> Result<Vec<u8>> {
        let response = self.blob_response(session, digest).await?;
        let bytes = response.bytes().await.map_err(|e| {
            self.registry_error(&session.registry, format!("failed to read blob {}: {}", digest, e))
        })?;
        Ok(bytes.to_vec())
    }

    /// Stream a blob to `dest`, verifying its sha256 digest. Returns the
    /// number of bytes written.
    pub async fn download_blob(
        &self,
        session: &RegistrySession,
        digest: &str,
        dest: &Path,
    ) -> Result<u64> {
        let response = self.blob_response(session, digest).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(CtrError::io(format!("failed to create {}", dest.display())))?;

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                self.registry_error(&session.registry, format!("download of {} failed: {}", digest, e))
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(CtrError::io(format!("failed to write {}", dest.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(CtrError::io(format!("failed to flush {}", dest.display())))?;

        verify_digest(digest, &hex::encode(hasher.finalize()))
            .map_err(|m| self.registry_error(&session.registry, m))?;
        Ok(written)
    }
}

/// Compare a `sha256:<hex>` digest with a computed hex hash. Other
/// algorithms are accepted unverified.
fn verify_digest(expected: &str, actual_hex: &str) -> std::result::Result<(), String> {
    match expected.split_once(':') {
        Some(("sha256", hex_part)) if hex_part != actual_hex => Err(format!(
            "digest mismatch: expected {}, got sha256:{}",
            expected, actual_hex
        )),
        _ => Ok(()),
    }
}

/// Parse `Bearer realm="...",service="..."` into (realm, service).
pub fn parse_bearer_challenge(header: &str) -> Option<(String, Option<String>)> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in rest.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }
    realm.map(|r| (r, service))
}
