//! HTTP client for the username publish/lookup directory service.
//!
//! The service itself is an external collaborator; this module only speaks
//! its JSON interface. A lookup miss is a remote-service condition
//! ([`DirectoryError::NotFound`]), never a transport error.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid directory config: {0}")]
    InvalidConfig(String),
    #[error("no token published for '{username}'")]
    NotFound { username: String },
    #[error("directory rejected request: {0}")]
    Server(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid directory response: {0}")]
    InvalidResponse(String),
}

#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    base_url: Url,
}

impl DirectoryConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, DirectoryError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(DirectoryError::InvalidConfig(
                "directory base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            base = format!("https://{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base)
            .map_err(|err| DirectoryError::InvalidConfig(format!("invalid directory url: {err}")))?;
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub username: String,
    /// Armored token, opaque to the directory.
    pub token: String,
    /// Seconds the directory keeps the entry alive.
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub token: String,
    pub username: String,
    #[serde(rename = "publishedAt")]
    pub published_at: u64,
}

/// Transport seam so tests can run against an in-memory directory.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    async fn publish(&self, base: &Url, request: &PublishRequest) -> Result<(), DirectoryError>;
    async fn lookup(&self, base: &Url, username: &str) -> Result<LookupResponse, DirectoryError>;
    async fn delete(&self, base: &Url, username: &str) -> Result<(), DirectoryError>;
    async fn health(&self, base: &Url) -> Result<(), DirectoryError>;
}

struct ReqwestDirectoryBackend {
    client: reqwest::Client,
}

impl ReqwestDirectoryBackend {
    fn new() -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

fn join(base: &Url, path: &str) -> Result<Url, DirectoryError> {
    base.join(path)
        .map_err(|err| DirectoryError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

async fn reject(response: reqwest::Response) -> DirectoryError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    DirectoryError::Server(format!("{status}: {body}"))
}

#[async_trait]
impl DirectoryBackend for ReqwestDirectoryBackend {
    async fn publish(&self, base: &Url, request: &PublishRequest) -> Result<(), DirectoryError> {
        let response = self
            .client
            .post(join(base, "publish")?)
            .json(request)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(reject(response).await)
        }
    }

    async fn lookup(&self, base: &Url, username: &str) -> Result<LookupResponse, DirectoryError> {
        let response = self
            .client
            .get(join(base, &format!("lookup/{username}"))?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound {
                username: username.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        response
            .json::<LookupResponse>()
            .await
            .map_err(|err| DirectoryError::InvalidResponse(err.to_string()))
    }

    async fn delete(&self, base: &Url, username: &str) -> Result<(), DirectoryError> {
        let response = self
            .client
            .delete(join(base, &format!("publish/{username}"))?)
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(reject(response).await)
        }
    }

    async fn health(&self, base: &Url) -> Result<(), DirectoryError> {
        let response = self.client.get(join(base, "health")?).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(reject(response).await)
        }
    }
}

#[derive(Clone)]
pub struct DirectoryClient {
    config: Arc<DirectoryConfig>,
    backend: Arc<dyn DirectoryBackend>,
}

impl DirectoryClient {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        let backend = Arc::new(ReqwestDirectoryBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn with_backend(config: DirectoryConfig, backend: Arc<dyn DirectoryBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub async fn publish(
        &self,
        username: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<(), DirectoryError> {
        let username = clean_username(username)?;
        let request = PublishRequest {
            username: username.clone(),
            token: token.to_string(),
            ttl: ttl.as_secs(),
        };
        debug!(target: "paircast::directory", %username, ttl = request.ttl, "publishing token");
        self.backend
            .publish(self.config.base_url(), &request)
            .await
    }

    pub async fn lookup(&self, username: &str) -> Result<LookupResponse, DirectoryError> {
        let username = clean_username(username)?;
        self.backend.lookup(self.config.base_url(), &username).await
    }

    pub async fn delete(&self, username: &str) -> Result<(), DirectoryError> {
        let username = clean_username(username)?;
        self.backend.delete(self.config.base_url(), &username).await
    }

    pub async fn health(&self) -> Result<(), DirectoryError> {
        self.backend.health(self.config.base_url()).await
    }
}

fn clean_username(username: &str) -> Result<String, DirectoryError> {
    let cleaned = username.trim();
    if cleaned.is_empty() {
        return Err(DirectoryError::InvalidConfig(
            "username cannot be empty".into(),
        ));
    }
    Ok(cleaned.to_string())
}
