//! Token acquisition against the relay. The engine itself only ever sees the
//! validated token string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tee_protocol::{TokenResponse, TokenValidateRequest, TokenValidateResponse};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid relay url: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A validated token plus the command the relay suggests for attaching
/// producers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub token: String,
    pub command_hint: Option<String>,
}

#[async_trait]
trait TokenBackend: Send + Sync {
    async fn validate(&self, base_url: &Url, token: &str) -> Result<bool, ScopeError>;

    async fn create(&self, base_url: &Url) -> Result<TokenResponse, ScopeError>;
}

pub struct ScopeClient {
    base_url: Url,
    backend: Arc<dyn TokenBackend>,
}

impl ScopeClient {
    pub fn new(base_url: Url) -> Result<Self, ScopeError> {
        let backend = Arc::new(ReqwestTokenBackend::new()?);
        Ok(Self::with_backend(base_url, backend))
    }

    fn with_backend(base_url: Url, backend: Arc<dyn TokenBackend>) -> Self {
        Self { base_url, backend }
    }

    /// Reuses `existing` when the relay still accepts it, otherwise creates a
    /// fresh token.
    pub async fn acquire(&self, existing: Option<&str>) -> Result<Scope, ScopeError> {
        if let Some(token) = existing.map(str::trim).filter(|token| !token.is_empty()) {
            match self.backend.validate(&self.base_url, token).await {
                Ok(true) => {
                    return Ok(Scope {
                        token: token.to_string(),
                        command_hint: None,
                    });
                }
                Ok(false) => {
                    tracing::info!(target: "mirror.scope", "stored token rejected; requesting a new one");
                }
                Err(err) => {
                    tracing::warn!(target: "mirror.scope", error = %err, "token validation failed; requesting a new one");
                }
            }
        }

        let created = self.backend.create(&self.base_url).await?;
        if created.token.trim().is_empty() {
            return Err(ScopeError::InvalidResponse("empty token".into()));
        }
        Ok(Scope {
            token: created.token,
            command_hint: Some(created.command_hint).filter(|hint| !hint.is_empty()),
        })
    }
}

struct ReqwestTokenBackend {
    client: reqwest::Client,
}

impl ReqwestTokenBackend {
    fn new() -> Result<Self, ScopeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url, ScopeError> {
    base_url
        .join(path)
        .map_err(|err| ScopeError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
}

#[async_trait]
impl TokenBackend for ReqwestTokenBackend {
    async fn validate(&self, base_url: &Url, token: &str) -> Result<bool, ScopeError> {
        let request = TokenValidateRequest {
            token: token.to_string(),
        };
        let response = self
            .client
            .post(endpoint(base_url, "api/token/validate")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ScopeError::HttpStatus(response.status()));
        }
        let payload = response.json::<TokenValidateResponse>().await?;
        Ok(payload.valid)
    }

    async fn create(&self, base_url: &Url) -> Result<TokenResponse, ScopeError> {
        let response = self
            .client
            .post(endpoint(base_url, "api/token")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ScopeError::HttpStatus(response.status()));
        }
        let payload = response.json::<TokenResponse>().await?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockTokenBackend {
        valid: Vec<String>,
        validate_fails: bool,
        created: Mutex<usize>,
    }

    #[async_trait]
    impl TokenBackend for MockTokenBackend {
        async fn validate(&self, _base_url: &Url, token: &str) -> Result<bool, ScopeError> {
            if self.validate_fails {
                return Err(ScopeError::HttpStatus(StatusCode::BAD_GATEWAY));
            }
            Ok(self.valid.iter().any(|valid| valid == token))
        }

        async fn create(&self, _base_url: &Url) -> Result<TokenResponse, ScopeError> {
            let count = {
                let mut created = self.created.lock();
                *created += 1;
                *created
            };
            Ok(TokenResponse {
                token: format!("fresh-{count}"),
                expires_at: Utc::now(),
                ws_url: None,
                command_hint: "tee-run --token fresh".into(),
            })
        }
    }

    fn client(backend: MockTokenBackend) -> (ScopeClient, Arc<MockTokenBackend>) {
        let backend = Arc::new(backend);
        let client = ScopeClient::with_backend(
            Url::parse("http://127.0.0.1:8080/").unwrap(),
            backend.clone(),
        );
        (client, backend)
    }

    #[tokio::test]
    async fn keeps_valid_token() {
        let (client, backend) = client(MockTokenBackend {
            valid: vec!["kept".into()],
            ..Default::default()
        });
        let scope = client.acquire(Some("kept")).await.unwrap();
        assert_eq!(scope.token, "kept");
        assert_eq!(*backend.created.lock(), 0);
    }

    #[tokio::test]
    async fn replaces_rejected_token() {
        let (client, backend) = client(MockTokenBackend::default());
        let scope = client.acquire(Some("stale")).await.unwrap();
        assert_eq!(scope.token, "fresh-1");
        assert_eq!(scope.command_hint.as_deref(), Some("tee-run --token fresh"));
        assert_eq!(*backend.created.lock(), 1);
    }

    #[tokio::test]
    async fn validation_error_falls_back_to_create() {
        let (client, _) = client(MockTokenBackend {
            valid: vec!["kept".into()],
            validate_fails: true,
            ..Default::default()
        });
        assert_eq!(client.acquire(Some("kept")).await.unwrap().token, "fresh-1");
    }

    #[tokio::test]
    async fn missing_token_creates_one() {
        let (client, _) = client(MockTokenBackend::default());
        assert_eq!(client.acquire(None).await.unwrap().token, "fresh-1");
        assert_eq!(client.acquire(Some("  ")).await.unwrap().token, "fresh-2");
    }
}
