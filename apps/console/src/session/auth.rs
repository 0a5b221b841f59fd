//! Step-up verification: some assets demand an extra challenge (a
//! one-time code or a passkey round trip) before a session may be
//! created or re-created. Both flows yield an opaque [`SecurityToken`]
//! consumed by session creation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ConsoleConfig;

/// Short-lived credential minted by a completed step-up challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken(String);

impl SecurityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug)]
pub enum StepUpError {
    #[error("verification code rejected")]
    CodeRejected,
    #[error("passkey assertion rejected")]
    PasskeyRejected,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid step-up endpoint: {0}")]
    InvalidEndpoint(String),
}

/// WebAuthn-style challenge surfaced to the platform authenticator.
#[derive(Debug, Clone, Deserialize)]
pub struct PasskeyChallenge {
    pub challenge: String,
    pub rp_id: String,
    #[serde(default)]
    pub allow_credentials: Vec<String>,
}

/// Authenticator output handed back to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct PasskeyAssertion {
    pub credential_id: String,
    pub authenticator_data: String,
    pub client_data: String,
    pub signature: String,
}

#[derive(Clone)]
pub struct StepUpClient {
    config: Arc<ConsoleConfig>,
    backend: Arc<dyn StepUpBackend>,
}

impl StepUpClient {
    pub fn new(config: ConsoleConfig) -> Result<Self, StepUpError> {
        let backend = Arc::new(ReqwestStepUpBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn with_backend(config: ConsoleConfig, backend: Arc<dyn StepUpBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    /// Exchange a numeric one-time code for a security token.
    pub async fn exchange_code(
        &self,
        asset_id: &str,
        code: &str,
    ) -> Result<SecurityToken, StepUpError> {
        let response = self
            .backend
            .exchange_code(
                self.config.api_base(),
                self.config.bearer_token(),
                &CodeExchangeRequest {
                    asset_id: asset_id.to_string(),
                    code: code.trim().to_string(),
                },
            )
            .await?;
        let token = token_from(response)?;
        debug!(target = "console::auth", asset_id = %asset_id, "one-time code accepted");
        Ok(token)
    }

    pub async fn begin_passkey(&self, asset_id: &str) -> Result<PasskeyChallenge, StepUpError> {
        self.backend
            .begin_passkey(
                self.config.api_base(),
                self.config.bearer_token(),
                asset_id,
            )
            .await
    }

    pub async fn complete_passkey(
        &self,
        asset_id: &str,
        assertion: &PasskeyAssertion,
    ) -> Result<SecurityToken, StepUpError> {
        let response = self
            .backend
            .complete_passkey(
                self.config.api_base(),
                self.config.bearer_token(),
                asset_id,
                assertion,
            )
            .await?;
        let token = token_from(response)?;
        debug!(target = "console::auth", asset_id = %asset_id, "passkey assertion accepted");
        Ok(token)
    }
}

fn token_from(response: StepUpResponse) -> Result<SecurityToken, StepUpError> {
    if !response.ok {
        return Err(match response.reason.as_deref() {
            Some("passkey") => StepUpError::PasskeyRejected,
            _ => StepUpError::CodeRejected,
        });
    }
    response
        .security_token
        .map(SecurityToken::new)
        .ok_or_else(|| StepUpError::InvalidResponse("missing security token".into()))
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeExchangeRequest {
    pub asset_id: String,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepUpResponse {
    pub ok: bool,
    #[serde(default)]
    pub security_token: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait StepUpBackend: Send + Sync {
    async fn exchange_code(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &CodeExchangeRequest,
    ) -> Result<StepUpResponse, StepUpError>;

    async fn begin_passkey(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        asset_id: &str,
    ) -> Result<PasskeyChallenge, StepUpError>;

    async fn complete_passkey(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        asset_id: &str,
        assertion: &PasskeyAssertion,
    ) -> Result<StepUpResponse, StepUpError>;
}

struct ReqwestStepUpBackend {
    client: reqwest::Client,
}

impl ReqwestStepUpBackend {
    fn new() -> Result<Self, StepUpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, StepUpError> {
        base_url
            .join(path)
            .map_err(|err| StepUpError::InvalidEndpoint(format!("{path}: {err}")))
    }
}

#[async_trait]
impl StepUpBackend for ReqwestStepUpBackend {
    async fn exchange_code(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &CodeExchangeRequest,
    ) -> Result<StepUpResponse, StepUpError> {
        let endpoint = Self::endpoint(base_url, "step-up/code")?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(request).send().await?;
        if !response.status().is_success() {
            return Err(StepUpError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }

    async fn begin_passkey(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        asset_id: &str,
    ) -> Result<PasskeyChallenge, StepUpError> {
        let endpoint = Self::endpoint(base_url, &format!("step-up/passkey/{asset_id}"))?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(StepUpError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }

    async fn complete_passkey(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        asset_id: &str,
        assertion: &PasskeyAssertion,
    ) -> Result<StepUpResponse, StepUpError> {
        let endpoint = Self::endpoint(base_url, &format!("step-up/passkey/{asset_id}/assert"))?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(assertion).send().await?;
        if !response.status().is_success() {
            return Err(StepUpError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockStepUpBackend {
        accepted_code: Option<String>,
        exchanges: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StepUpBackend for MockStepUpBackend {
        async fn exchange_code(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            request: &CodeExchangeRequest,
        ) -> Result<StepUpResponse, StepUpError> {
            self.exchanges.lock().push(request.code.clone());
            if Some(&request.code) == self.accepted_code.as_ref() {
                Ok(StepUpResponse {
                    ok: true,
                    security_token: Some("tok-abc".into()),
                    reason: None,
                })
            } else {
                Ok(StepUpResponse {
                    ok: false,
                    security_token: None,
                    reason: Some("code".into()),
                })
            }
        }

        async fn begin_passkey(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            _asset_id: &str,
        ) -> Result<PasskeyChallenge, StepUpError> {
            Ok(PasskeyChallenge {
                challenge: "Y2hhbGxlbmdl".into(),
                rp_id: "bastion.example.com".into(),
                allow_credentials: vec![],
            })
        }

        async fn complete_passkey(
            &self,
            _base_url: &Url,
            _auth_token: Option<&str>,
            _asset_id: &str,
            _assertion: &PasskeyAssertion,
        ) -> Result<StepUpResponse, StepUpError> {
            Ok(StepUpResponse {
                ok: true,
                security_token: Some("tok-passkey".into()),
                reason: None,
            })
        }
    }

    fn client(backend: MockStepUpBackend) -> StepUpClient {
        let config = ConsoleConfig::new("bastion.example.com").expect("config");
        StepUpClient::with_backend(config, Arc::new(backend))
    }

    #[tokio::test]
    async fn code_exchange_trims_and_returns_token() {
        let client = client(MockStepUpBackend {
            accepted_code: Some("482913".into()),
            ..Default::default()
        });
        let token = client
            .exchange_code("asset-1", " 482913 ")
            .await
            .expect("token");
        assert_eq!(token.as_str(), "tok-abc");
    }

    #[tokio::test]
    async fn rejected_code_is_typed() {
        let client = client(MockStepUpBackend {
            accepted_code: Some("111111".into()),
            ..Default::default()
        });
        let err = client
            .exchange_code("asset-1", "000000")
            .await
            .expect_err("must reject");
        assert!(matches!(err, StepUpError::CodeRejected));
    }

    #[tokio::test]
    async fn passkey_round_trip_yields_token() {
        let client = client(MockStepUpBackend::default());
        let challenge = client.begin_passkey("asset-2").await.expect("challenge");
        assert_eq!(challenge.rp_id, "bastion.example.com");
        let token = client
            .complete_passkey(
                "asset-2",
                &PasskeyAssertion {
                    credential_id: "cred".into(),
                    authenticator_data: "data".into(),
                    client_data: "client".into(),
                    signature: "sig".into(),
                },
            )
            .await
            .expect("token");
        assert_eq!(token.as_str(), "tok-passkey");
    }
}
