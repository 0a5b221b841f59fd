pub mod auth;
pub mod connection;
pub mod mock;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ConsoleConfig;
use crate::session::auth::SecurityToken;
use crate::tunnel::{Protocol, TunnelParams};

/// Session negotiated with the backend. Width/height are only present
/// when the remote side fixes the initial display size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub id: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareDescriptor {
    pub url: String,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not authorized to access this asset")]
    NotAuthorized,
    #[error("additional verification required")]
    RequiresStepUp { parameters: Vec<String> },
    #[error("asset or session not found")]
    NotFound,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid session endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Brokers session lifecycle calls against the console backend. The
/// backend is a trait so tests run against an in-memory double.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<ConsoleConfig>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionManager {
    pub fn new(config: ConsoleConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn with_backend(config: ConsoleConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Negotiate a new session for an asset. A `RequiresStepUp` error
    /// means the caller must run the step-up flow and retry with the
    /// resulting token; it is never retried automatically.
    pub async fn create_session(
        &self,
        asset_id: &str,
        protocol: Protocol,
        security_token: Option<&SecurityToken>,
        params: &TunnelParams,
    ) -> Result<SessionDescriptor, SessionError> {
        let request = CreateSessionRequest {
            asset_id: asset_id.to_string(),
            protocol,
            security_token: security_token.map(|token| token.as_str().to_string()),
            cols: params.cols,
            rows: params.rows,
            width: params.width,
            height: params.height,
            dpi: params.dpi,
        };
        let response = self
            .backend
            .create_session(
                self.config.api_base(),
                self.config.bearer_token(),
                &request,
            )
            .await?;

        if let Some(refusal) = response.refusal {
            return Err(match refusal {
                SessionRefusal::NotAuthorized => SessionError::NotAuthorized,
                SessionRefusal::StepUpRequired { parameters } => {
                    SessionError::RequiresStepUp { parameters }
                }
                SessionRefusal::NotFound => SessionError::NotFound,
            });
        }
        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "session creation failed".to_string());
            return Err(SessionError::Server(message));
        }
        let id = response
            .session_id
            .ok_or_else(|| SessionError::InvalidResponse("missing session id".into()))?;
        debug!(
            target = "console::session",
            session_id = %id,
            asset_id = %asset_id,
            protocol = %protocol,
            "session negotiated"
        );
        Ok(SessionDescriptor {
            id,
            width: response.width,
            height: response.height,
        })
    }

    /// Best-effort backend notification that a session ended. Teardown
    /// never blocks on its outcome; callers may ignore the result.
    pub async fn disconnect_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.backend
            .disconnect_session(
                self.config.api_base(),
                self.config.bearer_token(),
                session_id,
            )
            .await
    }

    pub async fn create_share(
        &self,
        session_id: &str,
        share_token: Option<&str>,
    ) -> Result<ShareDescriptor, SessionError> {
        let request = CreateShareRequest {
            share_token: share_token.map(str::to_string),
        };
        let response = self
            .backend
            .create_share(
                self.config.api_base(),
                self.config.bearer_token(),
                session_id,
                &request,
            )
            .await?;
        if !response.ok {
            return Err(SessionError::Server(
                response
                    .message
                    .unwrap_or_else(|| "share creation failed".to_string()),
            ));
        }
        let url = response
            .url
            .ok_or_else(|| SessionError::InvalidResponse("missing share url".into()))?;
        Ok(ShareDescriptor { url })
    }

    pub async fn cancel_share(&self, session_id: &str) -> Result<(), SessionError> {
        self.backend
            .cancel_share(
                self.config.api_base(),
                self.config.bearer_token(),
                session_id,
            )
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub asset_id: String,
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRefusal {
    NotAuthorized,
    StepUpRequired { parameters: Vec<String> },
    NotFound,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub refusal: Option<SessionRefusal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateShareRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateShareResponse {
    pub ok: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SessionError>;

    async fn disconnect_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError>;

    async fn create_share(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
        request: &CreateShareRequest,
    ) -> Result<CreateShareResponse, SessionError>;

    async fn cancel_share(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError>;
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, SessionError> {
        base_url
            .join(path)
            .map_err(|err| SessionError::InvalidEndpoint(format!("{path}: {err}")))
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn create_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SessionError> {
        let endpoint = Self::endpoint(base_url, "sessions")?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(request).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            // Refusals ride on 4xx with the same body shape.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Ok(response.json().await?)
            }
            status => Err(SessionError::HttpStatus(status)),
        }
    }

    async fn disconnect_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}/disconnect"))?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn create_share(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
        request: &CreateShareRequest,
    ) -> Result<CreateShareResponse, SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}/share"))?;
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(request).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }

    async fn cancel_share(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}/share"))?;
        let mut builder = self.client.delete(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSessionBackend;
    use super::*;

    fn manager(backend: MockSessionBackend) -> SessionManager {
        let config = ConsoleConfig::new("bastion.example.com").expect("config");
        SessionManager::with_backend(config, Arc::new(backend))
    }

    #[tokio::test]
    async fn create_session_returns_descriptor() {
        let backend = MockSessionBackend::new();
        let manager = manager(backend.clone());
        let descriptor = manager
            .create_session("asset-1", Protocol::Ssh, None, &TunnelParams::terminal(80, 24))
            .await
            .expect("session");
        assert!(!descriptor.id.is_empty());
        assert_eq!(backend.created_sessions().len(), 1);
    }

    #[tokio::test]
    async fn step_up_refusal_is_typed() {
        let backend = MockSessionBackend::new();
        backend.require_step_up(vec!["one-time-code".into()]);
        let manager = manager(backend);
        let err = manager
            .create_session("asset-1", Protocol::Rdp, None, &TunnelParams::default())
            .await
            .expect_err("must refuse");
        match err {
            SessionError::RequiresStepUp { parameters } => {
                assert_eq!(parameters, vec!["one-time-code".to_string()]);
            }
            other => panic!("expected step-up refusal, got {other}"),
        }
    }

    #[tokio::test]
    async fn step_up_token_satisfies_retry() {
        let backend = MockSessionBackend::new();
        backend.require_step_up(vec!["one-time-code".into()]);
        let manager = manager(backend.clone());
        let token = SecurityToken::new("tok-99");
        let descriptor = manager
            .create_session(
                "asset-1",
                Protocol::Rdp,
                Some(&token),
                &TunnelParams::default(),
            )
            .await
            .expect("token satisfies step-up");
        assert!(!descriptor.id.is_empty());
        assert_eq!(backend.last_security_token().as_deref(), Some("tok-99"));
    }

    #[tokio::test]
    async fn denial_maps_to_not_authorized() {
        let backend = MockSessionBackend::new();
        backend.deny_all();
        let manager = manager(backend);
        let err = manager
            .create_session("asset-1", Protocol::Vnc, None, &TunnelParams::default())
            .await
            .expect_err("must deny");
        assert!(matches!(err, SessionError::NotAuthorized));
    }

    #[tokio::test]
    async fn share_round_trip() {
        let backend = MockSessionBackend::new();
        let manager = manager(backend.clone());
        let share = manager
            .create_share("sess-1", Some("123456"))
            .await
            .expect("share");
        assert!(share.url.contains("sess-1"));
        manager.cancel_share("sess-1").await.expect("cancel");
        assert!(backend.cancelled_shares().contains(&"sess-1".to_string()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let backend = MockSessionBackend::new();
        let manager = manager(backend.clone());
        manager.disconnect_session("sess-7").await.expect("first");
        manager.disconnect_session("sess-7").await.expect("second");
        assert_eq!(backend.disconnect_calls("sess-7"), 2);
    }
}
