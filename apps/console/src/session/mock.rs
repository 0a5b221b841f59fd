//! In-memory session backend for tests, mirroring the refusal and
//! share semantics of the real endpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use super::{
    CreateSessionRequest, CreateSessionResponse, CreateShareRequest, CreateShareResponse,
    SessionBackend, SessionError, SessionRefusal,
};

#[derive(Default)]
struct Inner {
    next_id: u64,
    created: Vec<CreateSessionRequest>,
    step_up_parameters: Option<Vec<String>>,
    deny: bool,
    missing: bool,
    last_security_token: Option<String>,
    disconnects: HashMap<String, usize>,
    cancelled_shares: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockSessionBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MockSessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse token-less creation attempts with a step-up directive.
    pub fn require_step_up(&self, parameters: Vec<String>) {
        self.inner.lock().step_up_parameters = Some(parameters);
    }

    pub fn deny_all(&self) {
        self.inner.lock().deny = true;
    }

    pub fn mark_missing(&self) {
        self.inner.lock().missing = true;
    }

    pub fn created_sessions(&self) -> Vec<CreateSessionRequest> {
        self.inner.lock().created.clone()
    }

    pub fn last_security_token(&self) -> Option<String> {
        self.inner.lock().last_security_token.clone()
    }

    pub fn disconnect_calls(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .disconnects
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn cancelled_shares(&self) -> Vec<String> {
        self.inner.lock().cancelled_shares.clone()
    }
}

#[async_trait]
impl SessionBackend for MockSessionBackend {
    async fn create_session(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SessionError> {
        let mut inner = self.inner.lock();
        inner.created.push(request.clone());
        inner.last_security_token = request.security_token.clone();

        let refusal = if inner.deny {
            Some(SessionRefusal::NotAuthorized)
        } else if inner.missing {
            Some(SessionRefusal::NotFound)
        } else if request.security_token.is_none() {
            inner
                .step_up_parameters
                .clone()
                .map(|parameters| SessionRefusal::StepUpRequired { parameters })
        } else {
            None
        };

        if let Some(refusal) = refusal {
            return Ok(CreateSessionResponse {
                success: false,
                message: Some("session refused".into()),
                session_id: None,
                width: None,
                height: None,
                refusal: Some(refusal),
            });
        }

        inner.next_id += 1;
        Ok(CreateSessionResponse {
            success: true,
            message: None,
            session_id: Some(format!("sess-{}", inner.next_id)),
            width: Some(1024),
            height: Some(768),
            refusal: None,
        })
    }

    async fn disconnect_session(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        *inner.disconnects.entry(session_id.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn create_share(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        session_id: &str,
        _request: &CreateShareRequest,
    ) -> Result<CreateShareResponse, SessionError> {
        Ok(CreateShareResponse {
            ok: true,
            url: Some(format!("https://bastion.example.com/share/{session_id}")),
            message: None,
        })
    }

    async fn cancel_share(
        &self,
        _base_url: &Url,
        _auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        self.inner
            .lock()
            .cancelled_shares
            .push(session_id.to_string());
        Ok(())
    }
}
