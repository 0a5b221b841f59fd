use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("console api base url cannot be empty")]
    EmptyBase,
    #[error("invalid console api base url: {0}")]
    InvalidBase(String),
}

/// Console-wide configuration. The API base covers both the HTTP
/// session endpoints and the WebSocket tunnel endpoint.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    api_base: Url,
    bearer_token: Option<String>,
}

impl ConsoleConfig {
    pub fn new(api_base: impl AsRef<str>) -> Result<Self, ConfigError> {
        // Centralized override so callers and env stay consistent.
        let mut base = std::env::var("GATEHOUSE_API_BASE")
            .ok()
            .and_then(|s| {
                let trimmed = s.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
            .unwrap_or_else(|| api_base.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(ConfigError::EmptyBase);
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let parsed = Url::parse(&base).map_err(|err| ConfigError::InvalidBase(err.to_string()))?;
        Ok(Self {
            api_base: parsed,
            bearer_token: None,
        })
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}
