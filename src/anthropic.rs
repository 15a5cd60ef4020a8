//! Anthropic Messages API client.
//!
//! One JSON POST per call, no retry. Callers own any retry policy.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::{Error, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const KEY_PREFIX: &str = "sk-ant-";
const MIN_KEY_LEN: usize = 20;

const PLACEHOLDER_KEYS: &[&str] = &[
    "your-api-key-here",
    "your_api_key_here",
    "your-anthropic-api-key",
    "your_anthropic_api_key",
    "sk-ant-your-key-here",
    "sk-ant-api03-your-key-here",
];

/// A validated API key.
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    /// Read and validate the key from environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(value) => Self::parse(&value).map_err(|e| match e {
                Error::MissingCredential { .. } => Error::MissingCredential { var: var.into() },
                other => other,
            }),
            Err(_) => Err(Error::MissingCredential { var: var.into() }),
        }
    }

    /// Validate a raw key: non-empty, longer than 20 chars, not a placeholder,
    /// `sk-ant-` prefixed.
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(Error::MissingCredential { var: String::new() });
        }
        if PLACEHOLDER_KEYS.iter().any(|p| key.eq_ignore_ascii_case(p)) {
            return Err(Error::InvalidCredential("placeholder value".into()));
        }
        if key.chars().count() <= MIN_KEY_LEN {
            return Err(Error::InvalidCredential("key is too short".into()));
        }
        if !key.starts_with(KEY_PREFIX) {
            return Err(Error::InvalidCredential(format!(
                "key must start with '{KEY_PREFIX}'"
            )));
        }
        Ok(Self(key.to_string()))
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Thin wrapper around `POST /v1/messages`.
pub struct MessagesClient {
    client: Client,
    base_url: String,
    model: String,
    api_key_env: String,
    credential: Option<Credential>,
}

impl MessagesClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            credential: None,
        })
    }

    /// Use `credential` instead of reading the environment on each call.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn credential(&self) -> Result<Credential> {
        match &self.credential {
            Some(c) => Ok(c.clone()),
            None => Credential::from_env(&self.api_key_env),
        }
    }

    fn headers(&self, credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(credential.expose())
            .map_err(|_| Error::InvalidCredential("key is not a valid header value".into()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(
            "anthropic-dangerous-direct-browser-access",
            HeaderValue::from_static("true"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Send `messages` and return the first text segment of the reply.
    ///
    /// `Ok(None)` means the call succeeded but carried no text. A non-success
    /// status becomes [`Error::Api`] with the service's message, or
    /// `fallback_error` when the body has none. The credential is checked
    /// before any network I/O.
    pub async fn send(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        max_tokens: u32,
        fallback_error: &str,
    ) -> Result<Option<String>> {
        let credential = self.credential()?;
        let headers = self.headers(&credential)?;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages,
            system,
        };

        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            "POST {url} (model={}, messages={}, max_tokens={max_tokens})",
            self.model,
            messages.len()
        );

        let t_start = Instant::now();
        let resp = self.client.post(&url).headers(headers).json(&body).send().await?;
        let status = resp.status();
        let latency_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&raw)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| fallback_error.to_string());
            warn!("Messages API returned status {status} ({latency_ms:.0}ms): {message}");
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let data: MessagesResponse = resp.json().await?;
        let text = data.content.into_iter().find_map(|block| block.text);
        info!(
            "Messages API reply: {} chars ({latency_ms:.0}ms)",
            text.as_deref().map_or(0, str::len)
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_key() {
        assert!(Credential::parse("sk-ant-REDACTED").is_ok());
    }

    #[test]
    fn rejects_empty_key_as_missing() {
        assert!(matches!(
            Credential::parse("   "),
            Err(Error::MissingCredential { .. })
        ));
    }

    #[test]
    fn rejects_placeholder_short_and_unprefixed_keys() {
        for raw in [
            "your_api_key_here",
            "sk-ant-api03-your-key-here",
            "sk-ant-short",
            "sk-proj-abcdefghijklmnopqrstuvwxyz",
        ] {
            assert!(
                matches!(Credential::parse(raw), Err(Error::InvalidCredential(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn missing_env_var_names_the_variable() {
        let err = Credential::from_env("STILLWATER_TEST_UNSET_KEY_VAR").unwrap_err();
        match err {
            Error::MissingCredential { var } => assert_eq!(var, "STILLWATER_TEST_UNSET_KEY_VAR"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn debug_does_not_leak_key() {
        let c = Credential::parse("sk-ant-REDACTED").unwrap();
        assert_eq!(format!("{c:?}"), "Credential(***)");
    }

    #[test]
    fn request_omits_absent_system_prompt() {
        let messages = [ChatMessage::user("hello")];
        let body = MessagesRequest {
            model: "m",
            max_tokens: 10,
            messages: &messages,
            system: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "max_tokens": 10,
                "messages": [{"role": "user", "content": "hello"}],
            })
        );
    }
}
