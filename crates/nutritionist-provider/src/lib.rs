use std::fmt::{Debug, Formatter};
use std::time::Duration;

use nutritionist_core::{GenerationClient, GenerationError};
use serde_json::{json, Value};
use tracing::debug;

pub const API_KEY_ENV: &str = "DEEPSEEK_TENCENT_API_KEY";
pub const MODEL_ENV: &str = "DEEPSEEK_TENCENT_MODEL";
pub const BASE_URL_ENV: &str = "DEEPSEEK_TENCENT_BASE_URL";
pub const TIMEOUT_ENV: &str = "LLM_REQUEST_TIMEOUT_SECS";

pub const DEFAULT_MODEL: &str = "deepseek-v3";
pub const DEFAULT_BASE_URL: &str = "https://api.lkeap.tencentcloud.com/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Debug for ProviderConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`GenerationError::NotConfigured`] when the API key is missing
    /// or the timeout override is not a positive number of seconds.
    pub fn from_env() -> Result<Self, GenerationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source. Blank values
    /// count as unset.
    ///
    /// # Errors
    /// Same as [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GenerationError> {
        let read = |name: &str| {
            lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
        };

        let api_key = read(API_KEY_ENV)
            .ok_or_else(|| GenerationError::NotConfigured(format!("{API_KEY_ENV} is not set")))?;
        let timeout = match read(TIMEOUT_ENV) {
            None => DEFAULT_TIMEOUT,
            Some(raw) => match raw.parse::<u64>() {
                Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
                _ => {
                    return Err(GenerationError::NotConfigured(format!(
                        "{TIMEOUT_ENV} must be a positive number of seconds, got {raw:?}"
                    )))
                }
            },
        };

        Ok(Self {
            api_key,
            model: read(MODEL_ENV).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: read(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout,
        })
    }

    #[must_use]
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Blocking chat-completions client.
pub struct ChatCompletionsClient {
    config: ProviderConfig,
    agent: ureq::Agent,
}

impl ChatCompletionsClient {
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }

    /// # Errors
    /// See [`ProviderConfig::from_env`].
    pub fn from_env() -> Result<Self, GenerationError> {
        ProviderConfig::from_env().map(Self::new)
    }

    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

impl GenerationClient for ChatCompletionsClient {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: &str,
    ) -> Result<String, GenerationError> {
        let body = request_body(
            &self.config.model,
            system_prompt,
            user_prompt,
            parse_temperature(temperature),
        );
        debug!(model = %self.config.model, "sending chat completion request");

        let response = self
            .agent
            .post(&self.config.completions_url())
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .set("Content-Type", "application/json")
            .send_json(body)
            .map_err(|err| match err {
                ureq::Error::Status(status, response) => GenerationError::Status {
                    status,
                    body: response.into_string().unwrap_or_default(),
                },
                ureq::Error::Transport(transport) => GenerationError::Transport(transport.to_string()),
            })?;

        let value: Value =
            response.into_json().map_err(|err| GenerationError::Decode(err.to_string()))?;
        let content = extract_content(&value)?;
        debug!(bytes = content.len(), "chat completion received");
        Ok(content)
    }
}

/// Sampling temperature from its textual form. Blank or unparseable input
/// falls back to [`DEFAULT_TEMPERATURE`].
#[must_use]
pub fn parse_temperature(raw: &str) -> f64 {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite()).unwrap_or(DEFAULT_TEMPERATURE)
}

#[must_use]
pub fn request_body(model: &str, system_prompt: &str, user_prompt: &str, temperature: f64) -> Value {
    json!({
        "model": model,
        "temperature": temperature,
        "messages": [
            { "role": "system", "content": system_prompt },
            { "role": "user", "content": user_prompt },
        ],
    })
}

/// Text of the first choice. A response with no choices yields empty text.
///
/// # Errors
/// Returns [`GenerationError::Decode`] when the body is not a chat-completions
/// response.
pub fn extract_content(body: &Value) -> Result<String, GenerationError> {
    let choices = body
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| GenerationError::Decode("response has no choices array".to_string()))?;
    let Some(first) = choices.first() else {
        return Ok(String::new());
    };
    first
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GenerationError::Decode("first choice has no message content".to_string()))
}
