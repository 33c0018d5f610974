//! OpenAI-compatible chat completions backend.
//!
//! Requests a single output token with `top_logprobs` so the log-probabilities
//! of the `0` and `1` label tokens can be read directly. Works with any
//! endpoint that speaks the chat completions protocol (`base_url`).
//!
//! Rationales are a second, free-text request made after the label is known,
//! so the classification request stays a single token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use labelwise_core::{parse_label_token, JudgeResponse, Label, PromptView, TokenUsage};

use super::{
    factory::BackendFactory,
    secrets::{ApiCredential, CredentialSource},
    BackendError, ChatMessage, JudgeBackend,
};
use crate::prompts::{render_messages, render_rationale_messages};

/// Environment variable for the API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TOP_LOGPROBS: u32 = 5;
const DEFAULT_SAMPLING_TEMPERATURE: f64 = 1.0;
const DEFAULT_RATIONALE_MAX_TOKENS: u32 = 128;
const RATIONALE_TEMPERATURE: f64 = 0.7;

/// Token ids of "0" and "1" in the cl100k/o200k vocabularies.
const DEFAULT_LABEL_TOKEN_IDS: [u32; 2] = [15, 16];

/// Request shaping shared by every call of one backend.
#[derive(Debug, Clone, PartialEq)]
struct RequestOptions {
    top_logprobs: u32,
    sampling_temperature: f64,
    /// Bias per label token id, applied to classification requests only
    logit_bias: Option<BTreeMap<String, f64>>,
    rationale_max_tokens: u32,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            top_logprobs: DEFAULT_TOP_LOGPROBS,
            sampling_temperature: DEFAULT_SAMPLING_TEMPERATURE,
            logit_bias: None,
            rationale_max_tokens: DEFAULT_RATIONALE_MAX_TOKENS,
        }
    }
}

impl RequestOptions {
    fn from_settings(settings: &JsonValue) -> Self {
        let defaults = Self::default();
        let token_ids = label_token_ids(settings).unwrap_or(DEFAULT_LABEL_TOKEN_IDS);

        Self {
            top_logprobs: settings["top_logprobs"]
                .as_u64()
                .map(|n| n.clamp(2, 20) as u32)
                .unwrap_or(defaults.top_logprobs),
            sampling_temperature: settings["sampling_temperature"]
                .as_f64()
                .unwrap_or(defaults.sampling_temperature),
            logit_bias: settings["logit_bias"].as_f64().map(|bias| {
                token_ids
                    .iter()
                    .map(|id| (id.to_string(), bias))
                    .collect()
            }),
            rationale_max_tokens: settings["rationale_max_tokens"]
                .as_u64()
                .map(|n| n.max(1) as u32)
                .unwrap_or(defaults.rationale_max_tokens),
        }
    }
}

/// `label_token_ids: [id_of_0, id_of_1]`, when exactly two ids are given.
fn label_token_ids(settings: &JsonValue) -> Option<[u32; 2]> {
    match settings["label_token_ids"].as_array()?.as_slice() {
        [zero, one] => Some([u32::try_from(zero.as_u64()?).ok()?, u32::try_from(one.as_u64()?).ok()?]),
        _ => None,
    }
}

/// OpenAI-compatible judge backend.
pub struct OpenAiBackend {
    credential: ApiCredential,
    base_url: String,
    model: String,
    options: RequestOptions,
    name: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("options", &self.options)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        let credential =
            ApiCredential::new(api_key, CredentialSource::Programmatic, "OpenAI API key");
        Self::build(
            credential,
            DEFAULT_BASE_URL.to_string(),
            model.into(),
            RequestOptions::default(),
        )
    }

    /// Create from backend settings.
    ///
    /// Recognized keys: `api_key`, `api_key_env`, `base_url`, `model`,
    /// `top_logprobs`, `sampling_temperature`, `logit_bias`,
    /// `label_token_ids`, `rationale_max_tokens`.
    pub fn from_settings(settings: &JsonValue) -> Result<Self, BackendError> {
        let credential =
            ApiCredential::from_settings(settings, OPENAI_API_KEY_ENV, "OpenAI API key")?;
        let base_url = settings["base_url"]
            .as_str()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let model = settings["model"].as_str().unwrap_or(DEFAULT_MODEL).to_string();

        Self::build(credential, base_url, model, RequestOptions::from_settings(settings))
    }

    fn build(
        credential: ApiCredential,
        base_url: String,
        model: String,
        options: RequestOptions,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::NotConfigured(format!("HTTP client: {}", e)))?;
        let name = format!("openai/{}", model);

        Ok(Self {
            credential,
            base_url,
            model,
            options,
            name,
            client,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Sampling temperature of classification requests.
    pub fn with_sampling_temperature(mut self, temperature: f64) -> Self {
        self.options.sampling_temperature = temperature;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn classification_request<'a>(&'a self, messages: &'a [ChatMessage]) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: 1,
            temperature: self.options.sampling_temperature,
            logprobs: Some(true),
            top_logprobs: Some(self.options.top_logprobs),
            logit_bias: self.options.logit_bias.as_ref(),
        }
    }

    fn rationale_request<'a>(&'a self, messages: &'a [ChatMessage]) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.options.rationale_max_tokens,
            temperature: RATIONALE_TEMPERATURE,
            logprobs: None,
            top_logprobs: None,
            logit_bias: None,
        }
    }

    /// Send one request and return its first choice.
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<(Choice, TokenUsage), BackendError> {
        // Only expose the credential here, at the point of use
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.credential.expose())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(Duration::ZERO)
                } else {
                    BackendError::server(None, e.to_string())
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            return Err(classify_status(status.as_u16(), retry_after, message));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::server(Some(status.as_u16()), format!("Invalid JSON: {}", e)))?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::server(Some(status.as_u16()), "No choices in response"))?;

        Ok((choice, usage))
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logit_bias: Option<&'a BTreeMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Vec<TokenLogprob>,
}

#[derive(Debug, Deserialize)]
struct TokenLogprob {
    token: String,
    logprob: f64,
    #[serde(default)]
    top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Deserialize)]
struct TopLogprob {
    token: String,
    logprob: f64,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Label-token log-probabilities at the first output position. Variants of
/// the same label (`"1"`, `" 1"`) keep the most likely spelling.
fn label_logprobs(position: &TokenLogprob) -> BTreeMap<String, f64> {
    let mut found: BTreeMap<String, f64> = BTreeMap::new();
    let candidates = std::iter::once((&position.token, position.logprob)).chain(
        position
            .top_logprobs
            .iter()
            .map(|alt| (&alt.token, alt.logprob)),
    );

    for (token, logprob) in candidates {
        if let Some(label) = parse_label_token(token) {
            let entry = found
                .entry(label.token().to_string())
                .or_insert(f64::NEG_INFINITY);
            if logprob > *entry {
                *entry = logprob;
            }
        }
    }
    found
}

fn classify_status(status: u16, retry_after: Option<Duration>, message: String) -> BackendError {
    match status {
        401 | 403 => BackendError::AuthError(message),
        408 => BackendError::Timeout(Duration::ZERO),
        429 => BackendError::RateLimited { retry_after },
        400 | 404 | 413 | 422 => BackendError::MalformedRequest(message),
        _ => BackendError::server(Some(status), message),
    }
}

#[async_trait]
impl JudgeBackend for OpenAiBackend {
    async fn invoke(&self, view: &PromptView) -> Result<JudgeResponse, BackendError> {
        let messages = render_messages(view);
        let (choice, usage) = self.complete(&self.classification_request(&messages)).await?;

        let label_token = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let logprobs = choice
            .logprobs
            .and_then(|lp| lp.content.into_iter().next())
            .map(|position| label_logprobs(&position))
            .filter(|map| !map.is_empty());

        Ok(JudgeResponse {
            label_token,
            logprobs,
            self_reported_confidence: None,
            usage,
        })
    }

    async fn explain(&self, view: &PromptView, label: Label) -> Result<Option<String>, BackendError> {
        let messages = render_rationale_messages(view, label);
        let (choice, _) = self.complete(&self.rationale_request(&messages)).await?;

        Ok(choice
            .message
            .and_then(|m| m.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for OpenAI-compatible backends.
///
/// ## Settings
/// ```json
/// {
///   "api_key": "sk-...",            // Optional, falls back to api_key_env / OPENAI_API_KEY
///   "api_key_env": "MY_KEY_VAR",    // Optional
///   "base_url": "https://...",      // Optional, any chat completions endpoint
///   "model": "gpt-4o-mini",         // Optional
///   "top_logprobs": 5,              // Optional, 2..=20
///   "sampling_temperature": 1.0,    // Optional, 0..=2
///   "logit_bias": 5.0,              // Optional, added to both label tokens
///   "label_token_ids": [15, 16],    // Optional, token ids of "0" and "1"
///   "rationale_max_tokens": 128     // Optional
/// }
/// ```
pub struct OpenAiBackendFactory;

impl BackendFactory for OpenAiBackendFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, settings: &JsonValue) -> Result<Arc<dyn JudgeBackend>, BackendError> {
        self.validate_config(settings)?;
        Ok(Arc::new(OpenAiBackend::from_settings(settings)?))
    }

    fn validate_config(&self, settings: &JsonValue) -> Result<(), BackendError> {
        if !ApiCredential::is_available(settings, OPENAI_API_KEY_ENV) {
            return Err(BackendError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in backend settings or {} env",
                OPENAI_API_KEY_ENV
            )));
        }

        if let Some(url) = settings["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(BackendError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        if let Some(temperature) = settings.get("sampling_temperature") {
            match temperature.as_f64() {
                Some(t) if (0.0..=2.0).contains(&t) => {}
                _ => {
                    return Err(BackendError::NotConfigured(format!(
                        "sampling_temperature must be a number in [0, 2], got {}",
                        temperature
                    )))
                }
            }
        }

        if let Some(bias) = settings.get("logit_bias") {
            match bias.as_f64() {
                Some(b) if (-100.0..=100.0).contains(&b) => {}
                _ => {
                    return Err(BackendError::NotConfigured(format!(
                        "logit_bias must be a number in [-100, 100], got {}",
                        bias
                    )))
                }
            }
        }

        if settings.get("label_token_ids").is_some() && label_token_ids(settings).is_none() {
            return Err(BackendError::NotConfigured(
                "label_token_ids must list the token ids of \"0\" and \"1\"".to_string(),
            ));
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({
            "model": DEFAULT_MODEL,
            "top_logprobs": DEFAULT_TOP_LOGPROBS,
            "sampling_temperature": DEFAULT_SAMPLING_TEMPERATURE,
            "rationale_max_tokens": DEFAULT_RATIONALE_MAX_TOKENS
        })
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions with label-token logprobs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_name_includes_model() {
        let backend = OpenAiBackend::new("test-key", "gpt-4o").unwrap();
        assert_eq!(backend.name(), "openai/gpt-4o");
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret = "sk-super-secret-key-12345";
        let backend = OpenAiBackend::new(secret, "gpt-4o-mini").unwrap();
        let debug = format!("{:?}", backend);
        assert!(!debug.contains(secret), "API key was exposed in Debug output!");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_settings() {
        let settings = serde_json::json!({
            "api_key": "config-key",
            "base_url": "http://localhost:8000/v1/",
            "model": "local-judge",
            "top_logprobs": 50
        });
        let backend = OpenAiBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.completions_url(), "http://localhost:8000/v1/chat/completions");
        assert_eq!(backend.options.top_logprobs, 20);
        assert_eq!(backend.options.sampling_temperature, 1.0);
        assert!(backend.options.logit_bias.is_none());
        assert_eq!(backend.credential.source(), CredentialSource::Config);
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let settings = serde_json::json!({ "api_key": "k", "base_url": "localhost" });
        assert!(OpenAiBackendFactory.validate_config(&settings).is_err());
    }

    #[test]
    fn test_label_logprobs_from_top_alternatives() {
        let position: TokenLogprob = serde_json::from_value(serde_json::json!({
            "token": "1",
            "logprob": -0.2,
            "top_logprobs": [
                { "token": "1", "logprob": -0.2 },
                { "token": " 1", "logprob": -3.0 },
                { "token": "0", "logprob": -2.1 },
                { "token": "The", "logprob": -6.0 }
            ]
        }))
        .unwrap();

        let map = label_logprobs(&position);
        assert_eq!(map.len(), 2);
        assert_eq!(map["1"], -0.2);
        assert_eq!(map["0"], -2.1);
    }

    #[test]
    fn test_label_logprobs_ignores_other_tokens() {
        let position: TokenLogprob = serde_json::from_value(serde_json::json!({
            "token": "Yes",
            "logprob": -0.1,
            "top_logprobs": [{ "token": "No", "logprob": -2.0 }]
        }))
        .unwrap();
        assert!(label_logprobs(&position).is_empty());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(401, None, "bad key".into()),
            BackendError::AuthError(_)
        ));
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(3)), String::new()),
            BackendError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            classify_status(400, None, "bad".into()),
            BackendError::MalformedRequest(_)
        ));
        assert!(matches!(
            classify_status(503, None, "down".into()),
            BackendError::ServerError { status: Some(503), .. }
        ));
    }

    fn request_json(request: &CompletionRequest<'_>) -> JsonValue {
        serde_json::to_value(request).unwrap()
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("s"), ChatMessage::user("u")]
    }

    #[test]
    fn test_sampling_temperature_reaches_request() {
        let settings = serde_json::json!({ "api_key": "k", "sampling_temperature": 0.7 });
        let backend = OpenAiBackend::from_settings(&settings).unwrap();
        let messages = messages();
        let body = request_json(&backend.classification_request(&messages));

        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 1);
        assert_eq!(body["logprobs"], true);
        assert_eq!(body["top_logprobs"], 5);
        assert!(body.get("logit_bias").is_none());

        let default = OpenAiBackend::new("k", "gpt-4o").unwrap();
        assert_eq!(request_json(&default.classification_request(&messages))["temperature"], 1.0);
        let greedy = OpenAiBackend::new("k", "gpt-4o").unwrap().with_sampling_temperature(0.0);
        assert_eq!(request_json(&greedy.classification_request(&messages))["temperature"], 0.0);
    }

    #[test]
    fn test_logit_bias_targets_label_tokens() {
        let settings = serde_json::json!({ "api_key": "k", "logit_bias": 5.0 });
        let backend = OpenAiBackend::from_settings(&settings).unwrap();
        let messages = messages();
        let body = request_json(&backend.classification_request(&messages));
        assert_eq!(body["logit_bias"], serde_json::json!({ "15": 5.0, "16": 5.0 }));

        let settings = serde_json::json!({
            "api_key": "k",
            "logit_bias": 3.0,
            "label_token_ids": [488, 489]
        });
        let backend = OpenAiBackend::from_settings(&settings).unwrap();
        let body = request_json(&backend.classification_request(&messages));
        assert_eq!(body["logit_bias"], serde_json::json!({ "488": 3.0, "489": 3.0 }));
    }

    #[test]
    fn test_rationale_request_is_free_text() {
        let settings = serde_json::json!({ "api_key": "k", "logit_bias": 5.0, "rationale_max_tokens": 200 });
        let backend = OpenAiBackend::from_settings(&settings).unwrap();
        let messages = messages();
        let body = request_json(&backend.rationale_request(&messages));

        assert_eq!(body["max_tokens"], 200);
        assert_eq!(body["temperature"], RATIONALE_TEMPERATURE);
        assert!(body.get("logprobs").is_none());
        assert!(body.get("top_logprobs").is_none());
        assert!(body.get("logit_bias").is_none());
    }

    #[test]
    fn test_factory_validates_sampling_settings() {
        let factory = OpenAiBackendFactory;
        let ok = serde_json::json!({ "api_key": "k", "sampling_temperature": 0.0, "logit_bias": 5 });
        assert!(factory.validate_config(&ok).is_ok());

        for bad in [
            serde_json::json!({ "api_key": "k", "sampling_temperature": 3.5 }),
            serde_json::json!({ "api_key": "k", "sampling_temperature": "hot" }),
            serde_json::json!({ "api_key": "k", "logit_bias": 250 }),
            serde_json::json!({ "api_key": "k", "label_token_ids": [15] }),
        ] {
            assert!(factory.validate_config(&bad).is_err(), "{}", bad);
        }
    }
}
