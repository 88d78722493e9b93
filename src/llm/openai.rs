//! OpenAI-compatible chat-completions client.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::retry::{is_retryable_status, parse_retry_after};
use super::{LlmCallError, LlmClient, LlmRequest};
use crate::config::{ApiKey, LlmConfig, PricingConfig};
use crate::error::ConfigError;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const ERROR_BODY_LIMIT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: ApiKey,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(llm: &LlmConfig, api_key: ApiKey) -> Result<Self, ConfigError> {
        let timeout = Duration::from_secs(llm.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        Ok(OpenAiClient {
            http,
            endpoint: llm.endpoint.clone(),
            model: llm.model.clone(),
            api_key,
            timeout,
        })
    }

    /// Reads the key from the environment variable named in the config.
    pub fn from_config(config: &PricingConfig) -> Result<Self, ConfigError> {
        Self::new(&config.llm, config.api_key()?)
    }

    fn body(&self, request: &LlmRequest) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "response_format": { "type": "json_object" },
        })
    }

    async fn send(&self, request: &LlmRequest) -> Result<String, LlmCallError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout))?;

        let status = response.status();
        if status.is_success() {
            let parsed: CompletionResponse =
                response.json().await.map_err(|e| classify_transport(e, self.timeout))?;
            return parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .filter(|text| !text.trim().is_empty())
                .ok_or(LlmCallError::EmptyResponse);
        }

        let code = status.as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = truncate(response.text().await.unwrap_or_default());
        Err(match code {
            429 => LlmCallError::RateLimited { status: code, retry_after },
            _ if is_retryable_status(code) => LlmCallError::Server { status: code, body },
            _ => LlmCallError::Rejected { status: code, body },
        })
    }
}

impl LlmClient for OpenAiClient {
    fn complete(
        &self,
        request: &LlmRequest,
    ) -> impl Future<Output = Result<String, LlmCallError>> + Send {
        self.send(request)
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> LlmCallError {
    if err.is_timeout() {
        LlmCallError::Timeout(timeout)
    } else if err.is_decode() {
        LlmCallError::EmptyResponse
    } else {
        LlmCallError::Transport(err.to_string())
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
