//! Typed prompts.
//!
//! Each prompt the pipeline sends is a [`Tool`]: a name, a JSON shape, the
//! Rust type the answer must deserialize into and a structural check. The
//! [`ToolRunner`] owns the request/repair loop so individual stages only deal
//! in typed outputs.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use super::retry::{RetryConfig, call_with_retry};
use super::{ChatMessage, Exchange, LlmCallError, LlmClient, LlmRequest, Transcript};
use crate::config::{LlmConfig, PricingConfig};
use crate::types::Stage;

pub trait Tool: Sync {
    type Output: DeserializeOwned;

    const NAME: &'static str;

    /// Role and rules for the model. The JSON shape is appended by the runner.
    fn instructions(&self) -> String;

    /// Example-valued JSON object describing the expected fields.
    fn schema(&self) -> serde_json::Value;

    fn prompt(&self) -> String;

    /// Structural problems with a parsed answer. Anything returned here
    /// triggers a repair reprompt listing the problems.
    fn check(&self, _output: &Self::Output) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    Call(LlmCallError),
    Malformed { attempts: u32, problems: Vec<String> },
}

pub struct ToolRunner<'a, C> {
    client: &'a C,
    llm: &'a LlmConfig,
    retry: &'a RetryConfig,
}

impl<'a, C: LlmClient> ToolRunner<'a, C> {
    pub fn new(client: &'a C, config: &'a PricingConfig) -> Self {
        ToolRunner { client, llm: &config.llm, retry: &config.retry }
    }

    /// Asks `tool` once, then up to `repairs` more times while the answer is
    /// malformed. Every exchange lands in `transcript`, including failed ones.
    pub async fn run<T: Tool>(
        &self,
        stage: Stage,
        tool: &T,
        repairs: u32,
        transcript: &mut Transcript,
    ) -> Result<T::Output, ToolError> {
        let mut messages =
            vec![ChatMessage::system(system_prompt(tool)), ChatMessage::user(tool.prompt())];
        let timeout = Duration::from_secs(self.llm.timeout_secs.max(1));
        let attempts = repairs + 1;
        let mut problems = Vec::new();

        for attempt in 1..=attempts {
            let request = LlmRequest {
                tool: T::NAME,
                messages: messages.clone(),
                temperature: self.llm.temperature,
                max_tokens: self.llm.max_tokens,
            };
            let started = Instant::now();
            let outcome = call_with_retry(self.client, &request, timeout, self.retry).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let mut exchange = Exchange {
                stage,
                tool: T::NAME.to_string(),
                attempt,
                prompt: request.messages,
                response: None,
                error: None,
                latency_ms,
            };
            let text = match outcome {
                Ok(text) => {
                    exchange.response = Some(text.clone());
                    transcript.record(exchange);
                    text
                }
                Err(err) => {
                    exchange.error = Some(err.to_string());
                    transcript.record(exchange);
                    tracing::warn!(tool = T::NAME, attempt, error = %err, "tool call failed");
                    return Err(ToolError::Call(err));
                }
            };
            tracing::debug!(tool = T::NAME, attempt, latency_ms, response = %text, "tool response");

            match parse_output(tool, &text) {
                Ok(output) => return Ok(output),
                Err(found) => {
                    tracing::info!(
                        tool = T::NAME,
                        attempt,
                        problems = found.len(),
                        "tool response rejected"
                    );
                    messages.push(ChatMessage::assistant(text));
                    messages.push(ChatMessage::user(repair_prompt(&found)));
                    problems = found;
                }
            }
        }

        Err(ToolError::Malformed { attempts, problems })
    }
}

fn system_prompt<T: Tool>(tool: &T) -> String {
    let schema = serde_json::to_string_pretty(&tool.schema()).unwrap_or_default();
    format!(
        "{}\n\nRespond with a single JSON object and nothing else. It must have this shape \
         (values are illustrative):\n{schema}",
        tool.instructions()
    )
}

fn repair_prompt(problems: &[String]) -> String {
    let list: Vec<String> = problems.iter().map(|p| format!("- {p}")).collect();
    format!(
        "Your previous response could not be accepted:\n{}\nRespond again with only the \
         corrected JSON object.",
        list.join("\n")
    )
}

/// The outermost `{ ... }` span, tolerating code fences and surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_output<T: Tool>(tool: &T, text: &str) -> Result<T::Output, Vec<String>> {
    let json = extract_json(text)
        .ok_or_else(|| vec!["response contains no JSON object".to_string()])?;
    let output: T::Output =
        serde_json::from_str(json).map_err(|e| vec![format!("schema mismatch: {e}")])?;
    let problems = tool.check(&output);
    if problems.is_empty() { Ok(output) } else { Err(problems) }
}
