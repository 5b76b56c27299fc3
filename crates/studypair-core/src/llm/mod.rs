mod openai;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

pub use openai::OpenAiClient;

/// Client abstraction for turning a free-text radiology report into a
/// structured JSON object under a fixed extraction prompt.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one extraction call and return the parsed JSON object.
    async fn extract(&self, prompt: &str, report_text: &str) -> Result<Value>;
}

/// Parse model output that is expected to be a single JSON object.
///
/// Strict parse first; if that fails, retry on the substring between the
/// first `{` and the last `}` to shed stray prose or code fences. Anything
/// that still fails, or parses to a non-object, is an error for the retry
/// layer to handle.
pub fn parse_json_object(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(strict_err) => {
            let start = trimmed.find('{');
            let end = trimmed.rfind('}');
            match (start, end) {
                (Some(start), Some(end)) if end > start => {
                    serde_json::from_str(&trimmed[start..=end]).with_context(|| {
                        format!("model output is not valid JSON: {strict_err}")
                    })?
                }
                _ => {
                    return Err(anyhow::Error::new(strict_err)
                        .context("model output is not valid JSON"))
                }
            }
        }
    };
    if !value.is_object() {
        bail!("model output is valid JSON but not an object");
    }
    Ok(value)
}

/// Call the client up to `retries` times, sleeping `2^attempt` seconds
/// between attempts. The final attempt's error propagates to the caller.
pub async fn extract_with_retry(
    client: &dyn LlmClient,
    prompt: &str,
    report_text: &str,
    retries: u32,
) -> Result<Value> {
    let retries = retries.max(1);
    for attempt in 1..=retries {
        match client.extract(prompt, report_text).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries => {
                let backoff = Duration::from_secs(1u64 << attempt.min(16));
                warn!(
                    attempt,
                    retries,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "extraction attempt failed, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on the final attempt")
}
