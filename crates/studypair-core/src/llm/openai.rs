use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_json_object, LlmClient};
use crate::config::LlmConfig;

/// LLM client over the OpenAI Responses API, pinned to JSON-object output.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let api_key = cfg.api_key.as_deref().unwrap_or("").trim().to_string();
        if api_key.is_empty() {
            bail!("llm.api_key must be set (or OPENAI_API_KEY exported)");
        }
        let base = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let url = format!("{}/v1/responses", base.trim_end_matches('/'));
        let http = Client::builder()
            .user_agent("studypair/0.3")
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            http,
            url,
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn extract(&self, prompt: &str, report_text: &str) -> Result<Value> {
        let payload = ResponsesRequest {
            model: self.model.clone(),
            input: vec![
                InputMessage {
                    role: "system",
                    content: vec![ContentPart {
                        kind: "input_text",
                        text: prompt.to_string(),
                    }],
                },
                InputMessage {
                    role: "user",
                    content: vec![ContentPart {
                        kind: "input_text",
                        text: report_text.to_string(),
                    }],
                },
            ],
            text: TextOptions {
                format: TextFormat {
                    kind: "json_object",
                },
            },
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("failed to call OpenAI responses API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("OpenAI API error ({status}): {body}");
        }

        let reply: ResponsesReply = response
            .json()
            .await
            .context("failed to parse OpenAI response")?;
        let text = reply
            .output
            .into_iter()
            .flat_map(|item| item.content)
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("OpenAI response missing output text"))?;

        parse_json_object(&text)
    }
}

#[derive(Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputMessage>,
    text: TextOptions,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct InputMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Serialize)]
struct TextOptions {
    format: TextFormat,
}

#[derive(Serialize)]
struct TextFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Deserialize)]
struct OutputContent {
    #[serde(default)]
    text: Option<String>,
}
