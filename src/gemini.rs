use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::engine::StepPlanner;

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_base: String, // e.g. "https://generativelanguage.googleapis.com/v1beta"
    pub api_key: String,  // env GEMINI_API_KEY
    pub model: String,    // e.g. "gemini-2.5-flash"
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".into()),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Client for the language-model service: one prompt and one inline image
/// per call, free text back. A single attempt; failures surface to the caller.
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    cfg: GeminiConfig,
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("GEMINI_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub async fn generate(&self, prompt: &str, png: &[u8]) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.cfg.api_base, self.cfg.model);
        let req = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/png", "data": B64.encode(png) } }
                ]
            }]
        });

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Gemini error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse Gemini response JSON")?;
        debug!(model = %self.cfg.model, "model replied");
        Self::extract_text(&v)
    }

    fn extract_text(v: &Value) -> Result<String> {
        let parts = v
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .context("Gemini response carried no candidates")?;
        let mut out = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                out.push_str(text);
            }
        }
        if out.trim().is_empty() {
            bail!("Gemini response carried no text parts");
        }
        Ok(out.trim().to_string())
    }
}

#[async_trait]
impl StepPlanner for GeminiClient {
    async fn complete(&self, prompt: &str, annotated_png: &[u8]) -> Result<String> {
        self.generate(prompt, annotated_png).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_concatenates_parts() {
        let v = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "```json\n" },
                        { "text": "{\"steps\": []}\n```" }
                    ]
                }
            }]
        });
        assert_eq!(
            GeminiClient::extract_text(&v).unwrap(),
            "```json\n{\"steps\": []}\n```"
        );
    }

    #[test]
    fn extract_text_rejects_empty_candidates() {
        assert!(GeminiClient::extract_text(&json!({ "candidates": [] })).is_err());
        assert!(GeminiClient::extract_text(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "  " }] } }]
        }))
        .is_err());
    }
}
