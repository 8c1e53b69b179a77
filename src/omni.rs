use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::engine::{ElementParser, ParsedElement, ParsedScreen};

#[derive(Clone)]
pub struct OmniConfig {
    pub url: String, // env OMNIPARSER_URL
    pub box_threshold: f64,
    pub iou_threshold: f64,
    pub timeout: Duration,
}

impl Default for OmniConfig {
    fn default() -> Self {
        Self {
            url: env::var("OMNIPARSER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000/process".into()),
            box_threshold: 0.05,
            iou_threshold: 0.1,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct OmniResponse {
    parsed_content: Vec<ParsedElement>,
    image_base64: String,
}

/// Client for the vision-parsing service: a screenshot in, the ordered
/// element list plus the annotated (numbered) rendering of the same scene
/// back.
#[derive(Clone)]
pub struct OmniClient {
    http: Client,
    cfg: OmniConfig,
}

impl OmniClient {
    pub fn new(cfg: OmniConfig) -> Result<Self> {
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub async fn process(&self, screen_png: &[u8]) -> Result<ParsedScreen> {
        let form = Form::new()
            .part(
                "image",
                Part::bytes(screen_png.to_vec())
                    .file_name("screen.png")
                    .mime_str("image/png")?,
            )
            .text("box_threshold", self.cfg.box_threshold.to_string())
            .text("iou_threshold", self.cfg.iou_threshold.to_string());

        let resp = self.http.post(&self.cfg.url).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("element parser error {}: {}", status, text);
        }
        let decoded: OmniResponse =
            serde_json::from_str(&text).context("failed to parse element parser response JSON")?;
        let annotated_png = B64
            .decode(decoded.image_base64.as_bytes())
            .context("annotated image was not valid base64")?;
        debug!(elements = decoded.parsed_content.len(), "element parser replied");
        Ok(ParsedScreen { elements: decoded.parsed_content, annotated_png })
    }
}

#[async_trait]
impl ElementParser for OmniClient {
    async fn parse(&self, screen_png: &[u8]) -> Result<ParsedScreen> {
        self.process(screen_png).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_decodes_both_element_shapes() {
        let body = r#"{
            "parsed_content": [
                { "bbox": [0.1, 0.2, 0.3, 0.4], "content": "Open button" },
                "legacy item <box>10,20,30,40</box>"
            ],
            "image_base64": "aGVsbG8="
        }"#;
        let decoded: OmniResponse = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.parsed_content.len(), 2);
        assert!(matches!(
            decoded.parsed_content[0],
            ParsedElement::Detected { ref content, .. } if content == "Open button"
        ));
        assert!(matches!(decoded.parsed_content[1], ParsedElement::Legacy(_)));
        assert_eq!(B64.decode(decoded.image_base64.as_bytes()).unwrap(), b"hello");
    }

    #[test]
    fn extra_fields_on_detected_elements_are_tolerated() {
        let body = r#"{
            "parsed_content": [
                { "type": "icon", "bbox": [0.0, 0.0, 0.5, 0.5], "interactivity": true, "content": "Chrome" }
            ],
            "image_base64": ""
        }"#;
        let decoded: OmniResponse = serde_json::from_str(body).unwrap();
        assert!(matches!(decoded.parsed_content[0], ParsedElement::Detected { .. }));
    }
}
