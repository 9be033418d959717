use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ModelConfig;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
// Multimodal-capable model on the public Generative Language API.
const TRANSCRIPTION_MODEL: &str = "gemini-2.5-flash";

/// Sentinel the model is instructed to return for images with no text.
pub const NO_TEXT_SENTINEL: &str = "No text detected";

const OCR_PROMPT: &str = "Your only task is to act as a high-precision OCR (Optical Character \
    Recognition) system.\n\n\
    Transcribe all text, including numbers and symbols, present in the provided image.\n\n\
    Return only the transcribed text, without any commentary, additional formatting or \
    explanation.\n\n\
    If there is no text in the image, answer only: \"No text detected\".";

/// Image-to-text transcription over the Gemini multimodal endpoint. Reuses
/// the Gemini credential from the text-generation configuration.
pub struct TranscriptionEngine {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl TranscriptionEngine {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.gemini_api_key.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Transcribe an uploaded image into plain text. Returns an empty string
    /// when the model reports that the image contains no text.
    pub async fn transcribe_image(&self, image_bytes: &[u8], mime_type: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY not configured for transcription"))?;

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_BASE, TRANSCRIPTION_MODEL, api_key
        );

        let body = json!({
            "contents": [{
                "parts": [
                    {"text": OCR_PROMPT},
                    {"inline_data": {
                        "mime_type": mime_type,
                        "data": STANDARD.encode(image_bytes)
                    }}
                ]
            }]
        });

        debug!(
            image_size = image_bytes.len(),
            mime_type, "Sending image for transcription"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .context("Transcription request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("Transcription API error {}: {}", status, detail));
        }

        let payload: Value = response
            .json()
            .await
            .context("Failed to decode transcription response")?;
        let text = extract_text(&payload)
            .ok_or_else(|| anyhow!("Transcription response contained no text"))?;

        let text = text.trim();
        if text == NO_TEXT_SENTINEL {
            info!("No text detected in image");
            return Ok(String::new());
        }

        info!(chars = text.chars().count(), "Image transcribed");
        Ok(text.to_string())
    }
}

fn extract_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
