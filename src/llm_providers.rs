use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Common message structure for chat-style generation requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Enum-based generation provider: Groq (OpenAI-compatible, preferred) or
/// Gemini (fallback). Resolved once at startup and never switched at runtime.
#[derive(Debug, Clone)]
pub enum GenerationProvider {
    Groq(GroqProvider),
    Gemini(GeminiProvider),
}

impl GenerationProvider {
    /// Run one generation call and return the raw response text.
    pub async fn generate_text(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String> {
        match self {
            GenerationProvider::Groq(provider) => {
                provider
                    .generate_text(system, prompt, temperature, max_output_tokens)
                    .await
            }
            GenerationProvider::Gemini(provider) => {
                provider
                    .generate_text(system, prompt, temperature, max_output_tokens)
                    .await
            }
        }
    }

    /// Provider name for logging
    pub fn provider_name(&self) -> &'static str {
        match self {
            GenerationProvider::Groq(provider) => provider.provider_name(),
            GenerationProvider::Gemini(provider) => provider.provider_name(),
        }
    }

    /// Model name being used
    pub fn model_name(&self) -> &str {
        match self {
            GenerationProvider::Groq(provider) => provider.model_name(),
            GenerationProvider::Gemini(provider) => provider.model_name(),
        }
    }
}

/// Groq provider: OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct GroqProvider {
    client: Client,
    api_key: String,
    url: String,
    model: String,
}

#[derive(Debug, Clone, Serialize)]
struct GroqRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    // Tolerated by endpoints that ignore it
    response_format: GroqResponseFormat,
}

#[derive(Debug, Clone, Serialize)]
struct GroqResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GroqResponse {
    choices: Vec<GroqChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroqChoice {
    message: ChatMessage,
}

impl GroqProvider {
    pub fn new(api_key: String, url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            url: url.unwrap_or_else(|| {
                "https://api.groq.com/openai/v1/chat/completions".to_string()
            }),
            model: model.unwrap_or_else(|| "gemma2-9b-it".to_string()),
        }
    }

    pub async fn generate_text(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request_body = GroqRequest {
            model: self.model.clone(),
            messages,
            temperature,
            max_tokens: max_output_tokens,
            response_format: GroqResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        info!(
            provider = self.provider_name(),
            model = %self.model,
            prompt_length = prompt.len(),
            "Making generation request"
        );

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                provider = self.provider_name(),
                status = %status,
                error = %error_text,
                "Generation API request failed"
            );
            return Err(anyhow::anyhow!("Groq API request failed: {}", error_text));
        }

        let groq_response: GroqResponse = response.json().await?;
        let content = groq_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No choices in Groq response"))?;

        info!(
            provider = self.provider_name(),
            response_length = content.len(),
            "Successfully received generation response"
        );

        Ok(content)
    }

    pub fn provider_name(&self) -> &'static str {
        "Groq"
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}

/// Gemini provider: generateContent endpoint, used when no Groq key is set.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            base_url: base_url.unwrap_or_else(|| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            model: model.unwrap_or_else(|| "gemini-1.5-flash-latest".to_string()),
        }
    }

    pub async fn generate_text(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String> {
        let full_prompt = if system.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", system, prompt)
        };

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: full_prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature,
                max_output_tokens,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        info!(
            provider = self.provider_name(),
            model = %self.model,
            prompt_length = prompt.len(),
            "Making generation request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                provider = self.provider_name(),
                status = %status,
                error = %error_text,
                "Generation API request failed"
            );
            return Err(anyhow::anyhow!("Gemini API request failed: {}", error_text));
        }

        let gemini_response: GeminiResponse = response.json().await?;
        let content = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| anyhow::anyhow!("No candidates in Gemini response"))?;

        info!(
            provider = self.provider_name(),
            response_length = content.len(),
            "Successfully received generation response"
        );

        Ok(content)
    }

    pub fn provider_name(&self) -> &'static str {
        "Gemini"
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}

static JSON_BLOCK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("valid JSON block regex")
});

/// Extract a JSON object from free-text model output.
///
/// Precedence: a fenced code block (optionally tagged `json`) containing a
/// single `{...}` object, else the whole trimmed text if it is itself an
/// object. Anything else, including parse failures, yields `None` so the
/// caller can treat it as a recoverable failure.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let candidate = match JSON_BLOCK_REGEX.captures(text) {
        Some(captures) => captures.get(1).map(|m| m.as_str().to_string()),
        None => {
            let stripped = text.trim();
            if stripped.starts_with('{') && stripped.ends_with('}') {
                Some(stripped.to_string())
            } else {
                None
            }
        }
    }?;

    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_fenced_block() {
        let text = "Here you go:\n```json\n{\"mainError\": \"fractions\"}\n```\nDone.";
        let data = extract_json_object(text).unwrap();
        assert_eq!(data["mainError"], "fractions");
    }

    #[test]
    fn extracts_untagged_fenced_block() {
        let text = "```\n{\"a\": 1}\n```";
        let data = extract_json_object(text).unwrap();
        assert_eq!(data["a"], 1);
    }

    #[test]
    fn extracts_bare_object() {
        let data = extract_json_object("  {\"groups\": []}  ").unwrap();
        assert!(data["groups"].as_array().unwrap().is_empty());
    }

    #[test]
    fn rejects_prose_and_invalid_json() {
        assert!(extract_json_object("no JSON here at all").is_none());
        assert!(extract_json_object("```json\n{broken\n```").is_none());
        // Top-level arrays are not accepted payloads
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn fenced_block_takes_precedence_over_surrounding_text() {
        let text = "prefix {\"wrong\": true}\n```json\n{\"right\": true}\n```";
        let data = extract_json_object(text).unwrap();
        assert!(data.contains_key("right"));
    }
}
