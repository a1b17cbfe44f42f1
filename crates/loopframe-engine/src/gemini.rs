use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::error::truncate_text;
use crate::extract::{InlinePayload, ResponsePart, ResponsePartBody, ServiceResponse};
use crate::session::{Part, PartBody, Turn};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Thin blocking client for `models/{model}:generateContent`. Shared by
/// the image service and the scene planner.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(api_base: &str, api_key: Option<String>) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key,
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// One POST, no retries. Non-2xx statuses become errors carrying the
    /// truncated response body.
    pub fn generate_content(&self, model: &str, payload: &Value, timeout: Duration) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(timeout)
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

pub fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub fn turn_to_content(turn: &Turn) -> Value {
    let parts: Vec<Value> = turn.parts().iter().map(part_to_json).collect();
    json!({
        "role": turn.role().as_str(),
        "parts": parts,
    })
}

fn part_to_json(part: &Part) -> Value {
    let mut out = Map::new();
    match &part.body {
        PartBody::Text(text) => {
            out.insert("text".to_string(), Value::String(text.clone()));
        }
        PartBody::Image { mime_type, data } => {
            out.insert(
                "inlineData".to_string(),
                json!({
                    "mimeType": mime_type,
                    "data": BASE64.encode(data),
                }),
            );
        }
    }
    if let Some(signature) = part.thought_signature.as_deref() {
        out.insert(
            "thoughtSignature".to_string(),
            Value::String(signature.to_string()),
        );
    }
    Value::Object(out)
}

/// Normalizes the first candidate of a `generateContent` reply. Thought
/// parts are dropped; inline data stays base64 until extraction.
pub fn parse_response(payload: &Value) -> ServiceResponse {
    let candidate = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first());
    let Some(candidate) = candidate else {
        let blocked = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
            .map(|reason| format!("blocked: {reason}"));
        return ServiceResponse {
            parts: Vec::new(),
            finish_reason: blocked,
        };
    };

    let mut parts = Vec::new();
    let raw_parts = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for raw in raw_parts {
        if raw.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let signature = raw
            .get("thoughtSignature")
            .or_else(|| raw.get("thought_signature"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let inline = raw
            .get("inlineData")
            .or_else(|| raw.get("inline_data"))
            .and_then(Value::as_object);
        let mut part = if let Some(inline) = inline {
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str);
            ResponsePart::inline(mime_type, InlinePayload::Base64(data.to_string()))
        } else if let Some(text) = raw.get("text").and_then(Value::as_str) {
            ResponsePart::text(text)
        } else {
            continue;
        };
        part.thought_signature = signature;
        parts.push(part);
    }

    ServiceResponse {
        parts,
        finish_reason: candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Concatenated non-thought text of the first candidate.
pub fn response_text(payload: &Value) -> String {
    parse_response(payload)
        .parts
        .iter()
        .filter_map(|part| match &part.body {
            ResponsePartBody::Text(text) => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}
