use crate::error::{GENERIC_ERROR_MESSAGE, LlmError, Result};
use crate::types::Content;
use serde::Serialize;
use serde_json::Value;

const STOP_SEQUENCES: &[&str] = &["Title"];
const TEMPERATURE: f64 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 800;
const TOP_P: f64 = 0.8;
const TOP_K: u32 = 10;

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    stop_sequences: Vec<String>,
    temperature: f64,
    max_output_tokens: u32,
    top_p: f64,
    top_k: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting<'a> {
    category: &'static str,
    threshold: &'a str,
}

impl<'a> GenerateContentRequest<'a> {
    pub(crate) fn new(contents: &'a [Content], safety_threshold: &'a str) -> Self {
        Self {
            contents,
            generation_config: GenerationConfig {
                stop_sequences: STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
                top_p: TOP_P,
                top_k: TOP_K,
            },
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: safety_threshold,
                })
                .collect(),
        }
    }
}

/// Map a `generateContent` HTTP response onto reply text or a typed error.
pub(crate) fn parse_generate_response(status: u16, is_success: bool, body: &str) -> Result<String> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if !is_success {
        let message = parsed
            .as_ref()
            .and_then(|v| v.pointer("/error/message"))
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(GENERIC_ERROR_MESSAGE);
        return Err(LlmError::Response {
            status,
            message: message.to_string(),
        });
    }

    let Some(parsed) = parsed else {
        return Err(LlmError::generic_response(status));
    };

    let candidates = match parsed.get("candidates") {
        None | Some(Value::Null) => return Err(LlmError::SafetyBlocked { status }),
        Some(Value::Array(items)) if items.is_empty() => {
            return Err(LlmError::SafetyBlocked { status });
        }
        Some(Value::Array(items)) => items,
        Some(_) => return Err(LlmError::generic_response(status)),
    };

    let parts = candidates[0]
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::generic_response(status))?;

    let mut text = String::new();
    for part in parts {
        let fragment = part
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::generic_response(status))?;
        text.push_str(fragment);
    }
    Ok(text)
}
