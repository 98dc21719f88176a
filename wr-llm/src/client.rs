use crate::error::{LlmError, Result};
use crate::gemini::{GenerateContentRequest, parse_generate_response};
use crate::retry::RetryPolicy;
use crate::types::{Content, Part};
use std::time::Duration;

pub const DEFAULT_PRO_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent";
pub const DEFAULT_PRO_VISION_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro-vision:generateContent";
pub const DEFAULT_SAFETY_THRESHOLD: &str = "BLOCK_NONE";

/// Requests with more content blocks than this are sent text-only.
const MAX_VISION_CONTENTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Text,
    Vision,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub pro_url: String,
    pub pro_vision_url: String,
    pub safety_threshold: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            pro_url: DEFAULT_PRO_URL.to_string(),
            pro_vision_url: DEFAULT_PRO_VISION_URL.to_string(),
            safety_threshold: DEFAULT_SAFETY_THRESHOLD.to_string(),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: GeminiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http, config }
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Choose the backend variant for `contents`, stripping inline images when the
    /// conversation is too long to carry them.
    pub fn select_endpoint(contents: &mut [Content]) -> Endpoint {
        if contents.len() > MAX_VISION_CONTENTS {
            for content in contents.iter_mut() {
                content.parts.retain(|part| !part.is_inline_data());
            }
            return Endpoint::Text;
        }
        if contents.iter().any(Content::has_inline_data) {
            Endpoint::Vision
        } else {
            Endpoint::Text
        }
    }

    fn endpoint_url(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Text => &self.config.pro_url,
            Endpoint::Vision => &self.config.pro_vision_url,
        }
    }

    /// Generate reply text, retrying per the configured [`RetryPolicy`].
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn generate(&self, mut contents: Vec<Content>) -> Result<String> {
        if contents.is_empty() {
            return Err(LlmError::InvalidInput("contents must not be empty".to_string()));
        }
        let endpoint = Self::select_endpoint(&mut contents);
        let url = self.endpoint_url(endpoint);
        tracing::debug!(
            ?endpoint,
            content_count = contents.len(),
            image_count = count_inline_parts(&contents),
            "generating content"
        );

        self.config
            .retry
            .run(|attempt| self.generate_once(url, &contents, attempt))
            .await
    }

    async fn generate_once(&self, url: &str, contents: &[Content], attempt: u32) -> Result<String> {
        let req = GenerateContentRequest::new(contents, &self.config.safety_threshold);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let result = parse_generate_response(status.as_u16(), status.is_success(), &body);
        match &result {
            Ok(text) => tracing::debug!(attempt, reply_chars = text.chars().count(), "generated content"),
            Err(error) => tracing::debug!(attempt, %status, %error, "generate content failed"),
        }
        result
    }
}

fn count_inline_parts(contents: &[Content]) -> usize {
    contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| matches!(p, Part::InlineData { .. }))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorKind;
    use mockito::Matcher;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> GeminiClient {
        let mut config = GeminiConfig::new("test-key");
        config.pro_url = format!("{}/text", server.url());
        config.pro_vision_url = format!("{}/vision", server.url());
        GeminiClient::new(config)
    }

    fn reply_body(text: &str) -> String {
        json!({"candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]})
            .to_string()
    }

    #[test]
    fn inline_data_selects_vision_endpoint() {
        let mut contents = vec![Content::user(vec![
            Part::text("what is this"),
            Part::inline("image/png", "AAA="),
        ])];
        assert_eq!(GeminiClient::select_endpoint(&mut contents), Endpoint::Vision);
        assert_eq!(contents[0].parts.len(), 2);

        let mut text_only = vec![Content::user(vec![Part::text("hello")])];
        assert_eq!(GeminiClient::select_endpoint(&mut text_only), Endpoint::Text);
    }

    #[test]
    fn long_conversations_drop_images_and_use_text_endpoint() {
        let mut contents = vec![
            Content::user(vec![Part::text("a"), Part::inline("image/png", "AAA=")]),
            Content {
                parts: vec![Part::text("b")],
                role: Some(crate::types::Role::Model),
            },
            Content::user(vec![Part::inline("image/jpeg", "BBB="), Part::text("c")]),
        ];
        assert_eq!(GeminiClient::select_endpoint(&mut contents), Endpoint::Text);
        assert!(contents.iter().all(|c| !c.has_inline_data()));
        assert_eq!(contents[2].parts, vec![Part::text("c")]);
    }

    #[tokio::test]
    async fn generate_posts_to_text_endpoint_with_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/text")
            .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
            .match_body(Matcher::PartialJson(json!({
                "contents": [{"parts": [{"text": "hello"}], "role": "user"}],
                "generationConfig": {"maxOutputTokens": 800, "topK": 10}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply_body("hi there"))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let text = client
            .generate(vec![Content::user(vec![Part::text("hello")])])
            .await
            .expect("generation succeeds");
        assert_eq!(text, "hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn images_go_to_vision_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/vision")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(reply_body("a cat"))
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let text = client
            .generate(vec![Content::user(vec![
                Part::text("what is this"),
                Part::inline("image/jpeg", "AAA="),
            ])])
            .await
            .expect("generation succeeds");
        assert_eq!(text, "a cat");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn response_errors_are_retried_three_times() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/text")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body(json!({"error": {"message": "backend overloaded"}}).to_string())
            .expect(3)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .generate(vec![Content::user(vec![Part::text("hello")])])
            .await
            .expect_err("all attempts fail");
        match err {
            LlmError::Response { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "backend overloaded");
            }
            other => panic!("expected response error, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn safety_block_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/text")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"promptFeedback": {"blockReason": "SAFETY"}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server);
        let err = client
            .generate(vec![Content::user(vec![Part::text("hello")])])
            .await
            .expect_err("blocked");
        assert_eq!(err.kind(), LlmErrorKind::SafetyBlocked);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_failure_is_network_error() {
        let mut config = GeminiConfig::new("test-key");
        config.pro_url = "http://127.0.0.1:1/text".to_string();
        config.request_timeout = Duration::from_secs(2);
        let client = GeminiClient::new(config);

        let err = client
            .generate(vec![Content::user(vec![Part::text("hello")])])
            .await
            .expect_err("connection refused");
        assert_eq!(err.kind(), LlmErrorKind::Network);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn empty_contents_are_rejected() {
        let client = GeminiClient::new(GeminiConfig::new("test-key"));
        let err = client.generate(vec![]).await.expect_err("invalid input");
        assert_eq!(err.kind(), LlmErrorKind::InvalidInput);
    }
}
