//! Turns a user message into a generated reply: pending pictures are folded into
//! the prompt and backend failures become user-facing text.

use crate::coalescer::ReplyGenerator;
use crate::fallback;
use crate::picture_cache::PictureCache;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::try_join_all;
use std::sync::Arc;
use wr_channels::{ChannelError, Picture, WeChatAdapter};
use wr_llm::{Content, GeminiClient, LlmError, Part, is_supported_mime_type};

const DEFAULT_IMAGE_MIME_TYPE: &str = "image/jpeg";

pub struct RelayService {
    gemini: GeminiClient,
    wechat: WeChatAdapter,
    pictures: Arc<PictureCache>,
}

impl RelayService {
    pub fn new(gemini: GeminiClient, wechat: WeChatAdapter, pictures: Arc<PictureCache>) -> Self {
        Self {
            gemini,
            wechat,
            pictures,
        }
    }

    #[cfg(test)]
    pub fn pictures(&self) -> &Arc<PictureCache> {
        &self.pictures
    }

    /// Build the single user turn for `text`, consuming every picture queued for `user_id`.
    async fn build_prompt(&self, user_id: &str, text: &str) -> Result<Vec<Content>, ChannelError> {
        let urls = self.pictures.pop_all(user_id);
        let pictures = try_join_all(urls.iter().map(|url| self.wechat.download_picture(url))).await?;

        let mut parts = Vec::with_capacity(1 + pictures.len());
        parts.push(Part::text(text));
        parts.extend(pictures.iter().map(inline_part));
        Ok(vec![Content::user(parts)])
    }
}

#[async_trait]
impl ReplyGenerator for RelayService {
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user_id))]
    async fn generate(&self, user_id: &str, text: &str) -> String {
        let contents = match self.build_prompt(user_id, text).await {
            Ok(contents) => contents,
            Err(error) => {
                tracing::warn!(%error, "picture download failed; skipping generation");
                return fallback::IMAGE_SERVER_PROBLEM.to_string();
            }
        };

        match self.gemini.generate(contents).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(%error, kind = ?error.kind(), "generation failed");
                reply_for_error(&error)
            }
        }
    }
}

fn inline_part(picture: &Picture) -> Part {
    let mime_type = picture
        .content_type
        .as_deref()
        .filter(|mime| is_supported_mime_type(mime))
        .unwrap_or(DEFAULT_IMAGE_MIME_TYPE);
    Part::inline(mime_type, STANDARD.encode(&picture.bytes))
}

/// User-facing reply for a failed generation.
pub fn reply_for_error(error: &LlmError) -> String {
    match error {
        LlmError::Network { .. } => fallback::NETWORK_PROBLEM.to_string(),
        LlmError::Response { message, .. } => message.clone(),
        LlmError::SafetyBlocked { .. } => fallback::SAFETY_BLOCKED.to_string(),
        LlmError::InvalidInput(_) => fallback::INTERNAL_ERROR.to_string(),
    }
}
