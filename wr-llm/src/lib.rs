//! Gemini generation client for WeRelay.
//!
//! Pure HTTP client: builds `generateContent` requests, picks the text or vision
//! endpoint, and maps backend failures into [`LlmError`].

mod client;
mod error;
mod gemini;
mod retry;
mod types;

pub use client::{
    DEFAULT_PRO_URL, DEFAULT_PRO_VISION_URL, DEFAULT_SAFETY_THRESHOLD, Endpoint, GeminiClient,
    GeminiConfig,
};
pub use error::{GENERIC_ERROR_MESSAGE, LlmError, LlmErrorKind, Result};
pub use retry::RetryPolicy;
pub use types::{Content, InlineData, Part, Role, is_supported_mime_type};
