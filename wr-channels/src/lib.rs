//! WeChat official-account adapter for WeRelay.
//!
//! Adapters are pure I/O: they decode platform webhook payloads into
//! `InboundMessage`, encode passive replies, and talk to the platform API.

mod error;
mod signature;
mod traits;
mod types;
mod wechat;
mod xml;

pub use error::ChannelError;
pub use signature::{compute_signature, verify_signature};
pub use traits::ChannelAdapter;
pub use types::{InboundMessage, InboundMessageKind, MessageId, OutboundMessage, UserId};
pub use wechat::{DEFAULT_API_BASE_URL, Picture, WeChatAdapter, WeChatCredentials};
pub use xml::{REPLY_MSG_TYPE, encode_reply, encode_reply_at, parse_inbound};
