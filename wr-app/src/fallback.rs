//! User-facing replies used when no generated answer is available.

pub const NETWORK_PROBLEM: &str = "Network problem, please try again later.";
pub const INTERNAL_ERROR: &str = "Internal error, please try again later.";
pub const SAFETY_BLOCKED: &str = "Sorry, this topic cannot be discussed.";
pub const IMAGE_SERVER_PROBLEM: &str =
    "The image server had a problem, please send the picture again.";
pub const UNSUPPORTED_MESSAGE: &str = "Sorry, only text, voice and image messages are supported.";
pub const VOICE_NOT_RECOGNISED: &str = "Sorry, I could not make out that voice message.";
pub const IMAGE_RECEIVED: &str = "Picture received. Send a text message to ask about it.";
pub const SUBSCRIBE_WELCOME: &str = "Thanks for following! Send me a message and I will reply.";

/// Platform convention for "received, no reply".
pub const NO_REPLY: &str = "success";
