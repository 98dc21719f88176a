use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid inbound payload: {0}")]
    InvalidPayload(String),

    #[error("reply encoding failed: {0}")]
    Encode(String),

    #[error("picture download failed: {0}")]
    Download(String),
}
