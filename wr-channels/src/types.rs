use chrono::{DateTime, Utc};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(UserId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessageKind {
    Text {
        content: String,
    },
    Image {
        pic_url: String,
        media_id: Option<String>,
    },
    Voice {
        /// Platform speech recognition result; absent when recognition is off.
        recognition: Option<String>,
        media_id: Option<String>,
    },
    Event {
        event: String,
        event_key: Option<String>,
    },
    Unsupported {
        msg_type: String,
    },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Repeated verbatim when the platform retries delivery.
    pub message_id: MessageId,
    /// The official account the message was sent to.
    pub to_user: UserId,
    pub from_user: UserId,
    pub create_time: i64,
    pub kind: InboundMessageKind,
    /// When this process decoded the message.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Time elapsed since the message was decoded.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.received_at)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub content: String,
}
