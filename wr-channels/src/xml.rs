//! Webhook payload codec.
//!
//! Inbound: <https://developers.weixin.qq.com/doc/offiaccount/Message_Management/Receiving_standard_messages.html>
//! Reply: <https://developers.weixin.qq.com/doc/offiaccount/Message_Management/Passive_user_reply_message.html>

use crate::error::ChannelError;
use crate::types::{InboundMessage, InboundMessageKind, MessageId, UserId};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const REPLY_MSG_TYPE: &str = "text";

#[derive(Debug, Deserialize)]
#[serde(rename = "xml")]
struct RawInbound {
    #[serde(rename = "ToUserName")]
    to_user_name: String,
    #[serde(rename = "FromUserName")]
    from_user_name: String,
    #[serde(rename = "CreateTime", default)]
    create_time: i64,
    #[serde(rename = "MsgType")]
    msg_type: String,
    #[serde(rename = "MsgId", default)]
    msg_id: Option<String>,
    #[serde(rename = "Content", default)]
    content: Option<String>,
    #[serde(rename = "PicUrl", default)]
    pic_url: Option<String>,
    #[serde(rename = "MediaId", default)]
    media_id: Option<String>,
    #[serde(rename = "Recognition", default)]
    recognition: Option<String>,
    #[serde(rename = "Event", default)]
    event: Option<String>,
    #[serde(rename = "EventKey", default)]
    event_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "xml")]
struct ReplyEnvelope<'a> {
    #[serde(rename = "ToUserName")]
    to_user_name: &'a str,
    #[serde(rename = "FromUserName")]
    from_user_name: &'a str,
    #[serde(rename = "CreateTime")]
    create_time: i64,
    #[serde(rename = "MsgType")]
    msg_type: &'static str,
    #[serde(rename = "Content")]
    content: &'a str,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_inbound(body: &str) -> Result<InboundMessage, ChannelError> {
    let raw: RawInbound =
        quick_xml::de::from_str(body).map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;

    let from_user = raw.from_user_name.trim().to_string();
    if from_user.is_empty() {
        return Err(ChannelError::InvalidPayload(
            "FromUserName is required".to_string(),
        ));
    }

    let msg_type = raw.msg_type.trim().to_ascii_lowercase();
    let kind = match msg_type.as_str() {
        "text" => InboundMessageKind::Text {
            content: raw.content.unwrap_or_default(),
        },
        "image" => InboundMessageKind::Image {
            pic_url: non_empty(raw.pic_url).ok_or_else(|| {
                ChannelError::InvalidPayload("image message missing PicUrl".to_string())
            })?,
            media_id: non_empty(raw.media_id),
        },
        "voice" => InboundMessageKind::Voice {
            recognition: non_empty(raw.recognition),
            media_id: non_empty(raw.media_id),
        },
        "event" => InboundMessageKind::Event {
            event: raw.event.unwrap_or_default().trim().to_string(),
            event_key: non_empty(raw.event_key),
        },
        _ => InboundMessageKind::Unsupported { msg_type },
    };

    // Events carry no MsgId; the platform recommends FromUserName + CreateTime for dedup.
    let message_id = match non_empty(raw.msg_id) {
        Some(id) => id,
        None => format!("{}:{}", from_user, raw.create_time),
    };

    Ok(InboundMessage {
        message_id: MessageId::new(message_id),
        to_user: UserId::new(raw.to_user_name.trim()),
        from_user: UserId::new(from_user),
        create_time: raw.create_time,
        kind,
        received_at: Utc::now(),
    })
}

/// Encode a passive text reply stamped with the current time.
pub fn encode_reply(to_user: &str, from_self: &str, content: &str) -> Result<String, ChannelError> {
    encode_reply_at(to_user, from_self, content, Utc::now().timestamp())
}

pub fn encode_reply_at(
    to_user: &str,
    from_self: &str,
    content: &str,
    create_time: i64,
) -> Result<String, ChannelError> {
    let envelope = ReplyEnvelope {
        to_user_name: to_user,
        from_user_name: from_self,
        create_time,
        msg_type: REPLY_MSG_TYPE,
        content,
    };
    quick_xml::se::to_string(&envelope).map_err(|e| ChannelError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT_XML: &str = r#"<xml>
  <ToUserName><![CDATA[gh_account]]></ToUserName>
  <FromUserName><![CDATA[o_user]]></FromUserName>
  <CreateTime>1700000000</CreateTime>
  <MsgType><![CDATA[text]]></MsgType>
  <Content><![CDATA[hello <world>]]></Content>
  <MsgId>23911223344556677</MsgId>
  <MsgDataId></MsgDataId>
</xml>"#;

    #[test]
    fn text_message_is_decoded() {
        let before = Utc::now();
        let inbound = parse_inbound(TEXT_XML).expect("parse text");
        assert!(inbound.received_at >= before && inbound.received_at <= Utc::now());
        assert_eq!(inbound.message_id.as_str(), "23911223344556677");
        assert_eq!(inbound.to_user.as_str(), "gh_account");
        assert_eq!(inbound.from_user.as_str(), "o_user");
        assert_eq!(inbound.create_time, 1_700_000_000);
        assert_eq!(
            inbound.kind,
            InboundMessageKind::Text {
                content: "hello <world>".to_string()
            }
        );
    }

    #[test]
    fn image_and_voice_fields_are_extracted() {
        let image = parse_inbound(
            "<xml><ToUserName>gh</ToUserName><FromUserName>u</FromUserName>\
             <CreateTime>1</CreateTime><MsgType>image</MsgType>\
             <PicUrl>http://mmbiz.example/pic.jpg</PicUrl><MediaId>m-1</MediaId>\
             <MsgId>42</MsgId></xml>",
        )
        .expect("parse image");
        assert_eq!(
            image.kind,
            InboundMessageKind::Image {
                pic_url: "http://mmbiz.example/pic.jpg".to_string(),
                media_id: Some("m-1".to_string()),
            }
        );

        let voice = parse_inbound(
            "<xml><ToUserName>gh</ToUserName><FromUserName>u</FromUserName>\
             <CreateTime>1</CreateTime><MsgType>voice</MsgType><MediaId>v-1</MediaId>\
             <Format>amr</Format><Recognition><![CDATA[what time is it]]></Recognition>\
             <MsgId>43</MsgId></xml>",
        )
        .expect("parse voice");
        assert_eq!(
            voice.kind,
            InboundMessageKind::Voice {
                recognition: Some("what time is it".to_string()),
                media_id: Some("v-1".to_string()),
            }
        );
    }

    #[test]
    fn events_get_a_synthetic_message_id() {
        let inbound = parse_inbound(
            "<xml><ToUserName>gh</ToUserName><FromUserName>o_user</FromUserName>\
             <CreateTime>1700000123</CreateTime><MsgType>event</MsgType>\
             <Event>subscribe</Event></xml>",
        )
        .expect("parse event");
        assert_eq!(inbound.message_id.as_str(), "o_user:1700000123");
        assert_eq!(
            inbound.kind,
            InboundMessageKind::Event {
                event: "subscribe".to_string(),
                event_key: None,
            }
        );
    }

    #[test]
    fn unknown_types_are_kept_as_unsupported() {
        let inbound = parse_inbound(
            "<xml><ToUserName>gh</ToUserName><FromUserName>u</FromUserName>\
             <CreateTime>1</CreateTime><MsgType>location</MsgType><MsgId>7</MsgId></xml>",
        )
        .expect("parse location");
        assert_eq!(
            inbound.kind,
            InboundMessageKind::Unsupported {
                msg_type: "location".to_string()
            }
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            parse_inbound("<xml><ToUserName>gh</ToUserName></xml>"),
            Err(ChannelError::InvalidPayload(_))
        ));
        assert!(matches!(
            parse_inbound(
                "<xml><ToUserName>gh</ToUserName><FromUserName>u</FromUserName>\
                 <MsgType>image</MsgType><MsgId>1</MsgId></xml>"
            ),
            Err(ChannelError::InvalidPayload(_))
        ));
    }

    #[test]
    fn reply_envelope_has_expected_fields_and_escapes_content() {
        let xml = encode_reply_at("o_user", "gh_account", "a < b & c", 1_700_000_999)
            .expect("encode reply");
        assert!(xml.starts_with("<xml>"), "{xml}");
        assert!(xml.contains("<ToUserName>o_user</ToUserName>"), "{xml}");
        assert!(xml.contains("<FromUserName>gh_account</FromUserName>"), "{xml}");
        assert!(xml.contains("<CreateTime>1700000999</CreateTime>"), "{xml}");
        assert!(xml.contains("<MsgType>text</MsgType>"), "{xml}");
        assert!(xml.contains("<Content>a &lt; b &amp; c</Content>"), "{xml}");
    }
}
