use crate::coalescer::Coalesced;
use crate::fallback;
use crate::server::RelayState;
use axum::Extension;
use axum::extract::Query;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use std::sync::Arc;
use wr_channels::{InboundMessage, InboundMessageKind, encode_reply, parse_inbound, verify_signature};

const INVALID_SIGNATURE: &str = "Invalid signature";

#[derive(Debug, Default, Deserialize)]
struct SignatureQuery {
    #[serde(default)]
    signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    echostr: Option<String>,
}

impl SignatureQuery {
    fn is_valid(&self, token: &str) -> bool {
        verify_signature(token, &self.timestamp, &self.nonce, &self.signature)
    }
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/wechat", get(verify).post(receive))
}

/// Server verification handshake: echo `echostr` back when the signature checks out.
#[tracing::instrument(level = "info", skip_all)]
async fn verify(
    Extension(state): Extension<Arc<RelayState>>,
    Query(query): Query<SignatureQuery>,
) -> Response {
    if !query.is_valid(&state.token) {
        tracing::warn!(timestamp = %query.timestamp, nonce = %query.nonce, "webhook verification rejected");
        return (StatusCode::BAD_REQUEST, INVALID_SIGNATURE).into_response();
    }
    query.echostr.unwrap_or_default().into_response()
}

#[tracing::instrument(level = "info", skip_all)]
async fn receive(
    Extension(state): Extension<Arc<RelayState>>,
    Query(query): Query<SignatureQuery>,
    body: String,
) -> Response {
    if !query.is_valid(&state.token) {
        tracing::warn!(timestamp = %query.timestamp, nonce = %query.nonce, "webhook message rejected");
        return (StatusCode::BAD_REQUEST, INVALID_SIGNATURE).into_response();
    }

    let message = match parse_inbound(&body) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(%error, "malformed webhook payload");
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };
    tracing::info!(
        message_id = %message.message_id,
        from_user = %message.from_user,
        kind = message_kind_label(&message.kind),
        received_at = %message.received_at,
        "webhook message received"
    );

    let response = match dispatch(&state, &message).await {
        Some(Coalesced::Reply(text)) => xml_reply(&message, &text),
        Some(Coalesced::Abandoned) => StatusCode::REQUEST_TIMEOUT.into_response(),
        None => fallback::NO_REPLY.into_response(),
    };
    tracing::info!(
        message_id = %message.message_id,
        status = response.status().as_u16(),
        elapsed_ms = message.age().num_milliseconds(),
        "webhook message handled"
    );
    response
}

/// `None` means the message is acknowledged without a passive reply.
async fn dispatch(state: &RelayState, message: &InboundMessage) -> Option<Coalesced> {
    let message_id = message.message_id.as_str();
    let from_user = message.from_user.as_str();

    let outcome = match &message.kind {
        InboundMessageKind::Text { content } => {
            state.coalescer.handle(message_id, from_user, content).await
        }
        InboundMessageKind::Voice {
            recognition: Some(recognition),
            ..
        } => {
            state
                .coalescer
                .handle(message_id, from_user, recognition)
                .await
        }
        InboundMessageKind::Voice {
            recognition: None, ..
        } => Coalesced::Reply(fallback::VOICE_NOT_RECOGNISED.to_string()),
        InboundMessageKind::Image { pic_url, .. } => {
            let pictures = state.pictures.clone();
            let user = from_user.to_string();
            let pic_url = pic_url.clone();
            state
                .coalescer
                .coalesce(message_id, async move {
                    pictures.append(&user, pic_url);
                    fallback::IMAGE_RECEIVED.to_string()
                })
                .await
        }
        InboundMessageKind::Event { event, .. } if event.eq_ignore_ascii_case("subscribe") => {
            Coalesced::Reply(fallback::SUBSCRIBE_WELCOME.to_string())
        }
        InboundMessageKind::Event { event, .. } => {
            tracing::debug!(event = %event, "event acknowledged without reply");
            return None;
        }
        InboundMessageKind::Unsupported { msg_type } => {
            tracing::debug!(msg_type = %msg_type, "unsupported message type");
            Coalesced::Reply(fallback::UNSUPPORTED_MESSAGE.to_string())
        }
    };
    Some(outcome)
}

fn xml_reply(message: &InboundMessage, text: &str) -> Response {
    match encode_reply(message.from_user.as_str(), message.to_user.as_str(), text) {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(error) => {
            tracing::error!(%error, message_id = %message.message_id, "reply encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn message_kind_label(kind: &InboundMessageKind) -> &'static str {
    match kind {
        InboundMessageKind::Text { .. } => "text",
        InboundMessageKind::Image { .. } => "image",
        InboundMessageKind::Voice { .. } => "voice",
        InboundMessageKind::Event { .. } => "event",
        InboundMessageKind::Unsupported { .. } => "unsupported",
    }
}
