use serde_json::Value;
use thiserror::Error;

use crate::models::{
    ChatMessageBroadcastPayload, CodeUpdateBroadcastPayload, InboundPayload, OutboundPayload,
    TypingBroadcastPayload,
};

/// Errors that can occur when parsing an inbound event.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid payload: {0} ({1})")]
    InvalidPayload(String, String),
}

/// Parse a raw text frame into an inbound event.
///
/// # Errors
///
/// * [`ParseError::InvalidPayload`] if the frame is not valid JSON, carries
///   an unknown event name, or is missing required fields
pub fn parse_inbound(text: &str) -> Result<InboundPayload, ParseError> {
    serde_json::from_str(text)
        .map_err(|e| ParseError::InvalidPayload(text.to_string(), e.to_string()))
}

/// Per-connection context the relay routes against.
#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    /// Authenticated user ID of the sender. Stamped onto every relayed
    /// event; never taken from the client payload.
    pub user_id: String,
    /// The sender's current session room, if any.
    pub current_session: Option<String>,
}

/// Which room members receive a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everyone in the room except the sender.
    ExcludeSender,
    /// Everyone in the room, the sender included.
    IncludeSender,
}

/// The routing decision for one inbound event.
#[derive(Debug, Clone)]
pub enum RelayAction {
    Join {
        session_id: String,
    },
    Leave {
        session_id: String,
    },
    Broadcast {
        session_id: String,
        scope: Scope,
        payload: OutboundPayload,
    },
}

/// Decide how to route one inbound event.
///
/// `at` is the server timestamp (epoch milliseconds) stamped onto relayed
/// code and chat events. Returns `None` when the event must be dropped: no
/// resolvable target room, or payload validation failed. Drops are silent by
/// design; this is fire-and-forget relay, not request/response.
#[must_use]
pub fn route(payload: InboundPayload, ctx: &RelayContext, at: u64) -> Option<RelayAction> {
    match payload {
        InboundPayload::JoinSession(payload) => {
            let session_id = non_empty(payload.session_id)?;
            Some(RelayAction::Join { session_id })
        }

        InboundPayload::LeaveSession(payload) => {
            let session_id = resolve_target(payload.session_id, ctx)?;
            Some(RelayAction::Leave { session_id })
        }

        InboundPayload::CodeUpdate(payload) => {
            let session_id = resolve_target(payload.session_id, ctx)?;
            Some(RelayAction::Broadcast {
                payload: OutboundPayload::CodeUpdate(CodeUpdateBroadcastPayload {
                    session_id: session_id.clone(),
                    code: payload.code,
                    language: payload.language,
                    from: ctx.user_id.clone(),
                    at,
                }),
                session_id,
                scope: Scope::ExcludeSender,
            })
        }

        InboundPayload::ChatMessage(payload) => {
            let session_id = resolve_target(payload.session_id, ctx)?;
            let message = payload.message.trim();
            if message.is_empty() {
                return None;
            }
            Some(RelayAction::Broadcast {
                payload: OutboundPayload::ChatMessage(ChatMessageBroadcastPayload {
                    session_id: session_id.clone(),
                    from: ctx.user_id.clone(),
                    message: message.to_string(),
                    at,
                }),
                session_id,
                scope: Scope::IncludeSender,
            })
        }

        InboundPayload::Typing(payload) => {
            let session_id = resolve_target(payload.session_id, ctx)?;
            Some(RelayAction::Broadcast {
                payload: OutboundPayload::Typing(TypingBroadcastPayload {
                    session_id: session_id.clone(),
                    from: ctx.user_id.clone(),
                    is_typing: truthy(&payload.is_typing),
                }),
                session_id,
                scope: Scope::ExcludeSender,
            })
        }
    }
}

/// Explicit session ID if present, else the sender's current session.
fn resolve_target(session_id: Option<String>, ctx: &RelayContext) -> Option<String> {
    non_empty(session_id).or_else(|| non_empty(ctx.current_session.clone()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// JavaScript-style boolean coercion for the `isTyping` field, which clients
/// may send as any JSON value.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn ctx(user_id: &str, current: Option<&str>) -> RelayContext {
        RelayContext {
            user_id: user_id.to_string(),
            current_session: current.map(ToString::to_string),
        }
    }

    fn parse(json: &serde_json::Value) -> InboundPayload {
        parse_inbound(&json.to_string()).unwrap()
    }

    #[test_log::test]
    fn join_targets_the_requested_session() {
        let payload = parse(&json!({ "type": "join_session", "sessionId": "r1" }));

        let action = route(payload, &ctx("u1", None), 0).unwrap();

        match action {
            RelayAction::Join { session_id } => assert_eq!(session_id, "r1"),
            other => panic!("expected Join, got {other:?}"),
        }
    }

    #[test_log::test]
    fn join_without_session_id_is_dropped() {
        let payload = parse(&json!({ "type": "join_session" }));
        assert!(route(payload, &ctx("u1", Some("r1")), 0).is_none());

        let payload = parse(&json!({ "type": "join_session", "sessionId": "" }));
        assert!(route(payload, &ctx("u1", Some("r1")), 0).is_none());
    }

    #[test_log::test]
    fn leave_falls_back_to_current_session() {
        let payload = parse(&json!({ "type": "leave_session" }));

        let action = route(payload, &ctx("u1", Some("r1")), 0).unwrap();

        match action {
            RelayAction::Leave { session_id, .. } => assert_eq!(session_id, "r1"),
            other => panic!("expected Leave, got {other:?}"),
        }
    }

    #[test_log::test]
    fn leave_with_no_target_is_a_no_op() {
        let payload = parse(&json!({ "type": "leave_session" }));
        assert!(route(payload, &ctx("u1", None), 0).is_none());
    }

    #[test_log::test]
    fn code_update_excludes_the_sender() {
        let payload = parse(&json!({
            "type": "code_update",
            "sessionId": "r1",
            "code": "fn main() {}",
            "language": "rust",
        }));

        let action = route(payload, &ctx("u1", None), 42).unwrap();

        match action {
            RelayAction::Broadcast {
                session_id,
                scope,
                payload,
            } => {
                assert_eq!(session_id, "r1");
                assert_eq!(scope, Scope::ExcludeSender);
                assert_eq!(
                    serde_json::to_value(payload).unwrap(),
                    json!({
                        "type": "code_update",
                        "sessionId": "r1",
                        "code": "fn main() {}",
                        "language": "rust",
                        "from": "u1",
                        "at": 42,
                    })
                );
            }
            other => panic!("expected Broadcast, got {other:?}"),
        }
    }

    #[test_log::test]
    fn code_update_without_language_serializes_explicit_null() {
        let payload = parse(&json!({ "type": "code_update", "sessionId": "r1", "code": "x" }));

        let Some(RelayAction::Broadcast { payload, .. }) = route(payload, &ctx("u1", None), 1)
        else {
            panic!("expected Broadcast");
        };

        let value = serde_json::to_value(payload).unwrap();
        assert_eq!(value.get("language"), Some(&serde_json::Value::Null));
    }

    #[test_log::test]
    fn code_update_with_non_string_code_fails_to_parse() {
        let result = parse_inbound(
            &json!({ "type": "code_update", "sessionId": "r1", "code": 42 }).to_string(),
        );
        assert!(result.is_err());
    }

    #[test_log::test]
    fn code_update_with_no_target_is_dropped() {
        let payload = parse(&json!({ "type": "code_update", "code": "x" }));
        assert!(route(payload, &ctx("u1", None), 0).is_none());
    }

    #[test_log::test]
    fn chat_message_includes_the_sender_and_trims() {
        let payload = parse(&json!({ "type": "chat_message", "message": "  hello  " }));

        let action = route(payload, &ctx("u2", Some("r1")), 7).unwrap();

        match action {
            RelayAction::Broadcast {
                session_id,
                scope,
                payload,
            } => {
                assert_eq!(session_id, "r1");
                assert_eq!(scope, Scope::IncludeSender);
                assert_eq!(
                    serde_json::to_value(payload).unwrap(),
                    json!({
                        "type": "chat_message",
                        "sessionId": "r1",
                        "from": "u2",
                        "message": "hello",
                        "at": 7,
                    })
                );
            }
            other => panic!("expected Broadcast, got {other:?}"),
        }
    }

    #[test_log::test]
    fn whitespace_only_chat_message_is_dropped() {
        let payload = parse(&json!({ "type": "chat_message", "sessionId": "r1", "message": "  " }));
        assert!(route(payload, &ctx("u1", None), 0).is_none());
    }

    #[test_log::test]
    fn typing_coerces_any_value_to_boolean() {
        for (value, expected) in [
            (json!(true), true),
            (json!(false), false),
            (json!(1), true),
            (json!(0), false),
            (json!("yes"), true),
            (json!(""), false),
            (json!(null), false),
            (json!({ "nested": true }), true),
        ] {
            let payload = parse(&json!({
                "type": "typing",
                "sessionId": "r1",
                "isTyping": value,
            }));

            let Some(RelayAction::Broadcast { payload, scope, .. }) =
                route(payload, &ctx("u1", None), 0)
            else {
                panic!("expected Broadcast");
            };

            assert_eq!(scope, Scope::ExcludeSender);
            assert_eq!(
                serde_json::to_value(payload).unwrap().get("isTyping"),
                Some(&json!(expected))
            );
        }
    }

    #[test_log::test]
    fn typing_without_is_typing_field_relays_false() {
        let payload = parse(&json!({ "type": "typing", "sessionId": "r1" }));

        let Some(RelayAction::Broadcast { payload, .. }) = route(payload, &ctx("u1", None), 0)
        else {
            panic!("expected Broadcast");
        };

        assert_eq!(
            serde_json::to_value(payload).unwrap().get("isTyping"),
            Some(&json!(false))
        );
    }

    #[test_log::test]
    fn unknown_event_name_fails_to_parse() {
        assert!(parse_inbound(&json!({ "type": "bogus" }).to_string()).is_err());
        assert!(parse_inbound("not json").is_err());
    }
}
