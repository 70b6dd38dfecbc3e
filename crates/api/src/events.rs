//! Typed view of the envelopes delivered over the streaming channel.
//!
//! The wire format is `{ "event": <kind>, "data": <payload> }`. Payloads are either a bare
//! scalar or an object carrying the value under one of a few well-known keys.

use serde::Deserialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

pub const EVENT_PARSER_START: &str = "on_parser_start";
pub const EVENT_PARSER_STREAM: &str = "on_parser_stream";
pub const EVENT_MESSAGE_ID: &str = "message_id";
pub const EVENT_ACTION: &str = "action";
pub const EVENT_ERROR: &str = "error";

const FRAGMENT_KEYS: &[&str] = &["chunk", "text", "content", "token"];
const MESSAGE_ID_KEYS: &[&str] = &["message_id", "id"];
const ACTION_KEYS: &[&str] = &["action", "text", "message"];
const ERROR_KEYS: &[&str] = &["error", "message", "detail"];

/// One server-sent event on the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The agent started composing a reply.
    ParserStart,
    /// Text fragment for the open AI message.
    ParserStream(String),
    /// Durable identifier for the most recently opened AI message.
    MessageId(u64),
    /// Informational status about intermediate agent activity.
    Action(String),
    /// The agent failed; the text is shown as a system message.
    Error(String),
    /// A kind this client does not know about.
    Unknown { kind: String },
}

impl ChannelEvent {
    /// Parses one text frame into a typed event.
    ///
    /// Unknown kinds parse successfully into [`ChannelEvent::Unknown`]; only envelopes that
    /// cannot be understood at all are errors.
    pub fn parse(frame: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(frame).context(InvalidJsonSnafu {
            stage: "decode-envelope",
        })?;
        let data = envelope.data.unwrap_or(Value::Null);

        let event = match envelope.event.as_str() {
            EVENT_PARSER_START => Self::ParserStart,
            EVENT_PARSER_STREAM => {
                let fragment = text_payload(&data, FRAGMENT_KEYS).context(PayloadShapeSnafu {
                    stage: "decode-fragment",
                    kind: EVENT_PARSER_STREAM,
                })?;
                Self::ParserStream(fragment)
            }
            EVENT_MESSAGE_ID => {
                let id = id_payload(&data).context(PayloadShapeSnafu {
                    stage: "decode-message-id",
                    kind: EVENT_MESSAGE_ID,
                })?;
                Self::MessageId(id)
            }
            EVENT_ACTION => Self::Action(text_payload(&data, ACTION_KEYS).unwrap_or_default()),
            EVENT_ERROR => {
                let message = text_payload(&data, ERROR_KEYS)
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "the agent reported an error".to_string());
                Self::Error(message)
            }
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };

        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::ParserStart => EVENT_PARSER_START,
            Self::ParserStream(_) => EVENT_PARSER_STREAM,
            Self::MessageId(_) => EVENT_MESSAGE_ID,
            Self::Action(_) => EVENT_ACTION,
            Self::Error(_) => EVENT_ERROR,
            Self::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum EnvelopeError {
    #[snafu(display("channel frame is not a valid event envelope on `{stage}`: {source}"))]
    InvalidJson {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("payload of `{kind}` event has an unexpected shape on `{stage}`"))]
    PayloadShape {
        stage: &'static str,
        kind: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

fn text_payload(data: &Value, keys: &[&str]) -> Option<String> {
    match data {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => keys
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn id_payload(data: &Value) -> Option<u64> {
    match data {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Object(map) => MESSAGE_ID_KEYS
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(|value| match value {
                Value::Number(number) => number.as_u64(),
                Value::String(raw) => raw.trim().parse().ok(),
                _ => None,
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds_from_scalar_and_object_payloads() {
        let cases = [
            (r#"{"event":"on_parser_start","data":{}}"#, ChannelEvent::ParserStart),
            (
                r#"{"event":"on_parser_stream","data":"Hi"}"#,
                ChannelEvent::ParserStream("Hi".to_string()),
            ),
            (
                r#"{"event":"on_parser_stream","data":{"chunk":" there"}}"#,
                ChannelEvent::ParserStream(" there".to_string()),
            ),
            (r#"{"event":"message_id","data":42}"#, ChannelEvent::MessageId(42)),
            (
                r#"{"event":"message_id","data":{"message_id":"43"}}"#,
                ChannelEvent::MessageId(43),
            ),
            (
                r#"{"event":"action","data":{"action":"searching documents"}}"#,
                ChannelEvent::Action("searching documents".to_string()),
            ),
            (
                r#"{"event":"error","data":{"error":"quota exceeded"}}"#,
                ChannelEvent::Error("quota exceeded".to_string()),
            ),
        ];

        for (frame, expected) in cases {
            assert_eq!(ChannelEvent::parse(frame).expect(frame), expected);
        }
    }

    #[test]
    fn unknown_kinds_are_kept_as_unknown() {
        let event = ChannelEvent::parse(r#"{"event":"on_tool_start","data":{"tool":"sql"}}"#)
            .expect("unknown kinds still parse");
        assert_eq!(
            event,
            ChannelEvent::Unknown {
                kind: "on_tool_start".to_string()
            }
        );
        assert_eq!(event.kind(), "on_tool_start");
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            ChannelEvent::parse("not json"),
            Err(EnvelopeError::InvalidJson { .. })
        ));
        assert!(matches!(
            ChannelEvent::parse(r#"{"data":"missing kind"}"#),
            Err(EnvelopeError::InvalidJson { .. })
        ));
        assert!(matches!(
            ChannelEvent::parse(r#"{"event":"message_id","data":{"id":"abc"}}"#),
            Err(EnvelopeError::PayloadShape {
                stage: "decode-message-id",
                kind: EVENT_MESSAGE_ID,
            })
        ));
        assert!(matches!(
            ChannelEvent::parse(r#"{"event":"on_parser_stream","data":7}"#),
            Err(EnvelopeError::PayloadShape { .. })
        ));
    }

    #[test]
    fn error_event_without_text_gets_a_generic_message() {
        assert_eq!(
            ChannelEvent::parse(r#"{"event":"error"}"#).expect("error parses"),
            ChannelEvent::Error("the agent reported an error".to_string())
        );
    }
}
