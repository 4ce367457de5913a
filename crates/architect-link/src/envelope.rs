//! Wire envelopes.
//!
//! Every frame on a link is one JSON object:
//!
//! ```text
//! {"event":"phx_join","topic":"builders:pool","payload":{"token":"..."},"ref":1}
//! ```
//!
//! Decoding reads the envelope shell first with the payload left as raw
//! JSON, then picks the payload type from the `event` discriminant.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Value, json};

use crate::{LinkError, LinkResult};

pub const JOIN_EVENT: &str = "phx_join";
pub const LEAVE_EVENT: &str = "phx_leave";
pub const REPLY_EVENT: &str = "phx_reply";
pub const ERROR_EVENT: &str = "phx_error";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Topic heartbeats are exchanged on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Body of a `phx_join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Body of a `phx_reply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: ReplyStatus,
    #[serde(default = "empty_object")]
    pub response: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl ReplyPayload {
    pub fn ok() -> Self {
        Self::ok_with(empty_object())
    }

    pub fn ok_with(response: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            response: json!({ "message": message.into() }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// The response body for an ok reply, [`LinkError::Rejected`] otherwise.
    pub fn into_result(self) -> LinkResult<Value> {
        match self.status {
            ReplyStatus::Ok => Ok(self.response),
            ReplyStatus::Error => {
                let message = self
                    .response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("error reply")
                    .to_string();
                Err(LinkError::Rejected { message })
            }
        }
    }
}

/// Envelope payload, one variant per event kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Join(JoinPayload),
    Leave,
    Reply(ReplyPayload),
    /// A channel-level error pushed by the peer.
    Error(Value),
    Heartbeat,
    /// Any application-defined event.
    Event { name: String, body: Value },
}

impl Payload {
    pub fn event(&self) -> &str {
        match self {
            Payload::Join(_) => JOIN_EVENT,
            Payload::Leave => LEAVE_EVENT,
            Payload::Reply(_) => REPLY_EVENT,
            Payload::Error(_) => ERROR_EVENT,
            Payload::Heartbeat => HEARTBEAT_EVENT,
            Payload::Event { name, .. } => name,
        }
    }

    /// Body of an application event.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Payload::Event { body, .. } => Some(body),
            _ => None,
        }
    }

    fn to_value(&self) -> LinkResult<Value> {
        Ok(match self {
            Payload::Join(join) => serde_json::to_value(join)?,
            Payload::Leave | Payload::Heartbeat => empty_object(),
            Payload::Reply(reply) => serde_json::to_value(reply)?,
            Payload::Error(body) | Payload::Event { body, .. } => body.clone(),
        })
    }

    /// Decode the raw payload for the given event discriminant.
    fn decode(event: &str, raw: Option<&RawValue>) -> LinkResult<Self> {
        let raw = raw.map(RawValue::get).unwrap_or("{}");
        let payload = match event {
            JOIN_EVENT => Payload::Join(serde_json::from_str(raw)?),
            LEAVE_EVENT => Payload::Leave,
            REPLY_EVENT => Payload::Reply(serde_json::from_str(raw)?),
            ERROR_EVENT => Payload::Error(serde_json::from_str(raw)?),
            HEARTBEAT_EVENT => Payload::Heartbeat,
            reserved if reserved.starts_with("phx_") => {
                return Err(LinkError::Protocol(format!(
                    "unknown protocol event '{reserved}'"
                )));
            }
            name => Payload::Event {
                name: name.to_string(),
                body: serde_json::from_str(raw)?,
            },
        };
        Ok(payload)
    }
}

/// One message on a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Payload,
    /// Correlation id, assigned by the sending link when absent.
    pub reference: Option<u64>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    event: &'a str,
    topic: &'a str,
    payload: Value,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    reference: Option<u64>,
}

#[derive(Deserialize)]
struct RawEnvelope<'a> {
    event: String,
    topic: String,
    #[serde(rename = "ref", default)]
    reference: Option<u64>,
    #[serde(borrow, default)]
    payload: Option<&'a RawValue>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            reference: None,
        }
    }

    pub fn join(topic: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(
            topic,
            Payload::Join(JoinPayload {
                token: token.into(),
            }),
        )
    }

    pub fn leave(topic: impl Into<String>) -> Self {
        Self::new(topic, Payload::Leave)
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_TOPIC, Payload::Heartbeat)
    }

    pub fn event(topic: impl Into<String>, name: impl Into<String>, body: Value) -> Self {
        Self::new(
            topic,
            Payload::Event {
                name: name.into(),
                body,
            },
        )
    }

    /// A reply correlated with `reference` on `topic`.
    pub fn reply(topic: impl Into<String>, reference: Option<u64>, reply: ReplyPayload) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Reply(reply),
            reference,
        }
    }

    pub fn with_ref(mut self, reference: u64) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn event_name(&self) -> &str {
        self.payload.event()
    }

    /// Replies and errors are answers; they are never acknowledged themselves.
    pub fn is_answer(&self) -> bool {
        matches!(self.payload, Payload::Reply(_) | Payload::Error(_))
    }

    pub fn encode(&self) -> LinkResult<String> {
        let wire = WireEnvelope {
            event: self.event_name(),
            topic: &self.topic,
            payload: self.payload.to_value()?,
            reference: self.reference,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(frame: &str) -> LinkResult<Self> {
        let raw: RawEnvelope<'_> = serde_json::from_str(frame)?;
        Ok(Self {
            topic: raw.topic,
            reference: raw.reference,
            payload: Payload::decode(&raw.event, raw.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_join_in_wire_shape() {
        let frame = Envelope::join("builders:pool", "secret")
            .with_ref(1)
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "phx_join",
                "topic": "builders:pool",
                "payload": { "token": "secret" },
                "ref": 1
            })
        );
    }

    #[test]
    fn omits_ref_when_unset() {
        let frame = Envelope::heartbeat().encode().unwrap();
        assert!(!frame.contains("\"ref\""));
    }

    #[test]
    fn decodes_reply_by_discriminant() {
        let env = Envelope::decode(
            r#"{"event":"phx_reply","topic":"builders:pool","ref":1,"payload":{"status":"ok","response":{}}}"#,
        )
        .unwrap();
        assert_eq!(env.reference, Some(1));
        assert_eq!(env.payload, Payload::Reply(ReplyPayload::ok()));
    }

    #[test]
    fn decodes_application_event_with_body() {
        let env = Envelope::decode(
            r#"{"event":"report","topic":"builders:pool","ref":3,"payload":{"type":"log"}}"#,
        )
        .unwrap();
        match env.payload {
            Payload::Event { name, body } => {
                assert_eq!(name, "report");
                assert_eq!(body["type"], "log");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let env = Envelope::decode(r#"{"event":"heartbeat","topic":"phoenix","ref":2}"#).unwrap();
        assert_eq!(env.payload, Payload::Heartbeat);
    }

    #[test]
    fn unknown_protocol_event_is_a_protocol_error() {
        let err = Envelope::decode(r#"{"event":"phx_close","topic":"t","payload":{}}"#).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }

    #[test]
    fn malformed_join_is_a_codec_error() {
        let err =
            Envelope::decode(r#"{"event":"phx_join","topic":"t","payload":{"tok":1}}"#).unwrap_err();
        assert!(matches!(err, LinkError::Codec(_)));
    }

    #[test]
    fn error_reply_becomes_rejection() {
        let err = ReplyPayload::error("access denied").into_result().unwrap_err();
        match err {
            LinkError::Rejected { message } => assert_eq!(message, "access denied"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn answers_are_replies_and_errors() {
        assert!(Envelope::reply("t", Some(1), ReplyPayload::ok()).is_answer());
        assert!(Envelope::new("t", Payload::Error(json!({}))).is_answer());
        assert!(!Envelope::heartbeat().is_answer());
    }
}
