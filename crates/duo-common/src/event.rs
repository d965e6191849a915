//! duo wire events.
//!
//! Every WebSocket text frame carries exactly one JSON object tagged by its
//! `"type"` field. Event names and field names are camelCase. Handshake
//! payloads (`offer`, `answer`, `candidate`) are arbitrary JSON that the
//! server forwards without looking inside: a [`Payload`] keeps the exact
//! text the sender wrote, so key order, number spelling and whitespace
//! inside it reach the partner unchanged.
//!
//! Decoding goes through a flat frame struct rather than a tagged enum
//! derive, because serde buffers tagged-enum content and a raw JSON slice
//! cannot survive that buffering.

use crate::types::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

/// Opaque handshake payload, held as the sender's original JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    /// JSON `null`, used when a handshake event carries no payload.
    #[must_use]
    pub fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    /// Wrap JSON text. Surrounding whitespace is trimmed; everything else
    /// is kept byte for byte.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if `json` is not a single JSON value.
    pub fn from_json(json: impl Into<String>) -> Result<Self, EventError> {
        RawValue::from_string(json.into())
            .map(Self)
            .map_err(EventError::Malformed)
    }

    /// Serialize `value` into a payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, EventError> {
        serde_json::value::to_raw_value(value)
            .map(Self)
            .map_err(EventError::Encode)
    }

    /// The payload's JSON text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Ask to be paired with someone.
    FindPartner,
    /// Handshake offer for the current partner.
    Offer {
        /// Opaque handshake payload.
        payload: Payload,
    },
    /// Handshake answer for the current partner.
    Answer {
        /// Opaque handshake payload.
        payload: Payload,
    },
    /// Connectivity candidate for the current partner.
    Candidate {
        /// Opaque handshake payload.
        payload: Payload,
    },
    /// Leave the current partner and look for another one.
    Next,
    /// Report abusive behaviour.
    Report {
        /// Who is being reported. Ignored while the reporter has a partner.
        #[serde(rename = "reportedId", skip_serializing_if = "Option::is_none")]
        reported_id: Option<SessionId>,
        /// Free-form reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Liveness signal.
    Heartbeat,
}

/// Events the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// First frame on every connection: the id the transport assigned.
    Welcome {
        /// The receiving connection's own session id.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// A partner was found.
    Match {
        /// `true` for the side that must create the handshake offer.
        initiator: bool,
        /// The partner's session id.
        #[serde(rename = "partnerId")]
        partner_id: SessionId,
    },
    /// Offer relayed from the partner.
    Offer {
        /// Payload exactly as the partner sent it.
        payload: Payload,
    },
    /// Answer relayed from the partner.
    Answer {
        /// Payload exactly as the partner sent it.
        payload: Payload,
    },
    /// Candidate relayed from the partner.
    Candidate {
        /// Payload exactly as the partner sent it.
        payload: Payload,
    },
    /// The partner went away.
    PartnerLeft,
    /// The previous pairing was released after `next`.
    ReadyForNext,
    /// A pairing action was rejected by its cooldown.
    MatchTimeout {
        /// Human-readable explanation.
        message: String,
    },
    /// The session is banned from matching.
    Banned {
        /// Human-readable explanation.
        message: String,
    },
    /// A report was recorded.
    ReportAck {
        /// Human-readable explanation.
        message: String,
    },
}

/// The three handshake message kinds the server relays between partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    /// `offer`
    Offer,
    /// `answer`
    Answer,
    /// `candidate`
    Candidate,
}

impl RelayKind {
    /// Wire name of this kind, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }

    /// Wrap `payload` in the outbound event for this kind.
    #[must_use]
    pub fn into_event(self, payload: Payload) -> ServerEvent {
        match self {
            Self::Offer => ServerEvent::Offer { payload },
            Self::Answer => ServerEvent::Answer { payload },
            Self::Candidate => ServerEvent::Candidate { payload },
        }
    }
}

/// Errors that can occur while decoding or encoding events.
#[derive(Debug, Error)]
pub enum EventError {
    /// The frame was not valid JSON or a field had the wrong shape.
    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The `type` field named no known event.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// A field the event requires was absent.
    #[error("{event} event is missing `{field}`")]
    MissingField {
        /// Event name.
        event: &'static str,
        /// Missing field.
        field: &'static str,
    },
    /// The event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Every field any client event can carry. Unknown fields are ignored.
#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Payload>,
    #[serde(default, rename = "reportedId")]
    reported_id: Option<SessionId>,
    #[serde(default)]
    reason: Option<String>,
}

/// Every field any server event can carry.
#[derive(Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "sessionId")]
    session_id: Option<SessionId>,
    #[serde(default)]
    initiator: Option<bool>,
    #[serde(default, rename = "partnerId")]
    partner_id: Option<SessionId>,
    #[serde(default)]
    payload: Option<Payload>,
    #[serde(default)]
    message: Option<String>,
}

fn required<T>(value: Option<T>, event: &'static str, field: &'static str) -> Result<T, EventError> {
    value.ok_or(EventError::MissingField { event, field })
}

impl ClientEvent {
    /// Decode a client event from a text frame.
    ///
    /// A handshake event without a payload carries JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] for invalid JSON and
    /// [`EventError::UnknownType`] for an unrecognized `type`.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(EventError::Malformed)?;
        let payload = frame.payload.unwrap_or_default();
        Ok(match frame.kind.as_str() {
            "findPartner" => Self::FindPartner,
            "offer" => Self::Offer { payload },
            "answer" => Self::Answer { payload },
            "candidate" => Self::Candidate { payload },
            "next" => Self::Next,
            "report" => Self::Report {
                reported_id: frame.reported_id,
                reason: frame.reason,
            },
            "heartbeat" => Self::Heartbeat,
            _ => return Err(EventError::UnknownType(frame.kind)),
        })
    }

    /// Encode this event as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }

    /// Split a handshake event into its kind and payload.
    #[must_use]
    pub fn into_relay(self) -> Option<(RelayKind, Payload)> {
        match self {
            Self::Offer { payload } => Some((RelayKind::Offer, payload)),
            Self::Answer { payload } => Some((RelayKind::Answer, payload)),
            Self::Candidate { payload } => Some((RelayKind::Candidate, payload)),
            _ => None,
        }
    }
}

impl ServerEvent {
    /// Decode a server event from a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] for invalid JSON,
    /// [`EventError::UnknownType`] for an unrecognized `type`, and
    /// [`EventError::MissingField`] when a required field is absent.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let frame: ServerFrame = serde_json::from_str(text).map_err(EventError::Malformed)?;
        Ok(match frame.kind.as_str() {
            "welcome" => Self::Welcome {
                session_id: required(frame.session_id, "welcome", "sessionId")?,
            },
            "match" => Self::Match {
                initiator: required(frame.initiator, "match", "initiator")?,
                partner_id: required(frame.partner_id, "match", "partnerId")?,
            },
            "offer" => Self::Offer {
                payload: frame.payload.unwrap_or_default(),
            },
            "answer" => Self::Answer {
                payload: frame.payload.unwrap_or_default(),
            },
            "candidate" => Self::Candidate {
                payload: frame.payload.unwrap_or_default(),
            },
            "partnerLeft" => Self::PartnerLeft,
            "readyForNext" => Self::ReadyForNext,
            "matchTimeout" => Self::MatchTimeout {
                message: required(frame.message, "matchTimeout", "message")?,
            },
            "banned" => Self::Banned {
                message: required(frame.message, "banned", "message")?,
            },
            "reportAck" => Self::ReportAck {
                message: required(frame.message, "reportAck", "message")?,
            },
            _ => return Err(EventError::UnknownType(frame.kind)),
        })
    }

    /// Encode this event as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }

    /// Event name as it appears in the `type` field.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Match { .. } => "match",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::PartnerLeft => "partnerLeft",
            Self::ReadyForNext => "readyForNext",
            Self::MatchTimeout { .. } => "matchTimeout",
            Self::Banned { .. } => "banned",
            Self::ReportAck { .. } => "reportAck",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn payload(text: &str) -> Payload {
        Payload::from_json(text).unwrap()
    }

    #[test]
    fn parses_bare_client_events() {
        assert_eq!(
            ClientEvent::parse(r#"{"type":"findPartner"}"#).unwrap(),
            ClientEvent::FindPartner
        );
        assert_eq!(
            ClientEvent::parse(r#"{"type":"next"}"#).unwrap(),
            ClientEvent::Next
        );
        assert_eq!(
            ClientEvent::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientEvent::Heartbeat
        );
    }

    #[test]
    fn handshake_payload_is_kept_verbatim() {
        let text = r#"{"type":"offer","payload":{"sdp":"v=0\r\n","nested":[1,2,{"x":null}]}}"#;
        let event = ClientEvent::parse(text).unwrap();
        let (kind, payload) = event.into_relay().unwrap();
        assert_eq!(kind, RelayKind::Offer);
        assert_eq!(payload.as_str(), r#"{"sdp":"v=0\r\n","nested":[1,2,{"x":null}]}"#);
    }

    #[test]
    fn relayed_text_is_byte_identical() {
        // Unsorted keys, a number past u64, a float needing full precision,
        // escapes and inner whitespace
        let original = r#"{ "sdp":"v=0\r\n",  "big":123456789012345678901234567890, "f":0.30000000000000004, "a":"é" }"#;
        let inbound = format!(r#"{{"type":"offer","payload":{original}}}"#);

        let (kind, payload) = ClientEvent::parse(&inbound).unwrap().into_relay().unwrap();
        let outbound = kind.into_event(payload).to_json().unwrap();

        assert_eq!(outbound, format!(r#"{{"type":"offer","payload":{original}}}"#));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let event = ClientEvent::parse(r#"{"type":"candidate"}"#).unwrap();
        assert_eq!(event, ClientEvent::Candidate { payload: Payload::null() });
        assert_eq!(Payload::null().as_str(), "null");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let event = ClientEvent::parse(r#"{"type":"next","extra":[1,2]}"#).unwrap();
        assert_eq!(event, ClientEvent::Next);
    }

    #[test]
    fn report_fields_are_optional() {
        let bare = ClientEvent::parse(r#"{"type":"report"}"#).unwrap();
        assert_eq!(
            bare,
            ClientEvent::Report {
                reported_id: None,
                reason: None
            }
        );

        let full =
            ClientEvent::parse(r#"{"type":"report","reportedId":"abc","reason":"spam"}"#).unwrap();
        assert_eq!(
            full,
            ClientEvent::Report {
                reported_id: Some(SessionId::from("abc")),
                reason: Some("spam".to_string())
            }
        );
    }

    #[test]
    fn wrongly_typed_field_is_malformed() {
        let err = ClientEvent::parse(r#"{"type":"report","reason":42}"#).unwrap_err();
        assert!(matches!(err, EventError::Malformed(_)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ClientEvent::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, EventError::UnknownType(ref kind) if kind == "teleport"));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(
            ClientEvent::parse("hello"),
            Err(EventError::Malformed(_))
        ));
        assert!(ClientEvent::parse("").is_err());
        assert!(ClientEvent::parse(r#"{"no_type":true}"#).is_err());
    }

    #[test]
    fn match_event_uses_camel_case_fields() {
        let event = ServerEvent::Match {
            initiator: true,
            partner_id: SessionId::from("p1"),
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "match", "initiator": true, "partnerId": "p1"})
        );
    }

    #[test]
    fn unit_server_events_carry_only_type() {
        assert_eq!(
            ServerEvent::PartnerLeft.to_json().unwrap(),
            r#"{"type":"partnerLeft"}"#
        );
        assert_eq!(
            ServerEvent::ReadyForNext.to_json().unwrap(),
            r#"{"type":"readyForNext"}"#
        );
    }

    #[test]
    fn server_events_decode_what_they_encode() {
        let events = [
            ServerEvent::Welcome {
                session_id: SessionId::from("a"),
            },
            ServerEvent::Match {
                initiator: false,
                partner_id: SessionId::from("b"),
            },
            ServerEvent::PartnerLeft,
            ServerEvent::MatchTimeout {
                message: "x".into(),
            },
            ServerEvent::ReportAck {
                message: "x".into(),
            },
            ServerEvent::Candidate {
                payload: payload("1"),
            },
        ];
        for event in events {
            let text = event.to_json().unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], event.name());
            assert_eq!(ServerEvent::parse(&text).unwrap(), event);
        }
    }

    #[test]
    fn server_event_missing_field_is_reported() {
        let err = ServerEvent::parse(r#"{"type":"match","initiator":true}"#).unwrap_err();
        assert!(matches!(
            err,
            EventError::MissingField {
                event: "match",
                field: "partnerId"
            }
        ));
    }

    #[test]
    fn relay_kind_wraps_matching_event() {
        let candidate = payload(r#"{"candidate":"a=1"}"#);
        assert_eq!(
            RelayKind::Answer.into_event(candidate.clone()),
            ServerEvent::Answer {
                payload: candidate.clone()
            }
        );
        assert_eq!(
            RelayKind::Candidate.into_event(candidate.clone()),
            ServerEvent::Candidate { payload: candidate }
        );
    }

    #[test]
    fn payload_from_value_and_trimming() {
        let built = Payload::from_value(&json!({"sdp": "x"})).unwrap();
        assert_eq!(built.as_str(), r#"{"sdp":"x"}"#);
        assert_eq!(payload("  [1, 2]\n").as_str(), "[1, 2]");
        assert!(Payload::from_json("{").is_err());
        assert!(Payload::from_json("1 2").is_err());
    }

    #[test]
    fn non_handshake_events_have_no_relay_form() {
        assert!(ClientEvent::FindPartner.into_relay().is_none());
        assert!(ClientEvent::Heartbeat.into_relay().is_none());
    }
}
