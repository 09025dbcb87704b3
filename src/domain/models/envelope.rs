//! Wire envelope carried over the messaging bus.
//!
//! Every cross-cell interaction is an [`Envelope`] published to one of the
//! per-cell subjects (`inbox`, `outbox`, `control`) or the events subject.
//! Envelopes are consumed at most once per durable consumer; the id is the
//! deduplication key on redelivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// A conversational message for the receiving cell's agentic loop.
    Message,
    /// An operational instruction (drain, pause) handled outside the loop.
    Control,
    /// A structured event record for downstream consumers.
    Event,
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Control => write!(f, "control"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// W3C trace context propagated across cell boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Build a context from raw trace and span ids with the sampled flag set.
    pub fn from_ids(trace_id: &str, span_id: &str) -> Self {
        Self {
            traceparent: format!("00-{trace_id}-{span_id}-01"),
            tracestate: None,
        }
    }

    /// Parse the `traceparent` header into `(trace_id, span_id)`.
    ///
    /// Only version `00` is understood. Returns `None` for malformed input
    /// rather than failing the message: a bad trace header must never block
    /// delivery.
    pub fn parse(&self) -> Option<(String, String)> {
        let mut parts = self.traceparent.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let _flags = parts.next()?;

        if version != "00" || trace_id.len() != 32 || span_id.len() != 16 {
            return None;
        }
        if !trace_id.chars().all(|c| c.is_ascii_hexdigit())
            || !span_id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        // All-zero ids are invalid per the W3C spec.
        if trace_id.chars().all(|c| c == '0') || span_id.chars().all(|c| c == '0') {
            return None;
        }
        Some((trace_id.to_string(), span_id.to_string()))
    }
}

/// The wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Opaque payload: either a bare string or an object.
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: EnvelopeType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            trace_id: None,
            trace_context: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a conversational message with a `{content}` payload.
    pub fn message(from: impl Into<String>, to: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            from,
            to,
            EnvelopeType::Message,
            serde_json::json!({ "content": content.into() }),
        )
    }

    /// Build a control envelope with a named action and optional arguments.
    pub fn control(from: impl Into<String>, to: impl Into<String>, action: &str, args: Value) -> Self {
        Self::new(
            from,
            to,
            EnvelopeType::Control,
            serde_json::json!({ "action": action, "args": args }),
        )
    }

    #[must_use]
    pub fn with_trace(mut self, ctx: TraceContext) -> Self {
        if let Some((trace_id, _)) = ctx.parse() {
            self.trace_id = Some(trace_id);
        }
        self.trace_context = Some(ctx);
        self
    }

    /// Extract the human-readable content from the payload.
    ///
    /// Accepts both the `{content: "..."}` object form and a bare string
    /// payload; anything else is rendered as compact JSON.
    pub fn content(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("content")
                .and_then(Value::as_str)
                .map_or_else(|| self.payload.to_string(), ToString::to_string),
            other => other.to_string(),
        }
    }

    /// The control action name, if this is a control envelope.
    pub fn control_action(&self) -> Option<&str> {
        if self.kind != EnvelopeType::Control {
            return None;
        }
        self.payload.get("action").and_then(Value::as_str)
    }
}

// ============================================================================
// Subjects & identifier validation
// ============================================================================

/// Maximum identifier length, matching the DNS-1123 label limit.
const MAX_IDENT_LEN: usize = 63;

/// Validate a cell name or namespace.
///
/// Must match `^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$`: lowercase alphanumerics
/// and dashes, starting with a letter, ending alphanumeric, at most 63
/// characters. No dots, no wildcards: identifiers are spliced into bus
/// subjects and must not alter subject semantics.
pub fn validate_identifier(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_IDENT_LEN {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    if bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
            return false;
        }
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Subject the cell consumes inbound envelopes from.
pub fn inbox_subject(namespace: &str, cell: &str) -> String {
    format!("cell.{namespace}.{cell}.inbox")
}

/// Subject the cell publishes responses to.
pub fn outbox_subject(namespace: &str, cell: &str) -> String {
    format!("cell.{namespace}.{cell}.outbox")
}

/// Subject carrying drain/pause control envelopes.
pub fn control_subject(namespace: &str, cell: &str) -> String {
    format!("cell.{namespace}.{cell}.control")
}

/// Subject carrying structured event records for this cell.
pub fn events_subject(namespace: &str, cell: &str) -> String {
    format!("cell.events.{namespace}.{cell}")
}

/// Wildcard subject matching every cell's events stream.
pub fn all_events_subject() -> String {
    "cell.events.>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::message("alice", "bob", "hello");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["payload"]["content"], "hello");
        assert!(json.get("traceId").is_none());

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.content(), "hello");
    }

    #[test]
    fn test_envelope_accepts_string_payload() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "from": "a",
            "to": "b",
            "type": "message",
            "payload": "plain text"
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.content(), "plain text");
    }

    #[test]
    fn test_traceparent_roundtrip() {
        let ctx = TraceContext::from_ids("4bf92f3577b34da6a3ce929d0e0e4736", "00f067aa0ba902b7");
        let (trace_id, span_id) = ctx.parse().unwrap();
        assert_eq!(trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(span_id, "00f067aa0ba902b7");
    }

    #[test]
    fn test_traceparent_rejects_malformed() {
        for bad in [
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-short-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "garbage",
        ] {
            let ctx = TraceContext { traceparent: bad.to_string(), tracestate: None };
            assert!(ctx.parse().is_none(), "accepted {bad}");
        }
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("worker-0"));
        assert!(validate_identifier("a"));
        assert!(validate_identifier("cell-a1"));
        assert!(!validate_identifier(""));
        assert!(!validate_identifier("Worker"));
        assert!(!validate_identifier("9abc"));
        assert!(!validate_identifier("a.b"));
        assert!(!validate_identifier("a-"));
        assert!(!validate_identifier("cell.*"));
        assert!(!validate_identifier(&"x".repeat(64)));
    }

    #[test]
    fn test_subject_layout() {
        assert_eq!(inbox_subject("prod", "worker-0"), "cell.prod.worker-0.inbox");
        assert_eq!(events_subject("prod", "worker-0"), "cell.events.prod.worker-0");
    }
}
