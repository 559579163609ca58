use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound message/event from the messaging webhook.
///
/// Webhook verification, dedup and transport retries happen before this type
/// is constructed; the engine only sees events already in receipt order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InboundEvent {
    pub contact_id: String,
    /// Plain-text body, if the event carries one. Trigger matching and
    /// question answers read this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Raw provider payload, recorded verbatim into execution history.
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(contact_id: impl Into<String>, text: Option<String>, payload: Value) -> Self {
        Self {
            contact_id: contact_id.into(),
            text,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for a plain text message.
    pub fn text(contact_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            contact_id: contact_id.into(),
            text: Some(text.clone()),
            payload: Value::String(text),
            timestamp: Utc::now(),
        }
    }

    /// The answer/trigger body: text if present, else the payload as a string.
    pub fn body(&self) -> String {
        match &self.text {
            Some(t) => t.clone(),
            None => match &self.payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// One instruction handed back to the caller for dispatch to the messaging
/// provider. The engine's job ends at producing the ordered effect list;
/// transport and retry are the caller's responsibility.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEffect {
    SendMessage {
        to: String,
        text: String,
    },
    SendMedia {
        to: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    TransferToHuman {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    SetVariableExternal {
        key: String,
        value: Value,
    },
}
