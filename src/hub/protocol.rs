// JSON hub protocol codec
// Records are JSON objects terminated by 0x1E; one transport frame may carry several.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, Result};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u8 = 1;
const TYPE_STREAM_ITEM: u8 = 2;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

/// Frame the client opens every connection with
pub fn handshake_request() -> String {
    let mut record = serde_json::json!({ "protocol": "json", "version": 1 }).to_string();
    record.push(RECORD_SEPARATOR);
    record
}

/// Check the server's handshake answer: `{}` or `{"error": "..."}`
pub fn parse_handshake_response(record: &str) -> Result<()> {
    let value: Value = serde_json::from_str(record)?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(RealtimeError::Transport(format!("handshake rejected: {}", error))),
        None => Ok(()),
    }
}

/// Split a transport frame into its non-empty records
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items and anything newer than this client knows about
    Unsupported(u8),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    pub fn invocation(invocation_id: Option<String>, target: &str, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id,
            target: target.to_string(),
            arguments,
        }
    }

    /// Encode as a single record, separator included
    pub fn encode(&self) -> Result<String> {
        let raw = match self {
            HubMessage::Invocation { invocation_id, target, arguments } => RawHubMessage {
                kind: TYPE_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..Default::default()
            },
            HubMessage::Completion { invocation_id, result, error } => RawHubMessage {
                kind: TYPE_COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..Default::default()
            },
            HubMessage::Ping => RawHubMessage {
                kind: TYPE_PING,
                ..Default::default()
            },
            HubMessage::Close { error, allow_reconnect } => RawHubMessage {
                kind: TYPE_CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..Default::default()
            },
            HubMessage::Unsupported(kind) => {
                return Err(RealtimeError::Protocol(format!(
                    "cannot encode message type {}",
                    kind
                )))
            }
        };
        let mut record = serde_json::to_string(&raw)?;
        record.push(RECORD_SEPARATOR);
        Ok(record)
    }

    /// Decode one record (without separator)
    pub fn decode(record: &str) -> Result<Self> {
        let raw: RawHubMessage = serde_json::from_str(record)?;
        match raw.kind {
            TYPE_INVOCATION => {
                let target = raw.target.ok_or_else(|| {
                    RealtimeError::Protocol("invocation without target".to_string())
                })?;
                Ok(HubMessage::Invocation {
                    invocation_id: raw.invocation_id,
                    target,
                    arguments: raw.arguments.unwrap_or_default(),
                })
            }
            TYPE_COMPLETION => {
                let invocation_id = raw.invocation_id.ok_or_else(|| {
                    RealtimeError::Protocol("completion without invocationId".to_string())
                })?;
                Ok(HubMessage::Completion {
                    invocation_id,
                    result: raw.result,
                    error: raw.error,
                })
            }
            TYPE_PING => Ok(HubMessage::Ping),
            TYPE_CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            TYPE_STREAM_ITEM => Ok(HubMessage::Unsupported(TYPE_STREAM_ITEM)),
            other => Ok(HubMessage::Unsupported(other)),
        }
    }
}
