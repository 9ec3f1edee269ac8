use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::codes::is_valid_code;

pub const STATUS_PAIRED: i32 = 0;
pub const STATUS_NOT_FOUND: i32 = 404;
pub const ERR_CODE_EXHAUSTED: i32 = -1;
pub const CODE_EXHAUSTED_MSG: &str = "Init code fail";

/// Replies the relay itself originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Code { code: String },
    Status { code: i32 },
    Err { data: i32, msg: String },
}

impl ServerMessage {
    pub fn code_exhausted() -> Self {
        ServerMessage::Err {
            data: ERR_CODE_EXHAUSTED,
            msg: CODE_EXHAUSTED_MSG.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Send,
    Receive { code: String },
    /// Anything else; forwarded verbatim to the partner.
    Relay,
}

#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("malformed json: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
    #[error("pairing code must be four digits")]
    InvalidCode,
    #[error("relay message from an unpaired peer")]
    Unpaired,
}

impl ProtocolViolation {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolViolation::MalformedJson(_) => "malformed_json",
            ProtocolViolation::NotUtf8 => "not_utf8",
            ProtocolViolation::InvalidCode => "invalid_code",
            ProtocolViolation::Unpaired => "unpaired",
        }
    }
}

pub fn classify(text: &str) -> Result<Inbound, ProtocolViolation> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some("send") => Ok(Inbound::Send),
        Some("receive") | Some("recive") => {
            let code = value
                .get("code")
                .and_then(Value::as_str)
                .filter(|code| is_valid_code(code))
                .ok_or(ProtocolViolation::InvalidCode)?;
            Ok(Inbound::Receive {
                code: code.to_string(),
            })
        }
        _ => Ok(Inbound::Relay),
    }
}
