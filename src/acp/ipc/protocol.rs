// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control socket wire format.
//!
//! Each connection carries exactly one newline-delimited JSON command from
//! the producer, answered by one newline-delimited [`Ack`].

use serde::{Deserialize, Serialize};

/// Acknowledgement returned for every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Encode a message as a single JSON line.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from a JSON line.
pub fn decode<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::AcpCommand;

    #[test]
    fn test_encode_is_single_line() {
        let line = encode(&AcpCommand::prompt("fix the\nbug")).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let back: AcpCommand = decode(&line).unwrap();
        assert_eq!(back, AcpCommand::prompt("fix the\nbug"));
    }

    #[test]
    fn test_ack_format() {
        assert_eq!(encode(&Ack::ok()).unwrap(), "{\"ok\":true}\n");
        let err: Ack = decode(r#"{"ok":false,"error":"bad"}"#).unwrap();
        assert_eq!(err, Ack::error("bad"));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(decode::<AcpCommand>(r#"{"type":"reboot"}"#).is_err());
    }
}
