//! Message Codec (C2): encode/decode the control-plane `ControlMessage` to/from the
//! compact, self-describing JSON record the historical source speaks on the wire.
//!
//! Decoding is driven off a `serde_json::Value` rather than a derived `Deserialize`
//! impl so that a missing field and a wrongly-typed field surface as distinct
//! [`CodecError`] variants, matching `echowarp/models/json_message.py`'s manual
//! field-by-field extraction.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CodecError;

/// Fixed response-code/label pairs used throughout the control plane.
pub mod response_code {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const CONFLICT: u16 = 409;
    pub const LOCKED: u16 = 423;
}

const KNOWN_FIELDS: &[&str] = &[
    "message",
    "response_code",
    "comparability_version",
    "failed_connections",
    "reconnect_attempts",
    "config",
];

const KNOWN_CONFIG_FIELDS: &[&str] = &["is_encrypt", "is_integrity_control", "aes_key", "aes_iv"];

/// The `config` sub-record, present only in the server's authentication-success
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub is_encrypt: bool,
    pub is_integrity_control: bool,
    pub aes_key: String,
    pub aes_iv: String,
}

/// A single control-plane record (§3). Every field except `config` is always
/// present on the wire, `failed_connections`/`reconnect_attempts` serializing as
/// JSON `null` rather than being omitted when their value is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub message: String,
    pub response_code: u16,
    pub comparability_version: String,
    pub failed_connections: Option<u32>,
    pub reconnect_attempts: Option<u32>,
    pub config: Option<SessionConfig>,
}

impl ControlMessage {
    /// Builds a bare status message with no telemetry and no config.
    pub fn new(message: impl Into<String>, response_code: u16, version: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response_code,
            comparability_version: version.into(),
            failed_connections: None,
            reconnect_attempts: None,
            config: None,
        }
    }

    /// Status message carrying ledger telemetry but no `config`. `retry_budget <= 0`
    /// is encoded as unlimited (wire `null`), per `JSONMessage.encode_message_to_json_bytes`.
    pub fn encode_status(
        message: impl Into<String>,
        response_code: u16,
        version: impl Into<String>,
        failed_connections: u32,
        retry_budget: u32,
    ) -> Self {
        Self {
            message: message.into(),
            response_code,
            comparability_version: version.into(),
            failed_connections: Some(failed_connections),
            reconnect_attempts: if retry_budget == 0 {
                None
            } else {
                Some(retry_budget)
            },
            config: None,
        }
    }

    /// The server's authentication-success message: `200 OK` with an embedded
    /// `config` sub-record.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_auth_ok(
        version: impl Into<String>,
        is_encrypt: bool,
        is_integrity_control: bool,
        aes_key_b64: impl Into<String>,
        aes_iv_b64: impl Into<String>,
        failed_connections: u32,
        retry_budget: u32,
    ) -> Self {
        Self {
            message: "OK".to_string(),
            response_code: response_code::OK,
            comparability_version: version.into(),
            failed_connections: Some(failed_connections),
            reconnect_attempts: if retry_budget == 0 {
                None
            } else {
                Some(retry_budget)
            },
            config: Some(SessionConfig {
                is_encrypt,
                is_integrity_control,
                aes_key: aes_key_b64.into(),
                aes_iv: aes_iv_b64.into(),
            }),
        }
    }

    /// Serializes to the wire JSON byte form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut obj = json!({
            "message": self.message,
            "response_code": self.response_code,
            "comparability_version": self.comparability_version,
            "failed_connections": self.failed_connections,
            "reconnect_attempts": self.reconnect_attempts,
        });
        if let Some(config) = &self.config {
            obj["config"] = json!({
                "is_encrypt": config.is_encrypt,
                "is_integrity_control": config.is_integrity_control,
                "aes_key": config.aes_key,
                "aes_iv": config.aes_iv,
            });
        }
        Ok(serde_json::to_vec(&obj)?)
    }

    /// Decodes from the wire JSON byte form. Rejects unknown top-level or `config`
    /// fields (strict schema) and distinguishes a missing field from one of the
    /// wrong type.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let obj = value.as_object().ok_or(CodecError::Type("root"))?;

        for key in obj.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                return Err(CodecError::Type("root"));
            }
        }

        let message = field_str(obj, "message")?;
        let response_code = field_u16(obj, "response_code")?;
        let comparability_version = field_str(obj, "comparability_version")?;
        let failed_connections = optional_u32(obj, "failed_connections")?;
        let reconnect_attempts = optional_u32(obj, "reconnect_attempts")?;
        let config = match obj.get("config") {
            None => None,
            Some(Value::Null) => None,
            Some(v) => Some(decode_config(v)?),
        };

        Ok(Self {
            message,
            response_code,
            comparability_version,
            failed_connections,
            reconnect_attempts,
            config,
        })
    }
}

fn decode_config(value: &Value) -> Result<SessionConfig, CodecError> {
    let obj = value.as_object().ok_or(CodecError::Type("config"))?;
    for key in obj.keys() {
        if !KNOWN_CONFIG_FIELDS.contains(&key.as_str()) {
            return Err(CodecError::Type("config"));
        }
    }
    Ok(SessionConfig {
        is_encrypt: field_bool(obj, "is_encrypt")?,
        is_integrity_control: field_bool(obj, "is_integrity_control")?,
        aes_key: field_str(obj, "aes_key")?,
        aes_iv: field_str(obj, "aes_iv")?,
    })
}

fn field_str(obj: &serde_json::Map<String, Value>, name: &'static str) -> Result<String, CodecError> {
    obj.get(name)
        .ok_or(CodecError::Schema(name))?
        .as_str()
        .map(str::to_string)
        .ok_or(CodecError::Type(name))
}

fn field_bool(obj: &serde_json::Map<String, Value>, name: &'static str) -> Result<bool, CodecError> {
    obj.get(name)
        .ok_or(CodecError::Schema(name))?
        .as_bool()
        .ok_or(CodecError::Type(name))
}

fn field_u16(obj: &serde_json::Map<String, Value>, name: &'static str) -> Result<u16, CodecError> {
    let n = obj
        .get(name)
        .ok_or(CodecError::Schema(name))?
        .as_u64()
        .ok_or(CodecError::Type(name))?;
    u16::try_from(n).map_err(|_| CodecError::Type(name))
}

fn optional_u32(
    obj: &serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<Option<u32>, CodecError> {
    match obj.get(name) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v.as_u64().ok_or(CodecError::Type(name))?;
            Ok(Some(u32::try_from(n).map_err(|_| CodecError::Type(name))?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_status_message() {
        let msg = ControlMessage::encode_status("Accepted", response_code::ACCEPTED, "1", 2, 5);
        let bytes = msg.encode().unwrap();
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_auth_ok_with_config() {
        let msg = ControlMessage::encode_auth_ok("1", true, true, "a2V5", "aXY=", 0, 5);
        let bytes = msg.encode().unwrap();
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
        assert!(decoded.config.is_some());
    }

    #[test]
    fn retry_budget_zero_encodes_as_null_not_omitted() {
        let msg = ControlMessage::encode_status("Accepted", response_code::ACCEPTED, "1", 0, 0);
        let bytes = msg.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("reconnect_attempts").is_some());
        assert!(value.get("reconnect_attempts").unwrap().is_null());
    }

    #[test]
    fn config_absent_from_non_auth_messages() {
        let msg = ControlMessage::new("Accepted", response_code::ACCEPTED, "1");
        let bytes = msg.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("config").is_none());
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let bytes = br#"{"response_code":200,"comparability_version":"1","failed_connections":null,"reconnect_attempts":null}"#;
        let err = ControlMessage::decode(bytes).unwrap_err();
        assert!(matches!(err, CodecError::Schema("message")));
    }

    #[test]
    fn decode_rejects_wrong_type() {
        let bytes = br#"{"message":"OK","response_code":"200","comparability_version":"1","failed_connections":null,"reconnect_attempts":null}"#;
        let err = ControlMessage::decode(bytes).unwrap_err();
        assert!(matches!(err, CodecError::Type("response_code")));
    }

    #[test]
    fn decode_rejects_unknown_field() {
        let bytes = br#"{"message":"OK","response_code":200,"comparability_version":"1","failed_connections":null,"reconnect_attempts":null,"bogus":1}"#;
        let err = ControlMessage::decode(bytes).unwrap_err();
        assert!(matches!(err, CodecError::Type("root")));
    }
}
