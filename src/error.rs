use std::fmt;

use crate::frame::ProtocolError;
use crate::handshake::HandshakeError;

/// Typed fault kinds for the session surface (spec §7).
///
/// Lower-level errors are wrapped here with the operation context
/// (command, seqno) added by the session; nothing is swallowed except
/// the one documented benign case: a non-JSON or empty `CONTROL` reply,
/// which `DeviceSession::set_value` treats as success.
#[derive(Debug)]
pub enum SessionError {
    Json { context: String, source: serde_json::Error },
    Connect(std::io::Error),
    Timeout { op: &'static str },
    Range(String),
    BadFrame(ProtocolError),
    Offline { attempts: u32 },
    UnknownState { expected_cmd: u32, got_cmd: u32 },
    UnsupportedOp { dialect: String, cmd: &'static str },
    DialectMismatch,
    AuthFailure(String),
    BadParams(String),
    KeyOrVersion,
    Cancelled,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Json { context, source } => {
                write!(f, "Invalid JSON Response from Device ({context}): {source}")
            }
            SessionError::Connect(e) => write!(f, "Network Error: Unable to Connect: {e}"),
            SessionError::Timeout { op } => write!(f, "Timeout Waiting for Device during {op}"),
            SessionError::Range(msg) => write!(f, "Specified Value Out of Range: {msg}"),
            SessionError::BadFrame(e) => write!(f, "Unexpected Payload from Device: {e}"),
            SessionError::Offline { attempts } => {
                write!(f, "Network Error: Device Unreachable after {attempts} attempt(s)")
            }
            SessionError::UnknownState { expected_cmd, got_cmd } => write!(
                f,
                "Device in Unknown State: expected cmd {expected_cmd}, got {got_cmd}"
            ),
            SessionError::UnsupportedOp { dialect, cmd } => {
                write!(f, "Function Not Supported by Device: dialect {dialect} has no template for {cmd}")
            }
            SessionError::DialectMismatch => {
                write!(f, "Device22 Detected: Retry Command with the device22 dialect")
            }
            SessionError::AuthFailure(msg) => write!(f, "Check device key or version: {msg}"),
            SessionError::BadParams(msg) => write!(f, "Missing Function Parameters: {msg}"),
            SessionError::KeyOrVersion => write!(f, "Check device key or version"),
            SessionError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Connect(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::BadFrame(e)
    }
}

impl From<HandshakeError> for SessionError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::AuthFailure(msg) => SessionError::AuthFailure(msg),
            HandshakeError::UnknownState { expected_cmd, got_cmd } => {
                SessionError::UnknownState { expected_cmd, got_cmd }
            }
            HandshakeError::Io(e) => SessionError::Connect(e),
            HandshakeError::Protocol(e) => SessionError::BadFrame(e),
            HandshakeError::Timeout => SessionError::Timeout { op: "handshake" },
        }
    }
}

impl SessionError {
    /// The short error code string used in the `{"Error","Err","Payload"}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Json { .. } => "900",
            SessionError::Connect(_) => "901",
            SessionError::Timeout { .. } => "902",
            SessionError::Range(_) => "903",
            SessionError::BadFrame(_) => "904",
            SessionError::Offline { .. } => "905",
            SessionError::UnknownState { .. } => "906",
            SessionError::UnsupportedOp { .. } => "907",
            SessionError::DialectMismatch => "908",
            SessionError::AuthFailure(_) => "914",
            SessionError::BadParams(_) => "912",
            SessionError::KeyOrVersion => "914",
            SessionError::Cancelled => "920",
        }
    }

    /// Build the exit/error envelope described in spec §6.
    pub fn to_error_envelope(&self, payload: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "Error": self.to_string(),
            "Err": self.code(),
            "Payload": payload,
        })
    }
}
