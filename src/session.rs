//! Device session: connect, handshake, send/receive, retry (spec §4.6, §6).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::{ProtocolVersion, SessionConfig};
use crate::discovery::Discovery;
use crate::error::SessionError;
use crate::frame::{self, Frame};
use crate::handshake::{self, HandshakeVersion};
use crate::payload::{self, CommandKind, Dialect};

const DEVICE_PORT: u16 = 6668;

/// A live connection to one device, holding whatever per-version key
/// material is needed to frame requests and responses.
pub struct DeviceSession {
    device_id: String,
    local_key: [u8; 16],
    address: Mutex<String>,
    protocol_version: ProtocolVersion,
    dialect: Dialect,
    connection_timeout: Duration,
    persist: bool,
    cid: Option<String>,
    seqno: AtomicU32,
    stream: Mutex<Option<TcpStream>>,
    session_key: Mutex<Option<[u8; 16]>>,
    discovery: Option<Arc<Discovery>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession").field("device_id", &self.device_id).finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Build a session from config. Discovery is wired in lazily — it's
    /// only started if `needs_discovery()` or a later connect fails to
    /// resolve a concrete address.
    pub fn new(config: SessionConfig, discovery: Option<Arc<Discovery>>) -> Self {
        let (dialect, known) = Dialect::parse(&config.dialect);
        if !known {
            tracing::warn!(dialect = %config.dialect, "UnknownDialect, falling back to default");
        }
        DeviceSession {
            device_id: config.device_id,
            local_key: config.local_key,
            address: Mutex::new(config.address),
            protocol_version: config.protocol_version,
            dialect,
            connection_timeout: config.connection_timeout,
            persist: config.persist,
            cid: config.cid,
            seqno: AtomicU32::new(1),
            stream: Mutex::new(None),
            session_key: Mutex::new(None),
            discovery,
        }
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve a concrete address, falling back to discovery when the
    /// configured address is an auto sentinel (spec §4.6).
    async fn resolve_address(&self) -> Result<String, SessionError> {
        {
            let addr = self.address.lock().await;
            if !crate::config::ADDRESS_AUTO_SENTINELS.contains(&addr.as_str()) {
                return Ok(addr.clone());
            }
        }

        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| SessionError::Range("no address configured and discovery is disabled".into()))?;

        let beacon = discovery
            .find_device(&self.device_id, self.connection_timeout)
            .await
            .map_err(|_| SessionError::Timeout { op: "discovery" })?;

        let ip = beacon
            .get("ip")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SessionError::Range("discovery beacon missing ip".into()))?
            .to_owned();

        *self.address.lock().await = ip.clone();
        Ok(ip)
    }

    /// Connect over TCP and, for v3.4/v3.5, run the session-key handshake.
    async fn connect(&self) -> Result<TcpStream, SessionError> {
        let address = self.resolve_address().await?;
        let addr = format!("{address}:{DEVICE_PORT}");

        let mut stream = tokio::time::timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Timeout { op: "connect" })?
            .map_err(SessionError::Connect)?;
        stream.set_nodelay(true).map_err(SessionError::Connect)?;

        tracing::info!(addr = %addr, device_id = %self.device_id, "connected to device");

        if self.protocol_version.requires_handshake() {
            let session_key = self.run_handshake(&mut stream).await?;
            *self.session_key.lock().await = Some(session_key);
        }

        Ok(stream)
    }

    async fn run_handshake(&self, stream: &mut TcpStream) -> Result<[u8; 16], SessionError> {
        let version = match self.protocol_version {
            ProtocolVersion::V34 => HandshakeVersion::V34,
            ProtocolVersion::V35 => HandshakeVersion::V35,
            ProtocolVersion::V33 => unreachable!("handshake only runs for v3.4/v3.5"),
        };

        let seqno = self.next_seqno();
        let (start_frame, client_nonce) = handshake::build_start_frame(seqno, &self.local_key);
        stream.write_all(&start_frame).await?;
        stream.flush().await?;

        let resp_bytes = read_raw_frame(stream, self.connection_timeout).await?;
        let device_nonce = handshake::parse_resp_frame(&resp_bytes, &self.local_key, &client_nonce)?;

        let finish_seqno = self.next_seqno();
        let finish_frame = handshake::build_finish_frame(finish_seqno, &self.local_key, &device_nonce);
        stream.write_all(&finish_frame).await?;
        stream.flush().await?;

        tracing::debug!(device_id = %self.device_id, "session-key handshake complete");

        Ok(handshake::derive_session_key(version, &client_nonce, &device_nonce, &self.local_key))
    }

    /// Ensure a stream exists, connecting (and handshaking) if needed.
    async fn ensure_connected(&self, slot: &mut Option<TcpStream>) -> Result<(), SessionError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        Ok(())
    }

    /// Send a command and wait for the matching response, retrying the
    /// connection once on failure (spec §4.6).
    async fn send_receive(&self, cmd: u32, payload: &[u8]) -> Result<Frame, SessionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.send_receive_once(cmd, payload).await {
                Ok(frame) => return Ok(frame),
                Err(_) if attempts < 2 => {
                    tracing::warn!(device_id = %self.device_id, attempt = attempts, "send/receive failed, reconnecting");
                    *self.stream.lock().await = None;
                    continue;
                }
                Err(_) => return Err(SessionError::Offline { attempts }),
            }
        }
    }

    async fn send_receive_once(&self, cmd: u32, payload: &[u8]) -> Result<Frame, SessionError> {
        let mut guard = self.stream.lock().await;
        self.ensure_connected(&mut *guard).await?;
        let stream = guard.as_mut().expect("just ensured connected");

        let seqno = self.next_seqno();

        let frame_bytes = match self.protocol_version {
            ProtocolVersion::V33 => frame::pack_55aa(seqno, cmd, payload, &self.local_key, true),
            ProtocolVersion::V34 => {
                let key = self.session_key.lock().await.ok_or(SessionError::KeyOrVersion)?;
                frame::pack_55aa(seqno, cmd, payload, &key, true)
            }
            ProtocolVersion::V35 => {
                let key = self.session_key.lock().await.ok_or(SessionError::KeyOrVersion)?;
                frame::pack_6699(seqno, cmd, payload, &key)
            }
        };

        stream.write_all(&frame_bytes).await?;
        stream.flush().await?;

        let raw = read_raw_frame(stream, self.connection_timeout).await?;

        let parsed = match self.protocol_version {
            ProtocolVersion::V33 | ProtocolVersion::V34 => {
                let key = match self.protocol_version {
                    ProtocolVersion::V33 => self.local_key,
                    _ => self.session_key.lock().await.ok_or(SessionError::KeyOrVersion)?,
                };
                frame::unpack_55aa(&raw, &key, true)?
            }
            ProtocolVersion::V35 => {
                let key = self.session_key.lock().await.ok_or(SessionError::KeyOrVersion)?;
                frame::unpack_6699(&raw, &key)?
            }
        };

        if !self.persist {
            *guard = None;
        }

        Ok(parsed)
    }

    fn build_payload(&self, kind: CommandKind, dps_writes: Option<&serde_json::Value>) -> Result<(Vec<u8>, u32), SessionError> {
        payload::build(self.dialect, &self.device_id, kind, dps_writes, self.cid.as_deref()).ok_or_else(|| {
            SessionError::UnsupportedOp { dialect: self.dialect.to_string(), cmd: kind_name(kind) }
        })
    }

    /// Query the device's current data points (`DP_QUERY`, or its
    /// `device22` override).
    pub async fn status(&self) -> Result<serde_json::Value, SessionError> {
        let (body, cmd) = self.build_payload(CommandKind::DpQuery, None)?;
        let frame = self.send_receive(cmd, &body).await?;
        parse_json_response(&frame.payload, "status")
    }

    /// Write a single data point.
    pub async fn set_value(&self, dp_id: impl ToString, value: serde_json::Value) -> Result<serde_json::Value, SessionError> {
        let dps = serde_json::json!({ dp_id.to_string(): value });
        let (body, cmd) = self.build_payload(CommandKind::Control, Some(&dps))?;
        let frame = self.send_receive(cmd, &body).await?;

        if frame.payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        match serde_json::from_slice(&frame.payload) {
            Ok(v) => Ok(v),
            // Devices commonly ack CONTROL with a non-JSON or empty body; treat as success.
            Err(_) => Ok(serde_json::Value::Null),
        }
    }

    pub async fn turn_on(&self, switch_dp: u32) -> Result<serde_json::Value, SessionError> {
        self.set_value(switch_dp, serde_json::Value::Bool(true)).await
    }

    pub async fn turn_off(&self, switch_dp: u32) -> Result<serde_json::Value, SessionError> {
        self.set_value(switch_dp, serde_json::Value::Bool(false)).await
    }

    pub async fn close(&self) {
        *self.stream.lock().await = None;
        *self.session_key.lock().await = None;
    }

    /// A handle scoped to one child device behind this session's gateway
    /// (spec §9 Design Notes): every request carries `cid` in the body,
    /// forwarded through the same connection as the parent.
    pub fn child(self: &Arc<Self>, cid: impl Into<String>) -> ChildHandle {
        ChildHandle { cid: cid.into(), parent: self.clone() }
    }
}

fn kind_name(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::DpQuery => "DP_QUERY",
        CommandKind::Control => "CONTROL",
        CommandKind::Status => "STATUS",
    }
}

fn parse_json_response(payload: &[u8], context: &str) -> Result<serde_json::Value, SessionError> {
    if payload.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(payload)
        .map_err(|source| SessionError::Json { context: context.to_owned(), source })
}

/// Read one length-prefixed frame off the wire, honoring the 16-byte
/// header used by both 55AA and 6699 formats.
async fn read_raw_frame(stream: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>, SessionError> {
    tokio::time::timeout(timeout, async {
        let mut header = [0u8; frame::HEADER_SIZE];
        stream.read_exact(&mut header).await?;

        let length = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
        if length > frame::MAX_FRAME_SIZE {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "implausible frame length"));
        }

        let mut rest = vec![0u8; length];
        stream.read_exact(&mut rest).await?;

        let mut full = Vec::with_capacity(frame::HEADER_SIZE + length);
        full.extend_from_slice(&header);
        full.extend_from_slice(&rest);
        Ok(full)
    })
    .await
    .map_err(|_| SessionError::Timeout { op: "read_frame" })?
    .map_err(SessionError::Connect)
}

/// A session scoped to a child device (`cid`) behind a gateway. Forwards
/// every call to the parent session with its `cid` attached.
pub struct ChildHandle {
    cid: String,
    parent: Arc<DeviceSession>,
}

impl ChildHandle {
    pub async fn status(&self) -> Result<serde_json::Value, SessionError> {
        let (body, cmd) =
            payload::build(self.parent.dialect, &self.parent.device_id, CommandKind::DpQuery, None, Some(&self.cid))
                .ok_or(SessionError::UnsupportedOp { dialect: self.parent.dialect.to_string(), cmd: "DP_QUERY" })?;
        let frame = self.parent.send_receive(cmd, &body).await?;
        parse_json_response(&frame.payload, "status")
    }

    pub async fn set_value(&self, dp_id: impl ToString, value: serde_json::Value) -> Result<serde_json::Value, SessionError> {
        let dps = serde_json::json!({ dp_id.to_string(): value });
        let (body, cmd) =
            payload::build(self.parent.dialect, &self.parent.device_id, CommandKind::Control, Some(&dps), Some(&self.cid))
                .ok_or(SessionError::UnsupportedOp { dialect: self.parent.dialect.to_string(), cmd: "CONTROL" })?;
        let frame = self.parent.send_receive(cmd, &body).await?;
        if frame.payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&frame.payload).unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(version: ProtocolVersion) -> SessionConfig {
        SessionConfig {
            device_id: "dev1".into(),
            local_key: *b"0123456789abcdef",
            address: "10.0.0.5".into(),
            protocol_version: version,
            dialect: "default".into(),
            connection_timeout: Duration::from_secs(1),
            persist: false,
            cid: None,
        }
    }

    #[tokio::test]
    async fn resolve_address_returns_concrete_address_without_discovery() {
        let session = DeviceSession::new(test_config(ProtocolVersion::V33), None);
        let addr = session.resolve_address().await.unwrap();
        assert_eq!(addr, "10.0.0.5");
    }

    #[tokio::test]
    async fn resolve_address_errors_without_discovery_when_auto() {
        let mut config = test_config(ProtocolVersion::V33);
        config.address = String::new();
        let session = DeviceSession::new(config, None);
        assert!(session.resolve_address().await.is_err());
    }

    #[test]
    fn build_payload_reports_unsupported_op_for_device22_status() {
        let mut config = test_config(ProtocolVersion::V33);
        config.dialect = "device22".into();
        let session = DeviceSession::new(config, None);
        let result = session.build_payload(CommandKind::Status, None);
        assert!(matches!(result, Err(SessionError::UnsupportedOp { .. })));
    }
}
