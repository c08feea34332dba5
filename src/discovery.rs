//! UDP broadcast discovery: passive beacon listener (spec §4.4).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::crypto;
use crate::frame;

const DISCOVERY_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";
const UDP_PORT_33: u16 = 6666;
const UDP_PORT_34: u16 = 6667;
const VERSION_HEADER_LEN: usize = 15; // 3 version bytes + 12 reserved zero bytes

#[derive(Debug)]
pub enum DiscoveryError {
    Io(std::io::Error),
    NotFound,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Io(e) => write!(f, "discovery socket error: {e}"),
            DiscoveryError::NotFound => write!(f, "device not found via discovery"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        DiscoveryError::Io(e)
    }
}

fn static_key() -> [u8; 16] {
    crypto::md5(DISCOVERY_KEY_SEED)
}

/// Decrypt one beacon datagram into its JSON body.
///
/// 1. If it starts with `{`, it's plaintext legacy JSON.
/// 2. Else if it carries the v3.x header marker, strip it and
///    ECB-decrypt with the static key.
/// 3. Else ECB-decrypt the whole buffer.
fn decrypt_beacon(msg: &[u8]) -> Option<serde_json::Value> {
    let key = static_key();

    let text: Vec<u8> = if msg.first() == Some(&b'{') {
        msg.to_vec()
    } else if msg.starts_with(frame::VERSION_33) || msg.starts_with(frame::VERSION_34) {
        // Version marker ("3.3"/"3.4" + 12 reserved bytes) in the clear,
        // followed by the ECB-encrypted body — not a framed 55AA packet.
        if msg.len() < VERSION_HEADER_LEN {
            return None;
        }
        crypto::ecb_decrypt(&key, &msg[VERSION_HEADER_LEN..]).ok()?
    } else {
        crypto::ecb_decrypt(&key, msg).ok()?
    };

    serde_json::from_slice(&text).ok()
}

/// Observations keyed by device id (`gwId`), retaining the latest
/// beacon seen per device.
#[derive(Default)]
pub struct DiscoveryTable {
    by_device_id: HashMap<String, serde_json::Value>,
}

impl DiscoveryTable {
    fn record(&mut self, beacon: serde_json::Value) {
        if let Some(gw_id) = beacon.get("gwId").and_then(|v| v.as_str()) {
            self.by_device_id.insert(gw_id.to_owned(), beacon);
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&serde_json::Value> {
        self.by_device_id.get(device_id)
    }
}

/// A running discovery listener bound to ports 6666 and 6667.
pub struct Discovery {
    table: Arc<Mutex<DiscoveryTable>>,
}

impl Discovery {
    /// Bind both discovery ports and start listening in the background.
    pub async fn start() -> Result<Self, DiscoveryError> {
        let table = Arc::new(Mutex::new(DiscoveryTable::default()));

        spawn_listener(UDP_PORT_33, table.clone()).await?;
        spawn_listener(UDP_PORT_34, table.clone()).await?;

        Ok(Discovery { table })
    }

    /// Look up a device by id, polling until `timeout` elapses.
    pub async fn find_device(
        &self,
        device_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(v) = self.table.lock().await.get(device_id) {
                return Ok(v.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DiscoveryError::NotFound);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn spawn_listener(port: u16, table: Arc<Mutex<DiscoveryTable>>) -> Result<(), DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    socket.set_broadcast(true)?;

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, addr)) => {
                    if let Some(mut beacon) = decrypt_beacon(&buf[..n]) {
                        if let serde_json::Value::Object(ref mut map) = beacon {
                            map.entry("ip").or_insert_with(|| serde_json::Value::String(addr.ip().to_string()));
                        }
                        tracing::debug!(port, ip = %addr.ip(), "received discovery beacon");
                        table.lock().await.record(beacon);
                    }
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "discovery socket read failed");
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_key_is_md5_of_documented_seed() {
        let key = static_key();
        assert_eq!(key.len(), 16);
        assert_eq!(key, crypto::md5(b"yGAdlopoPVldABfn"));
    }

    #[test]
    fn plaintext_beacon_is_parsed_directly() {
        let beacon = br#"{"ip":"192.168.1.50","gwId":"abc123","version":"3.3"}"#;
        let parsed = decrypt_beacon(beacon).unwrap();
        assert_eq!(parsed["gwId"], "abc123");
    }

    #[test]
    fn encrypted_beacon_roundtrip() {
        let key = static_key();
        let body = br#"{"ip":"192.168.1.51","gwId":"dev42","version":"3.3"}"#;
        let encrypted = crypto::ecb_encrypt(&key, body);

        let mut datagram = Vec::with_capacity(VERSION_HEADER_LEN + encrypted.len());
        datagram.extend_from_slice(frame::VERSION_33);
        datagram.extend_from_slice(&[0u8; 12]);
        datagram.extend_from_slice(&encrypted);

        let parsed = decrypt_beacon(&datagram).unwrap();
        assert_eq!(parsed["gwId"], "dev42");
        assert_eq!(parsed["ip"], "192.168.1.51");
    }

    #[tokio::test]
    async fn find_device_times_out_when_absent() {
        let table = DiscoveryTable::default();
        let discovery = Discovery { table: Arc::new(Mutex::new(table)) };
        let result = discovery.find_device("nonexistent", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DiscoveryError::NotFound)));
    }

    #[tokio::test]
    async fn find_device_returns_recorded_beacon() {
        let mut table = DiscoveryTable::default();
        table.record(serde_json::json!({"gwId": "dev1", "ip": "10.0.0.5"}));
        let discovery = Discovery { table: Arc::new(Mutex::new(table)) };

        let found = discovery.find_device("dev1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(found["ip"], "10.0.0.5");
    }
}
