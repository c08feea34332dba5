//! Session-key negotiator: the v3.4/v3.5 three-message handshake (spec §4.5).

use std::fmt;

use crate::crypto;
use crate::frame::{
    self, ProtocolError, CMD_SESS_KEY_NEG_FINISH, CMD_SESS_KEY_NEG_RESP, CMD_SESS_KEY_NEG_START,
};

#[derive(Debug)]
pub enum HandshakeError {
    AuthFailure(String),
    UnknownState { expected_cmd: u32, got_cmd: u32 },
    Io(std::io::Error),
    Protocol(ProtocolError),
    Timeout,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::AuthFailure(msg) => write!(f, "handshake auth failure: {msg}"),
            HandshakeError::UnknownState { expected_cmd, got_cmd } => {
                write!(f, "handshake step returned cmd {got_cmd}, expected {expected_cmd}")
            }
            HandshakeError::Io(e) => write!(f, "handshake I/O error: {e}"),
            HandshakeError::Protocol(e) => write!(f, "handshake frame error: {e}"),
            HandshakeError::Timeout => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

impl From<ProtocolError> for HandshakeError {
    fn from(e: ProtocolError) -> Self {
        HandshakeError::Protocol(e)
    }
}

/// Protocol version affects session-key derivation only; the three
/// wire messages themselves are identical across v3.4/v3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVersion {
    V34,
    V35,
}

/// Build the client's first handshake frame (`SESS_KEY_NEG_START`).
/// Returns the frame bytes to send and the 16-byte client nonce to
/// remember for the remaining steps.
pub fn build_start_frame(seqno: u32, local_key: &[u8; 16]) -> (Vec<u8>, [u8; 16]) {
    let client_nonce: [u8; 16] = crypto::random_bytes();
    let frame = frame::pack_55aa(seqno, CMD_SESS_KEY_NEG_START, &client_nonce, local_key, false);
    (frame, client_nonce)
}

/// Parse the device's response frame (`SESS_KEY_NEG_RESP`), verifying
/// the HMAC and returning the device nonce on success.
pub fn parse_resp_frame(
    data: &[u8],
    local_key: &[u8; 16],
    client_nonce: &[u8; 16],
) -> Result<[u8; 16], HandshakeError> {
    let parsed = frame::unpack_55aa(data, local_key, false)?;

    if parsed.cmd != CMD_SESS_KEY_NEG_RESP {
        return Err(HandshakeError::UnknownState {
            expected_cmd: CMD_SESS_KEY_NEG_RESP,
            got_cmd: parsed.cmd,
        });
    }
    if parsed.payload.len() < 48 {
        return Err(HandshakeError::AuthFailure("short SESS_KEY_NEG_RESP payload".into()));
    }

    let device_nonce: [u8; 16] = parsed.payload[0..16].try_into().unwrap();
    let hmac_from_device = &parsed.payload[16..48];

    let expected = crypto::hmac_sha256(local_key, client_nonce);
    if expected != hmac_from_device {
        return Err(HandshakeError::AuthFailure(
            "device HMAC over client_nonce did not verify".into(),
        ));
    }

    Ok(device_nonce)
}

/// Build the client's finishing frame (`SESS_KEY_NEG_FINISH`).
pub fn build_finish_frame(seqno: u32, local_key: &[u8; 16], device_nonce: &[u8; 16]) -> Vec<u8> {
    let hmac = crypto::hmac_sha256(local_key, device_nonce);
    frame::pack_55aa(seqno, CMD_SESS_KEY_NEG_FINISH, &hmac, local_key, false)
}

/// Derive the per-session AES key from the two nonces and the local
/// key. Differs by protocol version (spec §4.5).
///
/// The v3.5 branch slices bytes `[12..28)` of `(ciphertext ‖ tag)`.
/// This is unusual and undocumented upstream; it must be reproduced
/// bit-exactly rather than "cleaned up" (spec §9 Open Question) —
/// verify against real hardware before shipping a change here.
pub fn derive_session_key(
    version: HandshakeVersion,
    client_nonce: &[u8; 16],
    device_nonce: &[u8; 16],
    local_key: &[u8; 16],
) -> [u8; 16] {
    let mut xor = [0u8; 16];
    for i in 0..16 {
        xor[i] = client_nonce[i] ^ device_nonce[i];
    }

    match version {
        HandshakeVersion::V34 => {
            let encrypted = crypto::ecb_encrypt(local_key, &xor);
            let mut key = [0u8; 16];
            key.copy_from_slice(&encrypted[..16]);
            key
        }
        HandshakeVersion::V35 => {
            let mut nonce12 = [0u8; 12];
            nonce12.copy_from_slice(&client_nonce[..12]);
            let (ciphertext, tag) = crypto::gcm_encrypt(local_key, &nonce12, &xor, b"");

            let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
            combined.extend_from_slice(&ciphertext);
            combined.extend_from_slice(&tag);

            let mut key = [0u8; 16];
            key.copy_from_slice(&combined[12..28]);
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v34_session_key_derivation_is_deterministic() {
        // Scenario 3 from spec §8.
        let client_nonce: [u8; 16] =
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let device_nonce: [u8; 16] =
            [0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00];
        let local_key: [u8; 16] = *b"keykeykeykeykeyk";

        let xor: [u8; 16] = [0xff; 16];
        let expected_key = crypto::ecb_encrypt(&local_key, &xor);

        let key1 = derive_session_key(HandshakeVersion::V34, &client_nonce, &device_nonce, &local_key);
        let key2 = derive_session_key(HandshakeVersion::V34, &client_nonce, &device_nonce, &local_key);

        assert_eq!(key1, key2, "derivation must be deterministic given the same inputs");
        assert_eq!(&key1[..], &expected_key[..16]);
    }

    #[test]
    fn v35_session_key_derivation_is_deterministic() {
        let client_nonce: [u8; 16] = [1u8; 16];
        let device_nonce: [u8; 16] = [2u8; 16];
        let local_key: [u8; 16] = *b"0123456789abcdef";

        let key1 = derive_session_key(HandshakeVersion::V35, &client_nonce, &device_nonce, &local_key);
        let key2 = derive_session_key(HandshakeVersion::V35, &client_nonce, &device_nonce, &local_key);
        assert_eq!(key1, key2);
    }

    #[test]
    fn resp_frame_hmac_mismatch_is_auth_failure() {
        let local_key: [u8; 16] = *b"0123456789abcdef";
        let client_nonce: [u8; 16] = [9u8; 16];
        let device_nonce: [u8; 16] = [8u8; 16];

        let mut payload = Vec::new();
        payload.extend_from_slice(&device_nonce);
        payload.extend_from_slice(&[0u8; 32]); // wrong HMAC

        let frame = frame::pack_55aa(1, CMD_SESS_KEY_NEG_RESP, &payload, &local_key, false);
        let result = parse_resp_frame(&frame, &local_key, &client_nonce);
        assert!(matches!(result, Err(HandshakeError::AuthFailure(_))));
    }

    #[test]
    fn resp_frame_wrong_cmd_is_unknown_state() {
        let local_key: [u8; 16] = *b"0123456789abcdef";
        let client_nonce: [u8; 16] = [9u8; 16];

        let frame = frame::pack_55aa(1, CMD_SESS_KEY_NEG_START, &[0u8; 48], &local_key, false);
        let result = parse_resp_frame(&frame, &local_key, &client_nonce);
        assert!(matches!(result, Err(HandshakeError::UnknownState { .. })));
    }

    #[test]
    fn full_handshake_roundtrip_v34() {
        let local_key: [u8; 16] = *b"0123456789abcdef";

        let (start_frame, client_nonce) = build_start_frame(1, &local_key);
        let parsed_start = frame::unpack_55aa(&start_frame, &local_key, false).unwrap();
        assert_eq!(parsed_start.cmd, CMD_SESS_KEY_NEG_START);
        assert_eq!(&parsed_start.payload[..], &client_nonce[..]);

        // Simulate the device's response.
        let device_nonce: [u8; 16] = [0x42; 16];
        let device_hmac = crypto::hmac_sha256(&local_key, &client_nonce);
        let mut resp_payload = Vec::new();
        resp_payload.extend_from_slice(&device_nonce);
        resp_payload.extend_from_slice(&device_hmac);
        let resp_frame = frame::pack_55aa(1, CMD_SESS_KEY_NEG_RESP, &resp_payload, &local_key, false);

        let recovered_device_nonce = parse_resp_frame(&resp_frame, &local_key, &client_nonce).unwrap();
        assert_eq!(recovered_device_nonce, device_nonce);

        let finish_frame = build_finish_frame(2, &local_key, &recovered_device_nonce);
        let parsed_finish = frame::unpack_55aa(&finish_frame, &local_key, false).unwrap();
        assert_eq!(parsed_finish.cmd, CMD_SESS_KEY_NEG_FINISH);
        assert_eq!(&parsed_finish.payload[..], &crypto::hmac_sha256(&local_key, &device_nonce)[..]);

        let session_key =
            derive_session_key(HandshakeVersion::V34, &client_nonce, &recovered_device_nonce, &local_key);
        assert_eq!(session_key.len(), 16);
    }
}
