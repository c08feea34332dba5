//! Frame codec: 55AA frames (v3.3/v3.4) and 6699 frames (v3.5) (spec §3, §4.2).

use std::fmt;

use crate::crypto::{self, CryptoError, GCM_NONCE_LEN, GCM_TAG_LEN};

pub const PREFIX_55AA: u32 = 0x0000_55AA;
pub const SUFFIX_55AA: u32 = 0x0000_AA55;
pub const PREFIX_6699: u32 = 0x0000_6699;
pub const SUFFIX_6699: u32 = 0x0000_9966;

pub const HEADER_SIZE: usize = 16; // prefix(4) + seqno(4) + cmd(4) + length(4)
pub const CRC_SIZE: usize = 4;
pub const SUFFIX_SIZE: usize = 4;
pub const FOOTER_SIZE_55AA: usize = CRC_SIZE + SUFFIX_SIZE;
pub const RETCODE_SIZE: usize = 4;

/// Defensive upper bound on frame size (spec §6).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const VERSION_HEADER_LEN: usize = 15; // 3 version bytes + 12 reserved zero bytes
pub const VERSION_33: &[u8; 3] = b"3.3";
pub const VERSION_34: &[u8; 3] = b"3.4";

/// Command codes the core must handle (spec §3).
pub const CMD_SESS_KEY_NEG_START: u32 = 3;
pub const CMD_SESS_KEY_NEG_RESP: u32 = 4;
pub const CMD_SESS_KEY_NEG_FINISH: u32 = 5;
pub const CMD_CONTROL: u32 = 7;
pub const CMD_STATUS: u32 = 8;
pub const CMD_HEART_BEAT: u32 = 9;
pub const CMD_DP_QUERY: u32 = 10;
pub const CMD_CONTROL_NEW: u32 = 13;
pub const CMD_DP_QUERY_NEW: u32 = 16;
pub const CMD_UDP_NEW: u32 = 19;
pub const CMD_BOARDCAST_LPV34: u32 = 35;

#[derive(Debug)]
pub enum ProtocolError {
    ShortFrame,
    BadFrame { what: &'static str, value: u32 },
    FrameTooLarge(usize),
    Crypto(CryptoError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ShortFrame => write!(f, "truncated frame buffer"),
            ProtocolError::BadFrame { what, value } => {
                write!(f, "bad frame: invalid {what} {value:#010x}")
            }
            ProtocolError::FrameTooLarge(n) => write!(f, "implausible frame length {n}"),
            ProtocolError::Crypto(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        ProtocolError::Crypto(e)
    }
}

/// Whether a decoded frame's integrity could be verified, and how
/// (spec §9: 6699 frames have no CRC, so this is not a plain bool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    CrcMismatch,
    /// No integrity mechanism was checked for this frame (e.g. the
    /// payload was returned undecrypted because the key was wrong).
    Unverified,
}

/// A decoded frame, common to both wire formats.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seqno: u32,
    pub cmd: u32,
    pub retcode: u32,
    /// Decrypted (or, on failed decrypt, still-encrypted) body bytes.
    pub payload: Vec<u8>,
    pub integrity: Integrity,
    /// Set when `decrypt` was requested but ECB/GCM decryption failed;
    /// `payload` then holds the raw (still-encrypted) bytes.
    pub crypto_failed: bool,
}

// ---- 55AA (v3.3 / v3.4) ----

/// Build a 55AA frame. When `encrypt` is true, the v3.x header
/// (`"3.3"` + 12 reserved zero bytes) is prepended in the clear before
/// the ECB-encrypted payload; when false the payload is emitted
/// verbatim (used for plaintext handshake frames).
pub fn pack_55aa(seqno: u32, cmd: u32, payload: &[u8], key: &[u8; 16], encrypt: bool) -> Vec<u8> {
    let body = if encrypt {
        let encrypted = crypto::ecb_encrypt(key, payload);
        let mut buf = Vec::with_capacity(VERSION_HEADER_LEN + encrypted.len());
        buf.extend_from_slice(VERSION_33);
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&encrypted);
        buf
    } else {
        payload.to_vec()
    };

    let length = (body.len() + FOOTER_SIZE_55AA) as u32;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE_55AA);
    frame.extend_from_slice(&PREFIX_55AA.to_be_bytes());
    frame.extend_from_slice(&seqno.to_be_bytes());
    frame.extend_from_slice(&cmd.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);

    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&SUFFIX_55AA.to_be_bytes());

    frame
}

/// Parse a 55AA frame. Prefix/suffix mismatches fail with `BadFrame`;
/// CRC mismatches are reported via `Integrity::CrcMismatch` but the
/// frame is still decoded (spec §3 invariant).
pub fn unpack_55aa(data: &[u8], key: &[u8; 16], decrypt: bool) -> Result<Frame, ProtocolError> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE_55AA {
        return Err(ProtocolError::ShortFrame);
    }

    let prefix = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if prefix != PREFIX_55AA {
        return Err(ProtocolError::BadFrame { what: "prefix", value: prefix });
    }

    let seqno = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let cmd = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let length = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if length < FOOTER_SIZE_55AA {
        return Err(ProtocolError::ShortFrame);
    }

    let total_size = HEADER_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::ShortFrame);
    }

    let suffix_offset = total_size - SUFFIX_SIZE;
    let suffix = u32::from_be_bytes([
        data[suffix_offset],
        data[suffix_offset + 1],
        data[suffix_offset + 2],
        data[suffix_offset + 3],
    ]);
    if suffix != SUFFIX_55AA {
        return Err(ProtocolError::BadFrame { what: "suffix", value: suffix });
    }

    let crc_offset = suffix_offset - CRC_SIZE;
    let expected_crc = u32::from_be_bytes([
        data[crc_offset],
        data[crc_offset + 1],
        data[crc_offset + 2],
        data[crc_offset + 3],
    ]);
    let actual_crc = crc32fast::hash(&data[..crc_offset]);
    let integrity = if expected_crc == actual_crc {
        Integrity::Ok
    } else {
        Integrity::CrcMismatch
    };

    let body = &data[HEADER_SIZE..crc_offset];

    if body.is_empty() {
        return Ok(Frame { seqno, cmd, retcode: 0, payload: Vec::new(), integrity, crypto_failed: false });
    }

    if !decrypt {
        return Ok(Frame {
            seqno,
            cmd,
            retcode: 0,
            payload: body.to_vec(),
            integrity,
            crypto_failed: false,
        });
    }

    let ciphertext = if body.len() >= VERSION_HEADER_LEN
        && (&body[..3] == VERSION_33 || &body[..3] == VERSION_34)
    {
        &body[VERSION_HEADER_LEN..]
    } else {
        body
    };

    match crypto::ecb_decrypt(key, ciphertext) {
        Ok(payload) => Ok(Frame { seqno, cmd, retcode: 0, payload, integrity, crypto_failed: false }),
        Err(_) => Ok(Frame {
            seqno,
            cmd,
            retcode: 0,
            payload: ciphertext.to_vec(),
            integrity,
            crypto_failed: true,
        }),
    }
}

// ---- 6699 (v3.5) ----

/// Build a 6699 frame. AAD fed to GCM is the 14-byte block
/// `reserved(2=0) ‖ seqno(4) ‖ cmd(4) ‖ length(4)`.
pub fn pack_6699(seqno: u32, cmd: u32, plaintext: &[u8], session_key: &[u8; 16]) -> Vec<u8> {
    let nonce = crypto::random_gcm_nonce();
    let length = (GCM_NONCE_LEN + plaintext.len() + GCM_TAG_LEN) as u32;

    let mut aad = Vec::with_capacity(14);
    aad.extend_from_slice(&[0u8; 2]);
    aad.extend_from_slice(&seqno.to_be_bytes());
    aad.extend_from_slice(&cmd.to_be_bytes());
    aad.extend_from_slice(&length.to_be_bytes());

    let (ciphertext, tag) = crypto::gcm_encrypt(session_key, &nonce, plaintext, &aad);

    let mut frame = Vec::with_capacity(4 + aad.len() + nonce.len() + ciphertext.len() + tag.len() + 4);
    frame.extend_from_slice(&PREFIX_6699.to_be_bytes());
    frame.extend_from_slice(&aad); // reserved(2) ‖ seqno(4) ‖ cmd(4) ‖ length(4)
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(&SUFFIX_6699.to_be_bytes());

    frame
}

/// Parse a 6699 frame. Integrity comes entirely from the GCM tag —
/// there is no CRC32 field in this format.
pub fn unpack_6699(data: &[u8], session_key: &[u8; 16]) -> Result<Frame, ProtocolError> {
    // prefix(4) + reserved(2) + seqno(4) + cmd(4) + length(4) + iv(12) + ct + tag(16) + suffix(4)
    const FIXED: usize = 4 + 2 + 4 + 4 + 4 + GCM_NONCE_LEN + GCM_TAG_LEN + 4;
    if data.len() < FIXED {
        return Err(ProtocolError::ShortFrame);
    }

    let prefix = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if prefix != PREFIX_6699 {
        return Err(ProtocolError::BadFrame { what: "prefix", value: prefix });
    }

    let reserved = &data[4..6];
    let seqno = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
    let cmd = u32::from_be_bytes([data[10], data[11], data[12], data[13]]);
    let length = u32::from_be_bytes([data[14], data[15], data[16], data[17]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    if length < GCM_NONCE_LEN + GCM_TAG_LEN {
        return Err(ProtocolError::ShortFrame);
    }

    let total_size = 18 + length + 4; // header-up-to-length(18) + (iv+ct+tag) + suffix
    if data.len() < total_size {
        return Err(ProtocolError::ShortFrame);
    }

    let suffix_offset = total_size - 4;
    let suffix = u32::from_be_bytes([
        data[suffix_offset],
        data[suffix_offset + 1],
        data[suffix_offset + 2],
        data[suffix_offset + 3],
    ]);
    if suffix != SUFFIX_6699 {
        return Err(ProtocolError::BadFrame { what: "suffix", value: suffix });
    }

    let iv_start = 18;
    let iv = &data[iv_start..iv_start + GCM_NONCE_LEN];
    let ct_start = iv_start + GCM_NONCE_LEN;
    let ct_end = suffix_offset - GCM_TAG_LEN;
    let ciphertext = &data[ct_start..ct_end];
    let tag = &data[ct_end..suffix_offset];

    let mut aad = Vec::with_capacity(14);
    aad.extend_from_slice(reserved);
    aad.extend_from_slice(&seqno.to_be_bytes());
    aad.extend_from_slice(&cmd.to_be_bytes());
    aad.extend_from_slice(&(length as u32).to_be_bytes());

    let mut nonce = [0u8; GCM_NONCE_LEN];
    nonce.copy_from_slice(iv);
    let mut tag_arr = [0u8; GCM_TAG_LEN];
    tag_arr.copy_from_slice(tag);

    match crypto::gcm_decrypt(session_key, &nonce, ciphertext, &tag_arr, &aad) {
        Ok(plaintext) => {
            if plaintext.len() < RETCODE_SIZE {
                return Err(ProtocolError::ShortFrame);
            }
            let retcode = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
            Ok(Frame {
                seqno,
                cmd,
                retcode,
                payload: plaintext[RETCODE_SIZE..].to_vec(),
                integrity: Integrity::Ok,
                crypto_failed: false,
            })
        }
        Err(_) => Ok(Frame {
            seqno,
            cmd,
            retcode: 0,
            payload: ciphertext.to_vec(),
            integrity: Integrity::Unverified,
            crypto_failed: true,
        }),
    }
}
