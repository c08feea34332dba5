//! AES-128-ECB (PKCS7), AES-128-GCM, MD5 and HMAC-SHA256 primitives (spec §4.1).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use aes_gcm::aead::{Aead, AeadCore, KeyInit as AeadKeyInit, OsRng, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::fmt;

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const GCM_NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

#[derive(Debug)]
pub enum CryptoError {
    BadPadding,
    AuthFailure,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::BadPadding => write!(f, "invalid PKCS7 padding"),
            CryptoError::AuthFailure => write!(f, "AES-GCM tag mismatch"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// PKCS7-pad `data` to the 16-byte block and ECB-encrypt it.
pub fn ecb_encrypt(key: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / 16 + 1) * 16;
    let mut buf = vec![0u8; padded_len];
    buf[..data.len()].copy_from_slice(data);

    Aes128EcbEnc::new(key.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, data.len())
        .expect("buffer is sized for PKCS7 padding")
        .to_vec()
}

/// Inverse of [`ecb_encrypt`]. Fails with `BadPadding` if the trailing
/// byte is 0, exceeds 16, or doesn't match the expected padding run.
pub fn ecb_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut buf = data.to_vec();
    Aes128EcbDec::new(key.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map(|out| out.to_vec())
        .map_err(|_| CryptoError::BadPadding)
}

/// AES-128-GCM encrypt. Returns `(ciphertext, tag)`, tag always 16 bytes.
pub fn gcm_encrypt(
    key: &[u8; 16],
    nonce: &[u8; GCM_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> (Vec<u8>, [u8; GCM_TAG_LEN]) {
    let cipher = Aes128Gcm::new(key.into());
    let mut out = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .expect("GCM encryption with a 12-byte nonce cannot fail");
    let tag_bytes = out.split_off(out.len() - GCM_TAG_LEN);
    let mut tag = [0u8; GCM_TAG_LEN];
    tag.copy_from_slice(&tag_bytes);
    (out, tag)
}

/// AES-128-GCM decrypt. Fails with `AuthFailure` on tag mismatch.
pub fn gcm_decrypt(
    key: &[u8; 16],
    nonce: &[u8; GCM_NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.into());
    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::AuthFailure)
}

/// Generate a random 12-byte GCM nonce.
pub fn random_gcm_nonce() -> [u8; GCM_NONCE_LEN] {
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let mut out = [0u8; GCM_NONCE_LEN];
    out.copy_from_slice(&nonce);
    out
}

/// Generate `N` random bytes (used for handshake client nonces).
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecb_roundtrip() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let plaintext = b"hello tuya world";

        let encrypted = ecb_encrypt(&key, plaintext);
        let decrypted = ecb_decrypt(&key, &encrypted).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn ecb_bad_padding_is_detected() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let mut garbage = vec![0u8; 16];
        garbage[15] = 17; // padding byte > block size
        assert!(matches!(ecb_decrypt(&key, &garbage), Err(CryptoError::BadPadding)));
    }

    #[test]
    fn gcm_roundtrip() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let nonce = random_gcm_nonce();
        let aad = b"header bytes";
        let plaintext = b"{\"dps\":{\"1\":true}}";

        let (ciphertext, tag) = gcm_encrypt(&key, &nonce, plaintext, aad);
        let decrypted = gcm_decrypt(&key, &nonce, &ciphertext, &tag, aad).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn gcm_tag_mismatch_is_auth_failure() {
        let key: [u8; 16] = *b"0123456789abcdef";
        let nonce = random_gcm_nonce();
        let (ciphertext, mut tag) = gcm_encrypt(&key, &nonce, b"payload", b"aad");
        tag[0] ^= 0xff;
        assert!(matches!(
            gcm_decrypt(&key, &nonce, &ciphertext, &tag, b"aad"),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn md5_known_vector() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let digest = md5(b"");
        assert_eq!(hex(&digest), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn discovery_static_key_derivation() {
        let key = md5(b"yGAdlopoPVldABfn");
        assert_eq!(key.len(), 16);
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
