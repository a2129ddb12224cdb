use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const AES_BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 16;

#[derive(Debug)]
pub enum CryptoError {
    KeyMissing,
    KeyTooShort(usize),
    EmptyInput,
    Base64(String),
    Cipher,
    Json(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyMissing => write!(f, "Push key not set"),
            CryptoError::KeyTooShort(n) => {
                write!(f, "Push key too short: {n} bytes, need {KEY_SIZE}")
            }
            CryptoError::EmptyInput => write!(f, "Nothing to encrypt or decrypt"),
            CryptoError::Base64(msg) => write!(f, "Invalid base64: {msg}"),
            CryptoError::Cipher => write!(f, "AES decryption failed"),
            CryptoError::Json(msg) => write!(f, "Invalid JSON after decrypt: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// The vendor firmware reuses the first 16 bytes of the push key as both
/// AES key and IV. Reproduced here for wire compatibility.
fn key_iv(push_key: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let raw = push_key.as_bytes();
    if raw.len() < KEY_SIZE {
        return Err(CryptoError::KeyTooShort(raw.len()));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&raw[..KEY_SIZE]);
    Ok(key)
}

/// Encrypt a JSON value into the base64 ciphertext form carried in the
/// packet payload's `data` field.
pub fn encrypt_data(push_key: &str, data: &serde_json::Value) -> Result<String, CryptoError> {
    if is_empty_value(data) {
        return Err(CryptoError::EmptyInput);
    }
    let key = key_iv(push_key)?;

    let plaintext = serde_json::to_vec(data).map_err(|e| CryptoError::Json(e.to_string()))?;

    // PKCS7 padded size: next multiple of 16
    let padded_len = (plaintext.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
    let mut buf = vec![0u8; padded_len];
    buf[..plaintext.len()].copy_from_slice(&plaintext);

    let encrypted = Aes128CbcEnc::new((&key).into(), (&key).into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .map_err(|_| CryptoError::Cipher)?;

    Ok(BASE64.encode(encrypted))
}

/// Decrypt a base64 `data` string back into its JSON value.
pub fn decrypt_data(push_key: &str, data: &str) -> Result<serde_json::Value, CryptoError> {
    if data.is_empty() {
        return Err(CryptoError::EmptyInput);
    }
    let key = key_iv(push_key)?;

    let mut buf = BASE64
        .decode(data)
        .map_err(|e| CryptoError::Base64(e.to_string()))?;

    let decrypted = Aes128CbcDec::new((&key).into(), (&key).into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::Cipher)?;

    serde_json::from_slice(decrypted).map_err(|e| CryptoError::Json(e.to_string()))
}

fn is_empty_value(data: &serde_json::Value) -> bool {
    match data {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = "0123456789ABCDEF";
        let data = json!({"battery": 42, "mode": "auto"});

        let encrypted = encrypt_data(key, &data).unwrap();
        let decrypted = decrypt_data(key, &encrypted).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn only_first_16_key_bytes_are_used() {
        let data = json!({"hello": "world"});

        let encrypted = encrypt_data("0123456789ABCDEF_extra", &data).unwrap();
        let decrypted = decrypt_data("0123456789ABCDEF_other_suffix", &encrypted).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn short_key_is_rejected() {
        let data = json!({"a": 1});
        assert!(matches!(
            encrypt_data("too-short", &data),
            Err(CryptoError::KeyTooShort(9))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        let key = "0123456789ABCDEF";
        assert!(matches!(
            encrypt_data(key, &json!({})),
            Err(CryptoError::EmptyInput)
        ));
        assert!(matches!(
            encrypt_data(key, &serde_json::Value::Null),
            Err(CryptoError::EmptyInput)
        ));
        assert!(matches!(decrypt_data(key, ""), Err(CryptoError::EmptyInput)));
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(matches!(
            decrypt_data("0123456789ABCDEF", "%%% not base64 %%%"),
            Err(CryptoError::Base64(_))
        ));
    }

    #[test]
    fn wrong_key_fails_cleanly() {
        let data = json!({"hello": "world"});
        let encrypted = encrypt_data("0123456789ABCDEF", &data).unwrap();

        // Wrong key: either the padding check fails or the plaintext is
        // garbage that does not parse as JSON. Both are errors, never junk.
        match decrypt_data("FEDCBA9876543210", &encrypted) {
            Err(CryptoError::Cipher) | Err(CryptoError::Json(_)) => {}
            other => panic!("expected decrypt failure, got {other:?}"),
        }
    }
}
