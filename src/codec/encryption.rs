//! AES-GCM authenticated encryption
//!
//! Each message gets a fresh 12-byte nonce from `OsRng`. The 16-byte tag is
//! kept separate from the ciphertext so the frame can record both lengths.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BridgeError, DecodeError, Result};

/// Nonce length in bytes
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Cipher recorded in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    None,
    Aes128Gcm,
    Aes256Gcm,
}

impl EncryptionType {
    pub fn id(self) -> u8 {
        match self {
            EncryptionType::None => 0,
            EncryptionType::Aes128Gcm => 1,
            EncryptionType::Aes256Gcm => 2,
        }
    }

    pub fn from_id(id: u8) -> std::result::Result<Self, DecodeError> {
        match id {
            0 => Ok(EncryptionType::None),
            1 => Ok(EncryptionType::Aes128Gcm),
            2 => Ok(EncryptionType::Aes256Gcm),
            other => Err(DecodeError::UnknownEncryption(other)),
        }
    }

    /// Key length in bytes, `None` for no encryption
    pub fn key_len(self) -> Option<usize> {
        match self {
            EncryptionType::None => None,
            EncryptionType::Aes128Gcm => Some(16),
            EncryptionType::Aes256Gcm => Some(32),
        }
    }

    /// Name used in the text envelope
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionType::None => "none",
            EncryptionType::Aes128Gcm => "aes_128_gcm",
            EncryptionType::Aes256Gcm => "aes_256_gcm",
        }
    }
}

/// Output of [`encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

pub fn encrypt(kind: EncryptionType, key: &[u8], plaintext: &[u8]) -> Result<Sealed> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let sealed = match kind {
        EncryptionType::None => return Err(BridgeError::Encode("no cipher selected".to_string())),
        EncryptionType::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| BridgeError::Encode(format!("key init failed: {}", e)))?
            .encrypt(nonce, plaintext),
        EncryptionType::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| BridgeError::Encode(format!("key init failed: {}", e)))?
            .encrypt(nonce, plaintext),
    }
    .map_err(|e| BridgeError::Encode(format!("encrypt failed: {}", e)))?;

    // aes-gcm appends the tag to the ciphertext
    let split = sealed.len() - TAG_LEN;
    Ok(Sealed {
        iv: iv.to_vec(),
        ciphertext: sealed[..split].to_vec(),
        tag: sealed[split..].to_vec(),
    })
}

pub fn decrypt(kind: EncryptionType, key: &[u8], sealed: &Sealed) -> std::result::Result<Vec<u8>, DecodeError> {
    if kind.key_len() != Some(key.len()) {
        return Err(DecodeError::MissingKey);
    }
    if sealed.iv.len() != IV_LEN || sealed.tag.len() != TAG_LEN {
        return Err(DecodeError::Authentication);
    }

    let nonce = Nonce::from_slice(&sealed.iv);
    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    let opened = match kind {
        EncryptionType::None => return Err(DecodeError::MissingKey),
        EncryptionType::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|_| DecodeError::MissingKey)?
            .decrypt(nonce, combined.as_slice()),
        EncryptionType::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| DecodeError::MissingKey)?
            .decrypt(nonce, combined.as_slice()),
    };

    opened.map_err(|_| DecodeError::Authentication)
}

/// Generate a random key of `len` bytes
pub fn generate_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    OsRng.fill_bytes(&mut key);
    key
}

/// Load the device-bound key at `path`, creating it on first use.
///
/// The file holds the key as hex and is created readable by the owner only.
///
/// # Errors
///
/// Returns error if the file cannot be read or written, or holds a key of
/// the wrong length
pub fn load_or_create_key_file<P: AsRef<Path>>(path: P, len: usize) -> Result<Vec<u8>> {
    let path = path.as_ref();

    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let key = hex::decode(contents.trim())
            .map_err(|e| BridgeError::Encode(format!("key file {} is not hex: {}", path.display(), e)))?;
        if key.len() != len {
            return Err(BridgeError::Encode(format!(
                "key file {} holds {} bytes, expected {}",
                path.display(),
                key.len(),
                len
            )));
        }
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let key = generate_key(len);
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(hex::encode(&key).as_bytes())?;
    file.sync_all()?;

    info!("Created device key at {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt_both_ciphers() {
        for kind in [EncryptionType::Aes128Gcm, EncryptionType::Aes256Gcm] {
            let key = generate_key(kind.key_len().unwrap());
            let sealed = encrypt(kind, &key, b"frame payload").unwrap();

            assert_eq!(sealed.iv.len(), IV_LEN);
            assert_eq!(sealed.tag.len(), TAG_LEN);
            assert_eq!(decrypt(kind, &key, &sealed).unwrap(), b"frame payload");
        }
    }

    #[test]
    fn test_nonce_differs_per_message() {
        let key = generate_key(32);
        let a = encrypt(EncryptionType::Aes256Gcm, &key, b"same").unwrap();
        let b = encrypt(EncryptionType::Aes256Gcm, &key, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let key = generate_key(32);
        let mut sealed = encrypt(EncryptionType::Aes256Gcm, &key, b"payload").unwrap();
        sealed.ciphertext[0] ^= 0x01;

        assert_eq!(
            decrypt(EncryptionType::Aes256Gcm, &key, &sealed),
            Err(DecodeError::Authentication)
        );
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = encrypt(EncryptionType::Aes128Gcm, &generate_key(16), b"payload").unwrap();
        assert_eq!(
            decrypt(EncryptionType::Aes128Gcm, &generate_key(16), &sealed),
            Err(DecodeError::Authentication)
        );
    }

    #[test]
    fn test_key_length_mismatch_reports_missing_key() {
        let sealed = encrypt(EncryptionType::Aes128Gcm, &generate_key(16), b"payload").unwrap();
        assert_eq!(
            decrypt(EncryptionType::Aes128Gcm, &generate_key(32), &sealed),
            Err(DecodeError::MissingKey)
        );
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("device.key");

        let first = load_or_create_key_file(&path, 32).unwrap();
        let second = load_or_create_key_file(&path, 32).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_key_file_wrong_length_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.key");
        load_or_create_key_file(&path, 16).unwrap();

        assert!(load_or_create_key_file(&path, 32).is_err());
    }
}
