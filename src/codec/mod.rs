//! # Codec Module
//!
//! Compression and authenticated encryption of outbound payloads.
//!
//! An encoded payload is a self-describing [`WireFrame`] (all integers
//! big-endian):
//!
//! ```text
//! magic "TB" | version u8 | compression u8 | encryption u8 |
//! original_size u32 | compressed_size u32 | body
//! ```
//!
//! For unencrypted frames the body is the (possibly compressed) payload. For
//! encrypted frames it is `iv_len u8 | iv | ct_len u32 | ciphertext | tag_len u8 | tag`.
//!
//! JSON transports carry frames inside a text envelope:
//! `{"type":"encoded","encryption":"aes_256_gcm","frame":"<base64>"}`.
//!
//! Decoding fails closed. A frame that does not authenticate, does not
//! decompress, or does not match its declared sizes yields a [`DecodeError`]
//! and never any bytes.

pub mod compression;
pub mod encryption;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use compression::CompressionType;
pub use encryption::{EncryptionType, Sealed};

use crate::config::CodecConfig;
use crate::error::{BridgeError, DecodeError, Result};

/// Frame magic bytes
pub const MAGIC: [u8; 2] = *b"TB";

/// Frame format version
pub const FRAME_VERSION: u8 = 1;

/// Fixed header length before the body
pub const HEADER_LEN: usize = 13;

/// Largest payload a frame may declare
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Envelope `type` tag
pub const ENVELOPE_TYPE: &str = "encoded";

/// Frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Plain(Vec<u8>),
    Sealed(Sealed),
}

/// Self-describing encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub compression: CompressionType,
    pub encryption: EncryptionType,
    /// Plaintext length before compression
    pub original_size: u32,
    /// Length after compression, before encryption
    pub compressed_size: u32,
    pub body: FrameBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    encryption: EncryptionType,
    frame: String,
}

/// Bounds-checked reader over a frame
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], DecodeError> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(DecodeError::Truncated { needed: self.pos + n, available: self.data.len() });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> std::result::Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

impl WireFrame {
    /// Serialize to the binary layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.compressed_size as usize + 64);
        buf.put_slice(&MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.compression.id());
        buf.put_u8(self.encryption.id());
        buf.put_u32(self.original_size);
        buf.put_u32(self.compressed_size);

        match &self.body {
            FrameBody::Plain(bytes) => buf.put_slice(bytes),
            FrameBody::Sealed(sealed) => {
                buf.put_u8(sealed.iv.len() as u8);
                buf.put_slice(&sealed.iv);
                buf.put_u32(sealed.ciphertext.len() as u32);
                buf.put_slice(&sealed.ciphertext);
                buf.put_u8(sealed.tag.len() as u8);
                buf.put_slice(&sealed.tag);
            }
        }

        buf.to_vec()
    }

    /// Parse the binary layout without decrypting or decompressing
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` on truncation, bad magic, unknown version or
    /// algorithm ids, trailing bytes after a sealed body, or oversize headers
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);

        if cursor.take(2)? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = cursor.u8()?;
        if version != FRAME_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let compression = CompressionType::from_id(cursor.u8()?)?;
        let encryption = EncryptionType::from_id(cursor.u8()?)?;
        let original_size = cursor.u32()?;
        let compressed_size = cursor.u32()?;

        if original_size as usize > MAX_FRAME_SIZE || compressed_size as usize > MAX_FRAME_SIZE {
            return Err(DecodeError::SizeMismatch {
                expected: MAX_FRAME_SIZE,
                actual: original_size.max(compressed_size) as usize,
            });
        }

        let body = match encryption {
            EncryptionType::None => FrameBody::Plain(cursor.rest().to_vec()),
            _ => {
                let iv_len = cursor.u8()? as usize;
                let iv = cursor.take(iv_len)?.to_vec();
                let ct_len = cursor.u32()? as usize;
                let ciphertext = cursor.take(ct_len)?.to_vec();
                let tag_len = cursor.u8()? as usize;
                let tag = cursor.take(tag_len)?.to_vec();
                let trailing = cursor.rest().len();
                if trailing != 0 {
                    return Err(DecodeError::SizeMismatch { expected: bytes.len() - trailing, actual: bytes.len() });
                }
                FrameBody::Sealed(Sealed { iv, ciphertext, tag })
            }
        };

        Ok(WireFrame { compression, encryption, original_size, compressed_size, body })
    }

    /// Wrap in the JSON text envelope
    pub fn to_envelope(&self) -> Result<String> {
        let envelope = Envelope {
            kind: ENVELOPE_TYPE.to_string(),
            encryption: self.encryption,
            frame: BASE64.encode(self.to_bytes()),
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// Encoder/decoder for one side of the link
#[derive(Clone)]
pub struct Codec {
    compression: CompressionType,
    threshold: usize,
    encryption: EncryptionType,
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("compression", &self.compression)
            .field("threshold", &self.threshold)
            .field("encryption", &self.encryption)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl Codec {
    /// Build a codec from configuration
    ///
    /// The key comes from `key_hex` if set, otherwise from `key_file`
    /// (created on first use). A key is loaded whenever one is configured, so
    /// a receiver with `encryption = "none"` can still open sealed frames.
    ///
    /// # Errors
    ///
    /// Returns error if the key is malformed or the key file is unusable
    pub fn from_config(config: &CodecConfig) -> Result<Self> {
        let key_len = config.encryption.key_len().unwrap_or(32);

        let key = match (&config.key_hex, &config.key_file) {
            (Some(key_hex), _) => Some(
                hex::decode(key_hex).map_err(|e| BridgeError::Encode(format!("invalid key_hex: {}", e)))?,
            ),
            (None, Some(path)) => Some(encryption::load_or_create_key_file(path, key_len)?),
            (None, None) => None,
        };

        Ok(Self {
            compression: config.compression,
            threshold: config.compression_threshold,
            encryption: config.encryption,
            key,
        })
    }

    /// Codec that compresses and encrypts nothing
    pub fn plain() -> Self {
        Self {
            compression: CompressionType::None,
            threshold: usize::MAX,
            encryption: EncryptionType::None,
            key: None,
        }
    }

    pub fn new(compression: CompressionType, threshold: usize, encryption: EncryptionType, key: Option<Vec<u8>>) -> Self {
        Self { compression, threshold, encryption, key }
    }

    /// Replace the key at runtime, e.g. after a session key was agreed
    pub fn set_session_key(&mut self, key: Vec<u8>) {
        self.key = Some(key);
    }

    pub fn encryption(&self) -> EncryptionType {
        self.encryption
    }

    /// True when encoding would leave the payload untouched
    pub fn is_passthrough(&self) -> bool {
        self.compression == CompressionType::None && self.encryption == EncryptionType::None
    }

    /// Encode a plaintext payload into a frame
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Encode` if encryption is configured without a
    /// key of the right length, or the payload is too large for a frame
    pub fn encode(&self, plaintext: &[u8]) -> Result<WireFrame> {
        if plaintext.len() > MAX_FRAME_SIZE {
            return Err(BridgeError::Encode(format!("payload of {} bytes exceeds frame limit", plaintext.len())));
        }

        let (compression, compressed) = compression::compress_if_smaller(self.compression, self.threshold, plaintext);
        let compressed_size = compressed.len() as u32;

        let body = match self.encryption {
            EncryptionType::None => FrameBody::Plain(compressed),
            kind => {
                let key = self
                    .key
                    .as_deref()
                    .filter(|k| kind.key_len() == Some(k.len()))
                    .ok_or_else(|| BridgeError::Encode(format!("no {} key configured", kind.as_str())))?;
                FrameBody::Sealed(encryption::encrypt(kind, key, &compressed)?)
            }
        };

        debug!(
            "Encoded {} bytes -> {} bytes ({:?}, {:?})",
            plaintext.len(),
            compressed_size,
            compression,
            self.encryption
        );

        Ok(WireFrame {
            compression,
            encryption: self.encryption,
            original_size: plaintext.len() as u32,
            compressed_size,
            body,
        })
    }

    /// Encode and wrap in the JSON text envelope
    pub fn encode_envelope(&self, plaintext: &[u8]) -> Result<String> {
        self.encode(plaintext)?.to_envelope()
    }

    /// Decode a binary frame back to the plaintext
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` for any malformed, unauthenticated or
    /// inconsistent frame
    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<Vec<u8>, DecodeError> {
        let frame = WireFrame::parse(bytes)?;

        let compressed = match &frame.body {
            FrameBody::Plain(body) => body.clone(),
            FrameBody::Sealed(sealed) => {
                let key = self.key.as_deref().ok_or(DecodeError::MissingKey)?;
                encryption::decrypt(frame.encryption, key, sealed)?
            }
        };

        if compressed.len() != frame.compressed_size as usize {
            return Err(DecodeError::SizeMismatch {
                expected: frame.compressed_size as usize,
                actual: compressed.len(),
            });
        }

        let plaintext = compression::decompress(frame.compression, &compressed, frame.original_size as usize)?;

        if plaintext.len() != frame.original_size as usize {
            return Err(DecodeError::SizeMismatch {
                expected: frame.original_size as usize,
                actual: plaintext.len(),
            });
        }

        Ok(plaintext)
    }

    /// Decode a JSON text envelope
    pub fn decode_envelope(&self, text: &str) -> std::result::Result<Vec<u8>, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(|e| DecodeError::Envelope(e.to_string()))?;
        if envelope.kind != ENVELOPE_TYPE {
            return Err(DecodeError::Envelope(format!("unexpected type '{}'", envelope.kind)));
        }
        let bytes = BASE64
            .decode(envelope.frame.as_bytes())
            .map_err(|e| DecodeError::Envelope(e.to_string()))?;
        self.decode(&bytes)
    }
}
