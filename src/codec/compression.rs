//! Threshold compression with `flate2`

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Compression algorithm recorded in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None,
    Gzip,
    Deflate,
}

impl CompressionType {
    pub fn id(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Deflate => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, DecodeError> {
        match id {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Gzip),
            2 => Ok(CompressionType::Deflate),
            other => Err(DecodeError::UnknownCompression(other)),
        }
    }
}

/// Compress `data` with `kind` unless it is below `threshold` bytes or the
/// result is not strictly smaller.
///
/// # Returns
///
/// * `(CompressionType, Vec<u8>)` - The algorithm actually applied and the bytes
pub fn compress_if_smaller(kind: CompressionType, threshold: usize, data: &[u8]) -> (CompressionType, Vec<u8>) {
    if kind == CompressionType::None || data.len() < threshold {
        return (CompressionType::None, data.to_vec());
    }

    match compress(kind, data) {
        Ok(compressed) if compressed.len() < data.len() => (kind, compressed),
        Ok(_) => (CompressionType::None, data.to_vec()),
        Err(e) => {
            tracing::warn!("Compression failed, sending uncompressed: {}", e);
            (CompressionType::None, data.to_vec())
        }
    }
}

pub fn compress(kind: CompressionType, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match kind {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionType::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

/// Decompress `data`, reading at most `expected_len + 1` bytes so a lying
/// header cannot inflate without bound.
pub fn decompress(kind: CompressionType, data: &[u8], expected_len: usize) -> Result<Vec<u8>, DecodeError> {
    let limit = expected_len as u64 + 1;
    let mut out = Vec::with_capacity(expected_len);

    let read = match kind {
        CompressionType::None => return Ok(data.to_vec()),
        CompressionType::Gzip => GzDecoder::new(data).take(limit).read_to_end(&mut out),
        CompressionType::Deflate => DeflateDecoder::new(data).take(limit).read_to_end(&mut out),
    };

    read.map_err(|e| DecodeError::Decompression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Vec<u8> {
        b"fps=60;frameTime=16.6;".iter().cycle().take(len).copied().collect()
    }

    #[test]
    fn test_ids() {
        for kind in [CompressionType::None, CompressionType::Gzip, CompressionType::Deflate] {
            assert_eq!(CompressionType::from_id(kind.id()).unwrap(), kind);
        }
        assert_eq!(CompressionType::from_id(9), Err(DecodeError::UnknownCompression(9)));
    }

    #[test]
    fn test_below_threshold_is_not_compressed() {
        let data = compressible(100);
        let (kind, out) = compress_if_smaller(CompressionType::Gzip, 512, &data);
        assert_eq!(kind, CompressionType::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let data = compressible(4096);
        let (kind, out) = compress_if_smaller(CompressionType::Deflate, 512, &data);
        assert_eq!(kind, CompressionType::Deflate);
        assert!(out.len() < data.len());
        assert_eq!(decompress(kind, &out, data.len()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_falls_back() {
        use rand::RngCore;
        let mut data = vec![0u8; 2048];
        rand::rngs::OsRng.fill_bytes(&mut data);

        let (kind, out) = compress_if_smaller(CompressionType::Gzip, 512, &data);
        assert_eq!(kind, CompressionType::None);
        assert_eq!(out, data);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let result = decompress(CompressionType::Gzip, b"definitely not gzip", 100);
        assert!(matches!(result, Err(DecodeError::Decompression(_))));
    }

    #[test]
    fn test_decompress_stops_past_expected_length() {
        let data = compressible(4096);
        let compressed = compress(CompressionType::Gzip, &data).unwrap();
        let out = decompress(CompressionType::Gzip, &compressed, 100).unwrap();
        assert_eq!(out.len(), 101);
    }
}
