//! Blob codec: raw bytes to persisted envelope and back.
//!
//! Payloads are stored as their original byte representation. The codec never
//! looks inside a payload beyond deciding whether lz4 is worth trying, and a
//! compressed envelope is only kept when it is actually smaller.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::BlobConfig;
use crate::core::BlobMetadata;
use crate::error::{Result, StoreError};

/// What actually gets persisted for a blob.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Bytes,
    pub byte_length: u64,
    pub checksum: Option<String>,
    pub compressed: bool,
}

/// Where a persisted envelope lives inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePath {
    /// Within the normal record or column.
    Inline,
    /// Via the backend's large-object facility.
    LargeObject,
}

impl StoragePath {
    /// The threshold applies to the persisted size so both backends split at
    /// the same point.
    pub fn for_stored_len(stored_len: usize, inline_threshold: usize) -> Self {
        if stored_len <= inline_threshold {
            StoragePath::Inline
        } else {
            StoragePath::LargeObject
        }
    }
}

/// Payloads at least this large are hashed and compressed on the blocking pool.
const OFFLOAD_THRESHOLD: usize = 1024 * 1024;

/// Hex SHA256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct BlobCodec {
    compression: bool,
    compression_min_bytes: usize,
    checksums: bool,
}

impl BlobCodec {
    pub fn new(config: &BlobConfig) -> Self {
        Self {
            compression: config.compression,
            compression_min_bytes: config.compression_min_bytes,
            checksums: config.checksums,
        }
    }

    /// Encode an uploaded payload.
    pub fn encode(&self, raw: Bytes, content_type: &str) -> Envelope {
        let byte_length = raw.len() as u64;
        let checksum = self.checksums.then(|| sha256_hex(&raw));

        if self.should_compress(raw.len(), content_type) {
            let compressed = lz4_flex::compress_prepend_size(&raw);
            if compressed.len() < raw.len() {
                debug!(
                    "Compressed {} payload {} -> {} bytes",
                    content_type,
                    raw.len(),
                    compressed.len()
                );
                return Envelope {
                    payload: Bytes::from(compressed),
                    byte_length,
                    checksum,
                    compressed: true,
                };
            }
        }

        Envelope {
            payload: raw,
            byte_length,
            checksum,
            compressed: false,
        }
    }

    /// Decode a persisted envelope back into the original bytes.
    pub fn decode(&self, payload: Bytes, metadata: &BlobMetadata) -> Result<Bytes> {
        if payload.len() as u64 != metadata.stored_length {
            return Err(StoreError::CorruptPayload(format!(
                "blob {}: stored length {} but {} bytes read",
                metadata.id,
                metadata.stored_length,
                payload.len()
            )));
        }

        let raw = if metadata.compressed {
            // The prepended size is checked first so a damaged header cannot
            // trigger a huge allocation.
            let declared = payload
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64);
            if declared != Some(metadata.byte_length) {
                return Err(StoreError::CorruptPayload(format!(
                    "blob {}: compressed header does not match length {}",
                    metadata.id, metadata.byte_length
                )));
            }
            let decompressed = lz4_flex::decompress_size_prepended(&payload).map_err(|e| {
                StoreError::CorruptPayload(format!("blob {}: {}", metadata.id, e))
            })?;
            Bytes::from(decompressed)
        } else {
            payload
        };

        if raw.len() as u64 != metadata.byte_length {
            return Err(StoreError::CorruptPayload(format!(
                "blob {}: expected {} bytes, decoded {}",
                metadata.id,
                metadata.byte_length,
                raw.len()
            )));
        }

        if let Some(expected) = &metadata.checksum {
            let actual = sha256_hex(&raw);
            if &actual != expected {
                return Err(StoreError::CorruptPayload(format!(
                    "blob {}: checksum mismatch (expected {}, got {})",
                    metadata.id, expected, actual
                )));
            }
        }

        Ok(raw)
    }

    /// `encode` on the blocking pool for large payloads.
    pub async fn encode_offloaded(&self, raw: Bytes, content_type: &str) -> Result<Envelope> {
        if raw.len() < OFFLOAD_THRESHOLD {
            return Ok(self.encode(raw, content_type));
        }
        let codec = self.clone();
        let content_type = content_type.to_string();
        tokio::task::spawn_blocking(move || codec.encode(raw, &content_type))
            .await
            .map_err(|e| StoreError::backend("codec", e.to_string()))
    }

    /// `decode` on the blocking pool for large payloads.
    pub async fn decode_offloaded(&self, payload: Bytes, metadata: &BlobMetadata) -> Result<Bytes> {
        if payload.len() < OFFLOAD_THRESHOLD {
            return self.decode(payload, metadata);
        }
        let codec = self.clone();
        let metadata = metadata.clone();
        tokio::task::spawn_blocking(move || codec.decode(payload, &metadata))
            .await
            .map_err(|e| StoreError::backend("codec", e.to_string()))?
    }

    fn should_compress(&self, len: usize, content_type: &str) -> bool {
        self.compression
            && len >= self.compression_min_bytes
            && len <= u32::MAX as usize
            && is_compressible(content_type)
    }
}

/// Text-like formats compress well. Images, archives, spreadsheets (zip
/// containers) and opaque binaries are passed through.
fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if essence.starts_with("text/") {
        return true;
    }
    matches!(
        essence.as_str(),
        "application/json"
            | "application/x-ndjson"
            | "application/xml"
            | "application/yaml"
            | "application/x-yaml"
            | "application/javascript"
            | "application/sql"
            | "application/csv"
    ) || essence.ends_with("+json")
        || essence.ends_with("+xml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BlobId;
    use chrono::Utc;

    fn codec() -> BlobCodec {
        BlobCodec::new(&BlobConfig::default())
    }

    fn metadata_for(envelope: &Envelope) -> BlobMetadata {
        BlobMetadata {
            id: BlobId::new("b1"),
            content_type: "text/csv".into(),
            filename: "data.csv".into(),
            byte_length: envelope.byte_length,
            stored_length: envelope.payload.len() as u64,
            checksum: envelope.checksum.clone(),
            compressed: envelope.compressed,
            hints: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn csv_payload(rows: usize) -> Bytes {
        let mut out = String::from("region,amount\n");
        for i in 0..rows {
            out.push_str(&format!("north,{}\n", i % 17));
        }
        Bytes::from(out)
    }

    #[test]
    fn test_small_payload_passes_through() {
        let envelope = codec().encode(Bytes::from_static(b"hello"), "text/plain");
        assert!(!envelope.compressed);
        assert_eq!(&envelope.payload[..], b"hello");
        assert_eq!(envelope.byte_length, 5);
        assert_eq!(
            envelope.checksum.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn test_large_text_is_compressed_and_restored() {
        let raw = csv_payload(10_000);
        let envelope = codec().encode(raw.clone(), "text/csv; charset=utf-8");
        assert!(envelope.compressed);
        assert!(envelope.payload.len() < raw.len());

        let meta = metadata_for(&envelope);
        let decoded = codec().decode(envelope.payload, &meta).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_binary_content_type_not_compressed() {
        let raw = Bytes::from(vec![0u8; 64 * 1024]);
        let envelope = codec().encode(raw.clone(), "application/zip");
        assert!(!envelope.compressed);
        assert_eq!(envelope.payload, raw);
    }

    #[test]
    fn test_compression_disabled() {
        let config = BlobConfig {
            compression: false,
            ..BlobConfig::default()
        };
        let envelope = BlobCodec::new(&config).encode(csv_payload(10_000), "text/csv");
        assert!(!envelope.compressed);
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let envelope = codec().encode(Bytes::from_static(b"hello"), "text/plain");
        let meta = metadata_for(&envelope);
        let err = codec()
            .decode(Bytes::from_static(b"jello"), &meta)
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptPayload(_)), "got {:?}", err);
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let envelope = codec().encode(csv_payload(10_000), "text/csv");
        let meta = metadata_for(&envelope);
        let truncated = envelope.payload.slice(..envelope.payload.len() / 2);
        assert!(matches!(
            codec().decode(truncated, &meta),
            Err(StoreError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_damaged_compressed_header_is_corrupt() {
        let envelope = codec().encode(csv_payload(10_000), "text/csv");
        let meta = metadata_for(&envelope);
        let mut damaged = envelope.payload.to_vec();
        damaged[0] ^= 0xFF;
        assert!(matches!(
            codec().decode(Bytes::from(damaged), &meta),
            Err(StoreError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_checksums_disabled_still_checks_length() {
        let config = BlobConfig {
            checksums: false,
            ..BlobConfig::default()
        };
        let codec = BlobCodec::new(&config);
        let envelope = codec.encode(Bytes::from_static(b"hello"), "text/plain");
        assert!(envelope.checksum.is_none());
        let meta = metadata_for(&envelope);
        assert_eq!(codec.decode(envelope.payload, &meta).unwrap(), "hello");
    }

    #[test]
    fn test_storage_path_boundary() {
        assert_eq!(StoragePath::for_stored_len(100, 100), StoragePath::Inline);
        assert_eq!(StoragePath::for_stored_len(101, 100), StoragePath::LargeObject);
        assert_eq!(StoragePath::for_stored_len(0, 100), StoragePath::Inline);
    }
}
