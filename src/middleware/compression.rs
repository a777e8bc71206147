//! Gzip compression stage.
//!
//! Wire format uses a marker byte prefix:
//!
//! - `0x00` prefix: uncompressed data follows
//! - `0x1f` prefix: gzip-compressed data follows (0x1f is the gzip magic byte)
//!
//! Incoming payloads without a recognized marker pass through untouched, so a
//! peer that never compresses can still talk to one that does.

use std::io::{Read, Write};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{Middleware, MiddlewareError, Next};

/// Marker byte for uncompressed data.
const MARKER_UNCOMPRESSED: u8 = 0x00;

/// Marker byte for gzip-compressed data (also gzip magic byte).
const MARKER_GZIP: u8 = 0x1f;

const STAGE: &str = "compression";

/// Compresses payloads at or above a size threshold.
#[derive(Debug, Clone, Copy)]
pub struct CompressionMiddleware {
    threshold: Option<usize>,
}

impl CompressionMiddleware {
    /// Create the stage. `None` disables compression (markers are still added).
    pub fn new(threshold: Option<usize>) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn on_send(&self, payload: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>, MiddlewareError> {
        next.run(maybe_compress(&payload, self.threshold)?).await
    }

    async fn on_receive(
        &self,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, MiddlewareError> {
        next.run(maybe_decompress(payload)?).await
    }
}

fn with_marker(marker: u8, data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(1 + data.len());
    result.push(marker);
    result.extend_from_slice(data);
    result
}

/// Compress data if it reaches the threshold.
///
/// If compression doesn't reduce size, returns uncompressed with `0x00` marker.
pub fn maybe_compress(data: &[u8], threshold: Option<usize>) -> Result<Vec<u8>, MiddlewareError> {
    let Some(threshold) = threshold else {
        return Ok(with_marker(MARKER_UNCOMPRESSED, data));
    };

    if data.len() < threshold {
        return Ok(with_marker(MARKER_UNCOMPRESSED, data));
    }

    let mut compressed = Vec::with_capacity(data.len());
    compressed.push(MARKER_GZIP);

    {
        let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
        encoder
            .write_all(data)
            .map_err(|e| MiddlewareError::transform(STAGE, format!("gzip write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| MiddlewareError::transform(STAGE, format!("gzip finish failed: {e}")))?;
    }

    if compressed.len() < data.len() + 1 {
        Ok(compressed)
    } else {
        Ok(with_marker(MARKER_UNCOMPRESSED, data))
    }
}

/// Decompress data based on its marker byte.
pub fn maybe_decompress(data: Vec<u8>) -> Result<Vec<u8>, MiddlewareError> {
    match data.first() {
        None => Ok(data),
        Some(&MARKER_UNCOMPRESSED) => Ok(data[1..].to_vec()),
        Some(&MARKER_GZIP) => {
            let mut decoder = GzDecoder::new(&data[1..]);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).map_err(|e| {
                MiddlewareError::transform(STAGE, format!("gzip decompress failed: {e}"))
            })?;
            Ok(decompressed)
        }
        // Unmarked (e.g. JSON from a peer without this stage).
        Some(_) => Ok(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewarePipeline;

    #[test]
    fn test_below_threshold_is_marked_uncompressed() {
        let out = maybe_compress(b"hello world", Some(1000)).unwrap();
        assert_eq!(out[0], MARKER_UNCOMPRESSED);
        assert_eq!(maybe_decompress(out).unwrap(), b"hello world");
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let out = maybe_compress(&data, Some(100)).unwrap();
        assert_eq!(out[0], MARKER_GZIP);
        assert!(out.len() < data.len());
        assert_eq!(maybe_decompress(out).unwrap(), data);
    }

    #[test]
    fn test_unmarked_payload_passes_through() {
        let json = br#"{"MessageType":0,"Data":"hi"}"#.to_vec();
        assert_eq!(maybe_decompress(json.clone()).unwrap(), json);
    }

    #[test]
    fn test_corrupt_gzip_is_a_transform_error() {
        let err = maybe_decompress(vec![MARKER_GZIP, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, MiddlewareError::Transform { .. }));
    }

    #[tokio::test]
    async fn test_stage_in_pipeline() {
        let pipeline = MiddlewarePipeline::builder()
            .with(CompressionMiddleware::new(Some(64)))
            .build();
        let payload = "abc".repeat(500).into_bytes();
        let wire = pipeline.run_send(payload.clone()).await.unwrap();
        assert_eq!(wire[0], MARKER_GZIP);
        assert_eq!(pipeline.run_receive(wire).await.unwrap(), payload);
    }
}
