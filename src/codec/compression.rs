//! Optional compression stage shared by every codec
//!
//! Compressed output is framed as `[0xF5, 'X', 'Z', algorithm-tag] + body`.
//! Uncompressed output is emitted as-is, so a payload that does not shrink is
//! never larger on the wire than its encoded body.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ExchangeError, Result};

/// Frame marker of a compressed buffer. 0xF5 never starts UTF-8 text.
pub const FRAME_MAGIC: [u8; 3] = [0xF5, b'X', b'Z'];

/// Default minimum body size before compression is attempted
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const READ_CHUNK: usize = 8192;
const BROTLI_BUFFER: usize = 4096;
const BROTLI_WINDOW: u32 = 22;

/// Compression algorithm applied to an encoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Deflate,
    Gzip,
    Brotli,
}

impl CompressionAlgorithm {
    /// Tag byte used in the compression frame
    pub fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Deflate => 1,
            CompressionAlgorithm::Gzip => 2,
            CompressionAlgorithm::Brotli => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Deflate),
            2 => Some(CompressionAlgorithm::Gzip),
            3 => Some(CompressionAlgorithm::Brotli),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Brotli => "brotli",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression settings of a codec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    /// Algorithm-specific level; `None` uses the algorithm default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    /// Bodies shorter than this are never compressed
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

fn default_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: None,
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Compression primitive consumed by the codecs
pub trait Compressor: Send + Sync {
    /// Compress `data`
    fn compress(&self, data: &[u8], algorithm: CompressionAlgorithm, level: Option<u32>) -> Result<Vec<u8>>;

    /// Decompress `data`, failing once the output would exceed `max_output` bytes
    fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm, max_output: usize) -> Result<Vec<u8>>;
}

/// Deflate (zlib) and gzip through `flate2`, brotli through `brotli`
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCompressor;

impl Compressor for StandardCompressor {
    fn compress(&self, data: &[u8], algorithm: CompressionAlgorithm, level: Option<u32>) -> Result<Vec<u8>> {
        let failed = |e: std::io::Error| ExchangeError::Compression(format!("{} compression failed: {}", algorithm, e));
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate_level(level));
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
            CompressionAlgorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate_level(level));
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
            CompressionAlgorithm::Brotli => {
                let quality = level.unwrap_or(6).min(11);
                let mut writer = brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER, quality, BROTLI_WINDOW);
                writer.write_all(data).map_err(failed)?;
                writer.flush().map_err(failed)?;
                Ok(writer.into_inner())
            }
        }
    }

    fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm, max_output: usize) -> Result<Vec<u8>> {
        match algorithm {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Deflate => read_limited(ZlibDecoder::new(data), algorithm, max_output),
            CompressionAlgorithm::Gzip => read_limited(GzDecoder::new(data), algorithm, max_output),
            CompressionAlgorithm::Brotli => {
                read_limited(brotli::Decompressor::new(data, BROTLI_BUFFER), algorithm, max_output)
            }
        }
    }
}

fn flate_level(level: Option<u32>) -> Compression {
    level.map_or_else(Compression::default, |l| Compression::new(l.min(9)))
}

/// Read a decoder to the end in chunks, enforcing the output limit as we go
fn read_limited(mut reader: impl Read, algorithm: CompressionAlgorithm, max_output: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > max_output {
                    return Err(ExchangeError::SizeLimitExceeded {
                        size: out.len(),
                        limit: max_output,
                    });
                }
            }
            Err(e) => {
                return Err(ExchangeError::Compression(format!(
                    "{} decompression failed: {}",
                    algorithm, e
                )))
            }
        }
    }
    Ok(out)
}

/// Output of the compression stage
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    /// Algorithm actually applied; `None` when the raw body was kept
    pub algorithm: CompressionAlgorithm,
}

/// Settings plus the compressor that carries them out
#[derive(Clone)]
pub struct CompressionStage {
    settings: CompressionSettings,
    compressor: Arc<dyn Compressor>,
}

impl fmt::Debug for CompressionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionStage")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CompressionStage {
    pub fn new(settings: CompressionSettings) -> Self {
        Self::with_compressor(settings, Arc::new(StandardCompressor))
    }

    pub fn with_compressor(settings: CompressionSettings, compressor: Arc<dyn Compressor>) -> Self {
        Self { settings, compressor }
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Compress `body` when enabled, above threshold and actually smaller.
    ///
    /// Compressor failures fall back to the raw body.
    pub fn apply(&self, body: Vec<u8>) -> Compressed {
        let algorithm = self.settings.algorithm;
        if algorithm == CompressionAlgorithm::None || body.len() < self.settings.threshold {
            return Compressed {
                bytes: body,
                algorithm: CompressionAlgorithm::None,
            };
        }

        match self.compressor.compress(&body, algorithm, self.settings.level) {
            Ok(compressed) if compressed.len() + FRAME_MAGIC.len() + 1 < body.len() => {
                let mut framed = Vec::with_capacity(compressed.len() + FRAME_MAGIC.len() + 1);
                framed.extend_from_slice(&FRAME_MAGIC);
                framed.push(algorithm.tag());
                framed.extend_from_slice(&compressed);
                Compressed {
                    bytes: framed,
                    algorithm,
                }
            }
            Ok(compressed) => {
                debug!(
                    algorithm = %algorithm,
                    original = body.len(),
                    compressed = compressed.len(),
                    "compression did not shrink body, sending uncompressed"
                );
                Compressed {
                    bytes: body,
                    algorithm: CompressionAlgorithm::None,
                }
            }
            Err(e) => {
                warn!(algorithm = %algorithm, error = %e, "compression failed, sending uncompressed");
                Compressed {
                    bytes: body,
                    algorithm: CompressionAlgorithm::None,
                }
            }
        }
    }

    /// Undo [`CompressionStage::apply`]. Unframed input is returned borrowed.
    pub fn strip<'a>(&self, bytes: &'a [u8], max_size: usize) -> Result<(Cow<'a, [u8]>, CompressionAlgorithm)> {
        if bytes.len() <= FRAME_MAGIC.len() || bytes[..FRAME_MAGIC.len()] != FRAME_MAGIC {
            return Ok((Cow::Borrowed(bytes), CompressionAlgorithm::None));
        }
        let tag = bytes[FRAME_MAGIC.len()];
        let algorithm = CompressionAlgorithm::from_tag(tag)
            .ok_or_else(|| ExchangeError::Compression(format!("unknown compression tag {}", tag)))?;
        let body = &bytes[FRAME_MAGIC.len() + 1..];
        let decompressed = self.compressor.decompress(body, algorithm, max_size)?;
        Ok((Cow::Owned(decompressed), algorithm))
    }
}

impl Default for CompressionStage {
    fn default() -> Self {
        Self::new(CompressionSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(algorithm: CompressionAlgorithm) -> CompressionStage {
        CompressionStage::new(CompressionSettings {
            algorithm,
            ..CompressionSettings::default()
        })
    }

    fn compressible() -> Vec<u8> {
        br#"{"event":"order.created","items":[1,2,3]}"#.repeat(64)
    }

    #[test]
    fn test_roundtrip_each_algorithm() {
        let data = compressible();
        for algorithm in [
            CompressionAlgorithm::Deflate,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Brotli,
        ] {
            let stage = stage(algorithm);
            let out = stage.apply(data.clone());
            assert_eq!(out.algorithm, algorithm);
            assert!(out.bytes.len() < data.len());
            let (restored, detected) = stage.strip(&out.bytes, 1 << 20).unwrap();
            assert_eq!(detected, algorithm);
            assert_eq!(restored.as_ref(), data.as_slice());
        }
    }

    #[test]
    fn test_below_threshold_is_raw() {
        let stage = stage(CompressionAlgorithm::Gzip);
        let out = stage.apply(b"0123456789".to_vec());
        assert_eq!(out.algorithm, CompressionAlgorithm::None);
        assert_eq!(out.bytes, b"0123456789");
    }

    #[test]
    fn test_incompressible_falls_back() {
        // xorshift noise does not compress
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect();
        let out = stage(CompressionAlgorithm::Deflate).apply(noise.clone());
        assert_eq!(out.algorithm, CompressionAlgorithm::None);
        assert_eq!(out.bytes, noise);
    }

    #[test]
    fn test_decompression_limit() {
        let data = vec![0u8; 64 * 1024];
        let stage = stage(CompressionAlgorithm::Gzip);
        let out = stage.apply(data);
        let err = stage.strip(&out.bytes, 1024).unwrap_err();
        assert!(matches!(err, ExchangeError::SizeLimitExceeded { .. }));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let stage = CompressionStage::default();
        let framed = [0xF5, b'X', b'Z', 9, 1, 2, 3];
        assert!(matches!(stage.strip(&framed, 1024), Err(ExchangeError::Compression(_))));
    }

    struct Broken;

    impl Compressor for Broken {
        fn compress(&self, _: &[u8], _: CompressionAlgorithm, _: Option<u32>) -> Result<Vec<u8>> {
            Err(ExchangeError::Compression("boom".to_string()))
        }

        fn decompress(&self, _: &[u8], _: CompressionAlgorithm, _: usize) -> Result<Vec<u8>> {
            Err(ExchangeError::Compression("boom".to_string()))
        }
    }

    #[test]
    fn test_compressor_failure_recovers_locally() {
        let stage = CompressionStage::with_compressor(
            CompressionSettings {
                algorithm: CompressionAlgorithm::Brotli,
                ..CompressionSettings::default()
            },
            Arc::new(Broken),
        );
        let data = compressible();
        let out = stage.apply(data.clone());
        assert_eq!(out.algorithm, CompressionAlgorithm::None);
        assert_eq!(out.bytes, data);
    }
}
