//! Adaptive compression for stored values.
//!
//! Small values are stored as-is. Larger values go through the cheapest
//! algorithm whose observed ratio for that size bucket reaches the current
//! target; the target moves with analytics feedback.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::cache::item::{Algorithm, CompressionInfo};
use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd codec failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Lz4 decompression failed: {0}")]
    Lz4Error(#[from] lz4_flex::block::DecompressError),

    #[error("Decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Algorithms tried above the threshold, cheapest first.
const CANDIDATES: [Algorithm; 2] = [Algorithm::Lz4, Algorithm::Zstd];

/// Ratio assumed for a bucket/algorithm pair with no observations yet.
fn prior_ratio(algorithm: Algorithm) -> f64 {
    match algorithm {
        Algorithm::None => 1.0,
        Algorithm::Lz4 => 2.0,
        Algorithm::Zstd => 3.0,
    }
}

/// Power-of-two size bucket.
fn size_bucket(size: usize) -> u32 {
    usize::BITS - size.leading_zeros()
}

/// Output of a compression pass.
#[derive(Debug)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub info: CompressionInfo,
}

struct CompressorState {
    target_ratio: f64,
    ratios: HashMap<(u32, Algorithm), f64>,
}

/// The compression engine.
pub struct Compressor {
    config: CompressionConfig,
    state: Mutex<CompressorState>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        let target_ratio = config
            .target_ratio
            .clamp(config.min_target_ratio, config.max_target_ratio);
        Self {
            config,
            state: Mutex::new(CompressorState {
                target_ratio,
                ratios: HashMap::new(),
            }),
        }
    }

    /// Pick the storage algorithm for a value of `size` bytes.
    pub fn select_algorithm(&self, size: usize) -> Algorithm {
        if !self.config.enabled || size <= self.config.threshold_bytes {
            return Algorithm::None;
        }

        let bucket = size_bucket(size);
        let state = self.state.lock();
        let ratio_of = |alg: Algorithm| {
            state
                .ratios
                .get(&(bucket, alg))
                .copied()
                .unwrap_or_else(|| prior_ratio(alg))
        };

        if let Some(alg) = CANDIDATES
            .iter()
            .copied()
            .find(|alg| ratio_of(*alg) >= state.target_ratio)
        {
            return alg;
        }

        // Nothing reaches the target: use whichever still saves space, if any.
        CANDIDATES
            .iter()
            .copied()
            .map(|alg| (alg, ratio_of(alg)))
            .filter(|(_, ratio)| *ratio > 1.0)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(alg, _)| alg)
            .unwrap_or(Algorithm::None)
    }

    /// Compress a serialized value.
    ///
    /// Falls back to storing the input unchanged when the selected algorithm
    /// does not shrink it.
    pub fn compress(&self, data: &[u8]) -> Result<Compressed, CompressionError> {
        let original = data.len();
        let algorithm = self.select_algorithm(original);
        if algorithm == Algorithm::None {
            return Ok(Compressed {
                bytes: data.to_vec(),
                info: CompressionInfo::uncompressed(original),
            });
        }

        let start = Instant::now();
        let encoded = self.encode(algorithm, data)?;
        let compress_time = start.elapsed();

        let ratio = original as f64 / encoded.len().max(1) as f64;
        self.observe(size_bucket(original), algorithm, ratio);

        if encoded.len() >= original {
            debug!(%algorithm, original, ratio, "Compression did not help, storing raw");
            let mut info = CompressionInfo::uncompressed(original);
            info.compress_time = compress_time;
            return Ok(Compressed {
                bytes: data.to_vec(),
                info,
            });
        }

        Ok(Compressed {
            info: CompressionInfo {
                algorithm,
                original_size: original,
                compressed_size: encoded.len(),
                ratio,
                compress_time,
                decompress_time: None,
            },
            bytes: encoded,
        })
    }

    /// Restore the serialized value from its stored representation.
    pub fn decompress(
        &self,
        stored: &[u8],
        info: &CompressionInfo,
    ) -> Result<Vec<u8>, CompressionError> {
        let decoded = match info.algorithm {
            Algorithm::None => stored.to_vec(),
            Algorithm::Lz4 => lz4_flex::decompress_size_prepended(stored)?,
            Algorithm::Zstd => zstd::decode_all(stored)?,
        };

        if decoded.len() != info.original_size {
            return Err(CompressionError::SizeMismatch {
                expected: info.original_size,
                actual: decoded.len(),
            });
        }
        Ok(decoded)
    }

    /// Require better ratios before compressing (favours zstd over lz4).
    pub fn increase_compression_level(&self) -> f64 {
        let mut state = self.state.lock();
        state.target_ratio =
            (state.target_ratio + self.config.level_step).min(self.config.max_target_ratio);
        state.target_ratio
    }

    /// Accept lower ratios (favours the cheaper algorithm).
    pub fn decrease_compression_level(&self) -> f64 {
        let mut state = self.state.lock();
        state.target_ratio =
            (state.target_ratio - self.config.level_step).max(self.config.min_target_ratio);
        state.target_ratio
    }

    pub fn target_ratio(&self) -> f64 {
        self.state.lock().target_ratio
    }

    pub fn threshold_bytes(&self) -> usize {
        self.config.threshold_bytes
    }

    fn encode(&self, algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match algorithm {
            Algorithm::None => Ok(data.to_vec()),
            Algorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Algorithm::Zstd => Ok(zstd::encode_all(data, self.config.zstd_level)?),
        }
    }

    fn observe(&self, bucket: u32, algorithm: Algorithm, ratio: f64) {
        let decay = self.config.ratio_ema_decay;
        let mut state = self.state.lock();
        state
            .ratios
            .entry((bucket, algorithm))
            .and_modify(|avg| *avg = decay * *avg + (1.0 - decay) * ratio)
            .or_insert(ratio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<u8> {
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_small_values_stored_raw() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = vec![b'a'; 1024];

        let out = compressor.compress(&data).unwrap();
        assert_eq!(out.info.algorithm, Algorithm::None);
        assert_eq!(out.bytes, data);
    }

    #[test]
    fn test_lz4_roundtrip_for_repetitive_data() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = br#"{"name":"widget","tags":["a","b"]}"#.repeat(200);

        let out = compressor.compress(&data).unwrap();
        assert_eq!(out.info.algorithm, Algorithm::Lz4);
        assert!(out.info.compressed_size < data.len());
        assert!(out.info.ratio > 1.0);

        let restored = compressor.decompress(&out.bytes, &out.info).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_higher_level_switches_to_zstd() {
        let compressor = Compressor::new(CompressionConfig::default());
        for _ in 0..3 {
            compressor.increase_compression_level();
        }
        assert!(compressor.target_ratio() > 2.0);
        assert_eq!(compressor.select_algorithm(8192), Algorithm::Zstd);

        let data = vec![7u8; 8192];
        let out = compressor.compress(&data).unwrap();
        assert_eq!(out.info.algorithm, Algorithm::Zstd);
        assert_eq!(compressor.decompress(&out.bytes, &out.info).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_learns_to_skip() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = noise(4096);

        let first = compressor.compress(&data).unwrap();
        assert_eq!(first.info.algorithm, Algorithm::None);
        assert_eq!(compressor.select_algorithm(4096), Algorithm::Zstd);

        let second = compressor.compress(&data).unwrap();
        assert_eq!(second.info.algorithm, Algorithm::None);
        assert_eq!(compressor.select_algorithm(4096), Algorithm::None);
    }

    #[test]
    fn test_target_ratio_is_clamped() {
        let config = CompressionConfig::default();
        let compressor = Compressor::new(config.clone());
        for _ in 0..100 {
            compressor.increase_compression_level();
        }
        assert_eq!(compressor.target_ratio(), config.max_target_ratio);
        for _ in 0..100 {
            compressor.decrease_compression_level();
        }
        assert_eq!(compressor.target_ratio(), config.min_target_ratio);
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let compressor = Compressor::new(CompressionConfig::default());
        let info = CompressionInfo {
            algorithm: Algorithm::Zstd,
            original_size: 100,
            compressed_size: 4,
            ratio: 25.0,
            compress_time: std::time::Duration::ZERO,
            decompress_time: None,
        };
        assert!(compressor.decompress(&[1, 2, 3, 4], &info).is_err());

        let raw = CompressionInfo::uncompressed(10);
        assert!(matches!(
            compressor.decompress(&[0u8; 4], &raw),
            Err(CompressionError::SizeMismatch { expected: 10, actual: 4 })
        ));
    }
}
