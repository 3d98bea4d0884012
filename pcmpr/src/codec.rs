//! Codec registry.
//!
//! Every back-end compressor is used through the same contract: levels are
//! normalized to the range the back-end supports, compression returns the
//! produced buffer or signals that the chunk should be stored raw, and
//! decompression is driven by the exact expected output size. The closed set
//! of back-ends is dispatched by enum, with the wire id recorded in the
//! container prologue.

use std::io::Write;

#[derive(Debug)]
pub enum CodecError {
    IO(std::io::Error),
    Lz4(lz4_flex::block::DecompressError),
    Inflate(miniz_oxide::inflate::DecompressError),
    #[cfg(feature = "lzma-compression")]
    LZMA(lzma::LzmaError),
    /// Decompressed output does not match the declared chunk size.
    SizeMismatch { expected: usize, actual: usize },
}

impl std::error::Error for CodecError {}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IO(err) => write!(f, "i/o error: {}", err),
            Self::Lz4(err) => write!(f, "lz4 error: {}", err),
            Self::Inflate(err) => write!(f, "inflate error: {:?}", err.status),
            #[cfg(feature = "lzma-compression")]
            Self::LZMA(err) => write!(f, "lzma error: {}", err),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "output size mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::IO(e)
    }
}

impl From<lz4_flex::block::DecompressError> for CodecError {
    fn from(e: lz4_flex::block::DecompressError) -> Self {
        Self::Lz4(e)
    }
}

impl From<miniz_oxide::inflate::DecompressError> for CodecError {
    fn from(e: miniz_oxide::inflate::DecompressError) -> Self {
        Self::Inflate(e)
    }
}

#[cfg(feature = "lzma-compression")]
impl From<lzma::LzmaError> for CodecError {
    fn from(e: lzma::LzmaError) -> Self {
        Self::LZMA(e)
    }
}

/// Stream format version below which the zlib back-end wrapped its deflate
/// data in a zlib header.
pub const ZLIB_RAW_SINCE_VERSION: u32 = 5;

/// Prefix length probed by the adaptive codec.
const ADAPT_PROBE_LEN: usize = 64 * 1024;

/// The compression back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zlib,
    Brotli,
    #[cfg(feature = "zstd-compression")]
    Zstd,
    #[cfg(feature = "lzma-compression")]
    Lzma,
    /// Meta-entry probing a prefix with the fast codecs and recording the
    /// winner per chunk.
    Adapt,
}

/// Candidates tried by the adaptive codec, fastest first. Ratio ties within
/// 1% resolve to the earlier entry.
const ADAPT_CANDIDATES: [CompressionAlgorithm; 2] =
    [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zlib];

impl CompressionAlgorithm {
    pub fn wire_id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zlib => 2,
            Self::Brotli => 3,
            #[cfg(feature = "zstd-compression")]
            Self::Zstd => 4,
            #[cfg(feature = "lzma-compression")]
            Self::Lzma => 5,
            Self::Adapt => 6,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zlib),
            3 => Some(Self::Brotli),
            #[cfg(feature = "zstd-compression")]
            4 => Some(Self::Zstd),
            #[cfg(feature = "lzma-compression")]
            5 => Some(Self::Lzma),
            6 => Some(Self::Adapt),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "lz4" => Some(Self::Lz4),
            "zlib" => Some(Self::Zlib),
            "brotli" => Some(Self::Brotli),
            #[cfg(feature = "zstd-compression")]
            "zstd" => Some(Self::Zstd),
            #[cfg(feature = "lzma-compression")]
            "lzma" => Some(Self::Lzma),
            "adapt" => Some(Self::Adapt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zlib => "zlib",
            Self::Brotli => "brotli",
            #[cfg(feature = "zstd-compression")]
            Self::Zstd => "zstd",
            #[cfg(feature = "lzma-compression")]
            Self::Lzma => "lzma",
            Self::Adapt => "adapt",
        }
    }

    pub fn max_level(self) -> u8 {
        match self {
            Self::None | Self::Lz4 => 1,
            Self::Zlib => 9,
            Self::Brotli => 11,
            #[cfg(feature = "zstd-compression")]
            Self::Zstd => 19,
            #[cfg(feature = "lzma-compression")]
            Self::Lzma => 9,
            Self::Adapt => 9,
        }
    }

    /// Clamp a requested level into the range the back-end supports.
    pub fn normalize_level(self, level: u8) -> u8 {
        level.clamp(1, self.max_level())
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-back-end properties the pipeline plans buffers and filters around.
#[derive(Debug, Clone, Copy)]
pub struct Props {
    pub mt_capable: bool,
    pub single_chunk_mt_capable: bool,
    pub c_max_threads: usize,
    pub d_max_threads: usize,
    /// Maximum stride span the delta filter should consider ahead of this
    /// back-end.
    pub delta2_span: usize,
    pub deltac_min_distance: u64,
}

const EIGHT_MB: u64 = 8 * 1024 * 1024;

/// Compression helper type; an algorithm with a normalized level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    pub algorithm: CompressionAlgorithm,
    pub level: u8,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.algorithm.name(), self.level)
    }
}

impl Compression {
    pub fn new(algorithm: CompressionAlgorithm, level: u8) -> Self {
        Self {
            algorithm,
            level: algorithm.normalize_level(level),
        }
    }

    pub fn props(&self) -> Props {
        let (mt_capable, single_chunk_mt_capable, delta2_span) = match self.algorithm {
            CompressionAlgorithm::Brotli => (false, false, 200),
            #[cfg(feature = "zstd-compression")]
            CompressionAlgorithm::Zstd => (true, true, 150),
            #[cfg(feature = "lzma-compression")]
            CompressionAlgorithm::Lzma => (true, false, 150),
            _ => (false, false, 100),
        };
        Props {
            mt_capable,
            single_chunk_mt_capable,
            c_max_threads: 1,
            d_max_threads: 1,
            delta2_span,
            deltac_min_distance: EIGHT_MB,
        }
    }

    /// Worst-case expansion budget for a destination buffer.
    pub fn buf_extra(&self, chunk_size: usize) -> usize {
        match self.algorithm {
            CompressionAlgorithm::Lz4 => chunk_size / 255 + 16,
            CompressionAlgorithm::Zlib | CompressionAlgorithm::Adapt => {
                (chunk_size >> 12) + (chunk_size >> 14) + (chunk_size >> 25) + 13
            }
            _ => chunk_size / 16 + 1024,
        }
    }

    /// Compress a chunk, probing for the best back-end in adaptive mode.
    ///
    /// Returns the effective algorithm (recorded in the chunk header so
    /// decompression dispatches correctly) and the produced buffer, or None
    /// when the back-end could not shrink its input and the chunk should be
    /// stored raw.
    pub fn compress_chunk(&self, src: &[u8]) -> (CompressionAlgorithm, Option<Vec<u8>>) {
        let algorithm = if self.algorithm == CompressionAlgorithm::Adapt {
            self.probe_best(src)
        } else {
            self.algorithm
        };
        let out = match self.compress_with(algorithm, src) {
            Ok(out) if out.len() < src.len() => Some(out),
            _ => None,
        };
        (algorithm, out)
    }

    fn probe_best(&self, src: &[u8]) -> CompressionAlgorithm {
        let probe = &src[..std::cmp::min(src.len(), ADAPT_PROBE_LEN)];
        let mut best = ADAPT_CANDIDATES[0];
        let mut best_len = match self.compress_with(best, probe) {
            Ok(out) => out.len(),
            Err(_) => usize::MAX,
        };
        for candidate in &ADAPT_CANDIDATES[1..] {
            let len = match self.compress_with(*candidate, probe) {
                Ok(out) => out.len(),
                Err(_) => continue,
            };
            // Better by more than 1%, otherwise the earlier entry keeps the
            // win.
            if (len as u64) * 100 < (best_len as u64) * 99 {
                best = *candidate;
                best_len = len;
            }
        }
        best
    }

    fn compress_with(
        &self,
        algorithm: CompressionAlgorithm,
        src: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let level = algorithm.normalize_level(self.level);
        match algorithm {
            CompressionAlgorithm::None => Ok(src.to_vec()),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::block::compress(src)),
            CompressionAlgorithm::Zlib => {
                Ok(miniz_oxide::deflate::compress_to_vec(src, level))
            }
            CompressionAlgorithm::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: level as i32,
                    magic_number: false,
                    ..Default::default()
                };
                let mut result = Vec::with_capacity(src.len() / 2 + 64);
                {
                    let mut writer =
                        brotli::CompressorWriter::with_params(&mut result, 32 * 1024, &params);
                    writer.write_all(src)?;
                }
                Ok(result)
            }
            #[cfg(feature = "zstd-compression")]
            CompressionAlgorithm::Zstd => {
                let mut result = Vec::with_capacity(src.len() / 2 + 64);
                zstd::stream::copy_encode(src, &mut result, level as i32)?;
                Ok(result)
            }
            #[cfg(feature = "lzma-compression")]
            CompressionAlgorithm::Lzma => {
                use lzma::LzmaWriter;
                let mut result = Vec::with_capacity(src.len() / 2 + 64);
                {
                    let mut f = LzmaWriter::new_compressor(&mut result, u32::from(level))?;
                    f.write_all(src)?;
                    f.finish()?;
                }
                Ok(result)
            }
            CompressionAlgorithm::Adapt => unreachable!("adapt resolves to a concrete back-end"),
        }
    }

    /// Decompress a chunk produced by `algorithm`.
    ///
    /// `expected_len` is the exact size recorded in the chunk header;
    /// `file_version` selects the inflate form for old zlib streams.
    pub fn decompress(
        &self,
        algorithm: CompressionAlgorithm,
        src: &[u8],
        expected_len: usize,
        file_version: u32,
    ) -> Result<Vec<u8>, CodecError> {
        let out = match algorithm {
            CompressionAlgorithm::None => src.to_vec(),
            CompressionAlgorithm::Lz4 => lz4_flex::block::decompress(src, expected_len)?,
            CompressionAlgorithm::Zlib => {
                if file_version < ZLIB_RAW_SINCE_VERSION {
                    miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(src, expected_len)?
                } else {
                    miniz_oxide::inflate::decompress_to_vec_with_limit(src, expected_len)?
                }
            }
            CompressionAlgorithm::Brotli => {
                let mut out = Vec::with_capacity(expected_len);
                {
                    let mut decompressor =
                        brotli::DecompressorWriter::new(&mut out, 32 * 1024);
                    decompressor.write_all(src)?;
                }
                out
            }
            #[cfg(feature = "zstd-compression")]
            CompressionAlgorithm::Zstd => {
                let mut out = Vec::with_capacity(expected_len);
                zstd::stream::copy_decode(src, &mut out)?;
                out
            }
            #[cfg(feature = "lzma-compression")]
            CompressionAlgorithm::Lzma => {
                use lzma::LzmaWriter;
                let mut out = Vec::with_capacity(expected_len);
                {
                    let mut f = LzmaWriter::new_decompressor(&mut out)?;
                    f.write_all(src)?;
                    f.finish()?;
                }
                out
            }
            CompressionAlgorithm::Adapt => unreachable!("adapt resolves to a concrete back-end"),
        };
        if out.len() != expected_len {
            return Err(CodecError::SizeMismatch {
                expected: expected_len,
                actual: out.len(),
            });
        }
        Ok(out)
    }
}
