//! Chunked parallel compression pipeline.
//!
//! A source stream is partitioned into fixed-size chunks which are
//! processed independently by a worker pool (dedup, preprocessing,
//! compression, encryption, MAC) and emitted in input order as a container
//! stream. Decompression inverts the pipeline with verification first.

mod bridge;
mod buffer_pool;
mod checksum;
mod chunker;
mod codec;
mod config;
mod crypto;
mod dedup;
mod dispatch;
mod error;
mod format;
mod hashsum;
mod pipeline;
mod preprocess;

pub use bridge::{bridge, BridgeReader, BridgeWriter};
pub use buffer_pool::BufferPool;
pub use checksum::{CksumKind, MacKind};
pub use codec::{CodecError, Compression, CompressionAlgorithm};
pub use config::{EncryptConfig, PipelineConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use crypto::{random_bytes, CipherKind, ScryptParams, SALT_LEN};
pub use dispatch::{compress_stream, decompress_stream, CompressStats, DecompressStats};
pub use error::Error;
pub use hashsum::HashSum;

pub mod chunking {
    //! Content-defined block splitting.
    pub use crate::chunker::{
        Block, Config, FixedSizeChunker, RabinHash, RollingHash, RollingHashChunker, SplitConfig,
    };
}

pub mod dedupe {
    //! Dedup configuration and index planning.
    pub use crate::dedup::{
        plan_index, DedupConfig, IndexMode, IndexPlan, IndexRequest, SegmentGeometry,
        DEFAULT_MEM_LIMIT, DEFAULT_PCT_INTERVAL,
    };
}

pub mod stream_format {
    //! Container format structures and constants.
    pub use crate::format::{
        read_chunk_header, read_prologue, ChunkHeader, Prologue, PrologueCrypto, CHSIZE_MASK,
        CHUNK_FLAG_DEDUP, CHUNK_FLAG_PREPROC, FLAG_ARCHIVE, FLAG_DEDUP, FLAG_DEDUP_FIXED,
        FLAG_SINGLE_CHUNK, MAGIC, MIN_VERSION, VERSION,
    };
}

pub use preprocess::PreprocessConfig;
