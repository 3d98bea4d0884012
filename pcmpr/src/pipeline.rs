//! The per-chunk transform pipeline.
//!
//! Compression side: dedup, preprocessing, codec (with raw-storage
//! fallback), encryption, MAC/checksum. Decompression inverts the sequence
//! with verification first. Both directions are pure functions of the chunk
//! bytes, the stream configuration and the chunk id, so any worker can
//! process any chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::codec::CompressionAlgorithm;
use crate::config::PipelineConfig;
use crate::crypto::CryptoCtx;
use crate::dedup::Deduper;
use crate::format::{
    ChunkHeader, CHUNK_ALGO_MASK, CHUNK_ALGO_SHIFT, CHUNK_FLAG_DEDUP, CHUNK_FLAG_PREPROC,
};
use crate::preprocess;
use crate::{Error, HashSum};

/// Shared state for one stream, read-only during the run apart from the
/// dedup index and the cancel flag.
pub struct PipelineCtx {
    pub cfg: PipelineConfig,
    pub crypto: Option<CryptoCtx>,
    pub dedup: Option<Deduper>,
    pub cancel: Arc<AtomicBool>,
    pub file_version: u32,
}

impl PipelineCtx {
    /// Width of the checksum/MAC field in chunk records.
    pub fn cksum_bytes(&self) -> usize {
        match &self.crypto {
            Some(crypto) => crypto.mac_kind().size(),
            None => self.cfg.cksum.size(),
        }
    }

    pub fn canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn chunk_tag(&self, id: u64, header: &ChunkHeader, payload: &[u8]) -> HashSum {
        match &self.crypto {
            Some(crypto) => crypto.mac(&[
                &header.size_field().to_be_bytes(),
                &header.original_size.to_be_bytes(),
                &[header.flags],
                &id.to_be_bytes(),
                payload,
            ]),
            None => self.cfg.cksum.tree_digest(payload),
        }
    }
}

/// A chunk read from the source, owned by one worker at a time.
pub struct ChunkJob {
    pub id: u64,
    pub data: Vec<u8>,
}

/// A processed chunk ready for the writer.
#[derive(Debug)]
pub struct ChunkRecord {
    pub id: u64,
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
    /// Raw chunk size as read from the source, for stats.
    pub source_size: u64,
}

/// A decoded chunk; `dedup` chunks still carry a descriptor stream the
/// writer expands against the reconstructed output.
#[derive(Debug)]
pub struct RestoredChunk {
    pub id: u64,
    pub data: Vec<u8>,
    pub dedup: bool,
}

/// Run the compression pipeline over one chunk.
pub fn process_chunk(ctx: &PipelineCtx, job: ChunkJob) -> Result<ChunkRecord, Error> {
    if ctx.canceled() {
        return Err(Error::Canceled);
    }
    let ChunkJob { id, data } = job;
    let pool = BufferPool::global();
    let source_size = data.len() as u64;
    let mut flags = 0u8;
    let mut payload = data;

    // Dedup runs on the raw chunk so back-references land on deterministic
    // stream offsets regardless of worker interleaving.
    if let Some(deduper) = &ctx.dedup {
        if let Some(descriptor) = deduper.dedup_chunk(id, &payload, &ctx.cancel)? {
            pool.put(std::mem::replace(&mut payload, descriptor));
            flags |= CHUNK_FLAG_DEDUP;
        }
    }

    if ctx.cfg.preprocess.any() {
        let btype = preprocess::detect(&payload);
        let span = ctx.cfg.compression.props().delta2_span;
        if let Some(filtered) = preprocess::apply(&ctx.cfg.preprocess, &payload, btype, span) {
            pool.put(std::mem::replace(&mut payload, filtered));
            flags |= CHUNK_FLAG_PREPROC;
        }
    }

    let original_size = payload.len() as u64;
    let (effective_algo, compressed) = ctx.cfg.compression.compress_chunk(&payload);
    if ctx.cfg.compression.algorithm == CompressionAlgorithm::Adapt {
        flags |= (effective_algo.wire_id() & CHUNK_ALGO_MASK) << CHUNK_ALGO_SHIFT;
    }
    let (mut stored, raw_stored) = match compressed {
        Some(out) => {
            pool.put(std::mem::replace(&mut payload, Vec::new()));
            (out, false)
        }
        // The codec could not shrink this chunk; store it as-is.
        None => (payload, true),
    };

    if let Some(crypto) = &ctx.crypto {
        crypto.apply_keystream(id, &mut stored);
    }

    let mut header = ChunkHeader {
        stored_size: stored.len() as u64,
        raw_stored,
        cksum: HashSum::new(),
        original_size,
        flags,
    };
    header.cksum = ctx.chunk_tag(id, &header, &stored);
    Ok(ChunkRecord {
        id,
        header,
        payload: stored,
        source_size,
    })
}

/// Run the decompression pipeline over one chunk record.
///
/// Verification comes first: nothing is decrypted or decoded unless the
/// received MAC (or checksum) matches.
pub fn restore_chunk(
    ctx: &PipelineCtx,
    id: u64,
    header: ChunkHeader,
    mut payload: Vec<u8>,
) -> Result<RestoredChunk, Error> {
    if ctx.canceled() {
        return Err(Error::Canceled);
    }
    if payload.len() as u64 != header.stored_size {
        return Err(Error::Format(format!(
            "chunk {} payload does not match its header",
            id
        )));
    }

    match &ctx.crypto {
        Some(crypto) => {
            let ok = crypto.verify_mac(
                &[
                    &header.size_field().to_be_bytes(),
                    &header.original_size.to_be_bytes(),
                    &[header.flags],
                    &id.to_be_bytes(),
                    &payload,
                ],
                header.cksum.slice(),
            );
            if !ok {
                return Err(Error::integrity(id));
            }
            crypto.apply_keystream(id, &mut payload);
        }
        None => {
            if ctx.cfg.cksum.tree_digest(&payload) != header.cksum {
                return Err(Error::integrity(id));
            }
        }
    }

    let mut data = if header.raw_stored {
        payload
    } else {
        let algorithm = if ctx.cfg.compression.algorithm == CompressionAlgorithm::Adapt {
            CompressionAlgorithm::from_wire_id(header.algo_id())
                .ok_or_else(|| Error::Format(format!("chunk {}: unknown back-end id", id)))?
        } else {
            ctx.cfg.compression.algorithm
        };
        ctx.cfg.compression.decompress(
            algorithm,
            &payload,
            header.original_size as usize,
            ctx.file_version,
        )?
    };
    if data.len() as u64 != header.original_size {
        return Err(Error::integrity(id));
    }

    if header.flags & CHUNK_FLAG_PREPROC != 0 {
        data = preprocess::reverse(&data, id)?;
    }

    Ok(RestoredChunk {
        id,
        data,
        dedup: header.flags & CHUNK_FLAG_DEDUP != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::MacKind;
    use crate::chunker;
    use crate::codec::Compression;
    use crate::config::EncryptConfig;
    use crate::crypto::{derive_keys, CipherKind, ScryptParams, SALT_LEN};
    use crate::dedup::DedupConfig;
    use crate::preprocess::PreprocessConfig;

    fn plain_ctx(compression: Compression) -> PipelineCtx {
        PipelineCtx {
            cfg: PipelineConfig::new(compression),
            crypto: None,
            dedup: None,
            cancel: Arc::new(AtomicBool::new(false)),
            file_version: crate::format::VERSION,
        }
    }

    fn crypto_ctx(cipher: CipherKind) -> CryptoCtx {
        let params = ScryptParams { log_n: 10, r: 8, p: 1 };
        let keys = derive_keys(b"pw", &[0u8; SALT_LEN], params, cipher.normalize_key_len(32))
            .unwrap();
        CryptoCtx::new(cipher, keys, vec![0x55; cipher.nonce_len()], MacKind::HmacSha256)
    }

    fn round_trip(ctx: &PipelineCtx, data: Vec<u8>) -> RestoredChunk {
        let record = process_chunk(ctx, ChunkJob { id: 0, data }).unwrap();
        restore_chunk(ctx, record.id, record.header, record.payload).unwrap()
    }

    #[test]
    fn compressible_chunk_round_trips() {
        let ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Zlib, 6));
        let data = b"abcdefgh".repeat(64 * 1024);
        let record = process_chunk(&ctx, ChunkJob { id: 0, data: data.clone() }).unwrap();
        assert!(!record.header.raw_stored);
        assert!(record.payload.len() < data.len());
        let restored = restore_chunk(&ctx, 0, record.header, record.payload).unwrap();
        assert_eq!(restored.data, data);
        assert!(!restored.dedup);
    }

    #[test]
    fn incompressible_chunk_is_stored_raw() {
        let ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Lz4, 1));
        let mut seed = 5u64;
        let data: Vec<u8> = (0..128 * 1024)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                (seed >> 33) as u8
            })
            .collect();
        let record = process_chunk(&ctx, ChunkJob { id: 0, data: data.clone() }).unwrap();
        assert!(record.header.raw_stored);
        assert_eq!(record.header.stored_size as usize, data.len());
        let restored = restore_chunk(&ctx, 0, record.header, record.payload).unwrap();
        assert_eq!(restored.data, data);
    }

    #[test]
    fn encrypted_chunk_round_trips_and_detects_tampering() {
        for cipher in [CipherKind::AesCtr, CipherKind::XSalsa20] {
            let mut ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Zlib, 6));
            ctx.cfg.encrypt = Some(EncryptConfig::new(cipher, b"pw".to_vec()));
            ctx.crypto = Some(crypto_ctx(cipher));
            let data = b"sensitive payload ".repeat(4096);

            let record = process_chunk(&ctx, ChunkJob { id: 3, data: data.clone() }).unwrap();
            let restored =
                restore_chunk(&ctx, 3, record.header.clone(), record.payload.clone()).unwrap();
            assert_eq!(restored.data, data);

            // A single flipped payload bit must fail MAC verification.
            let mut tampered = record.payload.clone();
            tampered[10] ^= 0x01;
            let err = restore_chunk(&ctx, 3, record.header.clone(), tampered).unwrap_err();
            assert!(matches!(err, Error::Integrity { chunk_id: Some(3) }));

            // So must a reordered chunk id.
            let err = restore_chunk(&ctx, 4, record.header, record.payload).unwrap_err();
            assert!(matches!(err, Error::Integrity { chunk_id: Some(4) }));
        }
    }

    #[test]
    fn plain_checksum_detects_corruption() {
        let ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Zlib, 6));
        let data = b"zyxw".repeat(16 * 1024);
        let record = process_chunk(&ctx, ChunkJob { id: 1, data }).unwrap();
        let mut tampered = record.payload;
        tampered[0] ^= 0x80;
        let err = restore_chunk(&ctx, 1, record.header, tampered).unwrap_err();
        assert!(matches!(err, Error::Integrity { chunk_id: Some(1) }));
    }

    #[test]
    fn preprocessed_chunk_round_trips() {
        let mut ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Zlib, 6));
        ctx.cfg.preprocess = PreprocessConfig { lzp: true, delta2: false };
        let data = b"repetitive words repeating repetitively, repeating words\n".repeat(2048);
        let record = process_chunk(&ctx, ChunkJob { id: 0, data: data.clone() }).unwrap();
        assert_ne!(record.header.flags & CHUNK_FLAG_PREPROC, 0);
        let restored = restore_chunk(&ctx, 0, record.header, record.payload).unwrap();
        assert_eq!(restored.data, data);
    }

    #[test]
    fn adaptive_mode_records_the_back_end() {
        let ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Adapt, 6));
        let data = b"adaptive probing payload ".repeat(8 * 1024);
        let record = process_chunk(&ctx, ChunkJob { id: 0, data: data.clone() }).unwrap();
        assert_ne!(record.header.algo_id(), 0);
        let restored = restore_chunk(&ctx, 0, record.header, record.payload).unwrap();
        assert_eq!(restored.data, data);
    }

    #[test]
    fn deduped_chunk_flags_for_writer_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Lz4, 1));
        ctx.cfg.chunk_size = 64 * 1024;
        let mut dedup_config = DedupConfig::new(chunker::Config::Rabin(
            chunker::SplitConfig {
                min_block_size: 256,
                avg_block_size: 1024,
                max_block_size: 8192,
                window_size: 32,
            },
        ));
        dedup_config.tmp_dir = dir.path().to_path_buf();
        ctx.dedup = Some(Deduper::new(&dedup_config, 64 * 1024, Some(128 * 1024), 1).unwrap());

        let chunk: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 247) as u8).collect();
        let first = process_chunk(&ctx, ChunkJob { id: 0, data: chunk.clone() }).unwrap();
        assert_eq!(first.header.flags & CHUNK_FLAG_DEDUP, 0);
        let second = process_chunk(&ctx, ChunkJob { id: 1, data: chunk.clone() }).unwrap();
        assert_ne!(second.header.flags & CHUNK_FLAG_DEDUP, 0);

        // The restored payload is a descriptor stream the writer expands.
        let restored = restore_chunk(&ctx, 1, second.header, second.payload).unwrap();
        assert!(restored.dedup);
        let expanded = crate::dedup::expand(
            &restored.data,
            1,
            chunk.len() as u64,
            |offset, buf| {
                buf.copy_from_slice(&chunk[offset as usize..offset as usize + buf.len()]);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(expanded, chunk);
    }

    #[test]
    fn canceled_context_refuses_work() {
        let ctx = plain_ctx(Compression::new(crate::codec::CompressionAlgorithm::Zlib, 6));
        ctx.cancel.store(true, Ordering::Release);
        let err = process_chunk(&ctx, ChunkJob { id: 0, data: vec![0; 1024] }).unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
