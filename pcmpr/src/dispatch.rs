//! The reader/worker/writer core.
//!
//! One reader task slices the source into chunks and hands them, in input
//! order, to a pool of blocking workers running the per-chunk pipeline. The
//! writer drains the worker stream, which preserves dispatch order, so
//! chunk records are emitted exactly in input order with at most
//! `num_workers` chunks in flight and natural backpressure on the reader.
//!
//! Any task hitting a fatal error stores it in the shared error slot and
//! raises the cancel flag; the writer emits nothing further once the flag
//! is up, and the other tasks bail out at their next check.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer_pool::BufferPool;
use crate::checksum::MacKind;
use crate::config::PipelineConfig;
use crate::crypto::{self, CryptoCtx};
use crate::dedup::{self, Deduper, IndexMode};
use crate::format::{
    self, ChunkHeader, Prologue, PrologueCrypto, CRYPTO_SHIFT, EOF_RECORD, FLAG_ARCHIVE,
    FLAG_DEDUP, FLAG_DEDUP_FIXED, FLAG_SINGLE_CHUNK, VERSION,
};
use crate::pipeline::{self, ChunkJob, PipelineCtx};
use crate::{chunker, Error};

/// Slack allowed on top of the chunk size for stored payloads (inner
/// preprocessing header and filter overhead).
const STORED_SIZE_SLACK: u64 = 64 * 1024;

#[derive(Debug, Default)]
pub struct CompressStats {
    pub chunks: u64,
    pub source_bytes: u64,
    pub output_bytes: u64,
    pub smallest_chunk: u64,
    pub largest_chunk: u64,
    pub dedup_saved: u64,
    pub dedup_mode: Option<IndexMode>,
}

impl CompressStats {
    fn record_chunk(&mut self, source_size: u64, record_size: u64) {
        self.chunks += 1;
        self.source_bytes += source_size;
        self.output_bytes += record_size;
        if self.smallest_chunk == 0 || source_size < self.smallest_chunk {
            self.smallest_chunk = source_size;
        }
        if source_size > self.largest_chunk {
            self.largest_chunk = source_size;
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.output_bytes == 0 {
            return 0.0;
        }
        self.source_bytes as f64 / self.output_bytes as f64
    }
}

#[derive(Debug, Default)]
pub struct DecompressStats {
    pub chunks: u64,
    pub output_bytes: u64,
}

fn store_failure(failure: &mut Option<Error>, error: Error, cancel: &AtomicBool) {
    cancel.store(true, Ordering::Release);
    match failure {
        None => *failure = Some(error),
        // A real error beats the cancellations it caused in other tasks.
        Some(Error::Canceled) if !matches!(error, Error::Canceled) => *failure = Some(error),
        _ => {}
    }
}

fn build_stream_flags(cfg: &PipelineConfig, file_size: Option<u64>) -> u32 {
    let mut flags = 0u32;
    if let Some(dedup) = &cfg.dedup {
        flags |= match dedup.split {
            chunker::Config::FixedSize(_) => FLAG_DEDUP_FIXED,
            chunker::Config::Rabin(_) => FLAG_DEDUP,
        };
    }
    if let Some(encrypt) = &cfg.encrypt {
        flags |= u32::from(encrypt.cipher.wire_id()) << CRYPTO_SHIFT;
    }
    if matches!(file_size, Some(size) if size <= cfg.chunk_size) {
        flags |= FLAG_SINGLE_CHUNK;
    }
    if cfg.archive {
        flags |= FLAG_ARCHIVE;
    }
    flags
}

fn init_crypto(cfg: &PipelineConfig) -> Result<(Option<CryptoCtx>, Option<PrologueCrypto>), Error> {
    let encrypt = match &cfg.encrypt {
        Some(e) => e,
        None => return Ok((None, None)),
    };
    let salt = match &encrypt.salt {
        Some(salt) => salt.clone(),
        None => {
            let mut salt = vec![0u8; crypto::SALT_LEN];
            crypto::random_bytes(&mut salt)?;
            salt
        }
    };
    let nonce = match &encrypt.nonce {
        Some(nonce) => nonce.clone(),
        None => {
            let mut nonce = vec![0u8; encrypt.cipher.nonce_len()];
            crypto::random_bytes(&mut nonce)?;
            nonce
        }
    };
    let keys = crypto::derive_keys(&encrypt.password, &salt, encrypt.params, encrypt.key_len)?;
    let ctx = CryptoCtx::new(encrypt.cipher, keys, nonce.clone(), encrypt.mac);
    let prologue_crypto = PrologueCrypto {
        cipher: encrypt.cipher,
        salt,
        params: encrypt.params,
        nonce,
    };
    Ok((Some(ctx), Some(prologue_crypto)))
}

struct ReaderState<R> {
    input: R,
    next_id: u64,
    done: bool,
}

/// Compress `input` into `output` as one container stream.
///
/// `file_size` is the source size when known; it sizes the dedup index and
/// the single-chunk flag. The cancel flag may be raised externally (SIGINT)
/// at any time.
pub async fn compress_stream<R, W>(
    cfg: PipelineConfig,
    cancel: Arc<AtomicBool>,
    file_size: Option<u64>,
    input: R,
    mut output: W,
) -> Result<CompressStats, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    cfg.validate()?;
    let (crypto, prologue_crypto) = init_crypto(&cfg)?;
    let dedup = match &cfg.dedup {
        Some(dedup_cfg) => Some(Deduper::new(
            dedup_cfg,
            cfg.chunk_size,
            file_size,
            cfg.num_workers,
        )?),
        None => None,
    };

    let prologue = Prologue {
        version: VERSION,
        compression: cfg.compression,
        cksum: cfg.cksum,
        mac: cfg.encrypt.as_ref().map(|e| e.mac),
        chunk_size: cfg.chunk_size,
        flags: build_stream_flags(&cfg, file_size),
        crypto: prologue_crypto,
    };
    let mut prologue_bytes = prologue.to_bytes();
    match &crypto {
        Some(ctx) => {
            let tag = ctx.mac(&[&prologue_bytes]);
            prologue_bytes.push(tag.len() as u8);
            prologue_bytes.extend_from_slice(tag.slice());
        }
        None => {
            let tag = cfg.cksum.digest(&prologue_bytes);
            prologue_bytes.extend_from_slice(tag.slice());
        }
    }
    output.write_all(&prologue_bytes).await?;

    let num_workers = std::cmp::max(1, cfg.num_workers);
    let chunk_size = cfg.chunk_size as usize;
    let ctx = Arc::new(PipelineCtx {
        cfg,
        crypto,
        dedup,
        cancel: cancel.clone(),
        file_version: VERSION,
    });

    // Reader: fill fixed-size chunks; the final chunk may be short.
    let reader_cancel = cancel.clone();
    let jobs = stream::try_unfold(
        ReaderState {
            input,
            next_id: 0,
            done: false,
        },
        move |mut state| {
            let cancel = reader_cancel.clone();
            async move {
                if state.done || cancel.load(Ordering::Acquire) {
                    return Ok(None);
                }
                let mut buf = BufferPool::global().get(chunk_size);
                buf.resize(chunk_size, 0);
                let mut filled = 0usize;
                while filled < chunk_size {
                    let n = state
                        .input
                        .read(&mut buf[filled..])
                        .await
                        .map_err(Error::Io)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                if filled < chunk_size {
                    state.done = true;
                }
                let job = ChunkJob {
                    id: state.next_id,
                    data: buf,
                };
                state.next_id += 1;
                Ok(Some((job, state)))
            }
        },
    );

    // Workers: the ordered buffered stream bounds in-flight chunks and
    // keeps completion order equal to dispatch order at the writer.
    let worker_ctx = ctx.clone();
    let processed = jobs
        .map(move |result: Result<ChunkJob, Error>| {
            let ctx = worker_ctx.clone();
            tokio::task::spawn_blocking(move || match result {
                Ok(job) => pipeline::process_chunk(&ctx, job),
                Err(e) => Err(e),
            })
        })
        .buffered(num_workers);
    futures_util::pin_mut!(processed);

    // Writer: emit records in order; stop emitting on the first failure.
    let mut stats = CompressStats::default();
    let mut failure: Option<Error> = None;
    while let Some(joined) = processed.next().await {
        let result = joined.map_err(Error::from).and_then(|inner| inner);
        match result {
            Ok(record) => {
                if failure.is_some() || cancel.load(Ordering::Acquire) {
                    if failure.is_none() {
                        store_failure(&mut failure, Error::Canceled, &cancel);
                    }
                    continue;
                }
                let mut head = Vec::with_capacity(32 + record.header.cksum.len());
                record.header.encode(&mut head);
                let write_result = async {
                    output.write_all(&head).await?;
                    output.write_all(&record.payload).await
                }
                .await;
                match write_result {
                    Ok(()) => {
                        log::debug!(
                            "chunk {}: {} -> {} bytes{}",
                            record.id,
                            record.source_size,
                            record.header.stored_size,
                            if record.header.raw_stored { " (stored)" } else { "" },
                        );
                        stats.record_chunk(
                            record.source_size,
                            head.len() as u64 + record.header.stored_size,
                        );
                        BufferPool::global().put(record.payload);
                    }
                    Err(e) => store_failure(&mut failure, Error::Io(e), &cancel),
                }
            }
            Err(e) => store_failure(&mut failure, e, &cancel),
        }
    }
    drop(processed);

    if let Some(error) = failure {
        return Err(error);
    }
    output.write_all(&EOF_RECORD).await?;
    output.flush().await?;

    stats.output_bytes += prologue_bytes.len() as u64 + EOF_RECORD.len() as u64;
    if let Some(deduper) = &ctx.dedup {
        stats.dedup_saved = deduper.saved_bytes();
        stats.dedup_mode = Some(deduper.mode());
    }
    Ok(stats)
}

/// Reconstructed-output history used to resolve dedup back-references.
///
/// Every restored chunk is appended; references read earlier regions. Backed
/// by an unlinked scratch file so it works for unseekable outputs too.
struct History {
    file: std::fs::File,
    pos: u64,
}

impl History {
    fn new() -> Result<Self, Error> {
        Ok(Self {
            file: tempfile::tempfile().map_err(Error::Io)?,
            pos: 0,
        })
    }

    fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(self.pos)).map_err(Error::Io)?;
        self.file.write_all(data).map_err(Error::Io)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if offset + buf.len() as u64 > self.pos {
            return Err(Error::Integrity { chunk_id: None });
        }
        self.file.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
        self.file.read_exact(buf).map_err(Error::Io)?;
        Ok(())
    }
}

/// Derive and verify the stream keys against the prologue MAC.
///
/// The cipher key length is not recorded on the wire; the candidates the
/// cipher supports are tried against the MAC, which is keyed independently
/// of the payloads.
fn verify_stream_keys(
    prologue_crypto: &PrologueCrypto,
    mac: MacKind,
    password: &[u8],
    auth: &[u8],
    tag: &[u8],
) -> Result<CryptoCtx, Error> {
    let candidates: &[usize] = match prologue_crypto.cipher {
        crate::crypto::CipherKind::AesCtr => &[32, 16],
        crate::crypto::CipherKind::XSalsa20 => &[32],
    };
    for &key_len in candidates {
        let keys = crypto::derive_keys(
            password,
            &prologue_crypto.salt,
            prologue_crypto.params,
            key_len,
        )?;
        let ctx = CryptoCtx::new(
            prologue_crypto.cipher,
            keys,
            prologue_crypto.nonce.clone(),
            mac,
        );
        if ctx.verify_mac(&[auth], tag) {
            return Ok(ctx);
        }
    }
    // Wrong password, or a tampered prologue.
    Err(Error::Integrity { chunk_id: None })
}

/// Decompress a container stream from `input` into `output`.
pub async fn decompress_stream<R, W>(
    cancel: Arc<AtomicBool>,
    password: Option<Vec<u8>>,
    num_workers: usize,
    mut input: R,
    mut output: W,
) -> Result<DecompressStats, Error>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (prologue, auth_bytes, tag) = format::read_prologue(&mut input).await?;
    log::debug!(
        "stream: version {}, {} compression, chunk size {}",
        prologue.version,
        prologue.compression,
        prologue.chunk_size
    );

    let crypto = match &prologue.crypto {
        Some(prologue_crypto) => {
            let mac = prologue
                .mac
                .ok_or_else(|| Error::Format("encrypted stream without mac kind".into()))?;
            let password = password
                .ok_or_else(|| Error::Usage("stream is encrypted, password required".into()))?;
            Some(verify_stream_keys(
                prologue_crypto,
                mac,
                &password,
                &auth_bytes,
                tag.slice(),
            )?)
        }
        None => {
            if prologue.cksum.digest(&auth_bytes) != tag {
                return Err(Error::Integrity { chunk_id: None });
            }
            None
        }
    };

    let mut cfg = PipelineConfig::new(prologue.compression);
    cfg.chunk_size = prologue.chunk_size;
    cfg.cksum = prologue.cksum;
    cfg.num_workers = std::cmp::max(1, num_workers);

    let dedup_present = prologue.flags & (FLAG_DEDUP | FLAG_DEDUP_FIXED) != 0;
    let mut history = if dedup_present {
        Some(History::new()?)
    } else {
        None
    };

    let ctx = Arc::new(PipelineCtx {
        cfg,
        crypto,
        dedup: None,
        cancel: cancel.clone(),
        file_version: prologue.version,
    });

    let cksum_bytes = ctx.cksum_bytes();
    let max_stored = prologue.chunk_size + STORED_SIZE_SLACK;
    let reader_cancel = cancel.clone();
    let records = stream::try_unfold((input, 0u64), move |(mut input, next_id)| {
        let cancel = reader_cancel.clone();
        async move {
            if cancel.load(Ordering::Acquire) {
                return Ok(None);
            }
            let header = match format::read_chunk_header(&mut input, cksum_bytes).await? {
                Some(header) => header,
                None => return Ok(None),
            };
            if header.stored_size > max_stored {
                return Err(Error::Format(format!(
                    "chunk {}: stored size {} exceeds the chunk size",
                    next_id, header.stored_size
                )));
            }
            let mut payload = BufferPool::global().get(header.stored_size as usize);
            payload.resize(header.stored_size as usize, 0);
            input
                .read_exact(&mut payload)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => {
                        Error::Format("unexpected end of stream".into())
                    }
                    _ => Error::Io(e),
                })?;
            Ok(Some(((next_id, header, payload), (input, next_id + 1))))
        }
    });

    let worker_ctx = ctx.clone();
    let restored_stream = records
        .map(move |result: Result<(u64, ChunkHeader, Vec<u8>), Error>| {
            let ctx = worker_ctx.clone();
            tokio::task::spawn_blocking(move || match result {
                Ok((id, header, payload)) => pipeline::restore_chunk(&ctx, id, header, payload),
                Err(e) => Err(e),
            })
        })
        .buffered(std::cmp::max(1, num_workers));
    futures_util::pin_mut!(restored_stream);

    let mut stats = DecompressStats::default();
    let mut failure: Option<Error> = None;
    while let Some(joined) = restored_stream.next().await {
        let result = joined.map_err(Error::from).and_then(|inner| inner);
        match result {
            Ok(restored) => {
                if failure.is_some() || cancel.load(Ordering::Acquire) {
                    if failure.is_none() {
                        store_failure(&mut failure, Error::Canceled, &cancel);
                    }
                    continue;
                }
                let expand_result = if restored.dedup {
                    let history = history
                        .as_mut()
                        .ok_or_else(|| Error::Format("dedup chunk in non-dedup stream".into()));
                    history.and_then(|history| {
                        let pos = history.pos;
                        dedup::expand(&restored.data, restored.id, pos, |offset, buf| {
                            history.read_at(offset, buf)
                        })
                    })
                } else {
                    Ok(restored.data)
                };
                let data = match expand_result {
                    Ok(data) => data,
                    Err(e) => {
                        store_failure(&mut failure, e, &cancel);
                        continue;
                    }
                };
                if let Some(history) = history.as_mut() {
                    if let Err(e) = history.append(&data) {
                        store_failure(&mut failure, e, &cancel);
                        continue;
                    }
                }
                match output.write_all(&data).await {
                    Ok(()) => {
                        stats.chunks += 1;
                        stats.output_bytes += data.len() as u64;
                        BufferPool::global().put(data);
                    }
                    Err(e) => store_failure(&mut failure, Error::Io(e), &cancel),
                }
            }
            Err(e) => store_failure(&mut failure, e, &cancel),
        }
    }
    drop(restored_stream);

    if let Some(error) = failure {
        return Err(error);
    }
    output.flush().await?;
    Ok(stats)
}
