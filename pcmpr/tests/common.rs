#![allow(dead_code)]
use std::io::Cursor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use pcmpr::stream_format::{read_chunk_header, read_prologue, ChunkHeader, Prologue};
use pcmpr::{compress_stream, decompress_stream, CompressStats, DecompressStats, PipelineConfig};

pub async fn compress_to_vec(
    config: PipelineConfig,
    input: &[u8],
) -> (Vec<u8>, CompressStats) {
    let mut output = Cursor::new(Vec::new());
    let stats = compress_stream(
        config,
        Arc::new(AtomicBool::new(false)),
        Some(input.len() as u64),
        Cursor::new(input.to_vec()),
        &mut output,
    )
    .await
    .expect("compress");
    (output.into_inner(), stats)
}

pub async fn decompress_to_vec(
    archive: &[u8],
    password: Option<&[u8]>,
    num_workers: usize,
) -> Result<(Vec<u8>, DecompressStats), pcmpr::Error> {
    let mut output = Cursor::new(Vec::new());
    let stats = decompress_stream(
        Arc::new(AtomicBool::new(false)),
        password.map(|p| p.to_vec()),
        num_workers,
        Cursor::new(archive.to_vec()),
        &mut output,
    )
    .await?;
    Ok((output.into_inner(), stats))
}

pub async fn round_trip(config: PipelineConfig, input: &[u8]) -> Vec<u8> {
    let (archive, _) = compress_to_vec(config, input).await;
    let (restored, _) = decompress_to_vec(&archive, None, 4).await.expect("decompress");
    assert_eq!(restored, input);
    archive
}

/// Parse an archive's prologue and chunk headers, skipping payloads.
pub async fn walk_records(archive: &[u8]) -> (Prologue, Vec<ChunkHeader>) {
    let mut reader = &archive[..];
    let (prologue, _auth, _tag) = read_prologue(&mut reader).await.expect("prologue");
    let cksum_bytes = match prologue.mac {
        Some(mac) => mac.size(),
        None => prologue.cksum.size(),
    };
    let mut headers = Vec::new();
    while let Some(header) = read_chunk_header(&mut reader, cksum_bytes)
        .await
        .expect("chunk header")
    {
        let mut payload = vec![0u8; header.stored_size as usize];
        reader.read_exact(&mut payload).await.expect("payload");
        headers.push(header);
    }
    (prologue, headers)
}

/// Deterministic pseudo-random bytes, incompressible for practical purposes.
pub fn random_ish(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (seed >> 33) as u8
        })
        .collect()
}
