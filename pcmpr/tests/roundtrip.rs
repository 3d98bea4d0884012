mod common;

use common::*;
use pcmpr::stream_format::FLAG_SINGLE_CHUNK;
use pcmpr::{CksumKind, Compression, CompressionAlgorithm, PipelineConfig};

fn config(algorithm: CompressionAlgorithm, chunk_size: u64, num_workers: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new(Compression::new(algorithm, 6));
    config.chunk_size = chunk_size;
    config.num_workers = num_workers;
    config
}

// ============================================================================
// Incompressible data is stored raw, chunk by chunk
// ============================================================================
#[tokio::test]
async fn random_data_stores_every_chunk_raw() {
    let input = random_ish(10 << 20, 0xfeed);
    let cfg = config(CompressionAlgorithm::Lz4, 1 << 20, 4);
    let (archive, stats) = compress_to_vec(cfg, &input).await;

    let (prologue, headers) = walk_records(&archive).await;
    assert_eq!(prologue.chunk_size, 1 << 20);
    assert_eq!(headers.len(), 10);
    for header in &headers {
        assert!(header.raw_stored);
        assert_eq!(header.stored_size, 1 << 20);
    }
    // Output carries only the per-record and prologue overhead.
    assert!(stats.output_bytes > input.len() as u64);
    assert!(stats.output_bytes < input.len() as u64 + 4096);

    let (restored, _) = decompress_to_vec(&archive, None, 4).await.unwrap();
    assert_eq!(restored, input);
}

// ============================================================================
// Repetitive data collapses
// ============================================================================
#[tokio::test]
async fn repetitive_data_compresses_well() {
    let input = b"abcdefgh".repeat(4 << 20); // 32 MiB
    let cfg = config(CompressionAlgorithm::Zlib, 1 << 20, 4);
    let (archive, stats) = compress_to_vec(cfg, &input).await;

    assert!(archive.len() < 1 << 20);
    assert_eq!(stats.chunks, 32);
    let (_, headers) = walk_records(&archive).await;
    assert_eq!(headers.len(), 32);
    for header in &headers {
        assert!(!header.raw_stored);
    }

    let (restored, dstats) = decompress_to_vec(&archive, None, 4).await.unwrap();
    assert_eq!(restored, input);
    assert_eq!(dstats.chunks, 32);
    assert_eq!(dstats.output_bytes, input.len() as u64);
}

// ============================================================================
// All back-ends, odd sizes
// ============================================================================
#[tokio::test]
async fn all_backends_round_trip() {
    let mut input = b"structured text with some repetition, repetition. ".repeat(100_000);
    input.extend_from_slice(&random_ish(100_000, 42));
    for algorithm in [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zlib,
        CompressionAlgorithm::Brotli,
        CompressionAlgorithm::Adapt,
    ] {
        round_trip(config(algorithm, 1 << 20, 4), &input).await;
    }
}

#[tokio::test]
async fn empty_input_round_trips() {
    let archive = round_trip(config(CompressionAlgorithm::Zlib, 1 << 20, 4), &[]).await;
    let (_, headers) = walk_records(&archive).await;
    assert!(headers.is_empty());
}

#[tokio::test]
async fn single_byte_round_trips() {
    let archive = round_trip(config(CompressionAlgorithm::Zlib, 1 << 20, 4), b"x").await;
    let (prologue, headers) = walk_records(&archive).await;
    assert_eq!(headers.len(), 1);
    assert_ne!(prologue.flags & FLAG_SINGLE_CHUNK, 0);
}

#[tokio::test]
async fn exact_chunk_multiple_round_trips() {
    let input = b"zy".repeat(64 * 1024); // exactly 2 chunks of 64 KiB
    let archive = round_trip(config(CompressionAlgorithm::Zlib, 64 * 1024, 2), &input).await;
    let (_, headers) = walk_records(&archive).await;
    assert_eq!(headers.len(), 2);
}

#[tokio::test]
async fn final_short_chunk_keeps_its_size() {
    let input = random_ish(3 * 64 * 1024 + 777, 7);
    let archive = round_trip(config(CompressionAlgorithm::Lz4, 64 * 1024, 4), &input).await;
    let (_, headers) = walk_records(&archive).await;
    assert_eq!(headers.len(), 4);
    assert_eq!(headers[3].original_size, 777);
}

// ============================================================================
// Parallel equivalence
// ============================================================================
#[tokio::test]
async fn worker_count_does_not_change_output() {
    let mut input = b"mixed content: repeated repeated repeated ".repeat(40_000);
    input.extend_from_slice(&random_ish(1 << 20, 99));

    let (serial, _) = compress_to_vec(config(CompressionAlgorithm::Zlib, 256 * 1024, 1), &input).await;
    let (parallel, _) =
        compress_to_vec(config(CompressionAlgorithm::Zlib, 256 * 1024, 8), &input).await;
    assert_eq!(serial, parallel);
}

#[tokio::test]
async fn checksum_kinds_round_trip() {
    let input = b"checksum coverage data ".repeat(50_000);
    for kind in [
        CksumKind::Xxh32,
        CksumKind::Crc64,
        CksumKind::Sha512,
        CksumKind::Blake2b,
    ] {
        let mut cfg = config(CompressionAlgorithm::Zlib, 256 * 1024, 4);
        cfg.cksum = kind;
        round_trip(cfg, &input).await;
    }
}

// ============================================================================
// Corruption detection without a MAC
// ============================================================================
#[tokio::test]
async fn plain_corruption_is_detected() {
    let input = b"payload to corrupt ".repeat(100_000);
    let (archive, _) = compress_to_vec(config(CompressionAlgorithm::Zlib, 256 * 1024, 4), &input).await;

    // Flip one bit somewhere inside the first chunk's payload.
    let mut corrupted = archive.clone();
    let at = archive.len() / 2;
    corrupted[at] ^= 0x01;
    let err = decompress_to_vec(&corrupted, None, 4).await.unwrap_err();
    assert!(matches!(
        err,
        pcmpr::Error::Integrity { .. } | pcmpr::Error::Codec(_) | pcmpr::Error::Format(_)
    ));

    // Corrupting the prologue fails up front.
    let mut corrupted = archive;
    corrupted[6] ^= 0x01;
    assert!(decompress_to_vec(&corrupted, None, 4).await.is_err());
}

#[tokio::test]
async fn truncated_stream_is_a_format_error() {
    let input = b"to be truncated ".repeat(100_000);
    let (archive, _) = compress_to_vec(config(CompressionAlgorithm::Zlib, 256 * 1024, 4), &input).await;
    let err = decompress_to_vec(&archive[..archive.len() - 9], None, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, pcmpr::Error::Format(_)));
}

// ============================================================================
// Archive bridge
// ============================================================================
#[tokio::test]
async fn archive_bridge_feeds_the_pipeline() {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    let members: Vec<Vec<u8>> = vec![
        b"first member contents ".repeat(10_000),
        random_ish(300_000, 3),
        b"third".to_vec(),
    ];
    let expect: Vec<u8> = members.concat();

    let cancel = Arc::new(AtomicBool::new(false));
    let (mut writer, reader) = pcmpr::bridge(4, cancel.clone());
    let feed = members.clone();
    let producer = tokio::spawn(async move {
        for member in feed {
            writer.send(member.into()).await.unwrap();
        }
        writer.close();
    });

    let mut cfg = config(CompressionAlgorithm::Zlib, 256 * 1024, 4);
    cfg.archive = true;
    let mut output = std::io::Cursor::new(Vec::new());
    pcmpr::compress_stream(cfg, cancel, Some(expect.len() as u64), reader, &mut output)
        .await
        .unwrap();
    producer.await.unwrap();

    let archive = output.into_inner();
    let (prologue, _) = walk_records(&archive).await;
    assert_ne!(prologue.flags & pcmpr::stream_format::FLAG_ARCHIVE, 0);
    let (restored, _) = decompress_to_vec(&archive, None, 4).await.unwrap();
    assert_eq!(restored, expect);
}

// ============================================================================
// Preprocessing
// ============================================================================
#[tokio::test]
async fn preprocessing_round_trips() {
    let mut cfg = config(CompressionAlgorithm::Zlib, 256 * 1024, 4);
    cfg.preprocess = pcmpr::PreprocessConfig {
        lzp: true,
        delta2: true,
    };
    let input = b"log line with fields repeating on and on and on\n".repeat(60_000);
    round_trip(cfg, &input).await;
}
