//! Container file format.
//!
//! A stream is a prologue followed by chunk records in input order and a
//! zero-size terminator record. All integers are big-endian.
//!
//! Prologue:
//!
//! | Offset | Size | Description                                   |
//! |--------|------|-----------------------------------------------|
//! |      0 |    4 | File magic ("PCMP").                          |
//! |      4 |    4 | Format version (u32).                         |
//! |      8 |    1 | Compression algorithm id.                     |
//! |      9 |    1 | Compression level.                            |
//! |     10 |    1 | Checksum kind id.                             |
//! |     11 |    1 | MAC kind id (0 without encryption).           |
//! |     12 |    8 | Chunk size (u64).                             |
//! |     20 |    4 | Stream flags (u32).                           |
//! |     24 |    n | Encryption block, or plain prologue checksum. |
//!
//! Encryption block: salt_len (u8), salt, scrypt log_n (u8), scrypt r
//! (u32), scrypt p (u32), nonce_len (u8), nonce, mac_len (u8), MAC over
//! everything before it. Without encryption the prologue ends with a
//! checksum of the preceding bytes using the stream's checksum kind.
//!
//! Chunk record: stored size (u64, top bit set when the payload is stored
//! uncompressed), checksum or MAC, pre-codec size (u64), chunk flags (u8),
//! payload bytes.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::checksum::{CksumKind, MacKind};
use crate::codec::{Compression, CompressionAlgorithm};
use crate::crypto::{CipherKind, ScryptParams};
use crate::{Error, HashSum};

pub const MAGIC: &[u8; 4] = b"PCMP";
/// Version written by this implementation.
pub const VERSION: u32 = 9;
/// Oldest version this implementation reads.
pub const MIN_VERSION: u32 = 1;

/// Top bit of the stored-size field: payload stored uncompressed.
pub const CHSIZE_MASK: u64 = 1 << 63;

// Stream flags.
pub const FLAG_DEDUP: u32 = 1;
pub const FLAG_DEDUP_FIXED: u32 = 2;
pub const FLAG_SINGLE_CHUNK: u32 = 4;
pub const FLAG_ARCHIVE: u32 = 2048;
/// Cipher id lives in bits 4-5.
pub const MASK_CRYPTO: u32 = 0x30;
pub const CRYPTO_SHIFT: u32 = 4;

// Per-chunk flags.
pub const CHUNK_FLAG_DEDUP: u8 = 2;
pub const CHUNK_FLAG_PREPROC: u8 = 4;
/// In adaptive mode bits 4-6 carry the back-end that won the chunk.
pub const CHUNK_ALGO_SHIFT: u8 = 4;
pub const CHUNK_ALGO_MASK: u8 = 7;

/// Encryption parameters carried by the prologue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrologueCrypto {
    pub cipher: CipherKind,
    pub salt: Vec<u8>,
    pub params: ScryptParams,
    pub nonce: Vec<u8>,
}

/// Parsed stream prologue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prologue {
    pub version: u32,
    pub compression: Compression,
    pub cksum: CksumKind,
    pub mac: Option<MacKind>,
    pub chunk_size: u64,
    pub flags: u32,
    pub crypto: Option<PrologueCrypto>,
}

impl Prologue {
    /// Serialize the authenticated region: every field up to, but not
    /// including, the MAC or checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.push(self.compression.algorithm.wire_id());
        out.push(self.compression.level);
        out.push(self.cksum.wire_id());
        out.push(self.mac.map(MacKind::wire_id).unwrap_or(0));
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        if let Some(crypto) = &self.crypto {
            out.push(crypto.salt.len() as u8);
            out.extend_from_slice(&crypto.salt);
            out.push(crypto.params.log_n);
            out.extend_from_slice(&crypto.params.r.to_be_bytes());
            out.extend_from_slice(&crypto.params.p.to_be_bytes());
            out.push(crypto.nonce.len() as u8);
            out.extend_from_slice(&crypto.nonce);
        }
        out
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }
}

/// Read and structurally validate a prologue.
///
/// Returns the prologue, the bytes its MAC/checksum covers and the received
/// MAC/checksum; the caller verifies once key material is available.
pub async fn read_prologue<R>(reader: &mut R) -> Result<(Prologue, Vec<u8>, HashSum), Error>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; 24];
    reader.read_exact(&mut fixed).await.map_err(map_eof)?;
    if &fixed[0..4] != MAGIC {
        return Err(Error::Format("bad file magic".into()));
    }
    let version = u32::from_be_bytes(fixed[4..8].try_into().expect("4 bytes"));
    if !(MIN_VERSION..=VERSION).contains(&version) {
        return Err(Error::Format(format!("unsupported format version {}", version)));
    }
    let algorithm = CompressionAlgorithm::from_wire_id(fixed[8])
        .ok_or_else(|| Error::Format(format!("unknown compression algorithm {}", fixed[8])))?;
    let level = fixed[9];
    let cksum = CksumKind::from_wire_id(fixed[10])
        .ok_or_else(|| Error::Format(format!("unknown checksum kind {}", fixed[10])))?;
    let mac = match fixed[11] {
        0 => None,
        id => Some(
            MacKind::from_wire_id(id)
                .ok_or_else(|| Error::Format(format!("unknown mac kind {}", id)))?,
        ),
    };
    let chunk_size = u64::from_be_bytes(fixed[12..20].try_into().expect("8 bytes"));
    let flags = u32::from_be_bytes(fixed[20..24].try_into().expect("4 bytes"));

    let cipher_id = ((flags & MASK_CRYPTO) >> CRYPTO_SHIFT) as u8;
    let mut auth = fixed.to_vec();
    let (crypto, tag) = if cipher_id != 0 {
        let cipher = CipherKind::from_wire_id(cipher_id)
            .ok_or_else(|| Error::Format(format!("unknown cipher id {}", cipher_id)))?;
        let salt = read_len_prefixed(reader, &mut auth).await?;
        let mut params_buf = [0u8; 9];
        reader.read_exact(&mut params_buf).await.map_err(map_eof)?;
        auth.extend_from_slice(&params_buf);
        let params = ScryptParams {
            log_n: params_buf[0],
            r: u32::from_be_bytes(params_buf[1..5].try_into().expect("4 bytes")),
            p: u32::from_be_bytes(params_buf[5..9].try_into().expect("4 bytes")),
        };
        let nonce = read_len_prefixed(reader, &mut auth).await?;
        if nonce.len() != cipher.nonce_len() {
            return Err(Error::Format("bad nonce length".into()));
        }
        let mac_len = reader.read_u8().await.map_err(map_eof)? as usize;
        let expected = mac.map(MacKind::size).unwrap_or(0);
        if mac_len != expected {
            return Err(Error::Format("bad prologue mac length".into()));
        }
        let mut tag = vec![0u8; mac_len];
        reader.read_exact(&mut tag).await.map_err(map_eof)?;
        (
            Some(PrologueCrypto {
                cipher,
                salt,
                params,
                nonce,
            }),
            HashSum::from_vec(tag),
        )
    } else {
        let mut tag = vec![0u8; cksum.size()];
        reader.read_exact(&mut tag).await.map_err(map_eof)?;
        (None, HashSum::from_vec(tag))
    };

    Ok((
        Prologue {
            version,
            compression: Compression { algorithm, level },
            cksum,
            mac,
            chunk_size,
            flags,
            crypto,
        },
        auth,
        tag,
    ))
}

async fn read_len_prefixed<R>(reader: &mut R, auth: &mut Vec<u8>) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await.map_err(map_eof)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(map_eof)?;
    auth.push(len as u8);
    auth.extend_from_slice(&buf);
    Ok(buf)
}

/// Per-chunk record header.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkHeader {
    pub stored_size: u64,
    /// Payload stored without compression (CHSIZE_MASK was set).
    pub raw_stored: bool,
    /// Chunk checksum, or MAC in encrypted streams.
    pub cksum: HashSum,
    /// Payload size ahead of the codec (after dedup/preprocessing).
    pub original_size: u64,
    pub flags: u8,
}

impl ChunkHeader {
    /// The size field as it appears on the wire.
    pub fn size_field(&self) -> u64 {
        if self.raw_stored {
            self.stored_size | CHSIZE_MASK
        } else {
            self.stored_size
        }
    }

    /// Back-end recorded by the adaptive codec.
    pub fn algo_id(&self) -> u8 {
        (self.flags >> CHUNK_ALGO_SHIFT) & CHUNK_ALGO_MASK
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size_field().to_be_bytes());
        out.extend_from_slice(self.cksum.slice());
        out.extend_from_slice(&self.original_size.to_be_bytes());
        out.push(self.flags);
    }
}

/// The terminator record closing a stream.
pub const EOF_RECORD: [u8; 8] = [0u8; 8];

/// Read the next chunk record header; None at the terminator.
pub async fn read_chunk_header<R>(
    reader: &mut R,
    cksum_bytes: usize,
) -> Result<Option<ChunkHeader>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 8];
    reader.read_exact(&mut size_buf).await.map_err(map_eof)?;
    let size_field = u64::from_be_bytes(size_buf);
    if size_field == 0 {
        return Ok(None);
    }
    let mut cksum = vec![0u8; cksum_bytes];
    reader.read_exact(&mut cksum).await.map_err(map_eof)?;
    let mut tail = [0u8; 9];
    reader.read_exact(&mut tail).await.map_err(map_eof)?;
    Ok(Some(ChunkHeader {
        stored_size: size_field & !CHSIZE_MASK,
        raw_stored: size_field & CHSIZE_MASK != 0,
        cksum: HashSum::from_vec(cksum),
        original_size: u64::from_be_bytes(tail[0..8].try_into().expect("8 bytes")),
        flags: tail[8],
    }))
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Format("unexpected end of stream".into())
    } else {
        Error::Io(e)
    }
}
