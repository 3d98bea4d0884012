//! Checksum and keyed-MAC registry.
//!
//! All digest kinds share one calling convention and a stable wire id so the
//! active kind can be recorded in the container prologue. Large buffers can
//! be digested with [`CksumKind::tree_digest`], a 4-lane interleaved tree
//! hash whose output depends only on the input bytes and digest kind.

use blake2::Blake2bMac512;
use crc::Crc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512, Sha512_256};
use sha3::{Keccak256, Keccak512};

use crate::HashSum;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// Leaf block size of the tree hash.
const TREE_BLK: usize = 2048;
/// Number of interleaved leaf streams.
const TREE_LANES: usize = 4;

/// Supported checksum kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CksumKind {
    Xxh32,
    Crc32,
    Crc64,
    Sha256,
    Sha512,
    Sha512T256,
    Keccak256,
    Keccak512,
    Blake2b,
}

impl CksumKind {
    /// Value stored in the container prologue.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::Xxh32 => 1,
            Self::Crc32 => 2,
            Self::Crc64 => 3,
            Self::Sha256 => 4,
            Self::Sha512 => 5,
            Self::Sha512T256 => 6,
            Self::Keccak256 => 7,
            Self::Keccak512 => 8,
            Self::Blake2b => 9,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Xxh32),
            2 => Some(Self::Crc32),
            3 => Some(Self::Crc64),
            4 => Some(Self::Sha256),
            5 => Some(Self::Sha512),
            6 => Some(Self::Sha512T256),
            7 => Some(Self::Keccak256),
            8 => Some(Self::Keccak512),
            9 => Some(Self::Blake2b),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "xxh32" => Some(Self::Xxh32),
            "crc32" => Some(Self::Crc32),
            "crc64" => Some(Self::Crc64),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            "sha512t256" => Some(Self::Sha512T256),
            "keccak256" => Some(Self::Keccak256),
            "keccak512" => Some(Self::Keccak512),
            "blake2b" => Some(Self::Blake2b),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Xxh32 => "xxh32",
            Self::Crc32 => "crc32",
            Self::Crc64 => "crc64",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Sha512T256 => "sha512t256",
            Self::Keccak256 => "keccak256",
            Self::Keccak512 => "keccak512",
            Self::Blake2b => "blake2b",
        }
    }

    /// Digest size in bytes, which is also the size of the checksum field in
    /// each chunk record.
    pub fn size(self) -> usize {
        match self {
            Self::Xxh32 | Self::Crc32 => 4,
            Self::Crc64 => 8,
            Self::Sha256 | Self::Sha512T256 | Self::Keccak256 => 32,
            Self::Sha512 | Self::Keccak512 | Self::Blake2b => 64,
        }
    }

    /// Plain single-pass digest.
    pub fn digest(self, data: &[u8]) -> HashSum {
        match self {
            Self::Xxh32 => {
                HashSum::from_slice(&xxhash_rust::xxh32::xxh32(data, 0).to_be_bytes())
            }
            Self::Crc32 => HashSum::from_slice(&CRC32.checksum(data).to_be_bytes()),
            Self::Crc64 => HashSum::from_slice(&CRC64.checksum(data).to_be_bytes()),
            Self::Sha256 => HashSum::from_slice(&Sha256::digest(data)),
            Self::Sha512 => HashSum::from_slice(&Sha512::digest(data)),
            Self::Sha512T256 => HashSum::from_slice(&Sha512_256::digest(data)),
            Self::Keccak256 => HashSum::from_slice(&Keccak256::digest(data)),
            Self::Keccak512 => HashSum::from_slice(&Keccak512::digest(data)),
            Self::Blake2b => HashSum::from_slice(&blake2::Blake2b512::digest(data)),
        }
    }

    /// Tree-structured digest for large buffers.
    ///
    /// Input is split into 4 interleaved streams of 2 KiB blocks which are
    /// hashed independently, reduced pairwise to 2 digests and finally to
    /// one. Falls back to the plain digest when the input is not larger than
    /// two blocks. The non-cryptographic kinds are always digested serially.
    pub fn tree_digest(self, data: &[u8]) -> HashSum {
        match self {
            Self::Xxh32 | Self::Crc32 | Self::Crc64 => self.digest(data),
            _ if data.len() <= 2 * TREE_BLK => self.digest(data),
            Self::Sha256 => tree_digest_of::<Sha256>(data),
            Self::Sha512 => tree_digest_of::<Sha512>(data),
            Self::Sha512T256 => tree_digest_of::<Sha512_256>(data),
            Self::Keccak256 => tree_digest_of::<Keccak256>(data),
            Self::Keccak512 => tree_digest_of::<Keccak512>(data),
            Self::Blake2b => tree_digest_of::<blake2::Blake2b512>(data),
        }
    }
}

fn lane_digest<D: Digest>(data: &[u8], lane: usize) -> Vec<u8> {
    let full = (data.len() / TREE_BLK) * TREE_BLK;
    let mut ctx = D::new();
    let mut at = lane * TREE_BLK;
    while at < full {
        ctx.update(&data[at..at + TREE_BLK]);
        at += TREE_LANES * TREE_BLK;
    }
    // The tail that is not a full block belongs to the first stream.
    if lane == 0 && full < data.len() {
        ctx.update(&data[full..]);
    }
    ctx.finalize().to_vec()
}

fn tree_digest_of<D: Digest>(data: &[u8]) -> HashSum {
    let leaves: Vec<Vec<u8>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..TREE_LANES)
            .map(|lane| s.spawn(move || lane_digest::<D>(data, lane)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("tree hash lane"))
            .collect()
    });

    let pair = |a: &[u8], b: &[u8]| {
        let mut ctx = D::new();
        ctx.update(a);
        ctx.update(b);
        ctx.finalize().to_vec()
    };
    let left = pair(&leaves[0], &leaves[1]);
    let right = pair(&leaves[2], &leaves[3]);
    HashSum::from_vec(pair(&left, &right))
}

/// Supported keyed-MAC kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacKind {
    HmacSha256,
    HmacSha512,
    Blake2bMac,
}

impl MacKind {
    pub fn wire_id(self) -> u8 {
        match self {
            Self::HmacSha256 => 1,
            Self::HmacSha512 => 2,
            Self::Blake2bMac => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::HmacSha256),
            2 => Some(Self::HmacSha512),
            3 => Some(Self::Blake2bMac),
            _ => None,
        }
    }

    /// MAC size in bytes, which is also the size of the MAC field in each
    /// chunk record of an encrypted stream.
    pub fn size(self) -> usize {
        match self {
            Self::HmacSha256 => 32,
            Self::HmacSha512 | Self::Blake2bMac => 64,
        }
    }

    /// Compute the MAC of `parts` concatenated, keyed with `key`.
    pub fn mac(self, key: &[u8], parts: &[&[u8]]) -> HashSum {
        match self {
            Self::HmacSha256 => {
                let mut m =
                    Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
                for p in parts {
                    m.update(p);
                }
                HashSum::from_slice(&m.finalize().into_bytes())
            }
            Self::HmacSha512 => {
                let mut m =
                    Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
                for p in parts {
                    m.update(p);
                }
                HashSum::from_slice(&m.finalize().into_bytes())
            }
            Self::Blake2bMac => {
                let mut m = <Blake2bMac512 as Mac>::new_from_slice(key)
                    .expect("mac key longer than 64 bytes");
                for p in parts {
                    m.update(p);
                }
                HashSum::from_slice(&m.finalize().into_bytes())
            }
        }
    }

    /// Constant-shape verification of a received MAC value.
    pub fn verify(self, key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
        let sum = self.mac(key, parts);
        // Compare the full width even on early mismatch.
        if sum.len() != expected.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in sum.slice().iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}
