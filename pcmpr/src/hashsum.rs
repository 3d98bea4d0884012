use std::fmt;

use blake2::{Blake2b512, Digest};

/// A digest value: chunk checksum, record MAC or dedup fingerprint.
///
/// Nothing the registries produce is wider than [`HashSum::MAX_LEN`]
/// bytes, so the value lives inline and is cheap to copy between pipeline
/// stages. Two sums are equal when both length and content match.
#[derive(Clone, Copy)]
pub struct HashSum {
    len: u8,
    bytes: [u8; Self::MAX_LEN],
}

impl HashSum {
    /// Widest digest the checksum/MAC registries produce.
    pub const MAX_LEN: usize = 64;
    /// Width of a dedup fingerprint. Must stay a multiple of the machine
    /// word; the dedup index compares fingerprints word-wise.
    pub const FINGERPRINT_LEN: usize = 32;

    /// Empty sum, filled in once the digest is known.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of a dedup block: blake2 cut down to the fingerprint
    /// width.
    pub fn fingerprint(data: &[u8]) -> Self {
        let digest = Blake2b512::digest(data);
        Self::from_slice(&digest[..Self::FINGERPRINT_LEN])
    }

    pub fn from_slice(sum: &[u8]) -> Self {
        assert!(sum.len() <= Self::MAX_LEN, "digest wider than any registered kind");
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..sum.len()].copy_from_slice(sum);
        Self {
            len: sum.len() as u8,
            bytes,
        }
    }

    pub fn from_vec(sum: Vec<u8>) -> Self {
        Self::from_slice(&sum)
    }

    /// The digest bytes.
    pub fn slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length of the digest in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for HashSum {
    fn default() -> Self {
        Self {
            len: 0,
            bytes: [0u8; Self::MAX_LEN],
        }
    }
}

impl PartialEq for HashSum {
    fn eq(&self, other: &Self) -> bool {
        self.slice() == other.slice()
    }
}

impl Eq for HashSum {}

impl fmt::Display for HashSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.slice() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashSum({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_covers_length_and_content() {
        assert_eq!(HashSum::from_slice(&[1, 2, 3]), HashSum::from_slice(&[1, 2, 3]));
        assert_ne!(HashSum::from_slice(&[1, 2, 3]), HashSum::from_slice(&[1, 2, 3, 0]));
        assert_ne!(HashSum::from_slice(&[1, 2, 3]), HashSum::from_slice(&[1, 2, 0]));
        assert_ne!(HashSum::from_slice(&[]), HashSum::from_slice(&[0]));
    }

    #[test]
    fn new_sum_is_empty() {
        let sum = HashSum::new();
        assert!(sum.is_empty());
        assert_eq!(sum.slice(), &[] as &[u8]);
    }

    #[test]
    fn fingerprint_width_is_word_aligned() {
        let fp = HashSum::fingerprint(b"some block bytes");
        assert_eq!(fp.len(), HashSum::FINGERPRINT_LEN);
        assert_eq!(HashSum::FINGERPRINT_LEN % std::mem::size_of::<usize>(), 0);
    }

    #[test]
    fn fingerprint_is_a_blake2_prefix() {
        let full = Blake2b512::digest(b"some block bytes");
        assert_eq!(
            HashSum::fingerprint(b"some block bytes").slice(),
            &full[..HashSum::FINGERPRINT_LEN]
        );
    }

    #[test]
    fn display_is_lowercase_hex() {
        assert_eq!(HashSum::from_slice(&[0xab, 0x01, 0xff]).to_string(), "ab01ff");
        assert_eq!(format!("{:?}", HashSum::from_slice(&[0x0e])), "HashSum(0e)");
    }
}
