use crate::checksum::{CksumKind, MacKind};
use crate::codec::Compression;
use crate::crypto::{CipherKind, ScryptParams};
use crate::dedup::DedupConfig;
use crate::preprocess::PreprocessConfig;
use crate::Error;

pub const MIN_CHUNK_SIZE: u64 = 2048;
pub const MAX_CHUNK_SIZE: u64 = 1 << 30;
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Encryption settings for a stream.
///
/// Salt and nonce are normally generated; injecting them pins the output
/// bytes for reproducible streams.
#[derive(Clone, Debug)]
pub struct EncryptConfig {
    pub cipher: CipherKind,
    pub key_len: usize,
    pub password: Vec<u8>,
    pub params: ScryptParams,
    pub mac: MacKind,
    pub salt: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

impl EncryptConfig {
    pub fn new(cipher: CipherKind, password: Vec<u8>) -> Self {
        Self {
            cipher,
            key_len: cipher.normalize_key_len(32),
            password,
            params: ScryptParams::default(),
            mac: MacKind::HmacSha256,
            salt: None,
            nonce: None,
        }
    }
}

impl Drop for EncryptConfig {
    fn drop(&mut self) {
        for b in self.password.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

/// Immutable per-stream configuration, fixed before the first chunk is
/// dispatched.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub chunk_size: u64,
    pub compression: Compression,
    pub cksum: CksumKind,
    pub preprocess: PreprocessConfig,
    pub dedup: Option<DedupConfig>,
    pub encrypt: Option<EncryptConfig>,
    pub num_workers: usize,
    pub hide_stats: bool,
    pub archive: bool,
}

impl PipelineConfig {
    pub fn new(compression: Compression) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression,
            cksum: CksumKind::Sha256,
            preprocess: PreprocessConfig::default(),
            dedup: None,
            encrypt: None,
            num_workers: 4,
            hide_stats: false,
            archive: false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::Usage(format!(
                "chunk size must be between {} and {} bytes",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }
        if self.num_workers == 0 {
            return Err(Error::Usage("thread count must be at least 1".into()));
        }
        if let Some(dedup) = &self.dedup {
            let valid = match &dedup.split {
                crate::chunker::Config::Rabin(split) => {
                    split.is_valid() && split.max_block_size as u64 <= self.chunk_size
                }
                crate::chunker::Config::FixedSize(size) => {
                    *size > 0 && *size as u64 <= self.chunk_size
                }
            };
            if !valid {
                return Err(Error::Usage(
                    "dedup block sizes must be ordered and fit within a chunk".into(),
                ));
            }
            if dedup.pct_interval == 0 || dedup.pct_interval > 100 {
                return Err(Error::Usage("similarity interval must be 1-100".into()));
            }
        }
        if let Some(encrypt) = &self.encrypt {
            if encrypt.password.is_empty() {
                return Err(Error::Usage("encryption requires a password".into()));
            }
            if encrypt.key_len != 16 && encrypt.key_len != 32 {
                return Err(Error::Usage("key length must be 16 or 32 bytes".into()));
            }
            if let Some(salt) = &encrypt.salt {
                if salt.len() < crate::crypto::SALT_LEN {
                    return Err(Error::Usage("salt must be at least 16 bytes".into()));
                }
            }
            if let Some(nonce) = &encrypt.nonce {
                if nonce.len() != encrypt.cipher.nonce_len() {
                    return Err(Error::Usage(format!(
                        "nonce must be {} bytes for {}",
                        encrypt.cipher.nonce_len(),
                        encrypt.cipher.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker;
    use crate::codec::CompressionAlgorithm;

    fn base() -> PipelineConfig {
        PipelineConfig::new(Compression::new(CompressionAlgorithm::Zlib, 6))
    }

    #[test]
    fn default_config_is_valid() {
        base().validate().unwrap();
    }

    #[test]
    fn tiny_chunk_size_is_rejected() {
        let mut config = base();
        config.chunk_size = 512;
        assert!(matches!(config.validate(), Err(Error::Usage(_))));
    }

    #[test]
    fn dedup_blocks_must_fit_in_chunk() {
        let mut config = base();
        config.chunk_size = 64 * 1024;
        config.dedup = Some(DedupConfig::new(chunker::Config::Rabin(
            chunker::SplitConfig::from_avg(64 * 1024),
        )));
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_password_is_rejected() {
        let mut config = base();
        config.encrypt = Some(EncryptConfig::new(CipherKind::AesCtr, Vec::new()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_nonce_length_is_rejected() {
        let mut config = base();
        let mut encrypt = EncryptConfig::new(CipherKind::XSalsa20, b"pw".to_vec());
        encrypt.nonce = Some(vec![0u8; 8]);
        config.encrypt = Some(encrypt);
        assert!(config.validate().is_err());
    }
}
