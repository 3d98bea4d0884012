//! Key derivation and the cipher envelope.
//!
//! Keys are derived from a password with scrypt. Chunk payloads are
//! encrypted with a CTR-mode stream keyed per chunk by the file's base nonce
//! plus the chunk id, so encryption is deterministic and any worker can
//! process any chunk. The prologue and every chunk record carry a keyed MAC.

use crate::checksum::MacKind;
use crate::{Error, HashSum};

/// Salt length written to the prologue.
pub const SALT_LEN: usize = 16;
/// Bytes of derived key material reserved for the MAC key.
const MAC_KEY_LEN: usize = 32;

/// scrypt cost parameters; `N = 2^log_n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScryptParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    /// Pick parameters from the memory budget available for key derivation.
    ///
    /// scrypt needs `128 * r * 2^log_n` bytes of scratch; the table trades
    /// hardness for staying inside the budget.
    pub fn for_memory_budget(budget_bytes: u64) -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        if budget_bytes >= GIB {
            Self { log_n: 15, r: 8, p: 1 }
        } else if budget_bytes >= 256 * 1024 * 1024 {
            Self { log_n: 14, r: 8, p: 1 }
        } else {
            Self { log_n: 12, r: 8, p: 1 }
        }
    }
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self::for_memory_budget(512 * 1024 * 1024)
    }
}

/// Fill `buf` with random bytes.
///
/// Falls back from the platform RNG to /dev/urandom to a keyed digest of the
/// monotonic clock, so salt and nonce generation cannot fail outright.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), Error> {
    if getrandom::getrandom(buf).is_ok() {
        return Ok(());
    }
    if let Ok(urandom) = std::fs::read("/dev/urandom") {
        if urandom.len() >= buf.len() {
            buf.copy_from_slice(&urandom[..buf.len()]);
            return Ok(());
        }
    }
    log::warn!("no system rng available, falling back to clock entropy");
    let mut filled = 0;
    let mut counter: u64 = 0;
    while filled < buf.len() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| Error::Resource("system clock unavailable".into()))?;
        let block = MacKind::HmacSha256.mac(
            &now.subsec_nanos().to_be_bytes(),
            &[&now.as_nanos().to_be_bytes(), &counter.to_be_bytes()],
        );
        let take = std::cmp::min(block.len(), buf.len() - filled);
        buf[filled..filled + take].copy_from_slice(&block.slice()[..take]);
        filled += take;
        counter += 1;
    }
    Ok(())
}

/// Derived key material, wiped on drop.
pub struct KeyMaterial {
    bytes: Vec<u8>,
    cipher_key_len: usize,
}

impl KeyMaterial {
    pub fn cipher_key(&self) -> &[u8] {
        &self.bytes[..self.cipher_key_len]
    }
    pub fn mac_key(&self) -> &[u8] {
        &self.bytes[self.cipher_key_len..]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

/// Derive cipher and MAC keys from a password.
pub fn derive_keys(
    password: &[u8],
    salt: &[u8],
    params: ScryptParams,
    cipher_key_len: usize,
) -> Result<KeyMaterial, Error> {
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, 32)
        .map_err(|e| Error::Usage(format!("invalid scrypt parameters: {}", e)))?;
    let mut bytes = vec![0u8; cipher_key_len + MAC_KEY_LEN];
    scrypt::scrypt(password, salt, &scrypt_params, &mut bytes)
        .map_err(|e| Error::Resource(format!("key derivation failed: {}", e)))?;
    Ok(KeyMaterial {
        bytes,
        cipher_key_len,
    })
}

/// The stream ciphers available for chunk encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    AesCtr,
    XSalsa20,
}

impl CipherKind {
    /// Value stored in the crypto bits of the prologue flags.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::AesCtr => 1,
            Self::XSalsa20 => 2,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::AesCtr),
            2 => Some(Self::XSalsa20),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES" => Some(Self::AesCtr),
            "SALSA20" | "XSALSA20" => Some(Self::XSalsa20),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AesCtr => "AES",
            Self::XSalsa20 => "SALSA20",
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Self::AesCtr => 8,
            Self::XSalsa20 => 24,
        }
    }

    /// Clamp a requested key length to what the cipher supports.
    pub fn normalize_key_len(self, requested: usize) -> usize {
        match self {
            Self::AesCtr => {
                if requested <= 16 {
                    16
                } else {
                    32
                }
            }
            // XSalsa20 keys are always 256 bits.
            Self::XSalsa20 => 32,
        }
    }
}

/// Add a chunk id to a base nonce.
///
/// The nonce is one big-endian integer spanning its full width; the id is
/// added to the lowest word and the carry propagates through the higher
/// words, so a wrap of the low word never aliases another stream position.
fn chunk_nonce(base_nonce: &[u8], chunk_id: u64) -> Vec<u8> {
    let mut nonce = base_nonce.to_vec();
    let mut carry = chunk_id;
    for word in nonce.rchunks_mut(8) {
        if carry == 0 {
            break;
        }
        let value = u64::from_be_bytes((&*word).try_into().expect("8 byte word"));
        let (sum, overflow) = value.overflowing_add(carry);
        word.copy_from_slice(&sum.to_be_bytes());
        carry = u64::from(overflow);
    }
    nonce
}

/// Per-stream crypto state shared by all workers.
pub struct CryptoCtx {
    cipher: CipherKind,
    keys: KeyMaterial,
    base_nonce: Vec<u8>,
    mac: MacKind,
}

impl CryptoCtx {
    pub fn new(cipher: CipherKind, keys: KeyMaterial, base_nonce: Vec<u8>, mac: MacKind) -> Self {
        debug_assert_eq!(base_nonce.len(), cipher.nonce_len());
        Self {
            cipher,
            keys,
            base_nonce,
            mac,
        }
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    pub fn mac_kind(&self) -> MacKind {
        self.mac
    }

    pub fn base_nonce(&self) -> &[u8] {
        &self.base_nonce
    }

    /// Encrypt or decrypt a chunk payload in place.
    ///
    /// The effective counter start is the base nonce plus the chunk id, so
    /// the transform is a pure function of (key, base nonce, chunk id).
    pub fn apply_keystream(&self, chunk_id: u64, data: &mut [u8]) {
        use aes::cipher::{KeyIvInit, StreamCipher};
        let nonce = chunk_nonce(&self.base_nonce, chunk_id);
        match self.cipher {
            CipherKind::AesCtr => {
                let mut iv = [0u8; 16];
                iv[..8].copy_from_slice(&nonce);
                match self.keys.cipher_key().len() {
                    16 => {
                        let mut cipher = ctr::Ctr64BE::<aes::Aes128>::new_from_slices(
                            self.keys.cipher_key(),
                            &iv,
                        )
                        .expect("fixed key and iv sizes");
                        cipher.apply_keystream(data);
                    }
                    _ => {
                        let mut cipher = ctr::Ctr64BE::<aes::Aes256>::new_from_slices(
                            self.keys.cipher_key(),
                            &iv,
                        )
                        .expect("fixed key and iv sizes");
                        cipher.apply_keystream(data);
                    }
                }
            }
            CipherKind::XSalsa20 => {
                let mut cipher =
                    salsa20::XSalsa20::new_from_slices(self.keys.cipher_key(), &nonce)
                        .expect("fixed key and nonce sizes");
                cipher.apply_keystream(data);
            }
        }
    }

    /// MAC over concatenated parts, keyed with the derived MAC key.
    pub fn mac(&self, parts: &[&[u8]]) -> HashSum {
        self.mac.mac(self.keys.mac_key(), parts)
    }

    pub fn verify_mac(&self, parts: &[&[u8]], expected: &[u8]) -> bool {
        self.mac.verify(self.keys.mac_key(), parts, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(cipher: CipherKind) -> CryptoCtx {
        let keys = derive_keys(
            b"pw",
            &[0u8; SALT_LEN],
            ScryptParams { log_n: 10, r: 8, p: 1 },
            cipher.normalize_key_len(32),
        )
        .unwrap();
        let nonce = vec![0x42; cipher.nonce_len()];
        CryptoCtx::new(cipher, keys, nonce, MacKind::HmacSha256)
    }

    #[test]
    fn keystream_round_trips() {
        for cipher in [CipherKind::AesCtr, CipherKind::XSalsa20] {
            let ctx = test_ctx(cipher);
            let plain = b"some chunk payload that is long enough to cross a block".to_vec();
            let mut data = plain.clone();
            ctx.apply_keystream(3, &mut data);
            assert_ne!(data, plain);
            ctx.apply_keystream(3, &mut data);
            assert_eq!(data, plain);
        }
    }

    #[test]
    fn chunk_nonce_carries_across_words() {
        let base = [&[0x01u8; 16][..], &[0xffu8; 8][..]].concat();
        let bumped = chunk_nonce(&base, 1);
        let mut expect = vec![0x01u8; 16];
        expect[15] = 0x02;
        expect.extend_from_slice(&[0x00; 8]);
        assert_eq!(bumped, expect);
        // An 8-byte nonce wraps within its single word.
        assert_eq!(chunk_nonce(&[0xff; 8], 1), vec![0x00; 8]);
        assert_eq!(chunk_nonce(&base, 0), base);
    }

    #[test]
    fn keystream_is_continuous_across_a_low_word_wrap() {
        let params = ScryptParams { log_n: 10, r: 8, p: 1 };
        let make = |nonce: Vec<u8>| {
            let keys = derive_keys(b"pw", &[0u8; SALT_LEN], params, 32).unwrap();
            CryptoCtx::new(CipherKind::XSalsa20, keys, nonce, MacKind::HmacSha256)
        };
        let base = [&[0x07u8; 16][..], &[0xffu8; 8][..]].concat();
        let ctx_base = make(base.clone());
        let ctx_carried = make(chunk_nonce(&base, 1));
        let mut a = vec![0u8; 48];
        let mut b = vec![0u8; 48];
        ctx_base.apply_keystream(1, &mut a);
        ctx_carried.apply_keystream(0, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn chunk_id_changes_keystream() {
        let ctx = test_ctx(CipherKind::AesCtr);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        ctx.apply_keystream(0, &mut a);
        ctx.apply_keystream(1, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn encryption_is_deterministic() {
        let ctx1 = test_ctx(CipherKind::XSalsa20);
        let ctx2 = test_ctx(CipherKind::XSalsa20);
        let mut a = b"identical input".to_vec();
        let mut b = a.clone();
        ctx1.apply_keystream(7, &mut a);
        ctx2.apply_keystream(7, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn derived_keys_depend_on_password_and_salt() {
        let params = ScryptParams { log_n: 10, r: 8, p: 1 };
        let k1 = derive_keys(b"pw", &[0u8; SALT_LEN], params, 32).unwrap();
        let k2 = derive_keys(b"px", &[0u8; SALT_LEN], params, 32).unwrap();
        let k3 = derive_keys(b"pw", &[1u8; SALT_LEN], params, 32).unwrap();
        assert_ne!(k1.cipher_key(), k2.cipher_key());
        assert_ne!(k1.cipher_key(), k3.cipher_key());
        assert_ne!(k1.cipher_key(), k1.mac_key());
    }

    #[test]
    fn random_bytes_fills_buffer() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a).unwrap();
        random_bytes(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn scrypt_param_table() {
        assert_eq!(
            ScryptParams::for_memory_budget(2 << 30),
            ScryptParams { log_n: 15, r: 8, p: 1 }
        );
        assert_eq!(
            ScryptParams::default(),
            ScryptParams { log_n: 14, r: 8, p: 1 }
        );
        assert_eq!(
            ScryptParams::for_memory_budget(64 << 20),
            ScryptParams { log_n: 12, r: 8, p: 1 }
        );
    }
}
