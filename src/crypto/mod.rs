//! Key derivation, length-preserving stream encryption, and HMAC
//! authentication (§4.2 step 8, §6.4).
//!
//! Key derivation: Argon2id(password, salt=file-header random salt) → key.
//!
//! Encryption is intentionally **not** AEAD: §4.2 keeps authentication as a
//! separate HMAC-SHA256 pass over the whole framed chunk (header + payload),
//! so the cipher itself only needs to be length-preserving and reversible.
//! AES-256-CTR and XSalsa20 both satisfy that; an AEAD mode like AES-GCM
//! would append a tag and break the "ciphertext length == plaintext length"
//! invariant the container format depends on.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::config::CryptoAlgo;

/// Byte length of the random salt stored in the `FileHeader` and fed to Argon2id.
pub const SALT_LEN: usize = 16;
/// Byte length of the per-file nonce base that `chunk_iv` mixes with the chunk id.
pub const NONCE_LEN: usize = 16;
/// HMAC-SHA256 tag length, used as the chunk/header authenticator when crypto is on.
pub const HMAC_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("authentication failed — wrong password or corrupted data")]
    AuthFailed,
    #[error("payload too short to carry authentication data")]
    TooShort,
    #[error("data is encrypted but no password was provided")]
    MissingKey,
    #[error("failed to read password file: {0}")]
    PasswordFile(String),
}

/// Derive a 256-bit key from a password and the file's random salt.
/// Conservative Argon2id parameters: 64 MiB memory, 3 passes, 1 lane.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params =
        Params::new(64 * 1024, 3, 1, Some(32)).map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Read a password from a file (`-P <file>`), trimming exactly one trailing
/// newline. The in-memory buffer is zeroized as soon as it's no longer
/// needed; the returned `Zeroizing<String>` zeroizes itself on drop too.
pub fn get_pw_string(path: &std::path::Path) -> Result<Zeroizing<String>, CryptoError> {
    let mut raw = std::fs::read(path).map_err(|e| CryptoError::PasswordFile(e.to_string()))?;
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    let s = String::from_utf8(raw.clone())
        .map_err(|e| CryptoError::PasswordFile(e.to_string()))?;
    raw.zeroize();
    Ok(Zeroizing::new(s))
}

/// All per-run crypto state: the derived key plus the per-file nonce base
/// chunk IVs are mixed from. Zeroizes the key material on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct CryptoContext {
    #[zeroize(skip)]
    algo: CryptoAlgo,
    key: [u8; 32],
    nonce_base: [u8; NONCE_LEN],
}

impl CryptoContext {
    pub fn new(algo: CryptoAlgo, key: [u8; 32], nonce_base: [u8; NONCE_LEN]) -> Self {
        Self { algo, key, nonce_base }
    }

    /// The derived key, reused as the HMAC key for chunk/header
    /// authentication (§3: authentication always rides on the same derived
    /// key as encryption when crypto is enabled).
    pub fn mac_key(&self) -> [u8; 32] {
        self.key
    }

    /// The per-file nonce base, as stored verbatim in the `FileHeader` so a
    /// later decompress run can rebuild the same per-chunk IVs.
    pub fn nonce_base_for_header(&self) -> [u8; NONCE_LEN] {
        self.nonce_base
    }

    /// Per-chunk IV: the file's random nonce base XORed with the chunk id in
    /// its last 8 bytes. Distinct chunk ids can never collide onto the same
    /// keystream window as long as chunk ids are monotonically assigned,
    /// which the Producer guarantees (§4.3).
    fn chunk_iv(&self, chunk_id: u64) -> [u8; NONCE_LEN] {
        let mut iv = self.nonce_base;
        let ctr = chunk_id.to_be_bytes();
        for i in 0..8 {
            iv[NONCE_LEN - 8 + i] ^= ctr[i];
        }
        iv
    }

    /// Encrypt or decrypt `buf` in place. Both directions are the same XOR
    /// operation for a stream cipher, so one function serves both — the
    /// caller picks the direction only in the sense of when it's called in
    /// the pipeline (§4.2 step 8 vs its mirror on decode).
    pub fn crypt_buf(&self, chunk_id: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        let iv = self.chunk_iv(chunk_id);
        match self.algo {
            CryptoAlgo::None => Ok(()),
            CryptoAlgo::Aes => {
                use aes::Aes256;
                use ctr::cipher::{KeyIvInit, StreamCipher};
                type Aes256Ctr = ctr::Ctr64BE<Aes256>;
                let mut cipher = Aes256Ctr::new_from_slices(&self.key, &iv)
                    .map_err(|_| CryptoError::KeyDerivation("bad AES-CTR key/iv length".into()))?;
                cipher.apply_keystream(buf);
                Ok(())
            }
            CryptoAlgo::Salsa20 => {
                use salsa20::cipher::{KeyIvInit, StreamCipher};
                use salsa20::XSalsa20;
                // XSalsa20 takes a 24-byte nonce; extend our 16-byte base
                // with 8 zero bytes, keeping the chunk-id mixing above as
                // the only per-chunk entropy source.
                let mut xnonce = [0u8; 24];
                xnonce[..NONCE_LEN].copy_from_slice(&iv);
                let mut cipher = XSalsa20::new_from_slices(&self.key, &xnonce)
                    .map_err(|_| CryptoError::KeyDerivation("bad XSalsa20 key/nonce length".into()))?;
                cipher.apply_keystream(buf);
                Ok(())
            }
        }
    }
}

/// HMAC-SHA256 authenticator used for both chunk frames and the `FileHeader`
/// when crypto is enabled (§3, §6.4). CRC32 ([`crate::checksum`]) plays this
/// role instead when crypto is disabled.
pub struct HmacAuth(Hmac<Sha256>);

impl HmacAuth {
    pub fn new(key: &[u8; 32]) -> Self {
        Self(Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length"))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; HMAC_LEN] {
        self.0.finalize().into_bytes().into()
    }

    /// One-shot compute over a single buffer.
    pub fn compute(key: &[u8; 32], data: &[u8]) -> [u8; HMAC_LEN] {
        let mut mac = Self::new(key);
        mac.update(data);
        mac.finalize()
    }

    /// Constant-time tag comparison — never short-circuit on mismatch.
    pub fn verify(key: &[u8; 32], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(tag).map_err(|_| CryptoError::AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic_per_salt() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key("hunter2", &salt).unwrap();
        let b = derive_key("hunter2", &salt).unwrap();
        assert_eq!(a, b);
        let c = derive_key("hunter2", &[8u8; SALT_LEN]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn aes_ctr_round_trips_and_preserves_length() {
        let ctx = CryptoContext::new(CryptoAlgo::Aes, [1u8; 32], [2u8; NONCE_LEN]);
        let mut buf = b"the quick brown fox jumps over the lazy dog".to_vec();
        let orig_len = buf.len();
        let plaintext = buf.clone();
        ctx.crypt_buf(42, &mut buf).unwrap();
        assert_eq!(buf.len(), orig_len);
        assert_ne!(buf, plaintext);
        ctx.crypt_buf(42, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn salsa20_round_trips_and_preserves_length() {
        let ctx = CryptoContext::new(CryptoAlgo::Salsa20, [3u8; 32], [4u8; NONCE_LEN]);
        let mut buf = vec![9u8; 257];
        let orig_len = buf.len();
        let plaintext = buf.clone();
        ctx.crypt_buf(5, &mut buf).unwrap();
        assert_eq!(buf.len(), orig_len);
        assert_ne!(buf, plaintext);
        ctx.crypt_buf(5, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn different_chunk_ids_yield_different_ciphertext() {
        let ctx = CryptoContext::new(CryptoAlgo::Aes, [1u8; 32], [2u8; NONCE_LEN]);
        let plaintext = vec![0u8; 64];
        let mut a = plaintext.clone();
        let mut b = plaintext.clone();
        ctx.crypt_buf(1, &mut a).unwrap();
        ctx.crypt_buf(2, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hmac_detects_tampering() {
        let key = [9u8; 32];
        let data = b"authenticated frame contents";
        let tag = HmacAuth::compute(&key, data);
        assert!(HmacAuth::verify(&key, data, &tag).is_ok());
        let mut tampered = data.to_vec();
        tampered[0] ^= 0xff;
        assert!(HmacAuth::verify(&key, &tampered, &tag).is_err());
    }
}
