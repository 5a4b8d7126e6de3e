//! Primitive cryptographic operations (§4.1): CSPRNG, HMAC-SHA-512, SLIP-21
//! symmetric key derivation, XChaCha20-Poly1305 AEAD, PADMÉ length padding,
//! and timing-safe comparison.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use evolu_core::errors::CryptoError;
use hmac::{Hmac, Mac};
use rand_core::RngCore;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha512 = Hmac<Sha512>;

/// Nonce length for XChaCha20-Poly1305 (§4.1).
pub const XCHACHA20_NONCE_LEN: usize = 24;

/// Fill a freshly allocated `Vec<u8>` of length `n` with bytes from the
/// system CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// HMAC-SHA-512 over `msg` keyed by `key`. Used both directly and as the
/// building block of [`slip21`].
pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&result);
    out
}

/// SLIP-21 symmetric key derivation (§4.1, §4.2).
///
/// `seed` is the 32-byte secret to derive from; `path` is a sequence of UTF-8
/// path components (e.g. `["Evolu", "Owner Id"]`). Returns the 32-byte leaf
/// node at the end of the path.
pub fn slip21(seed: &[u8], path: &[&str]) -> Zeroizing<[u8; 32]> {
    let mut m = hmac_sha512(b"Symmetric key seed", seed);
    for component in path {
        let mut msg = Vec::with_capacity(1 + component.len());
        msg.push(0x00);
        msg.extend_from_slice(component.as_bytes());
        m = hmac_sha512(&m[0..32], &msg);
    }
    let mut leaf = [0u8; 32];
    leaf.copy_from_slice(&m[32..64]);
    Zeroizing::new(leaf)
}

/// Encrypt `plaintext` under `key` using XChaCha20-Poly1305 with a freshly
/// generated random nonce. Returns `(nonce, ciphertext)`.
pub fn xchacha20poly1305_encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
) -> Result<([u8; XCHACHA20_NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; XCHACHA20_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::DecryptFailed)?;
    Ok((nonce_bytes, ciphertext))
}

/// Decrypt a ciphertext produced by [`xchacha20poly1305_encrypt`].
pub fn xchacha20poly1305_decrypt(
    key: &[u8; 32],
    nonce: &[u8; XCHACHA20_NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Constant-time byte-slice comparison, used for write-key validation at the
/// relay (§4.7) so that a mismatching key cannot be brute-forced via timing.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// PADMÉ padding (§4.1): round `n` up to the nearest length permitted by the
/// PADMÉ scheme, bounding the information an observer can infer about the
/// true plaintext length from the padded ciphertext length.
///
/// `e = floor(log2(n)); s = floor(log2(e)); mask = (1 << (e - s)) - 1;
/// result = (n + mask) & !mask`.
pub fn padme_padded_length(n: usize) -> usize {
    if n < 2 {
        return n;
    }
    let e = (usize::BITS - 1 - n.leading_zeros()) as u32; // floor(log2(n))
    if e == 0 {
        return n;
    }
    let s = (u32::BITS - 1 - e.leading_zeros()) as u32; // floor(log2(e))
    let shift = e.saturating_sub(s);
    let mask: usize = (1usize << shift) - 1;
    (n + mask) & !mask
}

/// Generate a BIP-39 mnemonic from 128 bits of entropy (12 words, §4.1).
pub fn bip39_generate(entropy: &[u8; 16]) -> Result<String, CryptoError> {
    let mnemonic = bip39::Mnemonic::from_entropy(entropy).map_err(|_| CryptoError::InvalidMnemonic)?;
    Ok(mnemonic.to_string())
}

/// Derive the 64-byte BIP-39 seed from a mnemonic phrase (no passphrase,
/// §4.1/§4.2 — Evolu uses the seed purely as SLIP-21 input, not for a BIP-32
/// wallet tree).
pub fn bip39_seed(mnemonic: &str) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
    let parsed = bip39::Mnemonic::parse_normalized(mnemonic).map_err(|_| CryptoError::InvalidMnemonic)?;
    Ok(Zeroizing::new(parsed.to_seed("")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slip21_is_deterministic() {
        let seed = [7u8; 32];
        let a = slip21(&seed, &["Evolu", "Owner Id"]);
        let b = slip21(&seed, &["Evolu", "Owner Id"]);
        assert_eq!(*a, *b);
    }

    #[test]
    fn slip21_differs_by_path() {
        let seed = [7u8; 32];
        let a = slip21(&seed, &["Evolu", "Owner Id"]);
        let b = slip21(&seed, &["Evolu", "Encryption Key"]);
        assert_ne!(*a, *b);
    }

    #[test]
    fn aead_round_trips() {
        let key = [1u8; 32];
        let plaintext = b"evolu crdt message";
        let (nonce, ciphertext) = xchacha20poly1305_encrypt(&key, plaintext).unwrap();
        let decrypted = xchacha20poly1305_decrypt(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let key = [1u8; 32];
        let (nonce, mut ciphertext) = xchacha20poly1305_encrypt(&key, b"hello").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(xchacha20poly1305_decrypt(&key, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn timing_safe_eq_detects_mismatch() {
        assert!(timing_safe_eq(b"abc", b"abc"));
        assert!(!timing_safe_eq(b"abc", b"abd"));
        assert!(!timing_safe_eq(b"abc", b"ab"));
    }

    #[test]
    fn padme_rounds_up_and_is_stable() {
        for n in [1usize, 2, 3, 17, 100, 1000, 65_536] {
            let padded = padme_padded_length(n);
            assert!(padded >= n);
            // Idempotent: padding an already-padded length doesn't grow it further
            // beyond the next bucket boundary.
            assert_eq!(padme_padded_length(padded), padded);
        }
    }

    #[test]
    fn bip39_round_trips_through_seed() {
        let entropy = [9u8; 16];
        let mnemonic = bip39_generate(&entropy).unwrap();
        assert_eq!(mnemonic.split_whitespace().count(), 12);
        // Seed derivation should succeed and be deterministic.
        let seed_a = bip39_seed(&mnemonic).unwrap();
        let seed_b = bip39_seed(&mnemonic).unwrap();
        assert_eq!(*seed_a, *seed_b);
    }
}
