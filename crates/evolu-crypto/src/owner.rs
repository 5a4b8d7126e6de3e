//! Owner/key derivation tree (§4.2).
//!
//! Every owner — `AppOwner`, `ShardOwner`, `SharedOwner`, `SharedReadonlyOwner`
//! — is derived from a 32-byte secret via fixed SLIP-21 paths, producing an
//! `OwnerId`, a 32-byte encryption key, and (except for `SharedReadonlyOwner`)
//! a 16-byte write key.

use crate::primitives::{hmac_sha512, random_bytes, slip21};
use base64::Engine;
use evolu_core::errors::CryptoError;
use evolu_core::identifiers::OwnerId;
use zeroize::Zeroizing;

/// Number of base64url characters an `OwnerId` is reduced to (§3): 21
/// characters cover 126 bits, the largest multiple of 6 bits not exceeding
/// the 128 bits available in the derived node.
const OWNER_ID_CHARS: usize = 21;

/// The 32-byte secret an owner and all its derived keys are built from.
///
/// For an `AppOwner` the secret is always constructed as `entropy(16) ||
/// expand(entropy)(16)` so that it can be losslessly re-encoded as the same
/// 12-word BIP-39 mnemonic it came from (§4.2, property 7). `ShardOwner`
/// secrets are plain SLIP-21 child outputs and are never mnemonic-encoded.
#[derive(Clone)]
pub struct OwnerSecret(pub Zeroizing<[u8; 32]>);

impl OwnerSecret {
    /// Wrap 32 raw bytes as an owner secret without any mnemonic structure.
    /// Used for shard/derived secrets that are never exported as mnemonics.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generate a fresh `AppOwner` secret: 128 bits of entropy, expanded to
    /// 32 bytes, together with the mnemonic that encodes it.
    pub fn generate_with_mnemonic() -> Result<(Self, String), CryptoError> {
        let entropy: [u8; 16] = random_bytes(16)
            .try_into()
            .map_err(|_| CryptoError::InvalidLength { expected: 16, actual: 0 })?;
        let mnemonic = crate::primitives::bip39_generate(&entropy)?;
        Ok((Self(Zeroizing::new(entropy_to_secret(&entropy))), mnemonic))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Expand 16 bytes of entropy into a 32-byte secret: the entropy itself,
/// followed by a deterministic 16-byte stretch so the result is always
/// re-derivable from the entropy alone.
fn entropy_to_secret(entropy: &[u8; 16]) -> [u8; 32] {
    let stretch = hmac_sha512(b"Evolu Owner Secret Expansion", entropy);
    let mut out = [0u8; 32];
    out[0..16].copy_from_slice(entropy);
    out[16..32].copy_from_slice(&stretch[0..16]);
    out
}

/// Recover an `OwnerSecret` from a BIP-39 mnemonic (§4.2, inverse of
/// [`OwnerSecret::generate_with_mnemonic`] via [`secret_to_mnemonic`]).
pub fn mnemonic_to_secret(mnemonic: &str) -> Result<OwnerSecret, CryptoError> {
    let parsed = bip39::Mnemonic::parse_normalized(mnemonic).map_err(|_| CryptoError::InvalidMnemonic)?;
    let entropy = parsed.to_entropy();
    if entropy.len() != 16 {
        return Err(CryptoError::InvalidMnemonic);
    }
    let mut entropy16 = [0u8; 16];
    entropy16.copy_from_slice(&entropy[..16]);
    Ok(OwnerSecret(Zeroizing::new(entropy_to_secret(&entropy16))))
}

/// Encode an `AppOwner` secret back to its 12-word mnemonic (§4.2, property
/// 7: `mnemonic_to_secret(secret_to_mnemonic(s)) == s`).
pub fn secret_to_mnemonic(secret: &OwnerSecret) -> Result<String, CryptoError> {
    let mut entropy = [0u8; 16];
    entropy.copy_from_slice(&secret.0[0..16]);
    crate::primitives::bip39_generate(&entropy)
}

/// Which kind of owner a derived [`Owner`] represents (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// The device's primary owner, created from a random or mnemonic-backed secret.
    App,
    /// A sub-owner derived from a parent via a SLIP-21 path, used to shard data.
    Shard,
    /// An owner whose keys are shared with other devices for collaborative writes.
    Shared,
    /// An owner whose keys are shared for read-only access (no write key).
    SharedReadonly,
}

/// A derived owner: identity plus the keys needed to write and decrypt its
/// data (§3).
#[derive(Clone)]
pub struct Owner {
    /// Which variant this owner is.
    pub kind: OwnerKind,
    /// The owner's public identifier.
    pub id: OwnerId,
    /// The write key presented to the relay, absent for `SharedReadonlyOwner`.
    pub write_key: Option<[u8; 16]>,
    /// The symmetric key used to encrypt/decrypt this owner's messages.
    pub encryption_key: [u8; 32],
    /// The underlying secret, retained so shard owners can be derived from
    /// this owner. Absent for `SharedReadonlyOwner`, which never holds a
    /// write-capable secret.
    pub secret: Option<OwnerSecret>,
    /// The BIP-39 mnemonic backing this owner, present only for `AppOwner`.
    pub mnemonic: Option<String>,
}

fn derive_owner_id(seed: &[u8]) -> OwnerId {
    let node = slip21(seed, &["Evolu", "Owner Id"]);
    // 21 base64url characters cover 126 bits; take the leading 16 bytes (128
    // bits) of the derived node and truncate the encoded string to 21 chars,
    // matching §3's "21 x 6 bits (126 bits)" derivation.
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&node[..16]);
    let truncated: String = encoded.chars().take(OWNER_ID_CHARS).collect();
    OwnerId::from_raw(truncated)
}

fn derive_encryption_key(seed: &[u8]) -> [u8; 32] {
    *slip21(seed, &["Evolu", "Encryption Key"])
}

fn derive_write_key(seed: &[u8]) -> [u8; 16] {
    let node = slip21(seed, &["Evolu", "Write Key"]);
    let mut key = [0u8; 16];
    key.copy_from_slice(&node[0..16]);
    key
}

/// Construct the device's primary `AppOwner` from a secret (§4.2).
pub fn create_app_owner(secret: OwnerSecret, mnemonic: Option<String>) -> Owner {
    let seed = secret.as_slice().to_vec();
    Owner {
        kind: OwnerKind::App,
        id: derive_owner_id(&seed),
        write_key: Some(derive_write_key(&seed)),
        encryption_key: derive_encryption_key(&seed),
        secret: Some(secret),
        mnemonic,
    }
}

/// Derive a `ShardOwner` from a parent owner and a path of shard labels
/// (§4.2). Uses the parent's secret as the SLIP-21 seed under
/// `["Evolu", "Shard", ...path]`.
pub fn derive_shard_owner(parent: &Owner, path: &[&str]) -> Result<Owner, CryptoError> {
    let parent_secret = parent.secret.as_ref().ok_or(CryptoError::InvalidLength {
        expected: 32,
        actual: 0,
    })?;

    let mut full_path: Vec<&str> = vec!["Evolu", "Shard"];
    full_path.extend_from_slice(path);

    let node = slip21(parent_secret.as_slice(), &full_path);
    let shard_secret = OwnerSecret::from_bytes(*node);

    let seed = shard_secret.as_slice().to_vec();
    Ok(Owner {
        kind: OwnerKind::Shard,
        id: derive_owner_id(&seed),
        write_key: Some(derive_write_key(&seed)),
        encryption_key: derive_encryption_key(&seed),
        secret: Some(shard_secret),
        mnemonic: None,
    })
}

/// Construct a `SharedOwner` from a secret received out-of-band (e.g. via an
/// invite link), carrying full write capability.
pub fn create_shared_owner(secret: OwnerSecret) -> Owner {
    let seed = secret.as_slice().to_vec();
    Owner {
        kind: OwnerKind::Shared,
        id: derive_owner_id(&seed),
        write_key: Some(derive_write_key(&seed)),
        encryption_key: derive_encryption_key(&seed),
        secret: Some(secret),
        mnemonic: None,
    }
}

/// Construct a `SharedReadonlyOwner` from just an `OwnerId` and encryption
/// key (no write key, no secret — this owner can decrypt but never write).
pub fn create_shared_readonly_owner(id: OwnerId, encryption_key: [u8; 32]) -> Owner {
    Owner {
        kind: OwnerKind::SharedReadonly,
        id,
        write_key: None,
        encryption_key,
        secret: None,
        mnemonic: None,
    }
}
