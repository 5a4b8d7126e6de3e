//! Cryptographic primitives and owner/key derivation (§4.1, §4.2).

pub mod owner;
pub mod primitives;

pub use owner::{
    create_app_owner, create_shared_owner, create_shared_readonly_owner, derive_shard_owner,
    mnemonic_to_secret, secret_to_mnemonic, Owner, OwnerKind, OwnerSecret,
};
pub use primitives::{
    bip39_generate, bip39_seed, hmac_sha512, padme_padded_length, random_bytes, slip21,
    timing_safe_eq, xchacha20poly1305_decrypt, xchacha20poly1305_encrypt, XCHACHA20_NONCE_LEN,
};
