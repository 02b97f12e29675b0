//! Cryptographic primitives for endpoint security
//!
//! - **Identity & Authentication**: Ed25519 keypairs, convertible to X25519 for key agreement
//! - **Encryption**: three interchangeable AEAD ciphers keyed from an ECDH secret
//!
//! # Key schedule
//!
//! Two endpoints of the same algorithm agree on a shared secret. For each direction,
//! HKDF-SHA256 expands that secret with the cipher tag, the sender's public key and
//! the receiver's public key into the cipher key. The sender's per-endpoint counter
//! forms the nonce, so a key/nonce pair is never reused.

mod cipher;
mod keys;

pub use cipher::{CipherError, CipherKind, COUNTER_SIZE, NONCE_SIZE};
pub use keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

pub(crate) use keys::random_bytes;
