//! Payload encryption with interchangeable AEAD ciphers
//!
//! Every cipher here is keyed from the same input: the ECDH secret agreed
//! between a local and a remote endpoint. A directional key is derived with
//! HKDF-SHA256, so traffic from A to B and from B to A never share a key, and
//! each side's outgoing counter owns its nonce space.
//!
//! The encrypted format is: `counter (8 bytes, big endian) || ciphertext || tag (16 bytes)`.
//! The 96-bit nonce is `0x00000000 || counter`.

use std::fmt;
use std::str::FromStr;

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of the AEAD nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of the counter prefix on every ciphertext
pub const COUNTER_SIZE: usize = 8;

const KDF_LABEL: &[u8] = b"stanza-e2e/v1/";

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cipher error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The symmetric ciphers endpoints can agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes256Gcm,
    Aes128Gcm,
}

impl CipherKind {
    pub const ALL: [CipherKind; 3] = [
        CipherKind::ChaCha20Poly1305,
        CipherKind::Aes256Gcm,
        CipherKind::Aes128Gcm,
    ];

    /// Element name used for envelopes sealed with this cipher
    pub fn tag(&self) -> &'static str {
        match self {
            CipherKind::ChaCha20Poly1305 => "cha",
            CipherKind::Aes256Gcm => "aes",
            CipherKind::Aes128Gcm => "a128",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    fn key_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Poly1305 | CipherKind::Aes256Gcm => 32,
            CipherKind::Aes128Gcm => 16,
        }
    }

    /// Derive the key protecting traffic from `sender` to `receiver`
    pub fn derive_key(
        &self,
        shared_secret: &[u8],
        sender: &[u8],
        receiver: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let hk = Hkdf::<Sha256>::new(None, shared_secret);
        let mut info = Vec::with_capacity(KDF_LABEL.len() + 8 + sender.len() + receiver.len());
        info.extend_from_slice(KDF_LABEL);
        info.extend_from_slice(self.tag().as_bytes());
        info.push(0);
        info.extend_from_slice(sender);
        info.extend_from_slice(receiver);

        let mut okm = Zeroizing::new(vec![0u8; self.key_size()]);
        hk.expand(&info, &mut okm)
            .map_err(|_| anyhow::anyhow!("key derivation error"))?;
        Ok(okm)
    }

    /// Encrypt `data` under `key`, binding `aad`
    ///
    /// # Errors
    ///
    /// Returns an error if the key has the wrong size for this cipher.
    pub fn seal(
        &self,
        key: &[u8],
        counter: u64,
        aad: &[u8],
        data: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        let nonce = nonce(counter);
        let payload = Payload { msg: data, aad };
        let ciphertext = match self {
            CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .encrypt(Nonce::from_slice(&nonce), payload),
            CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .encrypt(Nonce::from_slice(&nonce), payload),
            CipherKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .encrypt(Nonce::from_slice(&nonce), payload),
        }
        .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(COUNTER_SIZE + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt and authenticate `data`; returns the counter and the plaintext
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Data is too short to contain the counter
    /// - Authentication tag verification fails (tampered data, wrong key or wrong aad)
    pub fn open(&self, key: &[u8], aad: &[u8], data: &[u8]) -> Result<(u64, Vec<u8>), CipherError> {
        if data.len() < COUNTER_SIZE {
            return Err(anyhow::anyhow!("data too short for counter").into());
        }
        let mut counter = [0u8; COUNTER_SIZE];
        counter.copy_from_slice(&data[..COUNTER_SIZE]);
        let counter = u64::from_be_bytes(counter);

        let nonce = nonce(counter);
        let payload = Payload {
            msg: &data[COUNTER_SIZE..],
            aad,
        };
        let plaintext = match self {
            CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .decrypt(Nonce::from_slice(&nonce), payload),
            CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .decrypt(Nonce::from_slice(&nonce), payload),
            CipherKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|_| anyhow::anyhow!("invalid key length"))?
                .decrypt(Nonce::from_slice(&nonce), payload),
        }
        .map_err(|_| anyhow::anyhow!("decrypt error"))?;

        Ok((counter, plaintext))
    }
}

fn nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - COUNTER_SIZE..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| anyhow::anyhow!("unknown cipher: {}", s).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys(kind: CipherKind) -> (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>) {
        let shared = [7u8; 32];
        let forward = kind.derive_key(&shared, b"alice", b"bob").unwrap();
        let backward = kind.derive_key(&shared, b"bob", b"alice").unwrap();
        (forward, backward)
    }

    #[test]
    fn test_seal_open_every_cipher() {
        for kind in CipherKind::ALL {
            let (key, _) = keys(kind);
            let sealed = kind.seal(&key, 42, b"aad", b"ping").unwrap();
            let (counter, plain) = kind.open(&key, b"aad", &sealed).unwrap();
            assert_eq!(counter, 42);
            assert_eq!(plain, b"ping");
        }
    }

    #[test]
    fn test_directional_keys_differ() {
        for kind in CipherKind::ALL {
            let (forward, backward) = keys(kind);
            assert_eq!(forward.len(), kind.key_size());
            assert_ne!(*forward, *backward);

            let sealed = kind.seal(&forward, 1, b"", b"ping").unwrap();
            assert!(kind.open(&backward, b"", &sealed).is_err());
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        let kind = CipherKind::Aes256Gcm;
        let (key, _) = keys(kind);
        let sealed = kind.seal(&key, 1, b"id=1", b"ping").unwrap();
        assert!(kind.open(&key, b"id=2", &sealed).is_err());
    }

    #[test]
    fn test_tampered_data_fails() {
        let kind = CipherKind::ChaCha20Poly1305;
        let (key, _) = keys(kind);
        let mut sealed = kind.seal(&key, 1, b"", b"hello world").unwrap();
        sealed[COUNTER_SIZE + 3] ^= 0xFF;
        assert!(kind.open(&key, b"", &sealed).is_err());

        // the counter is authenticated through the nonce
        let mut sealed = kind.seal(&key, 1, b"", b"hello world").unwrap();
        sealed[COUNTER_SIZE - 1] ^= 0x01;
        assert!(kind.open(&key, b"", &sealed).is_err());
    }

    #[test]
    fn test_short_input_rejected() {
        let kind = CipherKind::Aes128Gcm;
        let (key, _) = keys(kind);
        assert!(kind.open(&key, b"", &[0u8; 4]).is_err());
        assert!(kind.open(&key, b"", &[0u8; COUNTER_SIZE]).is_err());
    }

    #[test]
    fn test_tags_round_trip() {
        for kind in CipherKind::ALL {
            assert_eq!(kind.tag().parse::<CipherKind>().unwrap(), kind);
        }
        assert!("des".parse::<CipherKind>().is_err());
    }
}
