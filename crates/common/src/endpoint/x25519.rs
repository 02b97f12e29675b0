use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, CipherKind};

use super::{AlgorithmId, EndpointCapability, EndpointError, KeyMaterial, NAMESPACE_E2E};

const ID: AlgorithmId = AlgorithmId::new(NAMESPACE_E2E, "x25519");
const KEY_SIZE: usize = 32;

/// Montgomery-curve endpoints; agreement only, no signatures
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519Capability;

impl EndpointCapability for X25519Capability {
    fn id(&self) -> AlgorithmId {
        ID
    }

    fn score(&self) -> u32 {
        2
    }

    fn default_cipher(&self) -> CipherKind {
        CipherKind::Aes256Gcm
    }

    fn generate(&self, _desired_strength: u32) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let secret = StaticSecret::from(random_bytes::<KEY_SIZE>()?);
        Ok(Box::new(X25519Key {
            public: PublicKey::from(&secret),
            secret: Some(secret),
        }))
    }

    fn decode_public(&self, public_key: &[u8]) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let bytes: [u8; KEY_SIZE] = public_key.try_into().map_err(|_| {
            anyhow::anyhow!(
                "invalid x25519 key size, expected {}, got {}",
                KEY_SIZE,
                public_key.len()
            )
        })?;
        Ok(Box::new(X25519Key {
            public: PublicKey::from(bytes),
            secret: None,
        }))
    }
}

struct X25519Key {
    public: PublicKey,
    secret: Option<StaticSecret>,
}

impl std::fmt::Debug for X25519Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519Key")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("private", &self.secret.is_some())
            .finish()
    }
}

impl KeyMaterial for X25519Key {
    fn strength(&self) -> u32 {
        128
    }

    fn public_key(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    fn has_private_key(&self) -> bool {
        self.secret.is_some()
    }

    fn agree(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, EndpointError> {
        let secret = self.secret.as_ref().ok_or(EndpointError::PublicOnly(ID))?;
        let remote: [u8; KEY_SIZE] = remote_public
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid x25519 peer key size"))?;
        let shared = secret.diffie_hellman(&PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(anyhow::anyhow!("non-contributory key agreement").into());
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}
