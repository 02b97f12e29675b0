use zeroize::Zeroizing;

use crate::crypto::{CipherKind, PublicKey, SecretKey};

use super::{AlgorithmId, EndpointCapability, EndpointError, KeyMaterial, NAMESPACE_E2E};

const ID: AlgorithmId = AlgorithmId::new(NAMESPACE_E2E, "ed25519");

/// Edwards-curve endpoints
///
/// Agreement runs on the birationally equivalent Montgomery curve, so the
/// same key pair both signs and encrypts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Capability;

impl EndpointCapability for Ed25519Capability {
    fn id(&self) -> AlgorithmId {
        ID
    }

    fn score(&self) -> u32 {
        1
    }

    fn default_cipher(&self) -> CipherKind {
        CipherKind::ChaCha20Poly1305
    }

    fn generate(&self, _desired_strength: u32) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let secret = SecretKey::generate()?;
        Ok(Box::new(Ed25519Key {
            public: secret.public(),
            secret: Some(secret),
        }))
    }

    fn decode_public(&self, public_key: &[u8]) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let public = PublicKey::try_from(public_key)?;
        Ok(Box::new(Ed25519Key {
            public,
            secret: None,
        }))
    }
}

#[derive(Debug)]
struct Ed25519Key {
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl KeyMaterial for Ed25519Key {
    fn strength(&self) -> u32 {
        128
    }

    fn public_key(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    fn has_private_key(&self) -> bool {
        self.secret.is_some()
    }

    fn agree(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, EndpointError> {
        let secret = self.secret.as_ref().ok_or(EndpointError::PublicOnly(ID))?;
        let remote = PublicKey::try_from(remote_public)?.to_x25519()?;
        let shared = secret.to_x25519().diffie_hellman(&remote);
        if !shared.was_contributory() {
            return Err(anyhow::anyhow!("non-contributory key agreement").into());
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn sign(&self, data: &[u8]) -> Option<Result<Vec<u8>, EndpointError>> {
        let secret = self.secret.as_ref()?;
        Some(Ok(secret.sign(data).to_vec()))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.public.verify(data, signature)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let cap = Ed25519Capability;
        let alice = cap.generate(128).unwrap();
        let bob = cap.generate(128).unwrap();

        let ab = alice.agree(&bob.public_key()).unwrap();
        let ba = bob.agree(&alice.public_key()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_sign_verify_through_public_copy() {
        let cap = Ed25519Capability;
        let local = cap.generate(128).unwrap();
        let remote = cap.decode_public(&local.public_key()).unwrap();

        let signature = local.sign(b"payload").unwrap().unwrap();
        assert!(remote.verify(b"payload", &signature));
        assert!(!remote.verify(b"payload!", &signature));
        assert!(remote.sign(b"payload").is_none());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(Ed25519Capability.decode_public(&[1, 2, 3]).is_err());
    }
}
