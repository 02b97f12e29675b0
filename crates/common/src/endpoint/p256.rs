use ::p256::ecdsa::signature::{Signer, Verifier};
use ::p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ::p256::elliptic_curve::sec1::ToEncodedPoint;
use ::p256::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::crypto::{random_bytes, CipherKind};

use super::{AlgorithmId, EndpointCapability, EndpointError, KeyMaterial, NAMESPACE_E2E};

const ID: AlgorithmId = AlgorithmId::new(NAMESPACE_E2E, "p256");
const GENERATE_ATTEMPTS: usize = 4;

/// NIST P-256 endpoints: ECDH agreement and ECDSA signatures
#[derive(Debug, Default, Clone, Copy)]
pub struct P256Capability;

impl EndpointCapability for P256Capability {
    fn id(&self) -> AlgorithmId {
        ID
    }

    fn score(&self) -> u32 {
        3
    }

    fn default_cipher(&self) -> CipherKind {
        CipherKind::Aes128Gcm
    }

    fn generate(&self, _desired_strength: u32) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        // a random 32-byte string is outside the scalar field with negligible probability
        for _ in 0..GENERATE_ATTEMPTS {
            let bytes = Zeroizing::new(random_bytes::<32>()?);
            if let Ok(secret) = SecretKey::from_slice(&bytes[..]) {
                return Ok(Box::new(P256Key {
                    public: secret.public_key(),
                    secret: Some(secret),
                }));
            }
        }
        Err(anyhow::anyhow!("failed to generate a p256 scalar").into())
    }

    fn decode_public(&self, public_key: &[u8]) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let public = PublicKey::from_sec1_bytes(public_key)
            .map_err(|_| anyhow::anyhow!("invalid p256 public key"))?;
        Ok(Box::new(P256Key {
            public,
            secret: None,
        }))
    }
}

struct P256Key {
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl std::fmt::Debug for P256Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P256Key")
            .field("public", &hex::encode(self.public_key()))
            .field("private", &self.secret.is_some())
            .finish()
    }
}

impl KeyMaterial for P256Key {
    fn strength(&self) -> u32 {
        128
    }

    /// SEC1 compressed point
    fn public_key(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    fn has_private_key(&self) -> bool {
        self.secret.is_some()
    }

    fn agree(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, EndpointError> {
        let secret = self.secret.as_ref().ok_or(EndpointError::PublicOnly(ID))?;
        let remote = PublicKey::from_sec1_bytes(remote_public)
            .map_err(|_| anyhow::anyhow!("invalid p256 peer key"))?;
        let shared = ::p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), remote.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    fn sign(&self, data: &[u8]) -> Option<Result<Vec<u8>, EndpointError>> {
        let secret = self.secret.as_ref()?;
        let signature: Signature = SigningKey::from(secret).sign(data);
        Some(Ok(signature.to_bytes().to_vec()))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        VerifyingKey::from(&self.public)
            .verify(data, &signature)
            .is_ok()
    }
}
