use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as MontgomeryPublic, StaticSecret};

const SEED_SIZE: usize = 32;
/// Encoded length of an Edwards endpoint public key
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Encoded length of an Edwards endpoint signature
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Draw `N` bytes from the operating system's entropy source
pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N], KeyError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|e| anyhow::anyhow!("entropy source failed: {}", e))?;
    Ok(out)
}

/// Public half of an Ed25519 endpoint key
///
/// Used both to verify endpoint signatures and, after conversion to the
/// Montgomery form, as the peer's half of an X25519 key agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(VerifyingKey);

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(encoded: &[u8]) -> Result<Self, Self::Error> {
        let encoded: [u8; PUBLIC_KEY_SIZE] = encoded.try_into().map_err(|_| {
            anyhow::anyhow!(
                "edwards public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                encoded.len()
            )
        })?;
        VerifyingKey::from_bytes(&encoded)
            .map(PublicKey)
            .map_err(|e| anyhow::anyhow!("rejected edwards public key: {}", e).into())
    }
}

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Map onto the Montgomery curve for use as an agreement peer
    #[allow(clippy::wrong_self_convention)]
    pub(crate) fn to_x25519(&self) -> Result<MontgomeryPublic, KeyError> {
        let point = CompressedEdwardsY(self.to_bytes())
            .decompress()
            .ok_or_else(|| anyhow::anyhow!("edwards point is not on the curve"))?;
        Ok(MontgomeryPublic::from(point.to_montgomery().to_bytes()))
    }

    /// Strict verification; a malformed signature simply fails.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match ed25519_dalek::Signature::from_slice(signature) {
            Ok(signature) => self.0.verify_strict(data, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

/// Private half of an Ed25519 endpoint key
///
/// Never leaves the process: endpoint descriptors only ever carry the
/// public half on the wire.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public()).finish()
    }
}

impl SecretKey {
    pub fn generate() -> Result<Self, KeyError> {
        let seed = zeroize::Zeroizing::new(random_bytes::<SEED_SIZE>()?);
        Ok(Self(SigningKey::from_bytes(&seed)))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Clamped scalar of this key as an X25519 static secret
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0.to_scalar_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.0.sign(data).to_bytes()
    }
}
