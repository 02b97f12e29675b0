//! Endpoint descriptors and the algorithms that produce them
//!
//! An *endpoint* is one asymmetric key pair of a given algorithm, identified on
//! the wire by `(namespace, local name)`. Local endpoints hold private key
//! material; endpoints learned from peers hold only the public half.
//!
//! Algorithms are plugged in through [`EndpointCapability`]; each capability
//! knows how to generate a fresh key pair and how to decode a peer's public key.
//! The [`EndpointRegistry`] is the catalog of available capabilities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::crypto::{CipherError, CipherKind, KeyError};
use crate::stanza::Element;

mod ed25519;
mod p256;
mod registry;
mod x25519;

pub use ed25519::Ed25519Capability;
pub use p256::P256Capability;
pub use registry::{EndpointRegistry, RegistryError};
pub use x25519::X25519Capability;

/// Current namespace of endpoint descriptors and envelopes
pub const NAMESPACE_E2E: &str = "urn:nf:iot:e2e:1.0";
/// Legacy alias of [`NAMESPACE_E2E`], accepted on read
pub const NAMESPACE_E2E_LEGACY: &str = "urn:ieee:iot:e2e:1.0";
/// Current namespace of peer address descriptors
pub const NAMESPACE_P2P: &str = "urn:nf:iot:p2p:1.0";
/// Legacy alias of [`NAMESPACE_P2P`], accepted on read
pub const NAMESPACE_P2P_LEGACY: &str = "urn:ieee:iot:p2p:1.0";

pub const E2E_NAMESPACES: [&str; 2] = [NAMESPACE_E2E, NAMESPACE_E2E_LEGACY];
pub const P2P_NAMESPACES: [&str; 2] = [NAMESPACE_P2P, NAMESPACE_P2P_LEGACY];

/// Rewrite a legacy namespace to its current form
pub fn normalize_namespace(namespace: &str) -> &str {
    match namespace {
        NAMESPACE_E2E_LEGACY => NAMESPACE_E2E,
        NAMESPACE_P2P_LEGACY => NAMESPACE_P2P,
        other => other,
    }
}

/// Parse an endpoint reference of the form `namespace#localName`
///
/// The legacy namespace alias is rewritten to the current one.
pub fn parse_reference(reference: &str) -> Option<(&str, &str)> {
    let (namespace, local_name) = reference.rsplit_once('#')?;
    if namespace.is_empty() || local_name.is_empty() {
        return None;
    }
    Some((normalize_namespace(namespace), local_name))
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("unsupported operation for {0}: {1}")]
    Unsupported(AlgorithmId, &'static str),
    #[error("no private key for {0}")]
    PublicOnly(AlgorithmId),
}

/// Identity of an endpoint algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlgorithmId {
    pub namespace: &'static str,
    pub local_name: &'static str,
}

impl AlgorithmId {
    pub const fn new(namespace: &'static str, local_name: &'static str) -> Self {
        Self {
            namespace,
            local_name,
        }
    }

    /// Whether this id matches `(local_name, namespace)`, legacy alias included
    pub fn matches(&self, local_name: &str, namespace: &str) -> bool {
        self.local_name == local_name && self.namespace == normalize_namespace(namespace)
    }

    /// `namespace#localName`
    pub fn reference(&self) -> String {
        format!("{}#{}", self.namespace, self.local_name)
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.local_name)
    }
}

/// The key material behind one endpoint
///
/// Implementations are the black boxes doing the actual asymmetric math.
pub trait KeyMaterial: Send + Sync + fmt::Debug {
    /// Security strength in bits
    fn strength(&self) -> u32;

    fn public_key(&self) -> Vec<u8>;

    fn has_private_key(&self) -> bool;

    /// Agree on a 32-byte secret with a peer's public key of the same algorithm
    fn agree(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, EndpointError>;

    fn sign(&self, _data: &[u8]) -> Option<Result<Vec<u8>, EndpointError>> {
        None
    }

    fn verify(&self, _data: &[u8], _signature: &[u8]) -> bool {
        false
    }
}

/// A pluggable endpoint algorithm
pub trait EndpointCapability: Send + Sync + fmt::Debug {
    fn id(&self) -> AlgorithmId;

    /// Tie-breaker among equally strong algorithms; lower is preferred
    fn score(&self) -> u32;

    fn default_cipher(&self) -> CipherKind;

    /// Create a fresh key pair, as close to `desired_strength` as the algorithm allows
    fn generate(&self, desired_strength: u32) -> Result<Box<dyn KeyMaterial>, EndpointError>;

    /// Decode a peer's public key
    fn decode_public(&self, public_key: &[u8]) -> Result<Box<dyn KeyMaterial>, EndpointError>;
}

/// Direction of traffic a derived key protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One endpoint descriptor: an algorithm instance with its key material
///
/// Local descriptors carry an outgoing counter and, after a rotation, a
/// reference to the generation they replaced.
pub struct Endpoint {
    capability: Arc<dyn EndpointCapability>,
    key: Box<dyn KeyMaterial>,
    public_key: Vec<u8>,
    counter: AtomicU64,
    previous: Mutex<Option<Arc<Endpoint>>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("strength", &self.strength())
            .field("private", &self.has_private_key())
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

impl Endpoint {
    fn from_key(capability: Arc<dyn EndpointCapability>, key: Box<dyn KeyMaterial>) -> Self {
        let public_key = key.public_key();
        Self {
            capability,
            key,
            public_key,
            counter: AtomicU64::new(0),
            previous: Mutex::new(None),
        }
    }

    /// Generate a fresh local endpoint
    pub fn generate(
        capability: Arc<dyn EndpointCapability>,
        desired_strength: u32,
    ) -> Result<Self, EndpointError> {
        let key = capability.generate(desired_strength)?;
        Ok(Self::from_key(capability, key))
    }

    /// Build a remote endpoint from a peer's public key
    pub fn decode(
        capability: Arc<dyn EndpointCapability>,
        public_key: &[u8],
    ) -> Result<Self, EndpointError> {
        let key = capability.decode_public(public_key)?;
        Ok(Self::from_key(capability, key))
    }

    /// Build a remote endpoint from its wire descriptor
    pub fn parse(
        capability: Arc<dyn EndpointCapability>,
        element: &Element,
    ) -> Result<Self, EndpointError> {
        let id = capability.id();
        if !id.matches(&element.name, &element.namespace) {
            return Err(anyhow::anyhow!(
                "descriptor {}#{} does not match {}",
                element.namespace,
                element.name,
                id
            )
            .into());
        }
        let encoded = element
            .attr("pub")
            .ok_or_else(|| anyhow::anyhow!("descriptor {} has no public key", id))?;
        let public_key = BASE64
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("descriptor {} public key decode error: {}", id, e))?;
        Self::decode(capability, &public_key)
    }

    /// Render the wire descriptor: `<{localName} xmlns="{namespace}" pub="base64"/>`
    pub fn to_element(&self) -> Element {
        let id = self.id();
        Element::new(id.local_name, id.namespace).with_attr("pub", BASE64.encode(&self.public_key))
    }

    /// A public-only copy of this endpoint
    pub fn public_view(&self) -> Result<Endpoint, EndpointError> {
        Self::decode(self.capability.clone(), &self.public_key)
    }

    pub fn id(&self) -> AlgorithmId {
        self.capability.id()
    }

    pub fn reference(&self) -> String {
        self.id().reference()
    }

    pub fn strength(&self) -> u32 {
        self.key.strength()
    }

    pub fn score(&self) -> u32 {
        self.capability.score()
    }

    pub fn default_cipher(&self) -> CipherKind {
        self.capability.default_cipher()
    }

    pub fn capability(&self) -> &Arc<dyn EndpointCapability> {
        &self.capability
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn has_private_key(&self) -> bool {
        self.key.has_private_key()
    }

    pub fn same_algorithm(&self, other: &Endpoint) -> bool {
        self.id() == other.id()
    }

    /// The generation this endpoint replaced, if still retained
    pub fn previous(&self) -> Option<Arc<Endpoint>> {
        self.previous.lock().clone()
    }

    /// Swap the previous-generation slot; returns what was there
    pub(crate) fn set_previous(&self, previous: Option<Arc<Endpoint>>) -> Option<Arc<Endpoint>> {
        std::mem::replace(&mut *self.previous.lock(), previous)
    }

    /// Next outgoing counter; strictly increasing, never repeats
    pub fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Derive the cipher key shared between this (local) endpoint and `remote`
    pub fn derive_key(
        &self,
        remote: &Endpoint,
        cipher: CipherKind,
        direction: Direction,
    ) -> Result<Zeroizing<Vec<u8>>, EndpointError> {
        if !self.same_algorithm(remote) {
            return Err(anyhow::anyhow!(
                "cannot combine {} with {}",
                self.id(),
                remote.id()
            )
            .into());
        }
        if !self.has_private_key() {
            return Err(EndpointError::PublicOnly(self.id()));
        }
        let shared = self.key.agree(remote.public_key())?;
        let key = match direction {
            Direction::Outgoing => {
                cipher.derive_key(shared.as_ref(), self.public_key(), remote.public_key())?
            }
            Direction::Incoming => {
                cipher.derive_key(shared.as_ref(), remote.public_key(), self.public_key())?
            }
        };
        Ok(key)
    }

    /// Sign `data`; `None` if the algorithm cannot sign
    pub fn sign(&self, data: &[u8]) -> Option<Result<Vec<u8>, EndpointError>> {
        if !self.has_private_key() {
            return Some(Err(EndpointError::PublicOnly(self.id())));
        }
        self.key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.key.verify(data, signature)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        tracing::trace!(
            "disposing {} endpoint (private: {})",
            self.id(),
            self.has_private_key()
        );
    }
}
