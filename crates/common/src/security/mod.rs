//! Endpoint security manager
//!
//! [`EndpointSecurity`] sits between the application and a [`Transport`]. It
//! owns the local endpoint generation, the cache of peers' endpoints, the
//! envelope encryption of stanza payloads and the synchronization handshake
//! that keeps both sides' endpoint knowledge in step.
//!
//! The manager is cheap to clone; all clones share one state. Handlers it
//! registers with the transport hold only a weak reference, so dropping every
//! clone (or calling [`dispose`](EndpointSecurity::dispose)) tears it down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::address::Address;
use crate::config::{ConfigError, SecurityConfig};
use crate::crypto::CipherError;
use crate::endpoint::{parse_reference, Endpoint, EndpointError, EndpointRegistry, RegistryError};
use crate::stanza::{Element, StanzaError};
use crate::transport::{AddressBook, HandlerKind, Transport, TransportError};

mod engine;
mod exchange;
mod inbound;
mod local_keys;
mod peer_cache;
mod send;
mod sync;

pub use engine::{Channel, Envelope, Sealed};
pub use exchange::{Exchange, ExchangeState, PendingRequest};
pub use local_keys::LocalKeySet;
pub use peer_cache::{order_endpoints, PeerCache};
pub use send::{E2ePolicy, IqResponse, SendOutcome};
pub use sync::{SyncRecord, ADDRESSES, BUNDLE, ENCRYPTION, SYNCHRONIZE};

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("endpoint security has been disposed")]
    Disposed,
    #[error("no end-to-end encrypted channel to {0}")]
    NoChannel(Address),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("stanza error: {0}")]
    Stanza(#[from] StanzaError),
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for SecurityError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout => SecurityError::Timeout,
            other => SecurityError::Transport(other),
        }
    }
}

/// Changes in what we know about a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer announced itself with an endpoint bundle
    Available { peer: Address, e2e: bool, p2p: bool },
    Unavailable { peer: Address },
    /// A synchronization completed; flags tell which halves were (re)established
    Updated { peer: Address, e2e: bool, p2p: bool },
}

pub(crate) struct Inner<T: Transport> {
    transport: Arc<T>,
    registry: Arc<EndpointRegistry>,
    keys: LocalKeySet,
    peers: PeerCache,
    address_book: Option<Arc<dyn AddressBook>>,
    config: SecurityConfig,
    events: broadcast::Sender<PeerEvent>,
    disposed: AtomicBool,
    handlers: Mutex<Vec<(HandlerKind, String, String)>>,
}

impl<T: Transport> Inner<T> {
    fn unregister_handlers(&self) {
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for (kind, name, namespace) in handlers {
            self.transport.unregister_handler(kind, &name, &namespace);
        }
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.unregister_handlers();
        }
    }
}

/// Builds an [`EndpointSecurity`] around a transport
#[derive(Default)]
pub struct EndpointSecurityBuilder {
    registry: Option<Arc<EndpointRegistry>>,
    config: Option<SecurityConfig>,
    address_book: Option<Arc<dyn AddressBook>>,
}

impl EndpointSecurityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a dedicated registry instead of the process-wide one
    pub fn registry(mut self, registry: Arc<EndpointRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: SecurityConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn address_book(mut self, address_book: Arc<dyn AddressBook>) -> Self {
        self.address_book = Some(address_book);
        self
    }

    pub fn build<T: Transport>(self, transport: Arc<T>) -> Result<EndpointSecurity<T>, SecurityError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let registry = self.registry.unwrap_or_else(EndpointRegistry::global);
        config.apply_allowed(&registry)?;

        let keys = LocalKeySet::new(
            registry.clone(),
            config.desired_strength,
            config.min_strength,
            config.max_strength,
        );
        let peers = PeerCache::new(config.desired_strength);
        let (events, _) = broadcast::channel(config.event_capacity);

        let inner = Arc::new(Inner {
            transport,
            registry,
            keys,
            peers,
            address_book: self.address_book,
            config,
            events,
            disposed: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
        });
        inbound::register_handlers(&inner);

        tracing::info!(
            "endpoint security ready for {} with {} local endpoints",
            inner.transport.address(),
            inner.keys.snapshot().len()
        );
        Ok(EndpointSecurity { inner })
    }
}

/// End-to-end encryption layer over a stanza transport
pub struct EndpointSecurity<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for EndpointSecurity<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for EndpointSecurity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSecurity")
            .field("address", &self.inner.transport.address())
            .field("local_endpoints", &self.inner.keys.snapshot().len())
            .field("peers", &self.inner.peers.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T: Transport> EndpointSecurity<T> {
    /// A manager with the default config and the process-wide registry
    pub fn new(transport: Arc<T>) -> Result<Self, SecurityError> {
        EndpointSecurityBuilder::new().build(transport)
    }

    pub(crate) fn from_inner(inner: Arc<Inner<T>>) -> Self {
        Self { inner }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn address(&self) -> Address {
        self.inner.transport.address()
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.registry
    }

    pub fn address_book(&self) -> Option<&Arc<dyn AddressBook>> {
        self.inner.address_book.as_ref()
    }

    /// Receive peer availability and synchronization events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        tracing::debug!("peer event: {:?}", event);
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), SecurityError> {
        if self.is_disposed() {
            return Err(SecurityError::Disposed);
        }
        Ok(())
    }

    /// Tear the manager down
    ///
    /// Unregisters every handler, drops all local endpoints (current and
    /// previous generations) and the whole peer cache. Every later call
    /// fails with [`SecurityError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.unregister_handlers();
        self.inner.keys.clear();
        self.inner.peers.clear();
        tracing::info!("endpoint security for {} disposed", self.address());
    }

    // ========================================
    // Local endpoints
    // ========================================

    /// Snapshot of the current local endpoints
    pub fn local_endpoints(&self) -> Result<Arc<Vec<Arc<Endpoint>>>, SecurityError> {
        self.ensure_active()?;
        Ok(self.inner.keys.snapshot())
    }

    /// The local endpoint matching a remote one's algorithm
    pub fn find_local_endpoint(&self, remote: &Endpoint) -> Result<Option<Arc<Endpoint>>, SecurityError> {
        self.ensure_active()?;
        Ok(self.inner.keys.matching(remote))
    }

    /// The local endpoint with the given name; an empty or absent namespace matches any
    pub fn find_local_endpoint_by_name(
        &self,
        local_name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Arc<Endpoint>>, SecurityError> {
        self.ensure_active()?;
        let namespace = namespace.filter(|ns| !ns.is_empty());
        Ok(self.inner.keys.find(local_name, namespace))
    }

    /// Rotate every local endpoint; returns how many were replaced
    pub fn generate_new_key(&self) -> Result<usize, SecurityError> {
        self.ensure_active()?;
        let rotated = self.inner.keys.generate_new_key();
        tracing::info!("generated {} new local endpoints", rotated);
        Ok(rotated)
    }

    /// Wire descriptors of every local endpoint
    pub fn local_descriptors(&self) -> Vec<Element> {
        self.inner
            .keys
            .snapshot()
            .iter()
            .map(|endpoint| endpoint.to_element())
            .collect()
    }

    // ========================================
    // Peer endpoints
    // ========================================

    /// Parse wire descriptors into public endpoints, skipping unknown algorithms
    pub fn parse_descriptors(&self, descriptors: &[Element]) -> Vec<Arc<Endpoint>> {
        let mut endpoints = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let capability = match self
                .inner
                .registry
                .require(&descriptor.name, &descriptor.namespace)
            {
                Ok(capability) => capability,
                Err(e) => {
                    tracing::debug!("skipping descriptor: {}", e);
                    continue;
                }
            };
            match Endpoint::parse(capability, descriptor) {
                Ok(endpoint) => endpoints.push(Arc::new(endpoint)),
                Err(e) => tracing::debug!("skipping unparsable descriptor: {}", e),
            }
        }
        endpoints
    }

    /// Replace what we know about `peer` with the given wire descriptors
    ///
    /// Empty or entirely unparsable input removes the peer and returns `false`.
    pub fn add_peer_info(&self, peer: &Address, descriptors: &[Element]) -> Result<bool, SecurityError> {
        self.ensure_active()?;
        let endpoints = self.parse_descriptors(descriptors);
        let known = self.inner.peers.replace(peer, endpoints);
        tracing::debug!("peer {} endpoints updated (usable: {})", peer, known);
        Ok(known)
    }

    pub fn remove_peer_info(&self, peer: &Address) -> Result<bool, SecurityError> {
        self.ensure_active()?;
        let removed = self.inner.peers.remove(peer);
        if removed {
            tracing::debug!("peer {} endpoints removed", peer);
        }
        Ok(removed)
    }

    pub fn contains_peer(&self, peer: &Address) -> Result<bool, SecurityError> {
        self.ensure_active()?;
        Ok(self.inner.peers.contains(peer))
    }

    /// The endpoints of `peer`, preferred first
    ///
    /// For our own address this is a public view of the local endpoints; the
    /// peer cache is never consulted for ourselves.
    pub fn peer_endpoints(&self, peer: &Address) -> Result<Option<Arc<[Arc<Endpoint>]>>, SecurityError> {
        self.ensure_active()?;
        if *peer == self.address() {
            let descriptors = self.local_descriptors();
            let endpoints = self.parse_descriptors(&descriptors);
            if endpoints.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Arc::from(endpoints)));
        }
        Ok(self.inner.peers.get(peer))
    }

    // ========================================
    // Signatures
    // ========================================

    /// Sign with the first local endpoint able to
    ///
    /// Returns the endpoint reference alongside the signature, or `None`
    /// if no local algorithm signs.
    pub fn sign(&self, data: &[u8]) -> Result<Option<(String, Vec<u8>)>, SecurityError> {
        self.ensure_active()?;
        for endpoint in self.inner.keys.snapshot().iter() {
            if let Some(signature) = endpoint.sign(data) {
                return Ok(Some((endpoint.reference(), signature?)));
            }
        }
        Ok(None)
    }

    /// Verify a peer's signature against its cached endpoint
    ///
    /// Without a reference the peer's preferred endpoint is used. Unknown
    /// peers and endpoints never verify.
    pub fn verify(
        &self,
        peer: &Address,
        reference: Option<&str>,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, SecurityError> {
        self.ensure_active()?;
        let Some(endpoints) = self.peer_endpoints(peer)? else {
            return Ok(false);
        };
        let endpoint = match reference {
            Some(reference) => {
                let Some((namespace, local_name)) = parse_reference(reference) else {
                    return Ok(false);
                };
                endpoints
                    .iter()
                    .find(|e| e.id().matches(local_name, namespace))
                    .cloned()
            }
            None => endpoints.first().cloned(),
        };
        Ok(endpoint.is_some_and(|e| e.verify(data, signature)))
    }

    pub(crate) fn keys(&self) -> &LocalKeySet {
        &self.inner.keys
    }

    pub(crate) fn peers(&self) -> &PeerCache {
        &self.inner.peers
    }
}
