//! Shared test utilities for endpoint security integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use zeroize::Zeroizing;

use common::address::Address;
use common::config::SecurityConfig;
use common::crypto::CipherKind;
use common::endpoint::{
    AlgorithmId, EndpointCapability, EndpointError, EndpointRegistry, KeyMaterial,
    X25519Capability, NAMESPACE_E2E,
};
use common::security::{ENCRYPTION, SYNCHRONIZE};
use common::stanza::{Element, Iq, IqType, Message, Presence};
use common::transport::{
    HandlerKind, RetryPolicy, StanzaHandler, Subscription, Transport, TransportError,
};

/// Install a log subscriber honouring `RUST_LOG`; repeated calls are fine
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn address(s: &str) -> Address {
    s.parse().unwrap()
}

/// Config with timeouts short enough for tests
pub fn test_config() -> SecurityConfig {
    SecurityConfig {
        retry: RetryPolicy::once(Duration::from_secs(1)),
        request_timeout: Duration::from_secs(3),
        ..SecurityConfig::default()
    }
}

pub fn ping() -> Element {
    Element::new("ping", "urn:test:ping")
}

pub fn pong() -> Element {
    Element::new("pong", "urn:test:ping").with_text("ok")
}

/// A handshake bundle carrying `descriptors`
pub fn sync_bundle(descriptors: Vec<Element>) -> Element {
    Element::new(SYNCHRONIZE, NAMESPACE_E2E)
        .with_child(Element::new(ENCRYPTION, NAMESPACE_E2E).with_children(descriptors))
}

pub fn is_sync(iq: &Iq) -> bool {
    iq.payload.as_ref().is_some_and(|p| p.name == SYNCHRONIZE)
}

// ========================================
// Scripted transport
// ========================================

pub type Script = Box<dyn FnMut(&Iq) -> Result<Iq, TransportError> + Send>;

type AppHandler = Box<dyn Fn(Iq) -> Option<Iq> + Send + Sync>;

/// A transport whose outbound requests are answered by a closure
///
/// Records every outbound stanza so tests can count exactly what was sent.
pub struct ScriptedTransport {
    address: Address,
    ids: AtomicU64,
    handlers: Mutex<HashMap<(HandlerKind, String, String), Arc<dyn StanzaHandler>>>,
    script: Mutex<Script>,
    app: Mutex<Option<AppHandler>>,
    resources: Mutex<Vec<Address>>,
    subscription: Mutex<Subscription>,
    requests: Mutex<Vec<Iq>>,
    responses: Mutex<Vec<Iq>>,
    messages: Mutex<Vec<Message>>,
    delivered: Mutex<Vec<Message>>,
    unreachable: Mutex<Vec<Address>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("address", &self.address)
            .finish()
    }
}

impl ScriptedTransport {
    /// A transport that answers every request with `item-not-found`
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: self::address(address),
            ids: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
            script: Mutex::new(Box::new(|iq: &Iq| {
                Ok(Iq::error_for(
                    iq,
                    common::stanza::StanzaError::new(common::stanza::ErrorCondition::ItemNotFound),
                ))
            })),
            app: Mutex::new(None),
            resources: Mutex::new(Vec::new()),
            subscription: Mutex::new(Subscription::Both),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            unreachable: Mutex::new(Vec::new()),
        })
    }

    pub fn script<F>(&self, script: F)
    where
        F: FnMut(&Iq) -> Result<Iq, TransportError> + Send + 'static,
    {
        *self.script.lock() = Box::new(script);
    }

    pub fn serve<F>(&self, handler: F)
    where
        F: Fn(Iq) -> Option<Iq> + Send + Sync + 'static,
    {
        *self.app.lock() = Some(Box::new(handler));
    }

    pub fn set_resources(&self, resources: Vec<Address>) {
        *self.resources.lock() = resources;
    }

    /// Fail every message sent to `address`
    pub fn set_unreachable(&self, address: Address) {
        self.unreachable.lock().push(address);
    }

    pub fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock() = subscription;
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn requests(&self) -> Vec<Iq> {
        self.requests.lock().clone()
    }

    pub fn sync_requests(&self) -> usize {
        self.requests.lock().iter().filter(|iq| is_sync(iq)).count()
    }

    pub fn responses(&self) -> Vec<Iq> {
        self.responses.lock().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().clone()
    }

    fn handler(&self, kind: HandlerKind, element: &Element) -> Option<Arc<dyn StanzaHandler>> {
        self.handlers
            .lock()
            .get(&(kind, element.name.clone(), element.namespace.clone()))
            .cloned()
    }

    /// Feed an inbound request to whichever handler registered for its payload
    pub async fn deliver_iq(&self, iq: Iq) -> Option<Iq> {
        let element = iq.payload.clone()?;
        let handler = self.handler(HandlerKind::Iq, &element)?;
        handler.on_iq(iq, element).await
    }

    pub async fn deliver_message(&self, message: Message) -> bool {
        let Some(element) = message.payload.first().cloned() else {
            return false;
        };
        let Some(handler) = self.handler(HandlerKind::Message, &element) else {
            return false;
        };
        handler.on_message(message, element).await;
        true
    }

    pub async fn deliver_presence(&self, presence: Presence) -> bool {
        let Some(handler) = presence
            .payload
            .iter()
            .find_map(|element| self.handler(HandlerKind::Presence, element))
        else {
            return false;
        };
        handler.on_presence(presence).await;
        true
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn next_id(&self) -> String {
        format!("s{}", self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn register_handler(
        &self,
        kind: HandlerKind,
        name: &str,
        namespace: &str,
        handler: Arc<dyn StanzaHandler>,
    ) {
        self.handlers
            .lock()
            .insert((kind, name.to_string(), namespace.to_string()), handler);
    }

    fn unregister_handler(&self, kind: HandlerKind, name: &str, namespace: &str) -> bool {
        self.handlers
            .lock()
            .remove(&(kind, name.to_string(), namespace.to_string()))
            .is_some()
    }

    fn resources(&self, bare: &Address) -> Vec<Address> {
        self.resources
            .lock()
            .iter()
            .filter(|r| r.same_account(bare))
            .cloned()
            .collect()
    }

    async fn subscription(&self, _address: &Address) -> Subscription {
        *self.subscription.lock()
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(&message.to) {
            return Err(TransportError::Unreachable(message.to));
        }
        self.messages.lock().push(message);
        Ok(())
    }

    async fn request(&self, iq: Iq, _retry: RetryPolicy) -> Result<Iq, TransportError> {
        self.requests.lock().push(iq.clone());
        let mut script = self.script.lock();
        (*script)(&iq)
    }

    async fn respond(&self, iq: Iq) -> Result<(), TransportError> {
        self.responses.lock().push(iq);
        Ok(())
    }

    async fn process_message(&self, message: Message) {
        self.delivered.lock().push(message);
    }

    async fn process_iq(&self, iq: Iq) -> Option<Iq> {
        match self.app.lock().as_ref() {
            Some(handler) => handler(iq),
            None => Some(Iq::result_for(&iq, None)),
        }
    }
}

/// Reply to `request` the way a peer holding `descriptors` would
pub fn answer_sync(request: &Iq, descriptors: &[Element]) -> Iq {
    Iq::result_for(request, Some(sync_bundle(descriptors.to_vec())))
}

pub fn is_request(iq: &Iq) -> bool {
    matches!(iq.kind, IqType::Get | IqType::Set)
}

// ========================================
// Counting key material
// ========================================

/// An x25519-backed algorithm whose private keys count themselves
///
/// `live()` is the number of generated keys not yet dropped, `disposed()`
/// the number of drops.
#[derive(Debug, Clone)]
pub struct CountedCapability {
    name: &'static str,
    strength: u32,
    live: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    disposed: Arc<AtomicUsize>,
}

impl CountedCapability {
    pub fn new(name: &'static str, strength: u32) -> Self {
        Self {
            name,
            strength,
            live: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            disposed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct CountedKey {
    inner: Box<dyn KeyMaterial>,
    strength: u32,
    live: Arc<AtomicUsize>,
    disposed: Arc<AtomicUsize>,
}

impl Drop for CountedKey {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

impl KeyMaterial for CountedKey {
    fn strength(&self) -> u32 {
        self.strength
    }

    fn public_key(&self) -> Vec<u8> {
        self.inner.public_key()
    }

    fn has_private_key(&self) -> bool {
        self.inner.has_private_key()
    }

    fn agree(&self, remote_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, EndpointError> {
        self.inner.agree(remote_public)
    }
}

impl EndpointCapability for CountedCapability {
    fn id(&self) -> AlgorithmId {
        AlgorithmId::new(NAMESPACE_E2E, self.name)
    }

    fn score(&self) -> u32 {
        0
    }

    fn default_cipher(&self) -> CipherKind {
        CipherKind::ChaCha20Poly1305
    }

    fn generate(&self, desired_strength: u32) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        let inner = X25519Capability.generate(desired_strength)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedKey {
            inner,
            strength: self.strength,
            live: self.live.clone(),
            disposed: self.disposed.clone(),
        }))
    }

    fn decode_public(&self, public_key: &[u8]) -> Result<Box<dyn KeyMaterial>, EndpointError> {
        X25519Capability.decode_public(public_key)
    }
}

/// A registry offering only `capability`
pub fn counted_registry(capability: &CountedCapability) -> Arc<EndpointRegistry> {
    let registry = Arc::new(EndpointRegistry::new());
    registry.register_capability(Arc::new(capability.clone()));
    registry
        .set_allowed(&[capability.id()], false)
        .unwrap();
    registry
}
