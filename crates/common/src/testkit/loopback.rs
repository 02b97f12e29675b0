use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::address::Address;
use crate::stanza::{ErrorCondition, Element, Iq, Message, Presence, PresenceType, StanzaError};
use crate::transport::{
    HandlerKind, RetryPolicy, StanzaHandler, Subscription, Transport, TransportError,
};

/// Application-level request handler, invoked for re-injected requests and
/// for requests no registered handler claimed
pub type RequestHandler = Arc<dyn Fn(Iq) -> Option<Iq> + Send + Sync>;

type HandlerKey = (HandlerKind, String, String);

/// Routes stanzas between the transports attached to it
#[derive(Default)]
pub(crate) struct Switchboard {
    nodes: RwLock<HashMap<String, Arc<LoopbackTransport>>>,
}

impl Switchboard {
    pub(crate) fn attach(&self, transport: Arc<LoopbackTransport>) -> bool {
        let key = transport.address.key();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&key) {
            return false;
        }
        nodes.insert(key, transport);
        true
    }

    pub(crate) fn detach(&self, address: &Address) -> Option<Arc<LoopbackTransport>> {
        self.nodes.write().remove(&address.key())
    }

    pub(crate) fn clear(&self) {
        self.nodes.write().clear();
    }

    fn exact(&self, address: &Address) -> Option<Arc<LoopbackTransport>> {
        self.nodes.read().get(&address.key()).cloned()
    }

    /// Every node of the account, in address order
    fn account(&self, bare: &Address) -> Vec<Arc<LoopbackTransport>> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .values()
            .filter(|node| node.address.same_account(bare))
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.address.key());
        nodes
    }

    /// Message recipients: the exact node, or every resource of a bare address
    fn recipients(&self, to: &Address) -> Vec<Arc<LoopbackTransport>> {
        if let Some(node) = self.exact(to) {
            return vec![node];
        }
        if to.is_bare() {
            return self.account(to);
        }
        Vec::new()
    }

    /// Request recipient: the exact node, or the first resource of a bare address
    fn responder(&self, to: &Address) -> Option<Arc<LoopbackTransport>> {
        self.exact(to)
            .or_else(|| to.is_bare().then(|| self.account(to).into_iter().next()).flatten())
    }

    fn resources(&self, bare: &Address) -> Vec<Address> {
        self.account(bare)
            .into_iter()
            .map(|node| node.address.clone())
            .filter(|address| !address.is_bare())
            .collect()
    }

    fn deliver_response(&self, response: Iq) -> Result<(), TransportError> {
        let Some(node) = self.exact(&response.to) else {
            return Err(TransportError::Unreachable(response.to));
        };
        node.complete(response);
        Ok(())
    }

    async fn broadcast(&self, presence: Presence) {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        for node in nodes {
            if node.address == presence.from {
                continue;
            }
            if let Some(to) = &presence.to {
                if !to.same_account(&node.address) {
                    continue;
                }
            }
            node.deliver_presence(presence.clone()).await;
        }
    }
}

/// In-process [`Transport`] attached to a [`Switchboard`]
///
/// Messages and requests are delivered directly to the destination's
/// registered handlers. Every outbound stanza is recorded so tests can
/// inspect what went over the wire.
pub struct LoopbackTransport {
    address: Address,
    switchboard: Weak<Switchboard>,
    ids: AtomicU64,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn StanzaHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Iq>>>,
    roster: Mutex<HashMap<String, Subscription>>,
    app: RwLock<Option<RequestHandler>>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    sent_messages: Mutex<Vec<Message>>,
    sent_requests: Mutex<Vec<Iq>>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("address", &self.address)
            .field("handlers", &self.handlers.read().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl LoopbackTransport {
    pub(crate) fn new(address: Address, switchboard: &Arc<Switchboard>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            address,
            switchboard: Arc::downgrade(switchboard),
            ids: AtomicU64::new(0),
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            roster: Mutex::new(HashMap::new()),
            app: RwLock::new(None),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            sent_messages: Mutex::new(Vec::new()),
            sent_requests: Mutex::new(Vec::new()),
        })
    }

    fn switchboard(&self) -> Result<Arc<Switchboard>, TransportError> {
        self.switchboard.upgrade().ok_or(TransportError::Closed)
    }

    /// Answer requests that reach the application
    pub fn serve<F>(&self, handler: F)
    where
        F: Fn(Iq) -> Option<Iq> + Send + Sync + 'static,
    {
        *self.app.write() = Some(Arc::new(handler));
    }

    pub fn set_subscription(&self, contact: &Address, subscription: Subscription) {
        self.roster.lock().insert(contact.bare().key(), subscription);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent_messages.lock().clone()
    }

    pub fn sent_requests(&self) -> Vec<Iq> {
        self.sent_requests.lock().clone()
    }

    /// Number of requests sent whose payload element is named `name`
    pub fn requests_named(&self, name: &str) -> usize {
        self.sent_requests
            .lock()
            .iter()
            .filter(|iq| iq.payload.as_ref().is_some_and(|p| p.name == name))
            .count()
    }

    /// Wait for the next message handed to the application
    pub async fn next_message(&self, timeout: std::time::Duration) -> Option<Message> {
        let mut inbox = self.inbox_rx.lock().await;
        tokio::time::timeout(timeout, inbox.recv()).await.ok().flatten()
    }

    /// Send presence to everyone on the switchboard, or to one account
    pub async fn send_presence(
        &self,
        kind: PresenceType,
        to: Option<Address>,
        payload: Vec<Element>,
    ) -> Result<(), TransportError> {
        let presence = Presence {
            from: self.address.clone(),
            to,
            kind,
            payload,
        };
        self.switchboard()?.broadcast(presence).await;
        Ok(())
    }

    fn handler(&self, kind: HandlerKind, element: &Element) -> Option<Arc<dyn StanzaHandler>> {
        let key = (kind, element.name.clone(), element.namespace.clone());
        self.handlers.read().get(&key).cloned()
    }

    fn complete(&self, response: Iq) {
        match self.pending.lock().remove(&response.id) {
            Some(waiter) => {
                // the requester may have given up already
                let _ = waiter.send(response);
            }
            None => tracing::debug!("{} dropping late response {}", self.address, response.id),
        }
    }

    async fn deliver_message(&self, message: Message) {
        let claimed = message
            .payload
            .iter()
            .find_map(|element| Some((self.handler(HandlerKind::Message, element)?, element.clone())));
        match claimed {
            Some((handler, element)) => handler.on_message(message, element).await,
            None => self.process_message(message).await,
        }
    }

    async fn deliver_iq(&self, iq: Iq) -> Option<Iq> {
        let claimed = iq
            .payload
            .as_ref()
            .and_then(|element| Some((self.handler(HandlerKind::Iq, element)?, element.clone())));
        match claimed {
            Some((handler, element)) => handler.on_iq(iq, element).await,
            None => self.process_iq(iq).await,
        }
    }

    async fn deliver_presence(&self, presence: Presence) {
        let handlers: Vec<Arc<dyn StanzaHandler>> = match presence.kind {
            PresenceType::Available => presence
                .payload
                .iter()
                .filter_map(|element| self.handler(HandlerKind::Presence, element))
                .take(1)
                .collect(),
            // no payload to match on, every presence handler hears about it once
            PresenceType::Unavailable => {
                let mut unique: Vec<Arc<dyn StanzaHandler>> = Vec::new();
                for ((kind, _, _), handler) in self.handlers.read().iter() {
                    if *kind == HandlerKind::Presence
                        && !unique.iter().any(|known| Arc::ptr_eq(known, handler))
                    {
                        unique.push(handler.clone());
                    }
                }
                unique
            }
        };
        for handler in handlers {
            handler.on_presence(presence.clone()).await;
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn next_id(&self) -> String {
        let n = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.address.key(), n)
    }

    fn register_handler(
        &self,
        kind: HandlerKind,
        name: &str,
        namespace: &str,
        handler: Arc<dyn StanzaHandler>,
    ) {
        self.handlers
            .write()
            .insert((kind, name.to_string(), namespace.to_string()), handler);
    }

    fn unregister_handler(&self, kind: HandlerKind, name: &str, namespace: &str) -> bool {
        self.handlers
            .write()
            .remove(&(kind, name.to_string(), namespace.to_string()))
            .is_some()
    }

    fn resources(&self, bare: &Address) -> Vec<Address> {
        match self.switchboard.upgrade() {
            Some(switchboard) => switchboard.resources(bare),
            None => Vec::new(),
        }
    }

    async fn subscription(&self, address: &Address) -> Subscription {
        self.roster
            .lock()
            .get(&address.bare().key())
            .copied()
            .unwrap_or(Subscription::None)
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        self.sent_messages.lock().push(message.clone());
        let recipients = self.switchboard()?.recipients(&message.to);
        if recipients.is_empty() {
            return Err(TransportError::Unreachable(message.to));
        }
        for node in recipients {
            node.deliver_message(message.clone()).await;
        }
        Ok(())
    }

    async fn request(&self, iq: Iq, retry: RetryPolicy) -> Result<Iq, TransportError> {
        self.sent_requests.lock().push(iq.clone());
        let switchboard = self.switchboard()?;
        let Some(responder) = switchboard.responder(&iq.to) else {
            return Err(TransportError::Unreachable(iq.to));
        };

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(iq.id.clone(), tx);

        for attempt in 0..=retry.retries {
            let responder = responder.clone();
            let request = iq.clone();
            let switchboard = self.switchboard.clone();
            tokio::spawn(async move {
                let Some(response) = responder.deliver_iq(request).await else {
                    return;
                };
                if let Some(switchboard) = switchboard.upgrade() {
                    if let Err(e) = switchboard.deliver_response(response) {
                        tracing::debug!("response not delivered: {}", e);
                    }
                }
            });

            match tokio::time::timeout(retry.attempt_timeout(attempt), &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(TransportError::Closed),
                Err(_) => tracing::debug!("{} attempt {} of {} timed out", iq.id, attempt + 1, retry.retries + 1),
            }
        }

        self.pending.lock().remove(&iq.id);
        Err(TransportError::Timeout)
    }

    async fn respond(&self, iq: Iq) -> Result<(), TransportError> {
        self.switchboard()?.deliver_response(iq)
    }

    async fn process_message(&self, message: Message) {
        if self.inbox_tx.send(message).is_err() {
            tracing::debug!("{} inbox closed", self.address);
        }
    }

    async fn process_iq(&self, iq: Iq) -> Option<Iq> {
        let handler = self.app.read().clone();
        match handler {
            Some(handler) => handler(iq),
            None => Some(Iq::error_for(
                &iq,
                StanzaError::new(ErrorCondition::ServiceUnavailable),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stanza::IqType;
    use std::time::Duration;

    fn node(switchboard: &Arc<Switchboard>, address: &str) -> Arc<LoopbackTransport> {
        let transport = LoopbackTransport::new(address.parse().unwrap(), switchboard);
        assert!(switchboard.attach(transport.clone()));
        transport
    }

    fn ping(from: &LoopbackTransport, to: &str) -> Iq {
        Iq {
            id: from.next_id(),
            from: from.address(),
            to: to.parse().unwrap(),
            kind: IqType::Get,
            payload: Some(Element::new("ping", "urn:test")),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_request_reaches_application() {
        let switchboard = Arc::new(Switchboard::default());
        let a = node(&switchboard, "a@x/1");
        let b = node(&switchboard, "b@x/1");
        b.serve(|iq| Some(Iq::result_for(&iq, Some(Element::new("pong", "urn:test")))));

        let reply = a
            .request(ping(&a, "b@x/1"), RetryPolicy::once(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.kind, IqType::Result);
        assert_eq!(reply.payload.unwrap().name, "pong");
        assert_eq!(a.requests_named("ping"), 1);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let switchboard = Arc::new(Switchboard::default());
        let a = node(&switchboard, "a@x/1");
        let b = node(&switchboard, "b@x/1");
        b.serve(|_| None);

        let result = a
            .request(ping(&a, "b@x/1"), RetryPolicy::once(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_bare_message_reaches_every_resource() {
        let switchboard = Arc::new(Switchboard::default());
        let a = node(&switchboard, "a@x/1");
        let b1 = node(&switchboard, "b@x/1");
        let b2 = node(&switchboard, "b@x/2");
        assert_eq!(a.resources(&"b@x".parse().unwrap()).len(), 2);

        let message = Message {
            id: a.next_id(),
            from: a.address(),
            to: "b@x".parse().unwrap(),
            kind: crate::stanza::MessageType::Chat,
            payload: vec![Element::new("body", "jabber:client").with_text("hi")],
        };
        a.send_message(message).await.unwrap();
        assert!(b1.next_message(Duration::from_secs(1)).await.is_some());
        assert!(b2.next_message(Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_destination_is_unreachable() {
        let switchboard = Arc::new(Switchboard::default());
        let a = node(&switchboard, "a@x/1");
        let result = a
            .request(ping(&a, "nobody@x/1"), RetryPolicy::once(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
