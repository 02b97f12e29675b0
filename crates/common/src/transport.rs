//! Boundary to the messaging transport
//!
//! The endpoint security layer does not own connections, routing, rosters or
//! retry timers. Everything it needs from the transport is described by the
//! [`Transport`] trait, and everything the transport needs to call back into
//! the security layer by [`StanzaHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::stanza::{Element, Iq, Message, Presence};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("peer unreachable: {0}")]
    Unreachable(Address),
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Retry budget for a single request, enforced by the transport
///
/// With `drop_off` set, each attempt waits twice as long as the one before,
/// bounded by `max_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "millis")]
    pub timeout: Duration,
    pub retries: u32,
    pub drop_off: bool,
    #[serde(with = "millis")]
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            drop_off: true,
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 0,
            drop_off: false,
            max_timeout: timeout,
        }
    }

    /// Timeout for the given zero-based attempt
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        if !self.drop_off {
            return self.timeout;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.timeout
            .checked_mul(factor)
            .unwrap_or(self.max_timeout)
            .min(self.max_timeout)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Roster subscription state between us and a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
    Unknown,
}

impl Subscription {
    /// Whether the contact is an established roster contact
    pub fn is_contact(&self) -> bool {
        matches!(
            self,
            Subscription::To | Subscription::From | Subscription::Both
        )
    }
}

/// The stanza family a handler is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Message,
    Iq,
    Presence,
}

/// Callbacks the transport invokes for elements the security layer registered
///
/// Each method receives the whole stanza and the matching payload element.
#[async_trait]
pub trait StanzaHandler: Send + Sync {
    async fn on_message(&self, _message: Message, _element: Element) {}

    /// Handle a request; `None` means the response will be sent later
    async fn on_iq(&self, _iq: Iq, _element: Element) -> Option<Iq> {
        None
    }

    async fn on_presence(&self, _presence: Presence) {}
}

/// What the security layer consumes from the messaging transport
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug + 'static {
    /// Our own full address
    fn address(&self) -> Address;

    /// Allocate a fresh correlation id
    fn next_id(&self) -> String;

    fn register_handler(
        &self,
        kind: HandlerKind,
        name: &str,
        namespace: &str,
        handler: Arc<dyn StanzaHandler>,
    );

    fn unregister_handler(&self, kind: HandlerKind, name: &str, namespace: &str) -> bool;

    /// Online resources of a bare address, as seen through presence
    fn resources(&self, bare: &Address) -> Vec<Address>;

    async fn subscription(&self, address: &Address) -> Subscription;

    async fn send_message(&self, message: Message) -> Result<(), TransportError>;

    /// Send a request and wait for its result or error, retrying per `retry`
    async fn request(&self, iq: Iq, retry: RetryPolicy) -> Result<Iq, TransportError>;

    /// Send a result or error for a request received earlier
    async fn respond(&self, iq: Iq) -> Result<(), TransportError>;

    /// Re-inject a decrypted message into the normal processing pipeline
    async fn process_message(&self, message: Message);

    /// Re-inject a decrypted request; returns the application's response
    async fn process_iq(&self, iq: Iq) -> Option<Iq>;
}

/// Optional serverless-messaging collaborator
///
/// Publishes how peers can reach us directly, and absorbs the same
/// information from peers.
pub trait AddressBook: Send + Sync + std::fmt::Debug {
    /// Our own address descriptors, if any
    fn local_descriptors(&self) -> Vec<Element>;

    /// Store a peer's address descriptors; returns whether anything was learned
    fn update_peer(&self, peer: &Address, descriptors: &[Element]) -> bool;

    fn remove_peer(&self, peer: &Address);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_drop_off_doubles_until_max() {
        let retry = RetryPolicy {
            timeout: Duration::from_secs(2),
            retries: 5,
            drop_off: true,
            max_timeout: Duration::from_secs(10),
        };
        assert_eq!(retry.attempt_timeout(0), Duration::from_secs(2));
        assert_eq!(retry.attempt_timeout(1), Duration::from_secs(4));
        assert_eq!(retry.attempt_timeout(2), Duration::from_secs(8));
        assert_eq!(retry.attempt_timeout(3), Duration::from_secs(10));
        assert_eq!(retry.attempt_timeout(40), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_timeout_without_drop_off() {
        let retry = RetryPolicy {
            drop_off: false,
            ..RetryPolicy::default()
        };
        assert_eq!(retry.attempt_timeout(3), retry.timeout);
    }

    #[test]
    fn test_contact_subscriptions() {
        assert!(Subscription::Both.is_contact());
        assert!(Subscription::From.is_contact());
        assert!(!Subscription::None.is_contact());
        assert!(!Subscription::Remove.is_contact());
        assert!(!Subscription::Unknown.is_contact());
    }
}
