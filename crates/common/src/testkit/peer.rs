use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::address::Address;
use crate::security::EndpointSecurity;
use crate::stanza::{Iq, Message, PresenceType};
use crate::transport::Subscription;

use super::loopback::LoopbackTransport;

/// A managed endpoint security instance on the loopback network
#[derive(Debug, Clone)]
pub struct TestPeer {
    /// The underlying transport (for wire inspection)
    transport: Arc<LoopbackTransport>,
    security: EndpointSecurity<LoopbackTransport>,
}

impl TestPeer {
    pub(crate) fn new(
        transport: Arc<LoopbackTransport>,
        security: EndpointSecurity<LoopbackTransport>,
    ) -> Self {
        Self {
            transport,
            security,
        }
    }

    pub fn address(&self) -> Address {
        self.security.address()
    }

    pub fn transport(&self) -> &Arc<LoopbackTransport> {
        &self.transport
    }

    pub fn security(&self) -> &EndpointSecurity<LoopbackTransport> {
        &self.security
    }

    /// Mark `other` as a roster contact, so it may synchronize with us
    pub fn befriend(&self, other: &Address) {
        self.transport.set_subscription(other, Subscription::Both);
    }

    /// Answer decrypted requests with `handler`
    pub fn serve<F>(&self, handler: F)
    where
        F: Fn(Iq) -> Option<Iq> + Send + Sync + 'static,
    {
        self.transport.serve(handler);
    }

    /// Broadcast available presence carrying our endpoint bundle
    pub async fn announce(&self) -> Result<()> {
        let bundle = self.security.presence_bundle()?;
        self.transport
            .send_presence(PresenceType::Available, None, vec![bundle])
            .await?;
        Ok(())
    }

    /// Broadcast unavailable presence
    pub async fn depart(&self) -> Result<()> {
        self.transport
            .send_presence(PresenceType::Unavailable, None, Vec::new())
            .await?;
        Ok(())
    }

    /// Next message handed to the application, if one arrives in time
    pub async fn next_message(&self, timeout: Duration) -> Option<Message> {
        self.transport.next_message(timeout).await
    }

    pub(crate) fn dispose(&self) {
        self.security.dispose();
    }
}
