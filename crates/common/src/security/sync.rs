//! Synchronization handshake
//!
//! Both sides exchange a bundle:
//!
//! ```text
//! <synchronize xmlns="urn:nf:iot:e2e:1.0">
//!   <e2e xmlns="urn:nf:iot:e2e:1.0"> endpoint descriptors </e2e>
//!   <p2p xmlns="urn:nf:iot:p2p:1.0"> address descriptors </p2p>
//! </synchronize>
//! ```
//!
//! The same bundle, named `endpoints`, rides on available presence.

use futures::future::join_all;

use crate::address::Address;
use crate::endpoint::{E2E_NAMESPACES, NAMESPACE_E2E, NAMESPACE_P2P, P2P_NAMESPACES};
use crate::stanza::{ErrorCondition, Element, Iq, IqType, Presence, PresenceType, StanzaError};
use crate::transport::Transport;

use super::{EndpointSecurity, PeerEvent, SecurityError};

/// Request payload of the handshake
pub const SYNCHRONIZE: &str = "synchronize";
/// Bundle embedded in available presence
pub const BUNDLE: &str = "endpoints";
/// Endpoint descriptors inside a bundle
pub const ENCRYPTION: &str = "e2e";
/// Address descriptors inside a bundle
pub const ADDRESSES: &str = "p2p";

/// What a synchronization (re)established
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRecord {
    pub e2e: bool,
    pub p2p: bool,
}

fn is_bundle(element: &Element, name: &str) -> bool {
    element.name == name && E2E_NAMESPACES.contains(&element.namespace.as_str())
}

impl<T: Transport> EndpointSecurity<T> {
    fn bundle(&self, name: &str) -> Element {
        self.bundle_with_keys(name).0
    }

    /// A bundle and the public keys of ours it carries
    fn bundle_with_keys(&self, name: &str) -> (Element, Vec<Vec<u8>>) {
        let endpoints = self.keys().snapshot();
        let keys = endpoints.iter().map(|e| e.public_key().to_vec()).collect();
        let encryption = Element::new(ENCRYPTION, NAMESPACE_E2E)
            .with_children(endpoints.iter().map(|e| e.to_element()));
        let mut bundle = Element::new(name, NAMESPACE_E2E).with_child(encryption);
        if let Some(book) = self.address_book() {
            let descriptors = book.local_descriptors();
            if !descriptors.is_empty() {
                bundle = bundle
                    .with_child(Element::new(ADDRESSES, NAMESPACE_P2P).with_children(descriptors));
            }
        }
        (bundle, keys)
    }

    /// Our bundle, for the transport to embed in outgoing available presence
    pub fn presence_bundle(&self) -> Result<Element, SecurityError> {
        self.ensure_active()?;
        Ok(self.bundle(BUNDLE))
    }

    /// Update caches from a peer's bundle
    fn absorb_bundle(&self, peer: &Address, bundle: &Element) -> Result<SyncRecord, SecurityError> {
        let mut record = SyncRecord::default();
        match bundle.child_in(ENCRYPTION, &E2E_NAMESPACES) {
            Some(encryption) => record.e2e = self.add_peer_info(peer, &encryption.children)?,
            None => {
                self.remove_peer_info(peer)?;
            }
        }
        if let Some(book) = self.address_book() {
            if let Some(addresses) = bundle.child_in(ADDRESSES, &P2P_NAMESPACES) {
                record.p2p = book.update_peer(peer, &addresses.children);
            }
        }
        Ok(record)
    }

    fn forget(&self, peer: &Address) -> Result<(), SecurityError> {
        self.remove_peer_info(peer)?;
        if let Some(book) = self.address_book() {
            book.remove_peer(peer);
        }
        Ok(())
    }

    /// Exchange endpoint bundles with `peer`
    ///
    /// On success the peer's endpoints replace whatever was cached and a
    /// [`PeerEvent::Updated`] is raised. A failed handshake forgets the peer.
    pub async fn synchronize(&self, peer: &Address) -> Result<SyncRecord, SecurityError> {
        self.ensure_active()?;
        let (bundle, sent_keys) = self.bundle_with_keys(SYNCHRONIZE);
        let iq = Iq {
            id: self.transport().next_id(),
            from: self.address(),
            to: peer.clone(),
            kind: IqType::Set,
            payload: Some(bundle),
            error: None,
        };
        tracing::debug!("synchronizing endpoints with {}", peer);

        let reply = match self.transport().request(iq, self.config().retry).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("synchronization with {} failed: {}", peer, e);
                self.forget(peer)?;
                return Err(e.into());
            }
        };
        if reply.kind != IqType::Result {
            let error = reply
                .error
                .unwrap_or_else(|| StanzaError::new(ErrorCondition::InternalServerError));
            tracing::warn!("synchronization with {} rejected: {}", peer, error);
            self.forget(peer)?;
            return Err(SecurityError::Stanza(error));
        }

        // a bare destination is answered by one of its resources
        let holder = if reply.from.is_bare() {
            peer.clone()
        } else {
            reply.from.clone()
        };
        let record = match reply.payload.as_ref().filter(|p| is_bundle(p, SYNCHRONIZE)) {
            Some(bundle) => self.absorb_bundle(&holder, bundle)?,
            None => {
                self.remove_peer_info(&holder)?;
                SyncRecord::default()
            }
        };
        // the peer accepted our bundle, so it now holds exactly those keys
        self.peers().set_learned(&holder, sent_keys);
        tracing::info!(
            "synchronized with {} (e2e: {}, p2p: {})",
            holder,
            record.e2e,
            record.p2p
        );
        self.emit(PeerEvent::Updated {
            peer: holder,
            e2e: record.e2e,
            p2p: record.p2p,
        });
        Ok(record)
    }

    /// Synchronize with `peer`, or with each online resource of a bare address
    ///
    /// Failures are logged; the caller retries its own operation regardless.
    pub(crate) async fn resynchronize(&self, peer: &Address) {
        let mut targets = Vec::new();
        if peer.is_bare() {
            targets = self.transport().resources(peer);
        }
        if targets.is_empty() {
            targets.push(peer.clone());
        }
        let results = join_all(targets.iter().map(|target| self.synchronize(target))).await;
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!("resynchronization with {} failed: {}", target, e);
            }
        }
    }

    async fn may_synchronize(&self, requester: &Address) -> bool {
        if requester.same_account(&self.address()) {
            return true;
        }
        self.transport()
            .subscription(&requester.bare())
            .await
            .is_contact()
    }

    /// Answer an inbound synchronization request
    pub(crate) async fn handle_synchronize(
        &self,
        request: &Iq,
        bundle: &Element,
    ) -> Result<Iq, SecurityError> {
        self.ensure_active()?;
        let own = self.address();
        if !self.may_synchronize(&request.from).await {
            tracing::warn!("rejecting synchronization from {}", request.from);
            return Ok(Iq {
                from: own,
                ..Iq::error_for(request, StanzaError::new(ErrorCondition::NotAuthorized))
            });
        }

        let record = self.absorb_bundle(&request.from, bundle)?;
        tracing::debug!(
            "accepted synchronization from {} (e2e: {}, p2p: {})",
            request.from,
            record.e2e,
            record.p2p
        );
        self.emit(PeerEvent::Updated {
            peer: request.from.clone(),
            e2e: record.e2e,
            p2p: record.p2p,
        });
        let (bundle, sent_keys) = self.bundle_with_keys(SYNCHRONIZE);
        self.peers().set_learned(&request.from, sent_keys);
        Ok(Iq {
            from: own,
            ..Iq::result_for(request, Some(bundle))
        })
    }

    /// Absorb a presence bundle or note a departure
    ///
    /// Unavailability does not purge the peer's cached endpoints.
    pub(crate) fn handle_presence(&self, presence: &Presence) -> Result<(), SecurityError> {
        self.ensure_active()?;
        if presence.from == self.address() {
            return Ok(());
        }
        match presence.kind {
            PresenceType::Available => {
                let Some(bundle) = presence.payload.iter().find(|e| is_bundle(e, BUNDLE)) else {
                    return Ok(());
                };
                let record = self.absorb_bundle(&presence.from, bundle)?;
                self.emit(PeerEvent::Available {
                    peer: presence.from.clone(),
                    e2e: record.e2e,
                    p2p: record.p2p,
                });
            }
            PresenceType::Unavailable => self.emit(PeerEvent::Unavailable {
                peer: presence.from.clone(),
            }),
        }
        Ok(())
    }
}

pub(crate) fn is_synchronize(element: &Element) -> bool {
    is_bundle(element, SYNCHRONIZE)
}
