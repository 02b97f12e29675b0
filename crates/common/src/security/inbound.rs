use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::crypto::CipherKind;
use crate::endpoint::E2E_NAMESPACES;
use crate::stanza::{
    ErrorCondition, Element, Iq, IqType, Message, MessageType, Presence, StanzaError,
};
use crate::transport::{HandlerKind, StanzaHandler, Transport};

use super::engine::Envelope;
use super::send::{decode_payload, SealedMessage};
use super::sync::{is_synchronize, BUNDLE, SYNCHRONIZE};
use super::{EndpointSecurity, Inner, SecurityError};

/// Receives envelopes, synchronization requests and presence bundles
///
/// Holds the manager weakly so registration with the transport does not keep
/// it alive.
struct InboundHandler<T: Transport> {
    security: Weak<Inner<T>>,
}

impl<T: Transport> InboundHandler<T> {
    fn security(&self) -> Option<EndpointSecurity<T>> {
        self.security
            .upgrade()
            .map(EndpointSecurity::from_inner)
            .filter(|security| !security.is_disposed())
    }
}

#[async_trait]
impl<T: Transport> StanzaHandler for InboundHandler<T> {
    async fn on_message(&self, message: Message, element: Element) {
        let Some(security) = self.security() else {
            return;
        };
        let (id, from) = (message.id.clone(), message.from.clone());
        if let Err(e) = security.receive_message(message, &element).await {
            tracing::warn!("failed to process message {} from {}: {}", id, from, e);
        }
    }

    async fn on_iq(&self, iq: Iq, element: Element) -> Option<Iq> {
        let Some(security) = self.security() else {
            return Some(Iq::error_for(
                &iq,
                StanzaError::new(ErrorCondition::ServiceUnavailable),
            ));
        };
        match security.receive_iq(&iq, &element).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("failed to process request {} from {}: {}", iq.id, iq.from, e);
                Some(Iq::error_for(
                    &iq,
                    StanzaError::new(ErrorCondition::InternalServerError),
                ))
            }
        }
    }

    async fn on_presence(&self, presence: Presence) {
        let Some(security) = self.security() else {
            return;
        };
        if let Err(e) = security.handle_presence(&presence) {
            tracing::warn!("failed to process presence from {}: {}", presence.from, e);
        }
    }
}

/// Register the handler for every envelope tag, the handshake and the
/// presence bundle, in both the current and the legacy namespace
pub(super) fn register_handlers<T: Transport>(inner: &Arc<Inner<T>>) {
    let handler: Arc<dyn StanzaHandler> = Arc::new(InboundHandler {
        security: Arc::downgrade(inner),
    });

    let mut wanted = Vec::new();
    for namespace in E2E_NAMESPACES {
        for cipher in CipherKind::ALL {
            wanted.push((HandlerKind::Message, cipher.tag(), namespace));
            wanted.push((HandlerKind::Iq, cipher.tag(), namespace));
        }
        wanted.push((HandlerKind::Iq, SYNCHRONIZE, namespace));
        wanted.push((HandlerKind::Presence, BUNDLE, namespace));
    }

    let mut registered = inner.handlers.lock();
    for (kind, name, namespace) in wanted {
        inner
            .transport
            .register_handler(kind, name, namespace, handler.clone());
        registered.push((kind, name.to_string(), namespace.to_string()));
    }
    tracing::debug!("registered {} stanza handlers", registered.len());
}

impl<T: Transport> EndpointSecurity<T> {
    /// Decrypt a message envelope and hand the plaintext message on
    ///
    /// An envelope that does not open is bounced to its sender as an
    /// error-type message.
    async fn receive_message(&self, message: Message, element: &Element) -> Result<(), SecurityError> {
        if message.kind == MessageType::Error {
            return Ok(());
        }
        let Some(envelope) = Envelope::parse(element) else {
            tracing::debug!("bouncing malformed envelope in {}", message.id);
            let error = StanzaError::with_text(ErrorCondition::BadRequest, "malformed envelope");
            return self.bounce(&message, error).await;
        };
        let opened = self.open_envelope(
            &envelope,
            &message.id,
            message.kind.as_str(),
            &message.from,
            &message.to,
        )?;
        let Some(plain) = opened else {
            tracing::warn!(
                "bouncing message {} from {}: unable to decrypt",
                message.id,
                message.from
            );
            let error = StanzaError::with_text(ErrorCondition::Forbidden, "unable to decrypt");
            return self.bounce(&message, error).await;
        };
        let sealed: SealedMessage = bincode::deserialize(&plain)?;
        self.transport()
            .process_message(Message {
                kind: sealed.kind,
                payload: sealed.payload,
                ..message
            })
            .await;
        Ok(())
    }

    async fn bounce(&self, message: &Message, error: StanzaError) -> Result<(), SecurityError> {
        let bounce = Message {
            from: self.address(),
            ..Message::error_for(message, error)
        };
        self.transport().send_message(bounce).await?;
        Ok(())
    }

    /// Answer a handshake or decrypt a request and encrypt its answer
    ///
    /// A request that does not decrypt is answered `forbidden`, which makes
    /// the sender synchronize and retry once.
    async fn receive_iq(&self, iq: &Iq, element: &Element) -> Result<Option<Iq>, SecurityError> {
        let own = self.address();
        if is_synchronize(element) {
            return self.handle_synchronize(iq, element).await.map(Some);
        }
        if !iq.kind.is_request() {
            return Ok(None);
        }
        let Some(envelope) = Envelope::parse(element) else {
            return Ok(Some(Iq {
                from: own,
                ..Iq::error_for(
                    iq,
                    StanzaError::with_text(ErrorCondition::BadRequest, "malformed envelope"),
                )
            }));
        };

        let opened =
            self.open_envelope(&envelope, &iq.id, iq.kind.as_str(), &iq.from, &iq.to)?;
        let Some(plain) = opened else {
            tracing::warn!("rejecting request {} from {}: unable to decrypt", iq.id, iq.from);
            return Ok(Some(Iq {
                from: own,
                ..Iq::error_for(
                    iq,
                    StanzaError::with_text(ErrorCondition::Forbidden, "unable to decrypt"),
                )
            }));
        };

        let request = Iq {
            payload: decode_payload(&plain)?,
            ..iq.clone()
        };
        let Some(response) = self.transport().process_iq(request).await else {
            // answered later through send_iq_result / send_iq_error
            return Ok(None);
        };

        match response.kind {
            IqType::Result => match self.seal_result(iq, response.payload.as_ref())? {
                Some(sealed) => Ok(Some(sealed)),
                None => {
                    tracing::warn!("no channel back to {}, refusing to answer in the clear", iq.from);
                    Ok(Some(Iq {
                        from: own,
                        ..Iq::error_for(iq, StanzaError::new(ErrorCondition::NotAcceptable))
                    }))
                }
            },
            _ => Ok(Some(Iq {
                from: own,
                ..response
            })),
        }
    }
}
