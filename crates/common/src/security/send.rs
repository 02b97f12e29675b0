use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::stanza::{ErrorCondition, Element, Iq, IqType, Message, MessageType, StanzaError};
use crate::transport::{RetryPolicy, Transport};

use super::engine::{Envelope, Sealed};
use super::exchange::{Exchange, PendingRequest};
use super::{EndpointSecurity, SecurityError};

/// What to do when no encrypted channel to a destination exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum E2ePolicy {
    /// Fail, after one synchronization attempt
    #[default]
    RequireE2E,
    /// Drop silently; requests complete as cancelled
    IgnoreIfNotE2E,
    /// Send in the clear
    NormalIfNotE2E,
}

/// How a message left
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encrypted to every listed recipient
    Encrypted(Vec<Address>),
    Plain,
    Dropped,
}

/// The outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqResponse {
    Result {
        from: Address,
        payload: Option<Element>,
        encrypted: bool,
    },
    Error {
        from: Address,
        error: StanzaError,
        encrypted: bool,
    },
    /// Encryption was required but no channel could be established
    NoChannel(Address),
    /// Dropped locally under [`E2ePolicy::IgnoreIfNotE2E`]
    Cancelled,
}

impl IqResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, IqResponse::Result { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            IqResponse::Error { error, .. } if error.condition == ErrorCondition::Forbidden
        )
    }

    /// An encrypted answer we could not open
    pub fn is_unreadable(&self) -> bool {
        matches!(self, IqResponse::Error { encrypted: true, .. })
    }

    pub fn into_result(self) -> Result<Option<Element>, SecurityError> {
        match self {
            IqResponse::Result { payload, .. } => Ok(payload),
            IqResponse::Error { error, .. } => Err(SecurityError::Stanza(error)),
            IqResponse::NoChannel(to) => Err(SecurityError::NoChannel(to)),
            IqResponse::Cancelled => Err(SecurityError::Cancelled),
        }
    }
}

/// Plaintext inside a message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SealedMessage {
    pub kind: MessageType,
    pub payload: Vec<Element>,
}

/// Envelopes always travel in normal-type messages
pub(crate) const ENVELOPE_MESSAGE_TYPE: MessageType = MessageType::Normal;

pub(crate) fn encode_payload(payload: Option<&Element>) -> Result<Vec<u8>, SecurityError> {
    Ok(bincode::serialize(&payload)?)
}

pub(crate) fn decode_payload(data: &[u8]) -> Result<Option<Element>, SecurityError> {
    Ok(bincode::deserialize(data)?)
}

impl<T: Transport> EndpointSecurity<T> {
    // ========================================
    // Messages
    // ========================================

    /// Send a message, end-to-end encrypted where possible
    ///
    /// A bare destination without a channel of its own fans out to every
    /// online resource we can encrypt to.
    pub async fn send_message(
        &self,
        policy: E2ePolicy,
        kind: MessageType,
        to: &Address,
        payload: Vec<Element>,
    ) -> Result<SendOutcome, SecurityError> {
        self.ensure_active()?;
        let plain = bincode::serialize(&SealedMessage {
            kind,
            payload: payload.clone(),
        })?;

        let mut exchange = Exchange::new();
        loop {
            let recipients = self.seal_and_fan_out(to, &plain).await?;
            if !recipients.is_empty() {
                exchange.done();
                return Ok(SendOutcome::Encrypted(recipients));
            }

            match policy {
                E2ePolicy::RequireE2E => {
                    if exchange.resynchronize() {
                        tracing::debug!("no channel to {}, synchronizing before retry", to);
                        self.resynchronize(to).await;
                        exchange.retry();
                        continue;
                    }
                    exchange.fail();
                    tracing::warn!("no end-to-end channel to {}, message not sent", to);
                    return Err(SecurityError::NoChannel(to.clone()));
                }
                E2ePolicy::IgnoreIfNotE2E => {
                    exchange.done();
                    tracing::debug!("no channel to {}, message dropped", to);
                    return Ok(SendOutcome::Dropped);
                }
                E2ePolicy::NormalIfNotE2E => {
                    let message = Message {
                        id: self.transport().next_id(),
                        from: self.address(),
                        to: to.clone(),
                        kind,
                        payload,
                    };
                    self.transport().send_message(message).await?;
                    exchange.done();
                    tracing::debug!("no channel to {}, message sent in the clear", to);
                    return Ok(SendOutcome::Plain);
                }
            }
        }
    }

    /// [`send_message`](Self::send_message) under the configured policy
    pub async fn send(
        &self,
        kind: MessageType,
        to: &Address,
        payload: Vec<Element>,
    ) -> Result<SendOutcome, SecurityError> {
        self.send_message(self.config().policy, kind, to, payload)
            .await
    }

    async fn seal_and_fan_out(
        &self,
        to: &Address,
        plain: &[u8],
    ) -> Result<Vec<Address>, SecurityError> {
        if self.seal_and_send(to, plain).await? {
            return Ok(vec![to.clone()]);
        }
        if !to.is_bare() {
            return Ok(Vec::new());
        }
        // one unreachable resource must not cost the others their copy
        let mut recipients = Vec::new();
        let mut failure = None;
        for resource in self.transport().resources(to) {
            match self.seal_and_send(&resource, plain).await {
                Ok(true) => recipients.push(resource),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("fan-out to {} failed: {}", resource, e);
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) if recipients.is_empty() => Err(e),
            _ => Ok(recipients),
        }
    }

    async fn seal_and_send(&self, to: &Address, plain: &[u8]) -> Result<bool, SecurityError> {
        let id = self.transport().next_id();
        let own = self.address();
        let Some(sealed) = self.encrypt(&id, ENVELOPE_MESSAGE_TYPE.as_str(), &own, to, plain)?
        else {
            return Ok(false);
        };
        let message = Message {
            id,
            from: own,
            to: to.clone(),
            kind: ENVELOPE_MESSAGE_TYPE,
            payload: vec![sealed.to_element()],
        };
        self.transport().send_message(message).await?;
        Ok(true)
    }

    // ========================================
    // Requests
    // ========================================

    pub async fn send_iq_get(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
    ) -> Result<IqResponse, SecurityError> {
        self.send_iq(IqType::Get, to, payload, policy, self.config().retry)
            .await
    }

    pub async fn send_iq_get_with_retry(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
        retry: RetryPolicy,
    ) -> Result<IqResponse, SecurityError> {
        self.send_iq(IqType::Get, to, payload, policy, retry).await
    }

    pub async fn send_iq_set(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
    ) -> Result<IqResponse, SecurityError> {
        self.send_iq(IqType::Set, to, payload, policy, self.config().retry)
            .await
    }

    pub async fn send_iq_set_with_retry(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
        retry: RetryPolicy,
    ) -> Result<IqResponse, SecurityError> {
        self.send_iq(IqType::Set, to, payload, policy, retry).await
    }

    /// Send a get request and wait, bounded by the configured request timeout
    ///
    /// Fails with the remote's stanza error, [`SecurityError::Timeout`], or
    /// the policy's failure.
    pub async fn iq_get(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
    ) -> Result<Option<Element>, SecurityError> {
        self.await_iq(IqType::Get, to, payload, policy).await
    }

    /// Send a set request and wait, bounded by the configured request timeout
    pub async fn iq_set(
        &self,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
    ) -> Result<Option<Element>, SecurityError> {
        self.await_iq(IqType::Set, to, payload, policy).await
    }

    /// [`iq_get`](Self::iq_get) under the configured policy
    pub async fn get(&self, to: &Address, payload: Element) -> Result<Option<Element>, SecurityError> {
        self.await_iq(IqType::Get, to, payload, self.config().policy)
            .await
    }

    /// [`iq_set`](Self::iq_set) under the configured policy
    pub async fn set(&self, to: &Address, payload: Element) -> Result<Option<Element>, SecurityError> {
        self.await_iq(IqType::Set, to, payload, self.config().policy)
            .await
    }

    async fn await_iq(
        &self,
        kind: IqType,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
    ) -> Result<Option<Element>, SecurityError> {
        let deadline = self.config().request_timeout;
        let request = self.send_iq(kind, to, payload, policy, self.config().retry);
        match tokio::time::timeout(deadline, request).await {
            Ok(response) => response?.into_result(),
            Err(_) => {
                tracing::debug!("{} request to {} timed out after {:?}", kind.as_str(), to, deadline);
                Err(SecurityError::Timeout)
            }
        }
    }

    async fn send_iq(
        &self,
        kind: IqType,
        to: &Address,
        payload: Element,
        policy: E2ePolicy,
        retry: RetryPolicy,
    ) -> Result<IqResponse, SecurityError> {
        self.ensure_active()?;
        let plain = encode_payload(Some(&payload))?;
        let mut request = PendingRequest::new(self.transport().next_id(), to.clone(), kind, retry);

        loop {
            if let Some((target, sealed)) = self.seal_request(&request, &plain)? {
                request.exchange.awaiting_response();
                let iq = Iq {
                    id: request.id.clone(),
                    from: self.address(),
                    to: target.clone(),
                    kind,
                    payload: Some(sealed.to_element()),
                    error: None,
                };
                let reply = self.transport().request(iq, request.retry).await?;
                let response = self.open_response(reply)?;

                if (response.is_forbidden() || response.is_unreadable())
                    && request.exchange.resynchronize()
                {
                    tracing::info!(
                        "envelope exchange with {} failed ({:?}), synchronizing and retrying",
                        target,
                        response
                    );
                    self.resynchronize(&target).await;
                    request.retry_with(self.transport().next_id());
                    continue;
                }
                self.settle(&mut request.exchange, &response);
                return Ok(response);
            }

            match policy {
                E2ePolicy::RequireE2E => {
                    if request.exchange.resynchronize() {
                        tracing::debug!("no channel to {}, synchronizing before retry", to);
                        self.resynchronize(to).await;
                        request.retry_with(self.transport().next_id());
                        continue;
                    }
                    request.exchange.fail();
                    tracing::warn!("no end-to-end channel to {}, request not sent", to);
                    return Ok(IqResponse::NoChannel(to.clone()));
                }
                E2ePolicy::IgnoreIfNotE2E => {
                    request.exchange.done();
                    tracing::debug!("no channel to {}, request cancelled", to);
                    return Ok(IqResponse::Cancelled);
                }
                E2ePolicy::NormalIfNotE2E => {
                    request.exchange.awaiting_response();
                    let iq = Iq {
                        id: request.id.clone(),
                        from: self.address(),
                        to: to.clone(),
                        kind,
                        payload: Some(payload),
                        error: None,
                    };
                    let reply = self.transport().request(iq, request.retry).await?;
                    let response = self.open_response(reply)?;
                    self.settle(&mut request.exchange, &response);
                    return Ok(response);
                }
            }
        }
    }

    fn settle(&self, exchange: &mut Exchange, response: &IqResponse) {
        if response.is_ok() {
            exchange.done();
        } else {
            exchange.fail();
        }
    }

    /// Encrypt a request for its destination, or for the first resource of a
    /// bare destination we have a channel to
    fn seal_request(
        &self,
        request: &PendingRequest,
        plain: &[u8],
    ) -> Result<Option<(Address, Sealed)>, SecurityError> {
        let own = self.address();
        let kind = request.kind.as_str();
        if let Some(sealed) = self.encrypt(&request.id, kind, &own, &request.to, plain)? {
            return Ok(Some((request.to.clone(), sealed)));
        }
        if request.to.is_bare() {
            for resource in self.transport().resources(&request.to) {
                if let Some(sealed) = self.encrypt(&request.id, kind, &own, &resource, plain)? {
                    return Ok(Some((resource, sealed)));
                }
            }
        }
        Ok(None)
    }

    /// Interpret a reply, opening its envelope if it carries one
    pub(crate) fn open_response(&self, reply: Iq) -> Result<IqResponse, SecurityError> {
        match reply.kind {
            IqType::Result => {
                let Some(envelope) = reply.payload.as_ref().and_then(Envelope::parse) else {
                    return Ok(IqResponse::Result {
                        from: reply.from,
                        payload: reply.payload,
                        encrypted: false,
                    });
                };
                let opened = self.open_envelope(
                    &envelope,
                    &reply.id,
                    IqType::Result.as_str(),
                    &reply.from,
                    &reply.to,
                )?;
                match opened {
                    Some(plain) => Ok(IqResponse::Result {
                        from: reply.from,
                        payload: decode_payload(&plain)?,
                        encrypted: true,
                    }),
                    None => Ok(IqResponse::Error {
                        from: reply.from,
                        error: StanzaError::with_text(
                            ErrorCondition::BadRequest,
                            "unable to decrypt response",
                        ),
                        encrypted: true,
                    }),
                }
            }
            IqType::Error => Ok(IqResponse::Error {
                from: reply.from,
                error: reply
                    .error
                    .unwrap_or_else(|| StanzaError::new(ErrorCondition::InternalServerError)),
                encrypted: false,
            }),
            IqType::Get | IqType::Set => Ok(IqResponse::Error {
                from: reply.from,
                error: StanzaError::with_text(ErrorCondition::BadRequest, "request sent as a response"),
                encrypted: false,
            }),
        }
    }

    // ========================================
    // Responses
    // ========================================

    /// Encrypt a result answering `request`; `None` without a channel
    pub(crate) fn seal_result(
        &self,
        request: &Iq,
        payload: Option<&Element>,
    ) -> Result<Option<Iq>, SecurityError> {
        let own = self.address();
        let plain = encode_payload(payload)?;
        let sealed = self.encrypt(
            &request.id,
            IqType::Result.as_str(),
            &own,
            &request.from,
            &plain,
        )?;
        Ok(sealed.map(|sealed| Iq {
            from: own,
            ..Iq::result_for(request, Some(sealed.to_element()))
        }))
    }

    /// Answer `request` with a result, encrypted where possible
    pub async fn send_iq_result(
        &self,
        request: &Iq,
        payload: Option<Element>,
        policy: E2ePolicy,
    ) -> Result<SendOutcome, SecurityError> {
        self.ensure_active()?;
        let mut exchange = Exchange::new();
        loop {
            if let Some(result) = self.seal_result(request, payload.as_ref())? {
                self.transport().respond(result).await?;
                exchange.done();
                return Ok(SendOutcome::Encrypted(vec![request.from.clone()]));
            }

            match policy {
                E2ePolicy::RequireE2E => {
                    if exchange.resynchronize() {
                        self.resynchronize(&request.from).await;
                        exchange.retry();
                        continue;
                    }
                    exchange.fail();
                    return Err(SecurityError::NoChannel(request.from.clone()));
                }
                E2ePolicy::IgnoreIfNotE2E => {
                    exchange.done();
                    return Ok(SendOutcome::Dropped);
                }
                E2ePolicy::NormalIfNotE2E => {
                    let result = Iq {
                        from: self.address(),
                        ..Iq::result_for(request, payload)
                    };
                    self.transport().respond(result).await?;
                    exchange.done();
                    return Ok(SendOutcome::Plain);
                }
            }
        }
    }

    /// Answer `request` with an error
    ///
    /// Error conditions are protocol metadata and travel in the clear.
    pub async fn send_iq_error(&self, request: &Iq, error: StanzaError) -> Result<(), SecurityError> {
        self.ensure_active()?;
        let reply = Iq {
            from: self.address(),
            ..Iq::error_for(request, error)
        };
        self.transport().respond(reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_payload_codec() {
        let element = Element::new("read", "urn:test")
            .with_attr("field", "temperature")
            .with_child(Element::new("unit", "urn:test").with_text("C"));
        let encoded = encode_payload(Some(&element)).unwrap();
        assert_eq!(decode_payload(&encoded).unwrap(), Some(element));
        assert_eq!(decode_payload(&encode_payload(None).unwrap()).unwrap(), None);
        assert!(decode_payload(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_response_classification() {
        let from: Address = "a@x/1".parse().unwrap();
        let forbidden = IqResponse::Error {
            from: from.clone(),
            error: StanzaError::new(ErrorCondition::Forbidden),
            encrypted: false,
        };
        assert!(forbidden.is_forbidden());
        assert!(!forbidden.is_ok());
        assert!(matches!(
            forbidden.into_result(),
            Err(SecurityError::Stanza(StanzaError {
                condition: ErrorCondition::Forbidden,
                ..
            }))
        ));

        let ok = IqResponse::Result {
            from,
            payload: None,
            encrypted: true,
        };
        assert!(ok.is_ok());
        assert!(matches!(ok.into_result(), Ok(None)));
        assert!(matches!(
            IqResponse::Cancelled.into_result(),
            Err(SecurityError::Cancelled)
        ));
    }
}
