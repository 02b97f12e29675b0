use std::io::{Read, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::address::Address;
use crate::crypto::CipherKind;
use crate::endpoint::{Direction, Endpoint, E2E_NAMESPACES, NAMESPACE_E2E};
use crate::stanza::Element;
use crate::transport::Transport;

use super::{EndpointSecurity, SecurityError};

/// A local endpoint paired with the peer endpoint it talks to
#[derive(Debug, Clone)]
pub struct Channel {
    pub local: Arc<Endpoint>,
    pub remote: Arc<Endpoint>,
    pub cipher: CipherKind,
}

impl Channel {
    /// Reference the receiver uses to find our endpoint: `namespace#localName`
    pub fn reference(&self) -> String {
        self.local.reference()
    }
}

/// Output of a successful encryption
#[derive(Debug, Clone)]
pub struct Sealed {
    pub channel: Channel,
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    pub fn envelope(&self) -> Envelope {
        Envelope {
            cipher: self.channel.cipher,
            reference: Some(self.channel.reference()),
            ciphertext: self.ciphertext.clone(),
        }
    }

    pub fn to_element(&self) -> Element {
        self.envelope().to_element()
    }
}

/// The wire form of an encrypted payload
///
/// `<{cipher tag} xmlns="urn:nf:iot:e2e:1.0" r="namespace#localName">base64</…>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub cipher: CipherKind,
    pub reference: Option<String>,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn is_envelope(element: &Element) -> bool {
        CipherKind::from_tag(&element.name).is_some()
            && E2E_NAMESPACES.contains(&element.namespace.as_str())
    }

    /// Parse an envelope element; `None` if it is not one or is malformed
    pub fn parse(element: &Element) -> Option<Envelope> {
        if !E2E_NAMESPACES.contains(&element.namespace.as_str()) {
            return None;
        }
        let cipher = CipherKind::from_tag(&element.name)?;
        let ciphertext = BASE64.decode(element.text.as_deref()?.trim()).ok()?;
        Some(Envelope {
            cipher,
            reference: element.attr("r").map(str::to_string),
            ciphertext,
        })
    }

    pub fn to_element(&self) -> Element {
        let element = Element::new(self.cipher.tag(), NAMESPACE_E2E)
            .with_text(BASE64.encode(&self.ciphertext));
        match &self.reference {
            Some(reference) => element.with_attr("r", reference.clone()),
            None => element,
        }
    }
}

/// Associated data binding a ciphertext to its stanza
pub(crate) fn associated_data(id: &str, kind: &str, from: &Address, to: &Address) -> Vec<u8> {
    let (from, to) = (from.key(), to.key());
    let mut aad = Vec::with_capacity(id.len() + kind.len() + from.len() + to.len() + 4);
    for part in [id, kind, from.as_str(), to.as_str()] {
        aad.extend_from_slice(part.as_bytes());
        aad.push(0);
    }
    aad
}

impl<T: Transport> EndpointSecurity<T> {
    /// Resolve the channel to `peer`, if one exists
    ///
    /// The peer's preferred endpoint wins when we have the same algorithm;
    /// otherwise the first of its endpoints we can match.
    ///
    /// After a local rotation the channel keeps sealing with our previous
    /// generation for as long as the peer is known to hold only that one.
    pub fn channel(&self, peer: &Address) -> Option<Channel> {
        let endpoints = self.peers().get(peer)?;
        endpoints.iter().find_map(|remote| {
            let local = self.sealing_generation(peer, self.keys().matching(remote)?);
            Some(Channel {
                cipher: local.default_cipher(),
                local,
                remote: remote.clone(),
            })
        })
    }

    fn sealing_generation(&self, peer: &Address, current: Arc<Endpoint>) -> Arc<Endpoint> {
        if self.peers().holds(peer, current.public_key()) != Some(false) {
            return current;
        }
        match current.previous() {
            Some(previous) if self.peers().holds(peer, previous.public_key()) == Some(true) => {
                tracing::trace!("{} still holds our previous {} key", peer, previous.id());
                previous
            }
            _ => current,
        }
    }

    /// Encrypt `data` for `to`
    ///
    /// `Ok(None)` means there is no channel to `to`; that is a normal outcome
    /// the caller's policy decides about, not an error.
    pub fn encrypt(
        &self,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
        data: &[u8],
    ) -> Result<Option<Sealed>, SecurityError> {
        self.encrypt_with(id, kind, from, to, data, None)
    }

    /// [`encrypt`](Self::encrypt) with `cipher` in place of the endpoint's default
    pub fn encrypt_with(
        &self,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
        data: &[u8],
        cipher: Option<CipherKind>,
    ) -> Result<Option<Sealed>, SecurityError> {
        self.ensure_active()?;
        let Some(mut channel) = self.channel(to) else {
            tracing::trace!("no channel to {}", to);
            return Ok(None);
        };
        if let Some(cipher) = cipher {
            channel.cipher = cipher;
        }
        let key = channel
            .local
            .derive_key(&channel.remote, channel.cipher, Direction::Outgoing)?;
        let counter = channel.local.next_counter();
        let aad = associated_data(id, kind, from, to);
        let ciphertext = channel.cipher.seal(&key, counter, &aad, data)?;
        Ok(Some(Sealed {
            channel,
            ciphertext,
        }))
    }

    /// Decrypt `data` received from `from`
    ///
    /// `reference` names the sender's endpoint; without it the sender's
    /// preferred endpoint is assumed. `cipher` overrides the local endpoint's
    /// default cipher. A payload sealed with either side's previous key
    /// generation still opens, and the generation of ours that opened it is
    /// remembered as held by the sender. `Ok(None)` means the payload could
    /// not be authenticated.
    #[allow(clippy::too_many_arguments)]
    pub fn decrypt(
        &self,
        reference: Option<&str>,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
        data: &[u8],
        cipher: Option<CipherKind>,
    ) -> Result<Option<Vec<u8>>, SecurityError> {
        self.ensure_active()?;
        let remote = match reference {
            Some(reference) => self.peers().by_reference(from, reference),
            None => self.peers().preferred(from),
        };
        let Some(remote) = remote else {
            tracing::debug!("no endpoint of {} matches {:?}", from, reference);
            return Ok(None);
        };
        let Some(local) = self.keys().matching(&remote) else {
            tracing::debug!("no local endpoint for {}", remote.id());
            return Ok(None);
        };
        let cipher = cipher.unwrap_or_else(|| local.default_cipher());
        let aad = associated_data(id, kind, from, to);

        // ours and theirs, current generation first, then previous
        let ours: Vec<_> = std::iter::once(local.clone()).chain(local.previous()).collect();
        let theirs: Vec<_> = std::iter::once(remote.clone()).chain(remote.previous()).collect();
        for (generation, candidate) in ours.iter().enumerate() {
            for sender in theirs.iter() {
                let key = match candidate.derive_key(sender, cipher, Direction::Incoming) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::debug!("key derivation with {} failed: {}", candidate.id(), e);
                        continue;
                    }
                };
                let Ok((_, plain)) = cipher.open(&key, &aad, data) else {
                    continue;
                };
                if generation > 0 {
                    tracing::debug!("decrypted {} from {} with previous key", id, from);
                }
                if *from != self.address() {
                    self.peers().add_learned(from, candidate.public_key());
                }
                return Ok(Some(plain));
            }
        }
        tracing::warn!("unable to decrypt {} from {}", id, from);
        Ok(None)
    }

    /// Encrypt everything read from `reader` into `writer`
    ///
    /// Returns the channel used, or `None` (writing nothing) without a channel.
    #[allow(clippy::too_many_arguments)]
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
        mut reader: R,
        mut writer: W,
        cipher: Option<CipherKind>,
    ) -> Result<Option<Channel>, SecurityError> {
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain)?;
        let Some(sealed) = self.encrypt_with(id, kind, from, to, &plain, cipher)? else {
            return Ok(None);
        };
        writer.write_all(&sealed.ciphertext)?;
        writer.flush()?;
        Ok(Some(sealed.channel))
    }

    /// Decrypt everything read from `reader` into `writer`
    ///
    /// Returns `false`, writing nothing, if the stream does not authenticate.
    #[allow(clippy::too_many_arguments)]
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        reference: Option<&str>,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
        mut reader: R,
        mut writer: W,
        cipher: Option<CipherKind>,
    ) -> Result<bool, SecurityError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let Some(plain) = self.decrypt(reference, id, kind, from, to, &data, cipher)? else {
            return Ok(false);
        };
        writer.write_all(&plain)?;
        writer.flush()?;
        Ok(true)
    }

    /// Open an envelope element received from `from`
    pub fn open_envelope(
        &self,
        envelope: &Envelope,
        id: &str,
        kind: &str,
        from: &Address,
        to: &Address,
    ) -> Result<Option<Vec<u8>>, SecurityError> {
        self.decrypt(
            envelope.reference.as_deref(),
            id,
            kind,
            from,
            to,
            &envelope.ciphertext,
            Some(envelope.cipher),
        )
    }
}
