/**
 * Peer addresses of the form
 *  `local@domain/resource`, compared
 *  case-insensitively.
 */
pub mod address;
/**
 * Tunables of the security manager,
 *  loadable from and savable to TOML.
 */
pub mod config;
/**
 * Cryptographic primitives.
 *  - Curve25519 identity keys
 *  - The AEAD ciphers that seal stanza payloads
 */
pub mod crypto;
/**
 * Key-exchange algorithms and the registry
 *  that discovers them. An endpoint is one
 *  key pair of one algorithm, either ours
 *  or a peer's public half.
 */
pub mod endpoint;
/**
 * The endpoint security manager: local key
 *  generations, the peer cache, payload
 *  encryption, policy-driven sending and
 *  the synchronization handshake.
 */
pub mod security;
/**
 * Minimal stanza model: elements, messages,
 *  requests and presence.
 */
pub mod stanza;
/**
 * In-process loopback network for
 *  exercising managers against each other.
 */
pub mod testkit;
/**
 * What the security layer needs from
 *  the messaging transport underneath it.
 */
pub mod transport;

pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::SecurityConfig;
    pub use crate::crypto::{CipherKind, PublicKey, SecretKey};
    pub use crate::endpoint::{AlgorithmId, Endpoint, EndpointRegistry};
    pub use crate::security::{
        E2ePolicy, EndpointSecurity, EndpointSecurityBuilder, IqResponse, PeerEvent,
        SecurityError, SendOutcome,
    };
    pub use crate::stanza::{Element, Iq, IqType, Message, MessageType, Presence};
    pub use crate::transport::{RetryPolicy, Transport};
}
