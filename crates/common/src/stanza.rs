//! Stanza model
//!
//! A minimal, transport-agnostic representation of the elements and stanzas
//! exchanged between peers. Rendering these to and from XML text is the
//! transport's business; this crate only builds and inspects trees.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// A namespaced element with attributes, children and optional text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<Element>,
    #[serde(default)]
    pub text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// First child matching `name`, in any of the given namespaces
    pub fn child_in(&self, name: &str, namespaces: &[&str]) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && namespaces.contains(&c.namespace.as_str()))
    }

    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.child_in(name, &[namespace])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Normal,
    Chat,
    GroupChat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::GroupChat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceType {
    Available,
    Unavailable,
}

/// Stanza-level error conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCondition {
    BadRequest,
    Forbidden,
    NotAuthorized,
    NotAcceptable,
    ItemNotFound,
    ServiceUnavailable,
    RemoteServerTimeout,
    InternalServerError,
}

impl ErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCondition::BadRequest => "bad-request",
            ErrorCondition::Forbidden => "forbidden",
            ErrorCondition::NotAuthorized => "not-authorized",
            ErrorCondition::NotAcceptable => "not-acceptable",
            ErrorCondition::ItemNotFound => "item-not-found",
            ErrorCondition::ServiceUnavailable => "service-unavailable",
            ErrorCondition::RemoteServerTimeout => "remote-server-timeout",
            ErrorCondition::InternalServerError => "internal-server-error",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorCondition> {
        const ALL: [ErrorCondition; 8] = [
            ErrorCondition::BadRequest,
            ErrorCondition::Forbidden,
            ErrorCondition::NotAuthorized,
            ErrorCondition::NotAcceptable,
            ErrorCondition::ItemNotFound,
            ErrorCondition::ServiceUnavailable,
            ErrorCondition::RemoteServerTimeout,
            ErrorCondition::InternalServerError,
        ];
        ALL.into_iter().find(|c| c.as_str() == s)
    }
}

/// Namespace of error condition elements
pub const NAMESPACE_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Namespace of the `<error/>` wrapper
pub const NAMESPACE_CLIENT: &str = "jabber:client";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    pub condition: ErrorCondition,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    pub fn with_text(condition: ErrorCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }
}

impl StanzaError {
    /// `<error><{condition} xmlns="…stanzas"/><text>…</text></error>`
    pub fn to_element(&self) -> Element {
        let mut element = Element::new("error", NAMESPACE_CLIENT)
            .with_child(Element::new(self.condition.as_str(), NAMESPACE_STANZAS));
        if let Some(text) = &self.text {
            element = element
                .with_child(Element::new("text", NAMESPACE_STANZAS).with_text(text.clone()));
        }
        element
    }

    pub fn from_element(element: &Element) -> Option<StanzaError> {
        if element.name != "error" {
            return None;
        }
        let condition = element
            .children
            .iter()
            .filter(|c| c.namespace == NAMESPACE_STANZAS)
            .find_map(|c| ErrorCondition::parse(&c.name))?;
        let text = element
            .child("text", NAMESPACE_STANZAS)
            .and_then(|t| t.text.clone());
        Some(StanzaError { condition, text })
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition.as_str(), text),
            None => write!(f, "{}", self.condition.as_str()),
        }
    }
}

impl std::error::Error for StanzaError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: Address,
    pub to: Address,
    pub kind: MessageType,
    pub payload: Vec<Element>,
}

impl Message {
    /// Bounce `message` back to its sender as an error-type message
    pub fn error_for(message: &Message, error: StanzaError) -> Message {
        Message {
            id: message.id.clone(),
            from: message.to.clone(),
            to: message.from.clone(),
            kind: MessageType::Error,
            payload: vec![error.to_element()],
        }
    }

    /// The stanza error carried by an error-type message
    pub fn error(&self) -> Option<StanzaError> {
        if self.kind != MessageType::Error {
            return None;
        }
        self.payload.iter().find_map(StanzaError::from_element)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iq {
    pub id: String,
    pub from: Address,
    pub to: Address,
    pub kind: IqType,
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    /// Build a result answering `request`
    pub fn result_for(request: &Iq, payload: Option<Element>) -> Iq {
        Iq {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            kind: IqType::Result,
            payload,
            error: None,
        }
    }

    /// Build an error answering `request`
    pub fn error_for(request: &Iq, error: StanzaError) -> Iq {
        Iq {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            kind: IqType::Error,
            payload: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub from: Address,
    pub to: Option<Address>,
    pub kind: PresenceType,
    pub payload: Vec<Element>,
}
