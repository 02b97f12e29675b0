//! Peer addresses
//!
//! An address has the shape `local@domain/resource`, where both the local part
//! and the resource are optional. A *bare* address has no resource and names an
//! account; a *full* address names one connected client of that account.
//!
//! Comparison, hashing and cache keys are case-insensitive.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("missing domain in address: {0}")]
    MissingDomain(String),
    #[error("empty resource in address: {0}")]
    EmptyResource(String),
}

/// A peer address, e.g. `alice@example.org/phone`
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Address {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            local: local.map(str::to_string),
            domain: domain.to_string(),
            resource: resource.map(str::to_string),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The account part of this address, without the resource
    pub fn bare(&self) -> Address {
        Address {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Address {
        Address {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }

    /// Lower-cased string form, used as a cache key
    pub fn key(&self) -> String {
        self.to_string().to_lowercase()
    }

    /// Whether both addresses name the same account
    pub fn same_account(&self, other: &Address) -> bool {
        self.bare() == other.bare()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        // the resource may itself contain '@' or '/', so split it off first
        let (account, resource) = match s.split_once('/') {
            Some((_, "")) => return Err(AddressError::EmptyResource(s.to_string())),
            Some((account, resource)) => (account, Some(resource)),
            None => (s, None),
        };

        let (local, domain) = match account.split_once('@') {
            Some((local, domain)) if !local.is_empty() => (Some(local), domain),
            Some((_, domain)) => (None, domain),
            None => (None, account),
        };

        if domain.is_empty() {
            return Err(AddressError::MissingDomain(s.to_string()));
        }

        Ok(Address::new(local, domain, resource))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        let address: Address = "alice@example.org/phone".parse().unwrap();
        assert_eq!(address.local(), Some("alice"));
        assert_eq!(address.domain(), "example.org");
        assert_eq!(address.resource(), Some("phone"));
        assert!(!address.is_bare());
        assert_eq!(address.bare().to_string(), "alice@example.org");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let address: Address = "alice@example.org/desk/top@home".parse().unwrap();
        assert_eq!(address.resource(), Some("desk/top@home"));
    }

    #[test]
    fn test_case_insensitive_equality() {
        let a: Address = "Alice@Example.org/Phone".parse().unwrap();
        let b: Address = "alice@example.org/phone".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        // display keeps the original casing
        assert_eq!(a.to_string(), "Alice@Example.org/Phone");
    }

    #[test]
    fn test_invalid_addresses() {
        assert_eq!("".parse::<Address>(), Err(AddressError::Empty));
        assert!(matches!(
            "alice@".parse::<Address>(),
            Err(AddressError::MissingDomain(_))
        ));
        assert!(matches!(
            "alice@example.org/".parse::<Address>(),
            Err(AddressError::EmptyResource(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let address: Address = "bob@example.org/laptop".parse().unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"bob@example.org/laptop\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(address, back);
    }
}
