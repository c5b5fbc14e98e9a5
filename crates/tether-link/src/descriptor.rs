//! Shared vocabulary of the request and event descriptors

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tether_core::{AddressType, LinkError, Result};

/// Direction a link runs in: our side first, the peer second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkPair {
    /// Type of the local peer
    pub source: AddressType,
    /// Type of the remote peer
    pub target: AddressType,
}

impl LinkPair {
    /// Create a pair
    #[must_use]
    pub const fn new(source: AddressType, target: AddressType) -> Self {
        Self { source, target }
    }

    /// The same link seen from the other end
    #[must_use]
    pub const fn reversed(self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }
}

fn parse_peer_type(name: &str) -> Option<AddressType> {
    match name {
        "controller" => Some(AddressType::Controller),
        "instance" => Some(AddressType::Instance),
        "host" => Some(AddressType::Host),
        "control" => Some(AddressType::Control),
        _ => None,
    }
}

impl FromStr for LinkPair {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LinkError::InvalidConfig(Cow::Owned(format!("invalid link pair {s:?}")));
        let (source, target) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            source: parse_peer_type(source).ok_or_else(invalid)?,
            target: parse_peer_type(target).ok_or_else(invalid)?,
        })
    }
}

impl fmt::Display for LinkPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

/// Permission a request requires from control clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    /// No check
    Unrestricted,
    /// Checked against the sender's permission set
    Named(String),
}

impl Permission {
    /// Named permission
    pub fn named(name: impl Into<String>) -> Self {
        Permission::Named(name.into())
    }
}

/// Where a request is forwarded when the controller receives it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardTarget {
    /// The instance named by the payload's `instanceId`, via its host
    Instance,
    /// The controller, when received by a host
    Controller,
}

/// Where an event is rebroadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Every instance except the one it came from
    Instance,
}

/// Decides whether the peer of a link holds a permission
pub trait PermissionCheck: Send + Sync {
    /// Check a permission
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Permission` if it is not held.
    fn check_permission(&self, permission: &str) -> Result<()>;
}

/// A fixed set of granted permissions
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    granted: HashSet<String>,
    all: bool,
}

impl PermissionSet {
    /// Grants nothing
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Grants everything
    #[must_use]
    pub fn all() -> Self {
        Self {
            granted: HashSet::new(),
            all: true,
        }
    }

    /// Grant a permission
    #[must_use]
    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.granted.insert(permission.into());
        self
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            granted: iter.into_iter().map(Into::into).collect(),
            all: false,
        }
    }
}

impl PermissionCheck for PermissionSet {
    fn check_permission(&self, permission: &str) -> Result<()> {
        if self.all || self.granted.contains(permission) {
            Ok(())
        } else {
            Err(LinkError::Permission(permission.to_string()))
        }
    }
}
