//! Registry of message descriptors
//!
//! Built once at startup and handed to whatever creates links, so separate
//! protocol instances (tests, embedded peers) never share state.

use std::collections::HashMap;
use std::sync::Arc;
use tether_core::envelope::{event_key, request_key};
use tether_core::{LinkError, Result};

use crate::descriptor::LinkPair;
use crate::link::Link;

/// Request or event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Answered with `response` / `responseError`
    Request,
    /// One way
    Event,
}

/// Common surface of [`crate::Request`] and [`crate::Event`]
pub trait Descriptor: Send + Sync {
    /// Message name
    fn name(&self) -> &str;

    /// Request or event
    fn kind(&self) -> DescriptorKind;

    /// Link pairs the message may travel over
    fn links(&self) -> &[LinkPair];

    /// Install default handling on `link`, if there is any for its side
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidState` if a handler is already installed.
    fn attach_defaults(&self, link: &Link) -> Result<()>;

    /// Dispatch key on the link
    fn key(&self) -> String {
        match self.kind() {
            DescriptorKind::Request => request_key(self.name()),
            DescriptorKind::Event => event_key(self.name()),
        }
    }
}

/// Constructed-once set of descriptors
#[derive(Default, Clone)]
pub struct MessageRegistry {
    descriptors: Vec<Arc<dyn Descriptor>>,
    by_key: HashMap<String, usize>,
}

impl MessageRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if a request or event of the same
    /// name is already registered.
    pub fn register<D: Descriptor + 'static>(&mut self, descriptor: D) -> Result<()> {
        let key = descriptor.key();
        if self.by_key.contains_key(&key) {
            return Err(LinkError::InvalidConfig(
                format!("{key} is already registered").into(),
            ));
        }
        self.by_key.insert(key, self.descriptors.len());
        self.descriptors.push(Arc::new(descriptor));
        Ok(())
    }

    /// Look up a descriptor by dispatch key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Arc<dyn Descriptor>> {
        self.by_key.get(key).map(|&index| &self.descriptors[index])
    }

    /// Number of descriptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Descriptor>> {
        self.descriptors.iter()
    }

    /// Install the default handling of every descriptor on `link`
    ///
    /// # Errors
    ///
    /// Stops at the first descriptor that fails to attach.
    pub fn attach_all(&self, link: &Link) -> Result<()> {
        for descriptor in &self.descriptors {
            descriptor.attach_defaults(link)?;
        }
        tracing::debug!(
            descriptors = self.descriptors.len(),
            "Attached message registry to {} link",
            link.pair()
        );
        Ok(())
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.descriptors.iter().map(|d| d.key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::link::tests::MockConnector;
    use crate::messages::{Empty, ping};
    use tether_core::{Address, AddressType};

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = MessageRegistry::new();
        registry.register(ping().unwrap()).unwrap();
        assert!(registry.register(ping().unwrap()).is_err());

        // Events live in their own namespace
        let event: Event<Empty> = Event::builder("ping").links(["host-controller"]).build().unwrap();
        registry.register(event).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("request:ping").is_some());
        assert_eq!(
            registry.get("event:ping").map(|d| d.kind()),
            Some(DescriptorKind::Event)
        );
    }

    #[tokio::test]
    async fn test_attach_all_installs_defaults() {
        let mut registry = MessageRegistry::new();
        registry.register(ping().unwrap()).unwrap();

        let connector = MockConnector::new(Address::controller(), Address::host(1));
        let link = Link::new(
            LinkPair::new(AddressType::Controller, AddressType::Host),
            connector,
        )
        .unwrap();
        registry.attach_all(&link).unwrap();
        assert!(link.has_handler("request:ping"));
    }
}
