//! Routing seam between links
//!
//! A peer that relays (the controller, a host) installs a [`Router`] on its
//! links. Links consult it for envelopes not addressed to them, for
//! `forwardTo` requests and for `broadcastTo` events. The routing table
//! itself belongs to the application; [`StaticRouter`] is a simple
//! in-memory one.

use dashmap::DashMap;
use std::sync::RwLock;
use tether_core::{Address, AddressType};

use crate::link::Link;

/// Resolves addresses to the link that leads towards them
pub trait Router: Send + Sync {
    /// Next hop for a destination, without request id
    fn route(&self, dst: &Address) -> Option<Link>;

    /// Links leading to every known instance
    fn downstream_instance_links(&self) -> Vec<Link>;
}

/// Router over an explicit address table
///
/// Instances are registered with the link that leads to them (their host
/// link, or the instance's own link when running on the host). Broadcasts
/// reach each distinct link once.
#[derive(Default)]
pub struct StaticRouter {
    routes: DashMap<Address, Link>,
    upstream: RwLock<Option<Link>>,
}

impl StaticRouter {
    /// Empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `address` over `link`
    pub fn add_route(&self, address: Address, link: Link) {
        self.routes.insert(address.without_request_id(), link);
    }

    /// Forget the route to `address`
    pub fn remove_route(&self, address: &Address) -> Option<Link> {
        self.routes
            .remove(&address.without_request_id())
            .map(|(_, link)| link)
    }

    /// Fallback link for addresses with no explicit route (a host's
    /// controller link)
    pub fn set_upstream(&self, link: Option<Link>) {
        if let Ok(mut slot) = self.upstream.write() {
            *slot = link;
        }
    }
}

impl Router for StaticRouter {
    fn route(&self, dst: &Address) -> Option<Link> {
        self.routes
            .get(&dst.without_request_id())
            .map(|entry| entry.value().clone())
            .or_else(|| self.upstream.read().ok().and_then(|link| link.clone()))
    }

    fn downstream_instance_links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = Vec::new();
        for entry in &self.routes {
            if entry.key().kind() != AddressType::Instance {
                continue;
            }
            if !links.iter().any(|known| known.ptr_eq(entry.value())) {
                links.push(entry.value().clone());
            }
        }
        links
    }
}

impl std::fmt::Debug for StaticRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticRouter")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::LinkPair;
    use crate::link::tests::MockConnector;
    use std::sync::Arc;

    fn link_to(dst: Address) -> Link {
        let connector = MockConnector::new(Address::controller(), dst);
        Link::new(
            LinkPair::new(AddressType::Controller, dst.kind()),
            connector,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_route_ignores_request_id() {
        let router = StaticRouter::new();
        let host = link_to(Address::host(2));
        router.add_route(Address::instance(7), host.clone());

        let found = router.route(&Address::instance(7).with_request_id(3)).unwrap();
        assert!(found.ptr_eq(&host));
        assert!(router.route(&Address::instance(8)).is_none());
    }

    #[tokio::test]
    async fn test_upstream_fallback() {
        let router = StaticRouter::new();
        let upstream = link_to(Address::controller());
        router.set_upstream(Some(upstream.clone()));
        assert!(router.route(&Address::control(4)).unwrap().ptr_eq(&upstream));
    }

    #[tokio::test]
    async fn test_downstream_links_are_distinct() {
        let router = Arc::new(StaticRouter::new());
        let host_a = link_to(Address::host(1));
        let host_b = link_to(Address::host(2));
        router.add_route(Address::instance(1), host_a.clone());
        router.add_route(Address::instance(2), host_a.clone());
        router.add_route(Address::instance(3), host_b.clone());
        router.add_route(Address::control(1), link_to(Address::control(1)));

        let links = router.downstream_instance_links();
        assert_eq!(links.len(), 2);
        assert!(links.iter().any(|l| l.ptr_eq(&host_a)));
        assert!(links.iter().any(|l| l.ptr_eq(&host_b)));
    }
}
