use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Scheme of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    /// Encrypted, requires a reactor with TLS configured.
    Https,
}

pub(crate) struct EndpointShared {
    address: SocketAddr,
    scheme: Scheme,
    closed: AtomicBool,
    notify: Notify,
}

/// A bound listening address.
///
/// Equality and hashing go by the bound address.
#[derive(Clone)]
pub struct ListenerEndpoint {
    shared: Arc<EndpointShared>,
    // the registry holds the endpoint, not the other way around.
    registry: Weak<Endpoints>,
}

impl ListenerEndpoint {
    pub(crate) fn new(address: SocketAddr, scheme: Scheme, registry: &EndpointRegistry) -> Self {
        ListenerEndpoint {
            shared: Arc::new(EndpointShared {
                address,
                scheme,
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            registry: Arc::downgrade(&registry.0),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    pub fn scheme(&self) -> Scheme {
        self.shared.scheme
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting and unbind. Removes the endpoint from the reactor's registry.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Close endpoint: {}", self.address());
        if let Some(endpoints) = self.registry.upgrade() {
            endpoints.lock().unwrap().remove(&self.address());
        }
        self.shared.notify.notify_one();
    }

    /// Resolves when the endpoint is closed.
    pub(crate) async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        // notify_one stores a permit, so a close racing this call is not missed.
        self.shared.notify.notified().await;
    }
}

impl PartialEq for ListenerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ListenerEndpoint {}

impl Hash for ListenerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state)
    }
}

type Endpoints = Mutex<HashMap<SocketAddr, ListenerEndpoint>>;

/// Live endpoints of a reactor, keyed by address.
#[derive(Clone, Default)]
pub(crate) struct EndpointRegistry(Arc<Endpoints>);

impl EndpointRegistry {
    pub fn insert(&self, endpoint: ListenerEndpoint) {
        let mut lock = self.0.lock().unwrap();
        lock.insert(endpoint.address(), endpoint);
    }

    pub fn endpoints(&self) -> Vec<ListenerEndpoint> {
        let lock = self.0.lock().unwrap();
        lock.values().cloned().collect()
    }

    pub fn close_all(&self) {
        // close() takes the lock again to remove itself.
        for e in self.endpoints() {
            e.close();
        }
    }
}

impl fmt::Debug for ListenerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ListenerEndpoint({:?} {}, closed: {})",
            self.scheme(),
            self.address(),
            self.is_closed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn close_removes_from_registry() {
        let registry = EndpointRegistry::default();
        let ep1 = ListenerEndpoint::new(addr(1), Scheme::Http, &registry);
        let ep2 = ListenerEndpoint::new(addr(2), Scheme::Https, &registry);
        registry.insert(ep1.clone());
        registry.insert(ep2.clone());

        ep1.close();
        ep1.close();

        assert!(ep1.is_closed());
        assert_eq!(registry.endpoints(), vec![ep2]);
    }

    #[test]
    fn registered_endpoint_freed_with_registry() {
        let registry = EndpointRegistry::default();
        let ep = ListenerEndpoint::new(addr(1), Scheme::Http, &registry);
        registry.insert(ep.clone());

        let weak = Arc::downgrade(&ep.shared);
        drop(ep);
        assert!(weak.upgrade().is_some());

        // never closed, still nothing leaks once the reactor's registry goes.
        drop(registry);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn close_after_registry_is_gone() {
        let registry = EndpointRegistry::default();
        let ep = ListenerEndpoint::new(addr(1), Scheme::Http, &registry);
        drop(registry);

        ep.close();
        assert!(ep.is_closed());
    }
}
