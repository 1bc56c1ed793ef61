use std::collections::HashMap;

use anyhow::{bail, ensure};

use crate::base::component::{ComponentId, PortId};
use crate::timeq::Cycle;

/// One side of a link: a port on a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub component: ComponentId,
    pub port: PortId,
}

impl PortRef {
    pub fn new(component: ComponentId, port: PortId) -> Self {
        Self { component, port }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub endpoint: PortRef,
    pub latency: Cycle,
}

/// Point-to-point links bound at build time.  Every link joins exactly two distinct endpoints
/// and has a single symmetric latency.
#[derive(Debug, Default)]
pub struct LinkTable {
    peers: HashMap<PortRef, Peer>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, a: PortRef, b: PortRef, latency: Cycle) -> anyhow::Result<()> {
        ensure!(a != b, "link endpoint {:?} cannot be connected to itself", a);
        for end in [a, b] {
            if let Some(existing) = self.peers.get(&end) {
                bail!(
                    "port {} of component {} is already bound to component {}",
                    end.port,
                    end.component,
                    existing.endpoint.component
                );
            }
        }
        self.peers.insert(a, Peer { endpoint: b, latency });
        self.peers.insert(b, Peer { endpoint: a, latency });
        Ok(())
    }

    pub fn peer(&self, from: PortRef) -> Option<Peer> {
        self.peers.get(&from).copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_symmetric() {
        let mut links = LinkTable::new();
        links
            .connect(PortRef::new(0, 1), PortRef::new(3, 0), 500)
            .unwrap();
        let peer = links.peer(PortRef::new(3, 0)).unwrap();
        assert_eq!(PortRef::new(0, 1), peer.endpoint);
        assert_eq!(500, peer.latency);
        assert_eq!(1, links.len());
    }

    #[test]
    fn double_binding_is_rejected() {
        let mut links = LinkTable::new();
        links.connect(PortRef::new(0, 0), PortRef::new(1, 0), 1).unwrap();
        assert!(links.connect(PortRef::new(2, 0), PortRef::new(1, 0), 1).is_err());
        assert!(links.connect(PortRef::new(2, 0), PortRef::new(2, 0), 1).is_err());
        assert!(links.peer(PortRef::new(2, 0)).is_none());
    }
}
