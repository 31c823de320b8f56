//! Test utilities for multi-node routing scenarios.
//!
//! Provides an in-memory link bus with explicit adjacency, so tests can
//! model lines, partitions and cross-group topologies without sockets.
//! Frames between unlinked peers are dropped silently, matching datagram
//! semantics.

use loomnet_core::RadarConfig;
use loomnet_mesh::{
    AddrFamily, HierAddr, MapStore, MeshError, MeshFrame, MeshResult, NoopKernelRoutes, PeerAddr,
    RadarReport, RoutingContext, Transport,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory link layer shared by every node of a scenario.
#[derive(Default)]
pub struct Bus {
    inboxes: Mutex<HashMap<PeerAddr, VecDeque<(PeerAddr, MeshFrame)>>>,
    links: Mutex<HashSet<(PeerAddr, PeerAddr)>>,
}

impl Bus {
    fn pair(a: &str, b: &str) -> (PeerAddr, PeerAddr) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn register(&self, peer: &str) {
        self.inboxes
            .lock()
            .unwrap()
            .entry(peer.to_string())
            .or_default();
    }

    /// Connect two peers bidirectionally.
    pub fn link(&self, a: &str, b: &str) {
        self.links.lock().unwrap().insert(Self::pair(a, b));
    }

    /// Cut the link between two peers.
    pub fn unlink(&self, a: &str, b: &str) {
        self.links.lock().unwrap().remove(&Self::pair(a, b));
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        self.links.lock().unwrap().contains(&Self::pair(a, b))
    }

    fn deliver(&self, from: &str, to: &str, frame: &MeshFrame) {
        if !self.linked(from, to) {
            return;
        }
        if let Some(inbox) = self.inboxes.lock().unwrap().get_mut(to) {
            inbox.push_back((from.to_string(), frame.clone()));
        }
    }

    fn broadcast_from(&self, from: &str, frame: &MeshFrame) {
        let peers: Vec<PeerAddr> = self.inboxes.lock().unwrap().keys().cloned().collect();
        for peer in peers {
            if peer != from {
                self.deliver(from, &peer, frame);
            }
        }
    }

    fn drain(&self, peer: &str) -> Vec<(PeerAddr, MeshFrame)> {
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(peer)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

/// One node's handle onto the bus.
pub struct BusTransport {
    peer: PeerAddr,
    bus: Arc<Bus>,
}

impl Transport for BusTransport {
    fn send(&self, to: &PeerAddr, frame: &MeshFrame) -> MeshResult<()> {
        self.bus.deliver(&self.peer, to, frame);
        Ok(())
    }

    fn broadcast(&self, frame: &MeshFrame) -> MeshResult<()> {
        self.bus.broadcast_from(&self.peer, frame);
        Ok(())
    }

    fn request(
        &self,
        to: &PeerAddr,
        _frame: &MeshFrame,
        _timeout: Duration,
    ) -> MeshResult<MeshFrame> {
        // Blocking exchanges are exercised by the hook unit tests; the bus
        // only models the settled, fire-and-forget traffic.
        Err(MeshError::Timeout(format!("no reply from {to}")))
    }
}

/// One simulated node.
pub struct TestNode {
    pub peer: PeerAddr,
    pub ctx: RoutingContext,
}

/// A scenario: several nodes plus the bus connecting them.
pub struct Mesh {
    pub bus: Arc<Bus>,
    pub nodes: Vec<TestNode>,
}

impl Mesh {
    /// Build nodes with the given peer names and addresses. No links yet.
    pub fn new(nodes: &[(&str, [u8; 5])]) -> Self {
        let bus = Arc::new(Bus::default());
        let nodes = nodes
            .iter()
            .map(|(peer, gids)| {
                bus.register(peer);
                let addr = HierAddr::new(AddrFamily::Ipv4, gids.to_vec()).unwrap();
                let mut store = MapStore::new(AddrFamily::Ipv4);
                store.init_self(&addr);
                let transport = Arc::new(BusTransport {
                    peer: peer.to_string(),
                    bus: bus.clone(),
                });
                let cfg = RadarConfig {
                    scans: 1,
                    wait_secs: 0,
                    rtt_delta_ms: 1,
                    interval_secs: 60,
                };
                let ctx = RoutingContext::new(
                    addr,
                    store,
                    cfg,
                    transport,
                    Arc::new(NoopKernelRoutes),
                );
                TestNode {
                    peer: peer.to_string(),
                    ctx,
                }
            })
            .collect();
        Self { bus, nodes }
    }

    pub fn node(&self, peer: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.peer == peer).unwrap()
    }

    pub fn node_mut(&mut self, peer: &str) -> &mut TestNode {
        self.nodes.iter_mut().find(|n| n.peer == peer).unwrap()
    }

    /// Deliver queued frames until the bus is quiescent. Frames a node
    /// rejects (stale floods, forged hops) are dropped, as the daemon does.
    /// Returns the number of frames processed, so tests can assert floods
    /// actually terminate.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            for idx in 0..self.nodes.len() {
                let peer = self.nodes[idx].peer.clone();
                for (from, frame) in self.bus.drain(&peer) {
                    progressed = true;
                    processed += 1;
                    match self.nodes[idx].ctx.handle_frame(&from, &frame) {
                        Ok(Some(reply)) => self.bus.deliver(&peer, &from, &reply),
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
            }
            if !progressed {
                return processed;
            }
        }
    }

    /// Run one full discovery cycle on every node: probe, exchange echoes,
    /// reconcile, then let the resulting floods propagate.
    pub fn radar_cycle(&mut self) -> Vec<RadarReport> {
        for node in &mut self.nodes {
            node.ctx.start_radar().unwrap();
        }
        self.pump();
        let reports = self
            .nodes
            .iter_mut()
            .map(|node| node.ctx.finish_radar().unwrap())
            .collect();
        self.pump();
        reports
    }
}
