//! Routing context.
//!
//! Owns the map store, the ranking policy, the radar gate and the neighbor
//! identity tables, and drives the protocol: every inbound frame goes
//! through [`RoutingContext::handle_frame`], every discovery cycle through
//! [`RoutingContext::start_radar`] / [`RoutingContext::finish_radar`]. The
//! context is synchronous; the service binary supplies the timing.

use crate::addr::{HierAddr, MAX_GROUP_SIZE};
use crate::error::{MeshError, MeshResult};
use crate::map::{EntityFlags, EntityKey, MapStore};
use crate::ports::{KernelRoutes, PeerAddr, Transport};
use crate::radar::{RadarCycle, RadarReport, RadarScanner};
use crate::ranking::RouteRanker;
use crate::tracer::{self, FloodExclude, TracerPacket};
use crate::wire::{FreeSlots, MeshFrame, MeshPayload};
use loomnet_core::RadarConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a settled node needs to route.
pub struct RoutingContext {
    local: HierAddr,
    store: MapStore,
    ranker: RouteRanker,
    scanner: RadarScanner,
    radar_cfg: RadarConfig,
    transport: Arc<dyn Transport>,
    kernel: Arc<dyn KernelRoutes>,
    /// Link address -> hierarchical address of confirmed neighbors
    neighbor_addrs: HashMap<PeerAddr, HierAddr>,
    /// Map entity -> link address, for relaying floods
    key_to_addr: HashMap<EntityKey, PeerAddr>,
    active_cycle: Option<RadarCycle>,
    probe_sent_at: HashMap<u32, Instant>,
}

impl RoutingContext {
    /// Build a context around an already settled address and store.
    pub fn new(
        local: HierAddr,
        store: MapStore,
        radar_cfg: RadarConfig,
        transport: Arc<dyn Transport>,
        kernel: Arc<dyn KernelRoutes>,
    ) -> Self {
        let ranker = RouteRanker::new(radar_cfg.rtt_delta_ms);
        Self {
            local,
            store,
            ranker,
            scanner: RadarScanner::new(),
            radar_cfg,
            transport,
            kernel,
            neighbor_addrs: HashMap::new(),
            key_to_addr: HashMap::new(),
            active_cycle: None,
            probe_sent_at: HashMap::new(),
        }
    }

    /// The node's own address.
    pub fn local(&self) -> &HierAddr {
        &self.local
    }

    /// Read access to the map store.
    pub fn store(&self) -> &MapStore {
        &self.store
    }

    /// Process one inbound frame, returning the direct reply to send back,
    /// if any. Tracer relays go out through the transport as a side effect.
    pub fn handle_frame(
        &mut self,
        from: &PeerAddr,
        frame: &MeshFrame,
    ) -> MeshResult<Option<MeshFrame>> {
        match &frame.payload {
            MeshPayload::RadarProbe { echo_id, hooking } => {
                if let Some(cycle) = self.active_cycle.as_mut() {
                    if !self.neighbor_addrs.contains_key(from) {
                        cycle.record_foreign_probe(from.clone());
                    }
                }
                debug!(from = %from, echo_id, hooking, "probed");
                Ok(Some(MeshFrame::from_node(
                    self.local.clone(),
                    MeshPayload::RadarEcho {
                        echo_id: *echo_id,
                        hier: self.local.clone(),
                        hooking: false,
                    },
                )))
            }
            MeshPayload::RadarEcho {
                echo_id,
                hier,
                hooking,
            } => {
                let sent = self.probe_sent_at.get(echo_id).copied();
                match (self.active_cycle.as_mut(), sent) {
                    (Some(cycle), Some(sent)) if cycle.echo_id() == *echo_id => {
                        // The echo measures a full round trip; the link
                        // latency is half of it.
                        let rtt_ms = (sent.elapsed().as_millis() / 2) as u32;
                        cycle.record_echo(from.clone(), hier.clone(), rtt_ms, *hooking);
                    }
                    _ => debug!(from = %from, echo_id, "echo outside any live cycle"),
                }
                Ok(None)
            }
            MeshPayload::Tracer(pkt) => {
                self.handle_tracer(frame.sender.as_ref(), pkt)?;
                Ok(None)
            }
            MeshPayload::FreeSlotsRequest => Ok(Some(MeshFrame::from_node(
                self.local.clone(),
                MeshPayload::FreeSlotsReply(self.free_slots_reply()),
            ))),
            MeshPayload::MapRequest => Ok(Some(MeshFrame::from_node(
                self.local.clone(),
                MeshPayload::MapReply(self.store.snapshot()),
            ))),
            MeshPayload::FreeSlotsReply(_) | MeshPayload::MapReply(_) => {
                debug!(from = %from, "unsolicited reply dropped");
                Ok(None)
            }
        }
    }

    /// Free-slot report for a joiner: the lowest enclosing group with room,
    /// escalating level by level when the inner groups are full. An empty
    /// report at the top level means the whole hierarchy is full.
    fn free_slots_reply(&self) -> FreeSlots {
        for level in 1..self.store.levels() {
            let slots = self.store.free_slots(level - 1);
            if !slots.is_empty() {
                return FreeSlots {
                    level,
                    gid: self.local.gid(level),
                    slots,
                    occupancy: self.store.occupancy(level - 1),
                };
            }
        }
        let top = self.store.levels() - 1;
        FreeSlots {
            level: top,
            gid: self.local.gid(top),
            slots: Vec::new(),
            occupancy: self.store.occupancy(top),
        }
    }

    fn handle_tracer(&mut self, sender: Option<&HierAddr>, pkt: &TracerPacket) -> MeshResult<()> {
        let sender = sender.ok_or_else(|| {
            MeshError::MalformedPacket("tracer without sender identity".into())
        })?;
        let from_id = sender.gid(pkt.level);

        tracer::verify(&self.store, &self.local, pkt, from_id)?;
        tracer::merge(&mut self.store, &self.ranker, &self.local, pkt, from_id);
        let relayed = tracer::extend(&self.store, &self.local, pkt, from_id)?;
        self.flood(&relayed, FloodExclude::SenderAndHooking { id: from_id });
        self.flush_kernel_routes()?;
        Ok(())
    }

    /// Send a tracer packet to every eligible neighbor at its level.
    fn flood(&self, pkt: &TracerPacket, exclude: FloodExclude) {
        let frame = MeshFrame::from_node(self.local.clone(), MeshPayload::Tracer(pkt.clone()));
        for id in tracer::relay_targets(&self.store, &self.local, pkt.level, exclude) {
            let key = EntityKey::new(pkt.level, id);
            match self.key_to_addr.get(&key) {
                Some(addr) => {
                    if let Err(err) = self.transport.send(addr, &frame) {
                        warn!(level = pkt.level, id, %err, "tracer relay failed");
                    }
                }
                None => debug!(level = pkt.level, id, "no link address for relay target"),
            }
        }
    }

    /// Originate a flood at `level` and send it out.
    pub fn originate_flood(&mut self, level: u8) -> TracerPacket {
        let pkt = tracer::originate(&mut self.store, &self.local, level);
        self.flood(&pkt, FloodExclude::Nobody);
        pkt
    }

    /// Announce this node: one fresh flood at every hierarchy level. Run
    /// once after joining, so the rest of the network learns the new
    /// address.
    pub fn announce(&mut self) {
        for level in 0..self.store.levels() {
            self.originate_flood(level);
        }
        info!(addr = %self.local, "announced at every level");
    }

    /// Begin a discovery cycle: broadcast the probe burst and directly probe
    /// any addresses deferred by the previous cycle.
    pub fn start_radar(&mut self) -> MeshResult<()> {
        let mut cycle = self.scanner.begin()?;
        let frame = MeshFrame::from_node(
            self.local.clone(),
            MeshPayload::RadarProbe {
                echo_id: cycle.echo_id(),
                hooking: false,
            },
        );

        self.probe_sent_at.insert(cycle.echo_id(), Instant::now());
        for _ in 0..self.radar_cfg.scans {
            match self.transport.broadcast(&frame) {
                Ok(()) => cycle.record_probe_sent(),
                Err(err) => warn!(%err, "probe broadcast failed"),
            }
        }
        for addr in self.scanner.take_deferred() {
            match self.transport.send(&addr, &frame) {
                Ok(()) => cycle.record_probe_sent(),
                Err(err) => warn!(addr = %addr, %err, "deferred probe failed"),
            }
        }

        self.active_cycle = Some(cycle);
        Ok(())
    }

    /// Close the cycle opened by [`start_radar`](Self::start_radar):
    /// reconcile the echoes into the store, refresh the identity tables,
    /// flood a tracer when the topology moved, and sync the kernel routes.
    pub fn finish_radar(&mut self) -> MeshResult<RadarReport> {
        let cycle = self.active_cycle.take().ok_or(MeshError::NoActiveScan)?;
        self.probe_sent_at.remove(&cycle.echo_id());

        let report =
            match cycle.reconcile(&mut self.store, &self.ranker, &self.local, &self.neighbor_addrs)
            {
                Ok(report) => report,
                Err(err) => {
                    self.scanner.finish(Vec::new());
                    return Err(err);
                }
            };

        for (addr, hier) in std::mem::take(&mut self.neighbor_addrs) {
            let alive = report.neighbors.iter().any(|n| n.addr == addr);
            if alive {
                self.neighbor_addrs.insert(addr, hier);
            } else if let Some(level) = self.local.divergence_level(&hier) {
                self.key_to_addr
                    .remove(&EntityKey::new(level, hier.gid(level)));
            }
        }
        for neighbor in &report.neighbors {
            self.neighbor_addrs
                .insert(neighbor.addr.clone(), neighbor.hier.clone());
            self.key_to_addr.insert(neighbor.key, neighbor.addr.clone());
        }

        self.scanner.finish(report.deferred.clone());

        if report.send_tracer_now {
            let mut levels: Vec<u8> = report
                .added
                .iter()
                .chain(report.removed.iter())
                .chain(report.changed.iter())
                .map(|k| k.level)
                .collect();
            levels.push(0);
            levels.sort_unstable();
            levels.dedup();
            for level in levels {
                self.originate_flood(level);
            }
        }

        self.flush_kernel_routes()?;
        Ok(report)
    }

    /// Push every pending route change down to the kernel and clear the
    /// sync markers.
    pub fn flush_kernel_routes(&mut self) -> MeshResult<()> {
        let mut pending = Vec::new();
        for level in 0..self.store.levels() {
            for id in 0..MAX_GROUP_SIZE as u16 {
                let key = EntityKey::new(level, id as u8);
                let record = self.store.entity(key);
                if record.flags.contains(EntityFlags::NEEDS_KERNEL_SYNC)
                    && !record.flags.contains(EntityFlags::SELF)
                {
                    pending.push(key);
                }
            }
        }
        for key in pending {
            {
                let record = self.store.entity(key);
                if record.is_void() || record.gateways.is_empty() {
                    self.kernel.remove_route(key)?;
                } else {
                    self.kernel.install_route(key, &record.gateways)?;
                }
            }
            self.store
                .entity_mut(key)
                .flags
                .remove(EntityFlags::NEEDS_KERNEL_SYNC);
        }
        Ok(())
    }

    /// Link addresses of all confirmed neighbors.
    pub fn neighbor_addrs(&self) -> &HashMap<PeerAddr, HierAddr> {
        &self.neighbor_addrs
    }
}
