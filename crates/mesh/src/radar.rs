//! Radar neighbor discovery.
//!
//! Periodically broadcasts a burst of probe datagrams on the local link,
//! collects unicast echoes, and reconciles the results against the map
//! store: new responders become neighbors, silent ones are torn down, and
//! latency shifts beyond the jitter threshold re-rank the affected routes.
//!
//! Only one scan cycle may run at a time. A cycle that would start while
//! another is in flight is rejected, not queued; the periodic driver simply
//! tries again on its next tick.

use crate::addr::HierAddr;
use crate::error::{MeshError, MeshResult};
use crate::map::{EntityFlags, EntityKey, Gateway, MapStore};
use crate::ports::PeerAddr;
use crate::ranking::{arrival_mask, Decision, RouteRanker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Echo samples collected from one responder during a cycle.
#[derive(Debug, Clone)]
struct EchoRecord {
    hier: HierAddr,
    hooking: bool,
    rtts: Vec<u32>,
}

/// One live neighbor after reconciliation.
#[derive(Debug, Clone)]
pub struct RadarNeighbor {
    /// Link-layer address echoes arrived from
    pub addr: PeerAddr,
    /// The neighbor's full hierarchical address
    pub hier: HierAddr,
    /// Map entity the neighbor resolves to
    pub key: EntityKey,
    /// Averaged round-trip latency for this cycle, in milliseconds
    pub rtt_ms: u32,
    /// The neighbor is still joining and must not carry routes
    pub hooking: bool,
}

/// Outcome of one completed scan cycle.
#[derive(Debug, Default)]
pub struct RadarReport {
    /// Every neighbor that echoed this cycle
    pub neighbors: Vec<RadarNeighbor>,
    /// Entities that appeared
    pub added: Vec<EntityKey>,
    /// Entities torn down for not echoing
    pub removed: Vec<EntityKey>,
    /// Entities whose link latency moved beyond the jitter threshold
    pub changed: Vec<EntityKey>,
    /// Link addresses that probed us without answering our own probes;
    /// they are probed directly on the next cycle
    pub deferred: Vec<PeerAddr>,
    /// Whether the topology changed enough to flood a tracer immediately
    pub send_tracer_now: bool,
}

/// Mutable state of one in-flight scan cycle.
#[derive(Debug)]
pub struct RadarCycle {
    echo_id: u32,
    probes_sent: u32,
    samples: HashMap<PeerAddr, EchoRecord>,
    foreign_probes: Vec<PeerAddr>,
}

impl RadarCycle {
    fn new(echo_id: u32) -> Self {
        Self {
            echo_id,
            probes_sent: 0,
            samples: HashMap::new(),
            foreign_probes: Vec::new(),
        }
    }

    /// Echo id stamped on this cycle's probes.
    pub fn echo_id(&self) -> u32 {
        self.echo_id
    }

    /// Record that one probe actually left the transport.
    pub fn record_probe_sent(&mut self) {
        self.probes_sent += 1;
    }

    /// Record an echo. Echoes carrying a stale echo id are the caller's
    /// concern; this cycle only sees its own.
    pub fn record_echo(&mut self, addr: PeerAddr, hier: HierAddr, rtt_ms: u32, hooking: bool) {
        let record = self.samples.entry(addr).or_insert_with(|| EchoRecord {
            hier: hier.clone(),
            hooking,
            rtts: Vec::new(),
        });
        record.hier = hier;
        record.hooking = hooking;
        record.rtts.push(rtt_ms);
    }

    /// Record a probe received from a link address we have no echo from.
    /// Asymmetric one-way reachability is not acted on mid-cycle; the
    /// address is queued and probed directly next time.
    pub fn record_foreign_probe(&mut self, addr: PeerAddr) {
        if !self.foreign_probes.contains(&addr) {
            self.foreign_probes.push(addr);
        }
    }

    /// Average latency of a responder, penalizing every missed echo with the
    /// worst sample observed this cycle.
    fn average_rtt(&self, rtts: &[u32]) -> u32 {
        let worst = rtts.iter().copied().max().unwrap_or(0);
        let sum: u64 = rtts.iter().map(|&r| r as u64).sum();
        let missed = self.probes_sent.saturating_sub(rtts.len() as u32) as u64;
        ((sum + missed * worst as u64) / self.probes_sent as u64) as u32
    }

    /// The responders observed so far, without touching any store. Used
    /// while hooking, when the node owns no maps yet; entity keys are
    /// resolved against the responder's own level-0 id.
    pub fn observations(&self) -> MeshResult<Vec<RadarNeighbor>> {
        if self.probes_sent == 0 {
            return Err(MeshError::NoProbesSent);
        }
        Ok(self
            .samples
            .iter()
            .map(|(addr, record)| RadarNeighbor {
                addr: addr.clone(),
                hier: record.hier.clone(),
                key: EntityKey::new(0, record.hier.gid(0)),
                rtt_ms: self.average_rtt(&record.rtts),
                hooking: record.hooking,
            })
            .collect())
    }

    /// Fold the cycle into the map store.
    ///
    /// `known` maps the link addresses of previously confirmed neighbors to
    /// their hierarchical addresses; entries absent from this cycle's
    /// samples are torn down. Fails with `NoProbesSent` when the transport
    /// never got a probe out, in which case the store is left untouched.
    pub fn reconcile(
        self,
        store: &mut MapStore,
        ranker: &RouteRanker,
        local: &HierAddr,
        known: &HashMap<PeerAddr, HierAddr>,
    ) -> MeshResult<RadarReport> {
        if self.probes_sent == 0 {
            return Err(MeshError::NoProbesSent);
        }

        let mut report = RadarReport::default();

        for (addr, record) in &self.samples {
            if record.hier.family() != local.family() {
                warn!(addr = %addr, "ignoring echo from mismatched address family");
                continue;
            }
            let level = match local.divergence_level(&record.hier) {
                // Our own broadcast bounced back
                None => continue,
                Some(level) => level,
            };
            let key = EntityKey::new(level, record.hier.gid(level));
            let rtt_ms = self.average_rtt(&record.rtts);
            let gw = Gateway {
                target: key,
                link_rtt_ms: rtt_ms,
                total_rtt_ms: rtt_ms,
                route_mask: arrival_mask([key.id]),
            };

            let root = store.root_key(local, level);
            match ranker.consider(store, root, gw) {
                Decision::Inserted => {
                    info!(level, id = key.id, rtt_ms, "neighbor appeared");
                    report.added.push(key);
                }
                Decision::Replaced { previous_ms } => {
                    debug!(level, id = key.id, previous_ms, rtt_ms, "neighbor latency moved");
                    report.changed.push(key);
                }
                Decision::Ignored => {}
            }
            // The neighbor entity itself is one hop away through itself.
            ranker.consider(store, key, gw);

            {
                let flags = &mut store.entity_mut(key).flags;
                flags.insert(EntityFlags::ROOT_GATEWAY);
                if record.hooking {
                    flags.insert(EntityFlags::HOOKING);
                } else {
                    flags.remove(EntityFlags::HOOKING);
                }
                if level > 0 {
                    flags.insert(EntityFlags::EXTERNAL);
                }
            }

            // A neighbor in a foreign group makes us the border node of our
            // own enclosing group one level below the split.
            if level > 0 {
                store.border_link(level - 1, local.gid(level - 1), key.id, rtt_ms);
            }

            report.neighbors.push(RadarNeighbor {
                addr: addr.clone(),
                hier: record.hier.clone(),
                key,
                rtt_ms,
                hooking: record.hooking,
            });
        }

        for (addr, hier) in known {
            if self.samples.contains_key(addr) {
                continue;
            }
            let level = match local.divergence_level(hier) {
                None => continue,
                Some(level) => level,
            };
            let key = EntityKey::new(level, hier.gid(level));
            let root = store.root_key(local, level);
            info!(level, id = key.id, addr = %addr, "neighbor vanished");
            store.remove_gateway(root, key);
            store.remove_gateway(key, key);
            if level > 0 {
                // No longer a border through this group unless another
                // neighbor keeps the link alive.
                if !store.is_neighbor(local, level, key.id) {
                    let below = store.root_key(local, level - 1);
                    store.borders_mut(level - 1).unlink(below.id, key.id);
                }
            }
            report.removed.push(key);
        }

        report.deferred = self
            .foreign_probes
            .into_iter()
            .filter(|addr| !self.samples.contains_key(addr))
            .collect();
        report.send_tracer_now =
            !report.added.is_empty() || !report.removed.is_empty() || !report.changed.is_empty();

        Ok(report)
    }
}

/// Scan-cycle gate. Hands out at most one `RadarCycle` at a time.
#[derive(Debug, Default)]
pub struct RadarScanner {
    scanning: AtomicBool,
    next_echo_id: AtomicU32,
    deferred: Mutex<Vec<PeerAddr>>,
}

impl RadarScanner {
    /// Create an idle scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a cycle. Rejected with `ScanInProgress` while another one is
    /// still in flight.
    pub fn begin(&self) -> MeshResult<RadarCycle> {
        if self.scanning.swap(true, Ordering::AcqRel) {
            return Err(MeshError::ScanInProgress);
        }
        let echo_id = self.next_echo_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Ok(RadarCycle::new(echo_id))
    }

    /// Release the gate after reconciliation (or abort), stashing any
    /// addresses to probe directly on the next cycle.
    pub fn finish(&self, deferred: Vec<PeerAddr>) {
        if !deferred.is_empty() {
            self.deferred.lock().unwrap().extend(deferred);
        }
        self.scanning.store(false, Ordering::Release);
    }

    /// Whether a cycle is currently in flight.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Drain the addresses deferred by the previous cycle.
    pub fn take_deferred(&self) -> Vec<PeerAddr> {
        std::mem::take(&mut self.deferred.lock().unwrap())
    }
}
