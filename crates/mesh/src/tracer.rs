//! Tracer flood protocol.
//!
//! A leaderless, loop-safe broadcast flood, run independently per hierarchy
//! level. Each packet carries an append-only path descriptor: every relay
//! validates it, merges every hop into the map store through the ranking
//! engine, appends its own hop, and re-floods to all neighbors except the
//! sender. Loop suppression is structural: a strictly increasing broadcast
//! counter per originator, bounded by the level's fixed entity count. No
//! per-flood state is retained beyond the packet itself.

use crate::addr::HierAddr;
use crate::error::{MeshError, MeshResult};
use crate::map::{EntityFlags, EntityKey, Gateway, MapStore};
use crate::ranking::{arrival_mask, RouteRanker};
use serde::{Deserialize, Serialize};

/// Maximum hops a tracer path can accumulate: every entity of a level,
/// except the receiver appending next.
pub const MAX_TRACER_HOPS: usize = crate::addr::MAX_GROUP_SIZE - 1;

/// One hop of a tracer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerHop {
    /// Level-local id of the entity that appended this hop
    pub id: u8,
    /// Incremental round-trip latency from the previous hop, in milliseconds
    /// (zero for the originator)
    pub rtt_ms: u32,
    /// Occupancy of the hop's enclosing group when the hop was appended
    pub occupancy: u16,
}

/// One upper-level link inside a border block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderChunk {
    /// Group id at `level`
    pub gid: u8,
    /// Hierarchy level of the bordered group; always the packet's level + 1
    pub level: u8,
    /// Measured latency of the bridging link, in milliseconds
    pub rtt_ms: u32,
}

/// Border information a border node appends alongside its hop, listing the
/// upper-level groups it bridges to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderBlock {
    /// Id of the border node this block belongs to
    pub bnode: u8,
    /// Its upper-level links
    pub links: Vec<BorderChunk>,
}

/// A tracer path in flight. Never mutated after being forwarded: each relay
/// allocates a new, one-hop-longer copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerPacket {
    /// Hierarchy level the flood is restricted to
    pub level: u8,
    /// Level-local id of the flood originator
    pub originator: u8,
    /// The originator's monotonic broadcast counter
    pub broadcast_id: u32,
    /// Path hops, oldest (the originator) first
    pub hops: Vec<TracerHop>,
    /// Border blocks accumulated along the path
    pub borders: Vec<BorderBlock>,
}

impl TracerPacket {
    /// The most recently appended hop.
    pub fn last_hop(&self) -> Option<&TracerHop> {
        self.hops.last()
    }

    /// New packet with `hop` (and optionally a border block) appended.
    pub fn extended(&self, hop: TracerHop, border: Option<BorderBlock>) -> Self {
        let mut next = self.clone();
        next.hops.push(hop);
        if let Some(block) = border {
            next.borders.push(block);
        }
        next
    }
}

/// Flood-exclusion policy applied when picking relay targets. A closed set:
/// the predicates are fixed and known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodExclude {
    /// Send to every neighbor (origination)
    Nobody,
    /// Skip the neighbor the packet came from (relay)
    Sender {
        /// Level-local id of the sender
        id: u8,
    },
    /// Skip the sender and any neighbor still joining the network
    SenderAndHooking {
        /// Level-local id of the sender
        id: u8,
    },
}

impl FloodExclude {
    /// Whether `neighbor_id` must not receive the flood.
    pub fn excludes(&self, store: &MapStore, level: u8, neighbor_id: u8) -> bool {
        match self {
            FloodExclude::Nobody => false,
            FloodExclude::Sender { id } => neighbor_id == *id,
            FloodExclude::SenderAndHooking { id } => {
                neighbor_id == *id
                    || store
                        .entity(EntityKey::new(level, neighbor_id))
                        .flags
                        .contains(EntityFlags::HOOKING)
            }
        }
    }
}

/// Occupancy value attached to a hop appended at `level`: the seeds of the
/// appender's enclosing group. Top-level hops carry zero.
fn enclosing_occupancy(store: &MapStore, local: &HierAddr, level: u8) -> u16 {
    if level + 1 < store.levels() {
        store
            .group(EntityKey::new(level + 1, local.gid(level + 1)))
            .map(|g| g.seeds)
            .unwrap_or(0)
    } else {
        0
    }
}

/// Originate a new flood at `level`: bump the local root's broadcast counter
/// and build a single-hop path.
pub fn originate(store: &mut MapStore, local: &HierAddr, level: u8) -> TracerPacket {
    let root = store.root_key(local, level);
    let broadcast_id = {
        let record = store.entity_mut(root);
        record.broadcast_seen += 1;
        record.broadcast_seen
    };
    let occupancy = enclosing_occupancy(store, local, level);
    TracerPacket {
        level,
        originator: root.id,
        broadcast_id,
        hops: vec![TracerHop {
            id: root.id,
            rtt_ms: 0,
            occupancy,
        }],
        borders: Vec::new(),
    }
}

/// Validate a received tracer packet before any state is touched.
///
/// A failure here means the packet is dropped: logged by the caller, never
/// merged, never forwarded.
pub fn verify(
    store: &MapStore,
    local: &HierAddr,
    pkt: &TracerPacket,
    from_id: u8,
) -> MeshResult<()> {
    if pkt.level >= store.levels() {
        return Err(MeshError::MalformedPacket(format!(
            "level {} beyond hierarchy depth",
            pkt.level
        )));
    }
    if pkt.hops.is_empty() {
        return Err(MeshError::MalformedPacket("zero hop count".into()));
    }
    if pkt.hops.len() > MAX_TRACER_HOPS {
        return Err(MeshError::MalformedPacket(format!(
            "oversized path: {} hops",
            pkt.hops.len()
        )));
    }
    if pkt.hops[0].id != pkt.originator {
        return Err(MeshError::MalformedPacket(
            "first hop does not match the originator".into(),
        ));
    }
    if pkt.level == store.levels() - 1 {
        for hop in &pkt.hops {
            if store.is_reserved_id(pkt.level, hop.id) {
                return Err(MeshError::MalformedPacket(format!(
                    "reserved id {} in path",
                    hop.id
                )));
            }
        }
    }

    // The path's last hop must resolve to a genuine current neighbor.
    let last = pkt.hops[pkt.hops.len() - 1].id;
    if last != from_id {
        return Err(MeshError::ForgedLastHop { id: last });
    }
    if !store.is_neighbor(local, pkt.level, from_id) {
        return Err(MeshError::ForgedLastHop { id: from_id });
    }

    // Sole loop-prevention mechanism: the counter must be strictly greater
    // than anything previously merged from this originator.
    let seen = store
        .entity(EntityKey::new(pkt.level, pkt.originator))
        .broadcast_seen;
    if pkt.broadcast_id <= seen {
        return Err(MeshError::StaleBroadcast {
            originator: pkt.originator,
            seen,
            got: pkt.broadcast_id,
        });
    }

    for block in &pkt.borders {
        if block.links.is_empty() {
            return Err(MeshError::MalformedPacket("empty border block".into()));
        }
        if !pkt.hops.iter().any(|h| h.id == block.bnode) {
            return Err(MeshError::MalformedPacket(format!(
                "border block for non-hop node {}",
                block.bnode
            )));
        }
        for chunk in &block.links {
            if chunk.level != pkt.level + 1 || chunk.level >= store.levels() {
                return Err(MeshError::MalformedPacket(format!(
                    "border chunk at level {}",
                    chunk.level
                )));
            }
        }
    }

    Ok(())
}

/// Merge a verified packet into the map store.
///
/// Walks the path from the most recent hop to the oldest, accumulating the
/// total latency, and feeds every hop through the ranking engine with the
/// sending neighbor as the via gateway. Records the originator's counter,
/// refreshes occupancy-derived flags, and, when the receiver is a border
/// node at this level, ingests the attached border blocks, skipping chunks
/// whose group prefix matches the receiver's own (those were self-authored
/// and are already known).
pub fn merge(
    store: &mut MapStore,
    ranker: &RouteRanker,
    local: &HierAddr,
    pkt: &TracerPacket,
    from_id: u8,
) {
    let level = pkt.level;
    let root = store.root_key(local, level);
    let via = EntityKey::new(level, from_id);
    let link_to_sender = store
        .entity(root)
        .gateways
        .iter()
        .find(|g| g.target == via)
        .map(|g| g.link_rtt_ms)
        .unwrap_or(0);
    let mask = arrival_mask(pkt.hops.iter().map(|h| h.id));

    let mut total = link_to_sender;
    for hop in pkt.hops.iter().rev() {
        if hop.id != root.id {
            ranker.consider(
                store,
                EntityKey::new(level, hop.id),
                Gateway {
                    target: via,
                    link_rtt_ms: link_to_sender,
                    total_rtt_ms: total,
                    route_mask: mask,
                },
            );

            if level > 0 {
                store.set_group_occupancy(level, hop.id, hop.occupancy);
            } else if store.levels() > 1 {
                // Level-0 hops report the occupancy of the shared level-1
                // group.
                store.set_group_occupancy(1, local.gid(1), hop.occupancy);
            }
        }
        // Hop latencies are attacker-controlled; a sum past u32::MAX must
        // pin at the ceiling instead of wrapping or panicking.
        total = total.saturating_add(hop.rtt_ms);
    }

    // Record the counter after the walk so a re-delivered duplicate fails
    // verification from now on.
    let origin = store.entity_mut(EntityKey::new(level, pkt.originator));
    origin.broadcast_seen = origin.broadcast_seen.max(pkt.broadcast_id);

    let receiver_is_border = store.borders(level).is_border(root.id)
        || store.entity(root).flags.contains(EntityFlags::BORDER);
    if receiver_is_border {
        for block in &pkt.borders {
            for chunk in &block.links {
                if chunk.gid == local.gid(chunk.level) {
                    continue;
                }
                store.border_link(level, block.bnode, chunk.gid, chunk.rtt_ms);
            }
        }
    }
}

/// Build the relayed copy of a verified, merged packet: the receiver's own
/// hop (incremental latency measured from the gateway entry to the sender)
/// plus a fresh border block when the receiver bridges the level above.
pub fn extend(
    store: &MapStore,
    local: &HierAddr,
    pkt: &TracerPacket,
    from_id: u8,
) -> MeshResult<TracerPacket> {
    let level = pkt.level;
    let root = store.root_key(local, level);
    let link_rtt_ms = store
        .entity(root)
        .gateways
        .iter()
        .find(|g| g.target == EntityKey::new(level, from_id))
        .map(|g| g.link_rtt_ms)
        .ok_or(MeshError::ForgedLastHop { id: from_id })?;

    let hop = TracerHop {
        id: root.id,
        rtt_ms: link_rtt_ms,
        occupancy: enclosing_occupancy(store, local, level),
    };

    let border = if level + 1 < store.levels() {
        store.borders(level).links_of(root.id).map(|links| BorderBlock {
            bnode: root.id,
            links: links
                .iter()
                .map(|l| BorderChunk {
                    gid: l.upper_gid,
                    level: level + 1,
                    rtt_ms: l.rtt_ms,
                })
                .collect(),
        })
    } else {
        None
    };

    Ok(pkt.extended(hop, border))
}

/// Neighbor ids a flood must be relayed to under the given exclusion policy.
pub fn relay_targets(
    store: &MapStore,
    local: &HierAddr,
    level: u8,
    exclude: FloodExclude,
) -> Vec<u8> {
    store
        .neighbor_ids(local, level)
        .into_iter()
        .filter(|&id| !exclude.excludes(store, level, id))
        .collect()
}
