//! Join procedure.
//!
//! A booting node owns no address and no maps. It runs discovery in hooking
//! mode, and either founds a brand-new network (nobody answered) or joins
//! the group of its fastest settled neighbor: ask for a free slot, pick one
//! at random, fetch the neighbor's map image and adopt it with every route
//! re-pointed through that neighbor. The caller then announces the new node
//! with a discovery cycle and a tracer flood at every level.

use crate::addr::{AddrFamily, HierAddr};
use crate::error::{MeshError, MeshResult};
use crate::map::{EntityFlags, EntityKey, Gateway, MapStore};
use crate::ports::{PeerAddr, Transport};
use crate::radar::{RadarNeighbor, RadarReport};
use crate::ranking::arrival_mask;
use crate::wire::{MeshFrame, MeshPayload};
use loomnet_core::HookConfig;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// How the node ended up with an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Nobody answered; the node founded a fresh network under a random
    /// non-reserved address
    Founded,
    /// The node joined an existing group through this neighbor
    Joined {
        /// Link address of the donor neighbor
        via: PeerAddr,
    },
}

/// Result of a completed join procedure.
#[derive(Debug)]
pub struct HookReport {
    /// The address the node now owns
    pub addr: HierAddr,
    /// The adopted (or freshly founded) map store
    pub store: MapStore,
    /// How the address was obtained
    pub outcome: HookOutcome,
}

/// Run the join procedure.
///
/// `scan` performs one discovery cycle; its argument is true while the node
/// is still hooking, so probes carry the hooking flag and responders know
/// not to route through us yet. Injected as a closure so the procedure stays
/// synchronous and testable without a live radar.
pub fn run_hook<R, F>(
    family: AddrFamily,
    cfg: &HookConfig,
    transport: &dyn Transport,
    rng: &mut R,
    mut scan: F,
) -> MeshResult<HookReport>
where
    R: Rng,
    F: FnMut(bool) -> MeshResult<RadarReport>,
{
    let mut neighbors: Vec<RadarNeighbor> = Vec::new();
    let mut saw_hooking = false;
    for round in 0..cfg.scan_rounds {
        let report = scan(true)?;
        saw_hooking |= report.neighbors.iter().any(|n| n.hooking);
        neighbors = settled_responders(report, family);
        if !neighbors.is_empty() {
            break;
        }
        info!(round, "no settled neighbor answered");
    }

    // Only other joiners answered: two bare nodes are racing to found the
    // same network. Back off for a random number of extra rounds so one
    // side founds first and the other finds it settled.
    if neighbors.is_empty() && saw_hooking {
        let backoff = rng.gen_range(1..=cfg.scan_rounds.max(1));
        for round in 0..backoff {
            let report = scan(true)?;
            neighbors = settled_responders(report, family);
            if !neighbors.is_empty() {
                break;
            }
            info!(round, "racing joiner has not settled yet");
        }
    }

    if neighbors.is_empty() {
        let addr = HierAddr::random(family, rng);
        let mut store = MapStore::new(family);
        store.init_self(&addr);
        info!(addr = %addr, "alone; founded a new network");
        return Ok(HookReport {
            addr,
            store,
            outcome: HookOutcome::Founded,
        });
    }

    // Fastest first; each neighbor gets one shot before falling through to
    // the next.
    neighbors.sort_by_key(|n| n.rtt_ms);
    let timeout = Duration::from_secs(cfg.fetch_timeout_secs);

    let mut all_full: Option<(u8, u8)> = None;
    for donor in &neighbors {
        let slots = match request_free_slots(transport, &donor.addr, timeout) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(addr = %donor.addr, %err, "free-slot request failed, trying next neighbor");
                continue;
            }
        };
        // Slots live one level below the reporting group, so the reply
        // level must sit inside 1..levels; anything else is a hostile or
        // broken donor.
        if slots.level == 0 || slots.level >= family.levels() {
            warn!(
                addr = %donor.addr,
                level = slots.level,
                "free-slot reply at an invalid level, trying next neighbor"
            );
            continue;
        }
        if slots.slots.is_empty() {
            warn!(level = slots.level, gid = slots.gid, "group is full");
            all_full = Some((slots.level, slots.gid));
            continue;
        }

        let slot = slots.slots[rng.gen_range(0..slots.slots.len())];
        let mut addr = donor.hier.clone();
        for level in 0..slots.level.saturating_sub(1) {
            addr.set_gid(level, rng.gen());
        }
        addr.set_gid(slots.level - 1, slot);

        let snapshot = match request_map(transport, &donor.addr, timeout) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(addr = %donor.addr, %err, "map fetch failed, trying next neighbor");
                continue;
            }
        };
        if snapshot.family != family {
            warn!(addr = %donor.addr, "donor map has the wrong address family");
            continue;
        }

        let mut store = adopt_snapshot(&snapshot, donor);
        store.init_self(&addr);
        if store.levels() > 1 {
            store.set_group_occupancy(1, addr.gid(1), slots.occupancy.saturating_add(1));
        }
        info!(addr = %addr, via = %donor.addr, "joined the network");
        return Ok(HookReport {
            addr,
            store,
            outcome: HookOutcome::Joined {
                via: donor.addr.clone(),
            },
        });
    }

    match all_full {
        Some((level, gid)) => Err(MeshError::GroupFull { level, gid }),
        None => Err(MeshError::HookFailed(
            "no reachable neighbor completed the join exchange".into(),
        )),
    }
}

/// Responders eligible as donors: settled (not hooking) and of our family.
fn settled_responders(report: RadarReport, family: AddrFamily) -> Vec<RadarNeighbor> {
    report
        .neighbors
        .into_iter()
        .filter(|n| !n.hooking && n.hier.family() == family)
        .collect()
}

fn request_free_slots(
    transport: &dyn Transport,
    to: &PeerAddr,
    timeout: Duration,
) -> MeshResult<crate::wire::FreeSlots> {
    let reply = transport.request(
        to,
        &MeshFrame::anonymous(MeshPayload::FreeSlotsRequest),
        timeout,
    )?;
    match reply.payload {
        MeshPayload::FreeSlotsReply(slots) => Ok(slots),
        other => Err(MeshError::MalformedPacket(format!(
            "expected a free-slot reply, got {other:?}"
        ))),
    }
}

fn request_map(
    transport: &dyn Transport,
    to: &PeerAddr,
    timeout: Duration,
) -> MeshResult<crate::map::MapSnapshot> {
    let reply = transport.request(to, &MeshFrame::anonymous(MeshPayload::MapRequest), timeout)?;
    match reply.payload {
        MeshPayload::MapReply(snapshot) => Ok(snapshot),
        other => Err(MeshError::MalformedPacket(format!(
            "expected a map reply, got {other:?}"
        ))),
    }
}

/// Build a local store from a donor's map image.
///
/// The donor's flags describe the donor's perspective, so SELF, gateway and
/// hooking markers are stripped. Every adopted entity is initially reached
/// through the donor itself; the first own tracer floods replace these
/// provisional routes with measured ones.
fn adopt_snapshot(snapshot: &crate::map::MapSnapshot, donor: &RadarNeighbor) -> MapStore {
    let mut store = MapStore::new(snapshot.family);
    let donor_key = EntityKey::new(0, donor.hier.gid(0));
    let donor_mask = arrival_mask([donor_key.id]);

    for (level, entries) in snapshot.levels.iter().enumerate() {
        for entry in entries {
            let key = EntityKey::new(level as u8, entry.id);
            let best_total = entry
                .gateways
                .first()
                .map(|g| g.total_rtt_ms)
                .unwrap_or(0);
            {
                let record = store.entity_mut(key);
                let mut flags = EntityFlags::from_bits(entry.flags);
                flags.remove(EntityFlags::SELF);
                flags.remove(EntityFlags::ROOT_GATEWAY);
                flags.remove(EntityFlags::HOOKING);
                flags.remove(EntityFlags::VOID);
                flags.insert(EntityFlags::NEEDS_KERNEL_SYNC);
                record.flags = flags;
                record.broadcast_seen = entry.broadcast_seen;
                record.gateways = vec![Gateway {
                    target: donor_key,
                    link_rtt_ms: donor.rtt_ms,
                    total_rtt_ms: donor.rtt_ms.saturating_add(best_total),
                    route_mask: donor_mask,
                }];
            }
            if level > 0 {
                store.set_group_occupancy(level as u8, entry.id, entry.seeds);
            }
        }
    }

    // The donor itself is one measured hop away.
    store.upsert_gateway(
        donor_key,
        Gateway {
            target: donor_key,
            link_rtt_ms: donor.rtt_ms,
            total_rtt_ms: donor.rtt_ms,
            route_mask: donor_mask,
        },
    );
    store
        .entity_mut(donor_key)
        .flags
        .insert(EntityFlags::ROOT_GATEWAY);

    for row in &snapshot.borders {
        store.border_link(row.level, row.id, row.upper_gid, row.rtt_ms);
    }
    store
}
