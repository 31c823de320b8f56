//! Route ranking engine.
//!
//! Decides whether a candidate path toward an entity is merged into its
//! ordered gateway list. New gateways are inserted and the worst entry
//! evicted beyond capacity; existing gateways are only re-ranked when the
//! latency moved by at least the jitter threshold, so measurement noise does
//! not thrash the kernel routing table.

use crate::map::{EntityKey, Gateway, GatewayChange, MapStore, MAX_ROUTES};

/// Divisor applied to the shorter path length when deciding whether two
/// arrival masks are similar.
pub const SIMILARITY_DIVISOR: u32 = 2;

/// Outcome of considering a candidate gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The candidate was new and has been inserted
    Inserted,
    /// The candidate replaced the latency of an existing entry
    Replaced {
        /// Total latency the entry had before
        previous_ms: u32,
    },
    /// The candidate changed nothing (duplicate, or within jitter)
    Ignored,
}

/// Route ranking policy, parameterized by the jitter threshold.
#[derive(Debug, Clone)]
pub struct RouteRanker {
    rtt_delta_ms: u32,
}

impl RouteRanker {
    /// Create a ranker with the given jitter threshold in milliseconds.
    pub fn new(rtt_delta_ms: u32) -> Self {
        Self { rtt_delta_ms }
    }

    /// The configured jitter threshold.
    pub fn rtt_delta_ms(&self) -> u32 {
        self.rtt_delta_ms
    }

    /// Consider routing toward `entity` through `candidate.target`.
    ///
    /// Present gateways (matched by target identity) are updated only when
    /// the total latency moved by at least the jitter threshold. Absent ones
    /// are inserted, the list re-sorted, and the worst entry evicted when
    /// over capacity.
    pub fn consider(&self, store: &mut MapStore, entity: EntityKey, candidate: Gateway) -> Decision {
        let record = store.entity(entity);
        match record.gateway_position(candidate.target) {
            Some(pos) => {
                let existing = record.gateways[pos];
                let delta = existing.total_rtt_ms.abs_diff(candidate.total_rtt_ms);
                if delta < self.rtt_delta_ms {
                    return Decision::Ignored;
                }
                match store.upsert_gateway(entity, candidate) {
                    GatewayChange::Updated { previous_ms } => Decision::Replaced { previous_ms },
                    _ => Decision::Ignored,
                }
            }
            None => {
                // A full list only accepts candidates that beat the worst
                // entry; upsert_gateway evicts it after the sort.
                if record.gateways.len() >= MAX_ROUTES {
                    let worst = record.gateways[record.gateways.len() - 1];
                    if candidate.total_rtt_ms >= worst.total_rtt_ms {
                        return Decision::Ignored;
                    }
                }
                match store.upsert_gateway(entity, candidate) {
                    GatewayChange::Added => Decision::Inserted,
                    GatewayChange::Updated { previous_ms } => Decision::Replaced { previous_ms },
                    GatewayChange::Unchanged => Decision::Ignored,
                }
            }
        }
    }
}

/// Build the arrival-route bitmask of a path from its hop ids.
pub fn arrival_mask<I: IntoIterator<Item = u8>>(hop_ids: I) -> u32 {
    hop_ids
        .into_iter()
        .fold(0u32, |mask, id| mask | 1u32 << (id % 32))
}

/// Whether two arrival paths are topologically similar: their hop-bitmask
/// Hamming distance is below a threshold proportional to the shorter path's
/// length. Diverse (non-similar) gateways are preferred so that one upstream
/// failure does not invalidate all of an entity's alternates at once.
pub fn similar_routes(mask_a: u32, mask_b: u32, shorter_len: u32) -> bool {
    let hamming = (mask_a ^ mask_b).count_ones();
    hamming < shorter_len / SIMILARITY_DIVISOR
}
