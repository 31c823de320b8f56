//! Border maps.
//!
//! A border map records, per level, which local entities bridge to groups of
//! the level above: one row per border entity, listing the upper-level group
//! ids it can reach and the measured latency of each link. This is how
//! cross-level connectivity is tracked without requiring knowledge of a
//! foreign group's interior.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One link from a border entity to a group of the level above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderLink {
    /// Group id at the level above
    pub upper_gid: u8,
    /// Measured round-trip latency of the bridging link, in milliseconds
    pub rtt_ms: u32,
}

/// Border rows for one hierarchy level: local entity id -> upper-level links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BorderMap {
    rows: HashMap<u8, Vec<BorderLink>>,
}

impl BorderMap {
    /// Create an empty border map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that entity `id` borders on `upper_gid` with the given
    /// latency. Re-linking an existing pair updates the latency instead of
    /// duplicating the row.
    pub fn link(&mut self, id: u8, upper_gid: u8, rtt_ms: u32) {
        let links = self.rows.entry(id).or_default();
        match links.iter_mut().find(|l| l.upper_gid == upper_gid) {
            Some(existing) => existing.rtt_ms = rtt_ms,
            None => links.push(BorderLink { upper_gid, rtt_ms }),
        }
    }

    /// Drop every row of entity `id`. Called when the entity is voided.
    pub fn remove_entity(&mut self, id: u8) -> bool {
        self.rows.remove(&id).is_some()
    }

    /// Drop the single link `id -> upper_gid`, removing the whole row if it
    /// was the last one.
    pub fn unlink(&mut self, id: u8, upper_gid: u8) {
        if let Some(links) = self.rows.get_mut(&id) {
            links.retain(|l| l.upper_gid != upper_gid);
            if links.is_empty() {
                self.rows.remove(&id);
            }
        }
    }

    /// Upper-level links of entity `id`, if it is a border entity.
    pub fn links_of(&self, id: u8) -> Option<&[BorderLink]> {
        self.rows.get(&id).map(|v| v.as_slice())
    }

    /// Whether entity `id` has at least one upper-level link.
    pub fn is_border(&self, id: u8) -> bool {
        self.rows.contains_key(&id)
    }

    /// Iterate all rows as `(entity id, links)`.
    pub fn rows(&self) -> impl Iterator<Item = (u8, &[BorderLink])> {
        self.rows.iter().map(|(id, links)| (*id, links.as_slice()))
    }

    /// Number of border entities recorded at this level.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no border entity is recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
