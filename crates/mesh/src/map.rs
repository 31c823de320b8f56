//! Hierarchical map store.
//!
//! The authoritative in-memory view of every known node, group node and
//! border link at each hierarchy level. Entities are held in fixed arenas of
//! 256 slots per level and referenced by stable `(level, id)` keys, never by
//! native pointers, so voiding and reusing a slot can never dangle.
//!
//! This module is pure data plus invariant-preserving mutators; all I/O and
//! protocol logic live elsewhere.

use crate::addr::{AddrFamily, HierAddr, MAX_GROUP_SIZE};
use crate::border::BorderMap;
use serde::{Deserialize, Serialize};

/// Maximum gateways kept per entity. Insertion beyond this evicts the worst.
pub const MAX_ROUTES: usize = 20;

/// Status flags of a map entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityFlags(u16);

impl EntityFlags {
    /// The local root entity at its level.
    pub const SELF: EntityFlags = EntityFlags(1);
    /// Placeholder slot; the entity does not exist.
    pub const VOID: EntityFlags = EntityFlags(1 << 1);
    /// The entity is currently joining the network.
    pub const HOOKING: EntityFlags = EntityFlags(1 << 2);
    /// The entity bridges to a group of the level above.
    pub const BORDER: EntityFlags = EntityFlags(1 << 3);
    /// The entity is a group node.
    pub const GROUP: EntityFlags = EntityFlags(1 << 4);
    /// The entity is a direct gateway of the local root.
    pub const ROOT_GATEWAY: EntityFlags = EntityFlags(1 << 5);
    /// The entity is reached through a foreign group.
    pub const EXTERNAL: EntityFlags = EntityFlags(1 << 6);
    /// The entity's kernel route is out of date.
    pub const NEEDS_KERNEL_SYNC: EntityFlags = EntityFlags(1 << 7);
    /// The entity's group has reached its level capacity.
    pub const FULL: EntityFlags = EntityFlags(1 << 8);

    /// Flag set containing only `VOID`.
    pub fn void() -> Self {
        Self::VOID
    }

    /// Whether every bit of `other` is set.
    pub fn contains(&self, other: EntityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: EntityFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: EntityFlags) {
        self.0 &= !other.0;
    }

    /// Raw bit representation, used by the snapshot layer.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Rebuild from raw bits.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
}

/// Stable arena key of a map entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Hierarchy level of the entity
    pub level: u8,
    /// Slot id within its level arena
    pub id: u8,
}

impl EntityKey {
    /// Shorthand constructor.
    pub fn new(level: u8, id: u8) -> Self {
        Self { level, id }
    }
}

/// One entry of an entity's ordered gateway list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    /// The neighbor entity traffic is forwarded through
    pub target: EntityKey,
    /// One-hop round-trip latency to the target, in milliseconds
    pub link_rtt_ms: u32,
    /// Cached total round-trip latency from the local root to the entity
    /// owning this gateway, via the target
    pub total_rtt_ms: u32,
    /// Bitmask of the hop ids the route announcement arrived through, used
    /// for similarity pruning
    pub route_mask: u32,
}

/// A level-0 entity: one individual node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Status flags
    pub flags: EntityFlags,
    /// Highest tracer broadcast counter merged from this entity as an
    /// originator
    pub broadcast_seen: u32,
    /// Gateways toward this entity, sorted ascending by total latency
    pub gateways: Vec<Gateway>,
}

impl NodeRecord {
    /// A fresh placeholder record.
    pub fn new_void() -> Self {
        Self {
            flags: EntityFlags::void(),
            broadcast_seen: 0,
            gateways: Vec::new(),
        }
    }

    /// Whether the slot holds no live entity.
    pub fn is_void(&self) -> bool {
        self.flags.contains(EntityFlags::VOID)
    }

    /// Position of the gateway through `target`, if present.
    pub fn gateway_position(&self, target: EntityKey) -> Option<usize> {
        self.gateways.iter().position(|g| g.target == target)
    }

    /// Best (lowest total latency) gateway, if any.
    pub fn best_gateway(&self) -> Option<&Gateway> {
        self.gateways.first()
    }

    /// Re-sort the gateway list ascending by total latency.
    pub fn sort_gateways(&mut self) {
        self.gateways.sort_by_key(|g| g.total_rtt_ms);
    }
}

/// A level-`k>0` entity: a group node. Embeds the generic node record and
/// adds occupancy tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Generic map-entity state (flags, counter, gateways)
    pub node: NodeRecord,
    /// Number of occupied slots inside the group
    pub seeds: u16,
}

impl GroupRecord {
    /// A fresh placeholder group.
    pub fn new_void() -> Self {
        let mut node = NodeRecord::new_void();
        node.flags.insert(EntityFlags::GROUP);
        Self { node, seeds: 0 }
    }

    /// Whether the group has no free slot left.
    pub fn is_full(&self) -> bool {
        self.seeds as usize >= MAX_GROUP_SIZE
    }
}

/// What a raw gateway upsert did to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayChange {
    /// A new entry was inserted
    Added,
    /// The existing entry through the same target was updated
    Updated {
        /// Total latency before the update
        previous_ms: u32,
    },
    /// The entry was already identical
    Unchanged,
}

/// Serializable image of one entity, used by the snapshot exchange and the
/// persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Slot id within the level
    pub id: u8,
    /// Raw status flags
    pub flags: u16,
    /// Highest merged broadcast counter
    pub broadcast_seen: u32,
    /// Group occupancy (0 for level-0 entities)
    pub seeds: u16,
    /// Gateway list in stored order
    pub gateways: Vec<Gateway>,
}

/// One border row in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderSnapshot {
    /// Level the border entity lives at
    pub level: u8,
    /// Border entity id
    pub id: u8,
    /// Group id at `level + 1`
    pub upper_gid: u8,
    /// Link latency in milliseconds
    pub rtt_ms: u32,
}

/// Complete serializable image of a map store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSnapshot {
    /// Address family the maps belong to
    pub family: AddrFamily,
    /// Occupied entities, grouped per level (index = level)
    pub levels: Vec<Vec<EntitySnapshot>>,
    /// All border rows
    pub borders: Vec<BorderSnapshot>,
}

/// The hierarchical map store.
#[derive(Debug)]
pub struct MapStore {
    family: AddrFamily,
    /// Level 0: individual nodes
    nodes: Vec<NodeRecord>,
    /// Levels 1..L: group nodes, one 256-slot arena per level
    groups: Vec<Vec<GroupRecord>>,
    /// Border rows, one map per level
    borders: Vec<BorderMap>,
}

impl MapStore {
    /// Create an all-void store for `family`.
    pub fn new(family: AddrFamily) -> Self {
        let levels = family.levels() as usize;
        Self {
            family,
            nodes: (0..MAX_GROUP_SIZE).map(|_| NodeRecord::new_void()).collect(),
            groups: (1..levels)
                .map(|_| (0..MAX_GROUP_SIZE).map(|_| GroupRecord::new_void()).collect())
                .collect(),
            borders: (0..levels).map(|_| BorderMap::new()).collect(),
        }
    }

    /// Address family of the store.
    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Number of hierarchy levels.
    pub fn levels(&self) -> u8 {
        self.family.levels()
    }

    fn check_level(&self, level: u8) {
        // Indexing past the hierarchy depth is a programming error, not a
        // recoverable condition.
        assert!(
            level < self.levels(),
            "level {} out of range (levels: {})",
            level,
            self.levels()
        );
    }

    /// Immutable access to the generic record of any entity.
    pub fn entity(&self, key: EntityKey) -> &NodeRecord {
        self.check_level(key.level);
        if key.level == 0 {
            &self.nodes[key.id as usize]
        } else {
            &self.groups[key.level as usize - 1][key.id as usize].node
        }
    }

    /// Mutable access to the generic record of any entity.
    pub fn entity_mut(&mut self, key: EntityKey) -> &mut NodeRecord {
        self.check_level(key.level);
        if key.level == 0 {
            &mut self.nodes[key.id as usize]
        } else {
            &mut self.groups[key.level as usize - 1][key.id as usize].node
        }
    }

    /// The group record behind `key`, or `None` for level-0 keys.
    pub fn group(&self, key: EntityKey) -> Option<&GroupRecord> {
        self.check_level(key.level);
        if key.level == 0 {
            None
        } else {
            Some(&self.groups[key.level as usize - 1][key.id as usize])
        }
    }

    /// Mutable group record behind `key`, or `None` for level-0 keys.
    pub fn group_mut(&mut self, key: EntityKey) -> Option<&mut GroupRecord> {
        self.check_level(key.level);
        if key.level == 0 {
            None
        } else {
            Some(&mut self.groups[key.level as usize - 1][key.id as usize])
        }
    }

    /// Look up a live entity; void placeholders resolve to `None`.
    pub fn find_entity(&self, key: EntityKey) -> Option<&NodeRecord> {
        let record = self.entity(key);
        if record.is_void() {
            None
        } else {
            Some(record)
        }
    }

    /// Whether `id` is reserved at `level` and must never be assigned.
    pub fn is_reserved_id(&self, level: u8, id: u8) -> bool {
        self.check_level(level);
        level == self.levels() - 1 && self.family.is_reserved_top_gid(id)
    }

    /// Idempotent gateway upsert: entries match by target entity identity,
    /// never by value. Keeps the list sorted ascending by total latency and
    /// evicts the worst entry beyond capacity. Marks the entity present and
    /// in need of a kernel-route sync when anything changed.
    pub fn upsert_gateway(&mut self, key: EntityKey, gw: Gateway) -> GatewayChange {
        let record = self.entity_mut(key);
        let change = match record.gateway_position(gw.target) {
            Some(pos) => {
                if record.gateways[pos] == gw {
                    GatewayChange::Unchanged
                } else {
                    let previous_ms = record.gateways[pos].total_rtt_ms;
                    record.gateways[pos] = gw;
                    GatewayChange::Updated { previous_ms }
                }
            }
            None => {
                record.gateways.push(gw);
                GatewayChange::Added
            }
        };

        if change != GatewayChange::Unchanged {
            record.sort_gateways();
            record.gateways.truncate(MAX_ROUTES);
            record.flags.remove(EntityFlags::VOID);
            record.flags.insert(EntityFlags::NEEDS_KERNEL_SYNC);
        }
        change
    }

    /// Remove the gateway through `target`. Deleting the last gateway of a
    /// non-self entity voids it and cascades through the border maps.
    pub fn remove_gateway(&mut self, key: EntityKey, target: EntityKey) {
        let record = self.entity_mut(key);
        if let Some(pos) = record.gateway_position(target) {
            record.gateways.remove(pos);
            record.flags.insert(EntityFlags::NEEDS_KERNEL_SYNC);
            if record.gateways.is_empty() && !record.flags.contains(EntityFlags::SELF) {
                self.mark_void(key);
            }
        }
    }

    /// Void an entity: reset its record, flag the slot for kernel-route
    /// removal, and drop every border row that references it at its level.
    pub fn mark_void(&mut self, key: EntityKey) {
        {
            let record = self.entity_mut(key);
            record.gateways.clear();
            record.broadcast_seen = 0;
            record.flags = EntityFlags::void();
            record.flags.insert(EntityFlags::NEEDS_KERNEL_SYNC);
            if key.level > 0 {
                record.flags.insert(EntityFlags::GROUP);
            }
        }
        if let Some(group) = self.group_mut(key) {
            group.seeds = 0;
        }
        self.borders[key.level as usize].remove_entity(key.id);
    }

    /// Clear the void flag of an entity slot.
    pub fn mark_present(&mut self, key: EntityKey) {
        self.entity_mut(key).flags.remove(EntityFlags::VOID);
    }

    /// Record that entity `id` at `level` borders on group `upper_gid` of
    /// the level above.
    pub fn border_link(&mut self, level: u8, id: u8, upper_gid: u8, rtt_ms: u32) {
        self.check_level(level);
        assert!(
            level + 1 < self.levels(),
            "border link above the top level"
        );
        self.entity_mut(EntityKey::new(level, id))
            .flags
            .insert(EntityFlags::BORDER);
        self.borders[level as usize].link(id, upper_gid, rtt_ms);
    }

    /// Border rows at `level`.
    pub fn borders(&self, level: u8) -> &BorderMap {
        self.check_level(level);
        &self.borders[level as usize]
    }

    /// Mutable border rows at `level`.
    pub fn borders_mut(&mut self, level: u8) -> &mut BorderMap {
        self.check_level(level);
        &mut self.borders[level as usize]
    }

    /// Update a group's occupancy and derive its FULL flag.
    pub fn set_group_occupancy(&mut self, level: u8, gid: u8, seeds: u16) {
        let seeds = seeds.min(MAX_GROUP_SIZE as u16);
        if let Some(group) = self.group_mut(EntityKey::new(level, gid)) {
            group.seeds = seeds;
            if group.is_full() {
                group.node.flags.insert(EntityFlags::FULL);
            } else {
                group.node.flags.remove(EntityFlags::FULL);
            }
        }
    }

    /// The local root entity key at `level` for the node addressed `local`.
    pub fn root_key(&self, local: &HierAddr, level: u8) -> EntityKey {
        EntityKey::new(level, local.gid(level))
    }

    /// Ids of the current direct neighbors at `level`: the targets of the
    /// root entity's gateway list.
    pub fn neighbor_ids(&self, local: &HierAddr, level: u8) -> Vec<u8> {
        self.entity(self.root_key(local, level))
            .gateways
            .iter()
            .filter(|g| g.target.level == level)
            .map(|g| g.target.id)
            .collect()
    }

    /// Whether `id` is currently a direct neighbor at `level`.
    pub fn is_neighbor(&self, local: &HierAddr, level: u8, id: u8) -> bool {
        self.entity(self.root_key(local, level))
            .gateway_position(EntityKey::new(level, id))
            .is_some()
    }

    /// Install the local root entity at every level for a node that owns
    /// `local`, founding single-member groups on the way up.
    pub fn init_self(&mut self, local: &HierAddr) {
        for level in 0..self.levels() {
            let key = self.root_key(local, level);
            {
                let record = self.entity_mut(key);
                record.flags.remove(EntityFlags::VOID);
                record.flags.insert(EntityFlags::SELF);
            }
            if level > 0 {
                self.set_group_occupancy(level, local.gid(level), 1);
            }
        }
    }

    /// Free (void) slot ids at `level`, excluding reserved ids.
    pub fn free_slots(&self, level: u8) -> Vec<u8> {
        self.check_level(level);
        (0..MAX_GROUP_SIZE as u16)
            .map(|i| i as u8)
            .filter(|&id| {
                !self.is_reserved_id(level, id)
                    && self.entity(EntityKey::new(level, id)).is_void()
            })
            .collect()
    }

    /// Number of occupied slots at `level`.
    pub fn occupancy(&self, level: u8) -> u16 {
        self.check_level(level);
        (0..MAX_GROUP_SIZE as u16)
            .filter(|&i| !self.entity(EntityKey::new(level, i as u8)).is_void())
            .count() as u16
    }

    /// Serialize every occupied entity and all border rows.
    pub fn snapshot(&self) -> MapSnapshot {
        let mut levels = Vec::with_capacity(self.levels() as usize);
        for level in 0..self.levels() {
            let mut entries = Vec::new();
            for id in 0..MAX_GROUP_SIZE as u16 {
                let key = EntityKey::new(level, id as u8);
                let record = self.entity(key);
                if record.is_void() {
                    continue;
                }
                entries.push(EntitySnapshot {
                    id: id as u8,
                    flags: record.flags.bits(),
                    broadcast_seen: record.broadcast_seen,
                    seeds: self.group(key).map(|g| g.seeds).unwrap_or(0),
                    gateways: record.gateways.clone(),
                });
            }
            levels.push(entries);
        }

        let mut borders = Vec::new();
        for level in 0..self.levels() {
            for (id, links) in self.borders[level as usize].rows() {
                for link in links {
                    borders.push(BorderSnapshot {
                        level,
                        id,
                        upper_gid: link.upper_gid,
                        rtt_ms: link.rtt_ms,
                    });
                }
            }
        }

        MapSnapshot {
            family: self.family,
            levels,
            borders,
        }
    }

    /// Rebuild a store from a snapshot, verbatim. The snapshot's flags are
    /// restored as-is; callers merging a *foreign* snapshot must go through
    /// the ranking engine instead (see the hook procedure).
    pub fn from_snapshot(snapshot: &MapSnapshot) -> Self {
        let mut store = Self::new(snapshot.family);
        for (level, entries) in snapshot.levels.iter().enumerate() {
            for entry in entries {
                let key = EntityKey::new(level as u8, entry.id);
                {
                    let record = store.entity_mut(key);
                    record.flags = EntityFlags::from_bits(entry.flags);
                    record.broadcast_seen = entry.broadcast_seen;
                    record.gateways = entry.gateways.clone();
                    record.sort_gateways();
                }
                if level > 0 {
                    store.set_group_occupancy(level as u8, entry.id, entry.seeds);
                }
            }
        }
        for row in &snapshot.borders {
            store.borders[row.level as usize].link(row.id, row.upper_gid, row.rtt_ms);
            store
                .entity_mut(EntityKey::new(row.level, row.id))
                .flags
                .insert(EntityFlags::BORDER);
        }
        store
    }
}
