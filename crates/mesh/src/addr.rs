//! Hierarchical addressing.
//!
//! The address space is organized into levels: level 0 is the set of
//! individual nodes, level `k > 0` groups up to 256 level-`(k-1)` entities
//! into one group node. A node's full address is the ordered array of its
//! per-level group identifiers.

use crate::error::{MeshError, MeshResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum entities per group at any level.
pub const MAX_GROUP_SIZE: usize = 256;

/// Address family the mesh runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    /// 5-level hierarchy
    Ipv4,
    /// 15-level hierarchy
    Ipv6,
}

impl AddrFamily {
    /// Number of hierarchy levels for this family.
    pub fn levels(&self) -> u8 {
        match self {
            AddrFamily::Ipv4 => 5,
            AddrFamily::Ipv6 => 15,
        }
    }

    /// Parse a family name from configuration.
    pub fn from_name(name: &str) -> MeshResult<Self> {
        match name {
            "ipv4" => Ok(AddrFamily::Ipv4),
            "ipv6" => Ok(AddrFamily::Ipv6),
            other => Err(MeshError::InvalidAddress(format!(
                "unknown address family: {other}"
            ))),
        }
    }

    /// Whether `gid` is reserved at the top hierarchy level and must never
    /// be assigned or accepted (loopback, multicast, broadcast, private
    /// ranges).
    pub fn is_reserved_top_gid(&self, gid: u8) -> bool {
        match self {
            AddrFamily::Ipv4 => matches!(gid, 0 | 10 | 127 | 172 | 192) || gid >= 224,
            AddrFamily::Ipv6 => matches!(gid, 0 | 0xfe | 0xff),
        }
    }
}

/// Full hierarchical address of a node: one group identifier per level.
///
/// `gid(0)` is the node id inside its level-1 group, `gid(levels-1)` the
/// top-level group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierAddr {
    family: AddrFamily,
    gids: Vec<u8>,
}

impl HierAddr {
    /// Build an address from per-level group ids. The id array length must
    /// match the family's level count and the top-level id must not be
    /// reserved.
    pub fn new(family: AddrFamily, gids: Vec<u8>) -> MeshResult<Self> {
        if gids.len() != family.levels() as usize {
            return Err(MeshError::InvalidAddress(format!(
                "expected {} levels, got {}",
                family.levels(),
                gids.len()
            )));
        }
        let top = gids[gids.len() - 1];
        if family.is_reserved_top_gid(top) {
            return Err(MeshError::InvalidAddress(format!(
                "top-level gid {top} is reserved"
            )));
        }
        Ok(Self { family, gids })
    }

    /// Address family.
    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Number of hierarchy levels.
    pub fn levels(&self) -> u8 {
        self.family.levels()
    }

    /// Group identifier at `level`. Panics if `level` is out of range;
    /// addressing beyond the hierarchy depth is a programming error.
    pub fn gid(&self, level: u8) -> u8 {
        self.gids[level as usize]
    }

    /// Replace the group identifier at `level`.
    pub fn set_gid(&mut self, level: u8, gid: u8) {
        self.gids[level as usize] = gid;
    }

    /// Lowest level at which this address and `other` diverge, or `None`
    /// when they are the same node. Two nodes belong to the same group at
    /// every level strictly above the returned value.
    pub fn divergence_level(&self, other: &HierAddr) -> Option<u8> {
        debug_assert_eq!(self.family, other.family);
        for level in (0..self.levels()).rev() {
            if self.gid(level) != other.gid(level) {
                return Some(level);
            }
        }
        None
    }

    /// Whether both addresses sit in the same group at every level strictly
    /// above `level`.
    pub fn same_group_above(&self, other: &HierAddr, level: u8) -> bool {
        match self.divergence_level(other) {
            None => true,
            Some(div) => div <= level,
        }
    }

    /// Pick a random, non-reserved address. Used by the join procedure when
    /// the node finds itself alone and must found a brand-new hierarchy.
    pub fn random<R: Rng>(family: AddrFamily, rng: &mut R) -> Self {
        let levels = family.levels() as usize;
        let mut gids: Vec<u8> = (0..levels).map(|_| rng.gen()).collect();
        let top = levels - 1;
        while family.is_reserved_top_gid(gids[top]) {
            gids[top] = rng.gen();
        }
        Self { family, gids }
    }
}

impl std::fmt::Display for HierAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.gids.iter().rev().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_family_levels() {
        assert_eq!(AddrFamily::Ipv4.levels(), 5);
        assert_eq!(AddrFamily::Ipv6.levels(), 15);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let result = HierAddr::new(AddrFamily::Ipv4, vec![1, 2, 3]);
        assert!(matches!(result, Err(MeshError::InvalidAddress(_))));
    }

    #[test]
    fn test_new_rejects_reserved_top_gid() {
        // 127 is the loopback block for the 5-level family
        let result = HierAddr::new(AddrFamily::Ipv4, vec![1, 2, 3, 4, 127]);
        assert!(matches!(result, Err(MeshError::InvalidAddress(_))));
    }

    #[test]
    fn test_reserved_ranges() {
        assert!(AddrFamily::Ipv4.is_reserved_top_gid(0));
        assert!(AddrFamily::Ipv4.is_reserved_top_gid(10));
        assert!(AddrFamily::Ipv4.is_reserved_top_gid(224));
        assert!(AddrFamily::Ipv4.is_reserved_top_gid(255));
        assert!(!AddrFamily::Ipv4.is_reserved_top_gid(42));

        assert!(AddrFamily::Ipv6.is_reserved_top_gid(0xff));
        assert!(!AddrFamily::Ipv6.is_reserved_top_gid(0x20));
    }

    #[test]
    fn test_divergence_level() {
        let a = HierAddr::new(AddrFamily::Ipv4, vec![7, 2, 3, 4, 5]).unwrap();
        let b = HierAddr::new(AddrFamily::Ipv4, vec![9, 2, 3, 4, 5]).unwrap();
        assert_eq!(a.divergence_level(&b), Some(0));
        assert!(a.same_group_above(&b, 0));

        let c = HierAddr::new(AddrFamily::Ipv4, vec![7, 8, 3, 4, 5]).unwrap();
        assert_eq!(a.divergence_level(&c), Some(1));
        assert!(!a.same_group_above(&c, 0));
        assert!(a.same_group_above(&c, 1));

        assert_eq!(a.divergence_level(&a), None);
    }

    #[test]
    fn test_random_never_reserved() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let addr = HierAddr::random(AddrFamily::Ipv4, &mut rng);
            assert!(!AddrFamily::Ipv4.is_reserved_top_gid(addr.gid(4)));
        }
    }

    #[test]
    fn test_display_orders_top_down() {
        let a = HierAddr::new(AddrFamily::Ipv4, vec![1, 2, 3, 4, 5]).unwrap();
        assert_eq!(a.to_string(), "5.4.3.2.1");
    }
}
