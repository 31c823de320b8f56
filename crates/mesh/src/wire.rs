//! Wire payloads.
//!
//! Every datagram a node sends or receives carries exactly one of these
//! payloads, serialized as JSON. The envelope identifies the sender by its
//! full hierarchical address so the receiver can resolve it to level-local
//! ids without a separate lookup protocol.

use crate::addr::HierAddr;
use crate::map::MapSnapshot;
use crate::tracer::TracerPacket;
use serde::{Deserialize, Serialize};

/// Free-slot report for one group, returned during the join procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSlots {
    /// Level the reporting group sits at
    pub level: u8,
    /// The reporting group's id at that level
    pub gid: u8,
    /// Unoccupied, non-reserved slot ids inside the group
    pub slots: Vec<u8>,
    /// Occupied slot count, for the joiner's occupancy bookkeeping
    pub occupancy: u16,
}

/// The payload of one mesh datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshPayload {
    /// Neighbor discovery probe, broadcast to the link.
    RadarProbe {
        /// Correlates echoes with the scan cycle that sent the probe
        echo_id: u32,
        /// The prober has no settled address yet and must not be routed to
        hooking: bool,
    },
    /// Unicast reply to a probe.
    RadarEcho {
        /// Echo id copied from the probe
        echo_id: u32,
        /// The responder's full hierarchical address
        hier: HierAddr,
        /// The responder is itself still joining
        hooking: bool,
    },
    /// A tracer flood packet, relayed hop by hop.
    Tracer(TracerPacket),
    /// Join procedure: ask a settled neighbor for free slots in its group.
    FreeSlotsRequest,
    /// Join procedure: the free-slot report.
    FreeSlotsReply(FreeSlots),
    /// Join procedure: ask a settled neighbor for its full map image.
    MapRequest,
    /// Join procedure: the map image.
    MapReply(MapSnapshot),
}

/// One framed datagram: sender identity plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshFrame {
    /// The sender's full hierarchical address, absent only while the sender
    /// is hooking and owns no address yet
    pub sender: Option<HierAddr>,
    /// The payload proper
    pub payload: MeshPayload,
}

impl MeshFrame {
    /// Frame a payload from a settled sender.
    pub fn from_node(sender: HierAddr, payload: MeshPayload) -> Self {
        Self {
            sender: Some(sender),
            payload,
        }
    }

    /// Frame a payload from a sender that has no address yet.
    pub fn anonymous(payload: MeshPayload) -> Self {
        Self {
            sender: None,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddrFamily;

    #[test]
    fn test_frame_round_trip() {
        let sender = HierAddr::new(AddrFamily::Ipv4, vec![7, 2, 3, 4, 5]).unwrap();
        let frame = MeshFrame::from_node(
            sender,
            MeshPayload::RadarEcho {
                echo_id: 42,
                hier: HierAddr::new(AddrFamily::Ipv4, vec![9, 2, 3, 4, 5]).unwrap(),
                hooking: false,
            },
        );

        let bytes = serde_json::to_vec(&frame).unwrap();
        let decoded: MeshFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_map_reply_round_trip() {
        use crate::map::MapStore;

        let sender = HierAddr::new(AddrFamily::Ipv4, vec![7, 2, 3, 4, 5]).unwrap();
        let mut store = MapStore::new(AddrFamily::Ipv4);
        store.init_self(&sender);
        store.border_link(0, 7, 9, 25);

        let frame = MeshFrame::from_node(sender, MeshPayload::MapReply(store.snapshot()));
        let bytes = serde_json::to_vec(&frame).unwrap();
        let decoded: MeshFrame = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_anonymous_probe_has_no_sender() {
        let frame = MeshFrame::anonymous(MeshPayload::RadarProbe {
            echo_id: 1,
            hooking: true,
        });
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: MeshFrame = serde_json::from_str(&json).unwrap();
        assert!(decoded.sender.is_none());
        assert!(json.contains("radar_probe"));
    }
}
