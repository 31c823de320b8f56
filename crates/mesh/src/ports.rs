//! Outbound ports.
//!
//! The routing core stays free of sockets and kernel calls: everything that
//! leaves the process goes through these traits. The service binary wires in
//! real implementations; tests substitute in-memory ones.

use crate::error::MeshResult;
use crate::map::{EntityKey, Gateway};
use crate::wire::MeshFrame;
use std::time::Duration;

/// Opaque link-layer address of a directly reachable peer.
pub type PeerAddr = String;

/// Datagram transport toward direct neighbors.
pub trait Transport: Send + Sync {
    /// Send a frame to one neighbor.
    fn send(&self, to: &PeerAddr, frame: &MeshFrame) -> MeshResult<()>;

    /// Broadcast a frame on the local link, reaching every node in radio or
    /// cable range regardless of whether it is known yet.
    fn broadcast(&self, frame: &MeshFrame) -> MeshResult<()>;

    /// Send a frame and block for the matching reply, failing with
    /// `MeshError::Timeout` when none arrives in time.
    fn request(&self, to: &PeerAddr, frame: &MeshFrame, timeout: Duration)
        -> MeshResult<MeshFrame>;
}

/// Kernel routing-table synchronization.
pub trait KernelRoutes: Send + Sync {
    /// Install (or replace) the route toward `entity` via the given ordered
    /// gateway list.
    fn install_route(&self, entity: EntityKey, gateways: &[Gateway]) -> MeshResult<()>;

    /// Remove the route toward a voided entity.
    fn remove_route(&self, entity: EntityKey) -> MeshResult<()>;
}

/// Kernel-route sink that drops every update. Used in tests and on systems
/// where the daemon runs without route-management privileges.
#[derive(Debug, Default)]
pub struct NoopKernelRoutes;

impl KernelRoutes for NoopKernelRoutes {
    fn install_route(&self, _entity: EntityKey, _gateways: &[Gateway]) -> MeshResult<()> {
        Ok(())
    }

    fn remove_route(&self, _entity: EntityKey) -> MeshResult<()> {
        Ok(())
    }
}
