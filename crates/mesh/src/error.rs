//! Error types for Loomnet mesh operations.
//!
//! The taxonomy follows the failure model of the routing core: transport
//! failures are recoverable and surfaced to the caller, protocol validation
//! failures cause the offending packet to be dropped, capacity exhaustion is
//! a normal typed condition, and invariant violations panic.

use thiserror::Error;

/// Errors that can occur in mesh routing operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Transport send/receive failure reported by the collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request/reply exchange timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A tracer packet carried a broadcast counter not newer than one
    /// already merged from the same originator
    #[error("Stale broadcast {got} from originator {originator} (already seen {seen})")]
    StaleBroadcast {
        /// Level-local id of the flood originator
        originator: u8,
        /// Highest counter previously merged
        seen: u32,
        /// Counter carried by the rejected packet
        got: u32,
    },

    /// The last hop of a tracer packet does not resolve to a genuine
    /// current neighbor of the receiver
    #[error("Last hop {id} is not a current neighbor")]
    ForgedLastHop {
        /// Claimed last-hop id
        id: u8,
    },

    /// A packet failed structural validation (hop count, level, border block)
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A group has no free slots left
    #[error("Group {gid} at level {level} is full")]
    GroupFull {
        /// Hierarchy level of the group
        level: u8,
        /// Group id within its level
        gid: u8,
    },

    /// A radar cycle is already in flight; concurrent cycles are rejected,
    /// not queued
    #[error("Radar scan already in progress")]
    ScanInProgress,

    /// Not a single probe could be broadcast during a radar cycle
    #[error("No radar probes could be sent")]
    NoProbesSent,

    /// A radar cycle was finalized without one being started
    #[error("No radar scan in flight")]
    NoActiveScan,

    /// An address failed validation (wrong family, reserved id, bad length)
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The join procedure exhausted every candidate neighbor
    #[error("Hook failed: {0}")]
    HookFailed(String),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
