//! Loomnet Mesh - Hierarchical Mesh Routing Core
//!
//! Implements the routing layer of a decentralized, self-organizing mesh:
//! nodes discover their link neighbors, arrange themselves into a recursive
//! 256-ary group hierarchy, and learn latency-ranked routes toward every
//! known entity through leaderless tracer floods.
//!
//! # Core Components
//!
//! - **Hierarchical Maps**: Fixed-arena stores of nodes, group nodes and
//!   border links, addressed by stable `(level, id)` keys
//! - **Radar**: Periodic probe/echo neighbor discovery with jitter-damped
//!   latency averaging
//! - **Tracer Floods**: Append-only path broadcasts that double as routing
//!   announcements, loop-suppressed by per-originator counters
//! - **Hook**: The join procedure; a booting node adopts a donor's maps or
//!   founds a fresh network when alone
//! - **Persistence**: Sqlite snapshots so a restarted node comes back warm
//!
//! The crate is synchronous and socket-free; the daemon binary supplies the
//! transport, the kernel-route sink and all timing.

pub mod addr;
pub mod border;
pub mod context;
pub mod error;
pub mod hook;
pub mod map;
pub mod persist;
pub mod ports;
pub mod radar;
pub mod ranking;
pub mod tracer;
pub mod wire;

pub use addr::{AddrFamily, HierAddr, MAX_GROUP_SIZE};
pub use context::RoutingContext;
pub use error::{MeshError, MeshResult};
pub use hook::{run_hook, HookOutcome, HookReport};
pub use map::{EntityFlags, EntityKey, Gateway, MapSnapshot, MapStore, MAX_ROUTES};
pub use persist::MapDb;
pub use ports::{KernelRoutes, NoopKernelRoutes, PeerAddr, Transport};
pub use radar::{RadarCycle, RadarNeighbor, RadarReport, RadarScanner};
pub use ranking::{Decision, RouteRanker};
pub use tracer::{FloodExclude, TracerPacket};
pub use wire::{FreeSlots, MeshFrame, MeshPayload};
