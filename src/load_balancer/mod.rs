//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request needs an upstream group
//!     → pool.rs (look up the group, create per-request state)
//!     → Apply the group's selection algorithm:
//!         - ip_hash.rs (client address affinity over the weight space)
//!         - round_robin.rs (smooth weighted rotation, also the fallback)
//!     → registry.rs (peer list + health bookkeeping, under one lock)
//!     → Return a PeerTarget or SelectError
//!
//! Connection attempt finished
//!     → health/passive.rs (count failures, release the connection slot)
//!     → On failure the caller selects again with the same state
//! ```
//!
//! # Design Decisions
//! - Per-request state is owned by the request, never shared
//! - The affinity state contains the round-robin state, so falling back
//!   reuses the same tried bitmap
//! - Unavailable peers are skipped, never removed

use std::net::IpAddr;
use std::time::Instant;
use thiserror::Error;

pub mod ip_hash;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod round_robin;
pub mod tried;

pub use ip_hash::{ClientKey, IpHash, IpHashState};
pub use peer::{Peer, PeerSnapshot, PeerTarget};
pub use pool::{SelectionState, Upstream, UpstreamManager, UpstreamRequest};
pub use registry::{PeerRegistry, Peers};
pub use round_robin::{RoundRobin, RoundRobinState};
pub use tried::TriedPeers;

/// Why no peer could be handed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// Every candidate is down, failed, or already tried.
    #[error("no live peers in upstream \"{group}\"")]
    NoLivePeers { group: String },

    /// The requested upstream group does not exist.
    #[error("unknown upstream \"{0}\"")]
    UnknownGroup(String),
}

/// A peer selection algorithm bound to one registry.
pub trait PeerSelector {
    /// Per-request state threaded through repeated attempts.
    type State;

    /// Create the state for a new request from the client's address.
    /// `None` stands for a non-IP client (e.g. a unix socket).
    fn init_peer(&self, client: Option<IpAddr>) -> Self::State;

    /// Select a peer as of `now`.
    fn select_at(&self, state: &mut Self::State, now: Instant) -> Result<PeerTarget, SelectError>;

    /// Select a peer for the next connection attempt.
    fn select(&self, state: &mut Self::State) -> Result<PeerTarget, SelectError> {
        self.select_at(state, Instant::now())
    }
}
