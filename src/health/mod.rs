//! Health tracking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health checks (passive.rs):
//!     Connection attempt finished
//!     → Increment failure count / reset window
//!     → Peer skipped by selectors while fails >= max_fails within fail_timeout
//! ```
//!
//! # Design Decisions
//! - No probing: health is inferred from real traffic only
//! - Failure windows are reset lazily on selection, no timers
//! - Health state is per-peer, kept in the peer registry

pub mod passive;

pub use passive::{free_peer, free_peer_at, PeerOutcome};
