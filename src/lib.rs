//! Upstream peer selection for a reverse proxy.
//!
//! Picks the backend peer for each connection attempt of a request, by
//! client address affinity (`ip_hash`) or smooth weighted round robin,
//! honouring weights, the `down` flag and passive failure windows.

pub mod config;
pub mod health;
pub mod load_balancer;
pub mod observability;

pub use config::schema::BalancerConfig;
pub use health::PeerOutcome;
pub use load_balancer::{
    PeerSelector, PeerTarget, SelectError, Upstream, UpstreamManager, UpstreamRequest,
};
