//! Peer abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server inside an upstream group
//! - Carry the static selection inputs (weight, failure policy, down flag)
//! - Carry the mutable bookkeeping shared by every selector
//!
//! All mutable fields are only touched while the owning registry's write
//! lock is held.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PeerConfig;

/// A single backend server.
#[derive(Debug)]
pub struct Peer {
    /// Display name used in logs and metrics.
    pub name: Arc<str>,
    /// Address to connect to.
    pub addr: SocketAddr,
    /// Size of this peer's slice of the weight space.
    pub weight: u32,
    /// Failures tolerated within `fail_timeout`. Zero disables the check.
    pub max_fails: u32,
    /// Length of the failure-counting window.
    pub fail_timeout: Duration,
    /// Administratively disabled.
    pub down: bool,

    /// Failures counted in the current window.
    pub fails: u32,
    /// Start of the current failure window.
    pub checked: Instant,
    /// Time of the last reported failure.
    pub accessed: Option<Instant>,
    /// Connections handed out and not yet released.
    pub conns: usize,

    pub(crate) current_weight: i64,
    pub(crate) effective_weight: i64,
}

impl Peer {
    /// Create a peer with default health settings.
    pub fn new(addr: SocketAddr, weight: u32) -> Self {
        Self::with_name(addr.to_string(), addr, weight)
    }

    pub fn with_name(name: impl Into<Arc<str>>, addr: SocketAddr, weight: u32) -> Self {
        Self {
            name: name.into(),
            addr,
            weight,
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            down: false,
            fails: 0,
            checked: Instant::now(),
            accessed: None,
            conns: 0,
            current_weight: 0,
            effective_weight: i64::from(weight),
        }
    }

    /// Build a peer from validated configuration.
    pub(crate) fn from_config(config: &PeerConfig, addr: SocketAddr) -> Self {
        let mut peer = Self::with_name(config.display_name(), addr, config.weight);
        peer.max_fails = config.max_fails;
        peer.fail_timeout = config.fail_timeout();
        peer.down = config.down;
        peer
    }

    /// Whether the peer exhausted its failure budget and the window is still open.
    pub fn is_failed(&self, now: Instant) -> bool {
        self.max_fails > 0
            && self.fails >= self.max_fails
            && now.saturating_duration_since(self.checked) <= self.fail_timeout
    }

    /// Eligible for selection: not down and not failed.
    pub fn is_available(&self, now: Instant) -> bool {
        !self.down && !self.is_failed(now)
    }

    /// Start a new failure window once the previous one expired.
    pub(crate) fn refresh_checked(&mut self, now: Instant) {
        if now.saturating_duration_since(self.checked) > self.fail_timeout {
            self.checked = now;
        }
    }

    /// Carry runtime bookkeeping over from the peer this one replaces.
    pub(crate) fn inherit(&mut self, old: &Peer) {
        self.fails = old.fails;
        self.checked = old.checked;
        self.accessed = old.accessed;
        self.conns = old.conns;
    }

    pub fn snapshot(&self, now: Instant) -> PeerSnapshot {
        PeerSnapshot {
            name: self.name.to_string(),
            addr: self.addr,
            weight: self.weight,
            down: self.down,
            fails: self.fails,
            conns: self.conns,
            available: self.is_available(now),
        }
    }
}

/// Where the caller should connect after a successful selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerTarget {
    /// Position of the peer in its registry.
    pub index: usize,
    pub addr: SocketAddr,
    pub name: Arc<str>,
}

impl PeerTarget {
    pub(crate) fn new(index: usize, peer: &Peer) -> Self {
        Self {
            index,
            addr: peer.addr,
            name: peer.name.clone(),
        }
    }
}

/// Point-in-time view of a peer for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u32,
    pub down: bool,
    pub fails: u32,
    pub conns: usize,
    pub available: bool,
}
