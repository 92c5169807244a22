//! Peer registry.
//!
//! # Responsibilities
//! - Own the ordered peer list of one upstream group
//! - Keep aggregate metadata (total weight, single-peer flag) consistent
//! - Guard all peer bookkeeping behind one reader/writer lock
//! - Swap the peer list on reconfiguration, numbering each list with a
//!   generation so in-flight requests can find their peers again
//!
//! # Design Decisions
//! - Peer order is significant: it defines the layout of the weight space
//! - A selection attempt holds the write lock for its whole duration so the
//!   weight walk and health checks see one consistent snapshot

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::validation::validate_upstream;
use crate::config::{ConfigError, UpstreamConfig, ValidationError};
use crate::load_balancer::peer::{Peer, PeerSnapshot};

/// Peer list plus aggregate metadata. Only reachable through a registry guard.
#[derive(Debug)]
pub struct Peers {
    list: Vec<Peer>,
    total_weight: u32,
    single: bool,
    generation: u64,
    /// Where each peer of the previous generation went; `None` if removed.
    previous: Vec<Option<usize>>,
}

/// A peer handed out to a request.
///
/// Stays meaningful after the registry is reconfigured: a stale handle is
/// resolved again by address and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerHandle {
    generation: u64,
    index: usize,
    addr: SocketAddr,
    name: Arc<str>,
}

impl PeerHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl Peers {
    fn new(group: &str, list: Vec<Peer>) -> Result<Self, ConfigError> {
        if list.is_empty() {
            return Err(ConfigError::Validation(vec![ValidationError::NoPeers(
                group.to_string(),
            )]));
        }

        let mut errors = Vec::new();
        let mut total_weight: u32 = 0;
        for peer in &list {
            if peer.weight == 0 {
                errors.push(ValidationError::ZeroWeight {
                    group: group.to_string(),
                    peer: peer.name.to_string(),
                });
            }
            match total_weight.checked_add(peer.weight) {
                Some(sum) => total_weight = sum,
                None => {
                    errors.push(ValidationError::WeightOverflow(group.to_string()));
                    break;
                }
            }
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        Ok(Self {
            single: list.len() == 1,
            list,
            total_weight,
            generation: 0,
            previous: Vec::new(),
        })
    }

    pub fn list(&self) -> &[Peer] {
        &self.list
    }

    pub fn get(&self, index: usize) -> Option<&Peer> {
        self.list.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Peer> {
        self.list.get_mut(index)
    }

    pub(crate) fn list_mut(&mut self) -> &mut [Peer] {
        &mut self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn total_weight(&self) -> u32 {
        self.total_weight
    }

    /// Exactly one peer configured.
    pub fn is_single(&self) -> bool {
        self.single
    }

    /// Bumped by every reconfiguration.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// New positions of the previous generation's peers.
    pub(crate) fn previous_positions(&self) -> &[Option<usize>] {
        &self.previous
    }

    pub(crate) fn handle(&self, index: usize) -> PeerHandle {
        let peer = &self.list[index];
        PeerHandle {
            generation: self.generation,
            index,
            addr: peer.addr,
            name: peer.name.clone(),
        }
    }

    /// Current index of a handed-out peer, `None` once it was removed.
    pub(crate) fn resolve(&self, handle: &PeerHandle) -> Option<usize> {
        if handle.generation == self.generation {
            return (handle.index < self.list.len()).then_some(handle.index);
        }
        self.list
            .iter()
            .position(|p| p.addr == handle.addr && p.name == handle.name)
    }

    /// Index of the peer whose weight slice contains `offset`.
    ///
    /// `offset` must be below `total_weight`.
    pub fn position_of(&self, mut offset: u32) -> usize {
        for (index, peer) in self.list.iter().enumerate() {
            if offset < peer.weight {
                return index;
            }
            offset -= peer.weight;
        }
        self.list.len() - 1
    }
}

/// Shared, lock-guarded peer list of one upstream group.
#[derive(Debug)]
pub struct PeerRegistry {
    name: String,
    peers: RwLock<Peers>,
}

impl PeerRegistry {
    /// Create a registry from an explicit peer list.
    pub fn new(name: impl Into<String>, peers: Vec<Peer>) -> Result<Self, ConfigError> {
        let name = name.into();
        let peers = Peers::new(&name, peers)?;
        Ok(Self {
            name,
            peers: RwLock::new(peers),
        })
    }

    /// Create a registry from upstream configuration.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        Self::new(config.name.clone(), peers_from_config(config)?)
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the exclusive lock. Dropping the guard unlocks.
    pub fn write(&self) -> RwLockWriteGuard<'_, Peers> {
        self.peers.write().expect("peer registry lock poisoned")
    }

    /// Acquire the shared lock.
    pub fn read(&self) -> RwLockReadGuard<'_, Peers> {
        self.peers.read().expect("peer registry lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn total_weight(&self) -> u32 {
        self.read().total_weight()
    }

    pub fn is_single(&self) -> bool {
        self.read().is_single()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        self.read().list().iter().map(|p| p.snapshot(now)).collect()
    }

    /// Replace the peer list in place.
    ///
    /// Peers whose name and address are unchanged keep their failure and
    /// connection bookkeeping.
    pub fn reconfigure(&self, config: &UpstreamConfig) -> Result<(), ConfigError> {
        let mut list = peers_from_config(config)?;

        let mut peers = self.write();
        let mut previous = vec![None; peers.len()];
        for (index, peer) in list.iter_mut().enumerate() {
            if let Some(old) = peers
                .list()
                .iter()
                .position(|old| old.addr == peer.addr && old.name == peer.name)
            {
                peer.inherit(&peers.list()[old]);
                previous[old] = Some(index);
            }
        }

        let mut next = Peers::new(&self.name, list)?;
        next.generation = peers.generation + 1;
        next.previous = previous;
        *peers = next;

        tracing::info!(
            group = %self.name,
            generation = peers.generation,
            peers = peers.len(),
            total_weight = peers.total_weight(),
            "Peer registry reconfigured"
        );
        Ok(())
    }
}

fn peers_from_config(config: &UpstreamConfig) -> Result<Vec<Peer>, ConfigError> {
    validate_upstream(config).map_err(ConfigError::Validation)?;

    let mut list = Vec::with_capacity(config.peers.len());
    for peer in &config.peers {
        let addr: SocketAddr = peer.address.parse().map_err(|_| {
            ConfigError::Validation(vec![ValidationError::InvalidAddress {
                group: config.name.clone(),
                address: peer.address.clone(),
            }])
        })?;
        list.push(Peer::from_config(peer, addr));
    }
    Ok(list)
}
