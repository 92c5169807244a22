//! Upstream group management.
//!
//! # Responsibilities
//! - Manage upstream groups by name
//! - Bind each group's registry to its selection algorithm
//! - Hand out per-request selection state
//! - Apply reloaded configuration without dropping in-flight requests

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::validation::validate_upstreams;
use crate::config::{BalanceMethod, ConfigError, UpstreamConfig};
use crate::health::passive::{free_peer_at, PeerOutcome};
use crate::load_balancer::{
    ip_hash::{IpHash, IpHashState},
    peer::{PeerSnapshot, PeerTarget},
    registry::PeerRegistry,
    round_robin::{RoundRobin, RoundRobinState},
    PeerSelector, SelectError,
};

/// Selection algorithm of one group.
#[derive(Debug, Clone)]
enum Balancer {
    RoundRobin(RoundRobin),
    IpHash(IpHash),
}

/// Per-request state for whichever algorithm the group uses.
#[derive(Debug, Clone)]
pub enum SelectionState {
    RoundRobin(RoundRobinState),
    IpHash(IpHashState),
}

impl SelectionState {
    /// The round-robin part, which every state carries.
    pub fn round_robin(&self) -> &RoundRobinState {
        match self {
            SelectionState::RoundRobin(state) => state,
            SelectionState::IpHash(state) => state.round_robin(),
        }
    }

    pub fn round_robin_mut(&mut self) -> &mut RoundRobinState {
        match self {
            SelectionState::RoundRobin(state) => state,
            SelectionState::IpHash(state) => state.round_robin_mut(),
        }
    }

    /// Rejected ip_hash candidates; always zero for round robin.
    pub fn tries(&self) -> u8 {
        match self {
            SelectionState::RoundRobin(_) => 0,
            SelectionState::IpHash(state) => state.tries(),
        }
    }
}

/// One upstream group: a registry plus its algorithm.
#[derive(Debug)]
pub struct Upstream {
    method: BalanceMethod,
    registry: Arc<PeerRegistry>,
    balancer: Balancer,
}

impl Upstream {
    /// Create an upstream group from configuration.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        let registry = Arc::new(PeerRegistry::from_config(config)?);
        Ok(Self::new(config.method, registry))
    }

    pub fn new(method: BalanceMethod, registry: Arc<PeerRegistry>) -> Self {
        let balancer = match method {
            BalanceMethod::RoundRobin => Balancer::RoundRobin(RoundRobin::new(registry.clone())),
            BalanceMethod::IpHash => Balancer::IpHash(IpHash::new(registry.clone())),
        };
        Self {
            method,
            registry,
            balancer,
        }
    }

    pub fn name(&self) -> &str {
        self.registry.name()
    }

    pub fn method(&self) -> BalanceMethod {
        self.method
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.registry.snapshot()
    }

    /// Create the state for a new request.
    pub fn init_peer(&self, client: Option<IpAddr>) -> SelectionState {
        match &self.balancer {
            Balancer::RoundRobin(lb) => SelectionState::RoundRobin(lb.init_peer(client)),
            Balancer::IpHash(lb) => SelectionState::IpHash(lb.init_peer(client)),
        }
    }

    pub fn select(&self, state: &mut SelectionState) -> Result<PeerTarget, SelectError> {
        self.select_at(state, Instant::now())
    }

    /// Select a peer as of `now`.
    ///
    /// A state created for the other algorithm is served through its
    /// round-robin part.
    pub fn select_at(
        &self,
        state: &mut SelectionState,
        now: Instant,
    ) -> Result<PeerTarget, SelectError> {
        match (&self.balancer, state) {
            (Balancer::IpHash(lb), SelectionState::IpHash(state)) => lb.select_at(state, now),
            (Balancer::IpHash(lb), SelectionState::RoundRobin(state)) => {
                lb.fallback().select_at(state, now)
            }
            (Balancer::RoundRobin(lb), state) => lb.select_at(state.round_robin_mut(), now),
        }
    }

    /// Report how the connection to the current peer ended.
    pub fn free_peer(&self, state: &mut SelectionState, outcome: PeerOutcome) {
        free_peer_at(&self.registry, state.round_robin_mut(), outcome, Instant::now());
    }

    pub fn free_peer_at(&self, state: &mut SelectionState, outcome: PeerOutcome, now: Instant) {
        free_peer_at(&self.registry, state.round_robin_mut(), outcome, now);
    }
}

/// A request's handle on one upstream group.
///
/// Lives as long as the request; dropping it discards the selection state.
#[derive(Debug)]
pub struct UpstreamRequest {
    upstream: Arc<Upstream>,
    state: SelectionState,
}

impl UpstreamRequest {
    pub fn new(upstream: Arc<Upstream>, client: Option<IpAddr>) -> Self {
        let state = upstream.init_peer(client);
        Self { upstream, state }
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    /// Select a peer for the next connection attempt.
    pub fn select(&mut self) -> Result<PeerTarget, SelectError> {
        self.upstream.select(&mut self.state)
    }

    pub fn select_at(&mut self, now: Instant) -> Result<PeerTarget, SelectError> {
        self.upstream.select_at(&mut self.state, now)
    }

    /// Report the outcome of the last attempt.
    pub fn free(&mut self, outcome: PeerOutcome) {
        self.upstream.free_peer(&mut self.state, outcome);
    }

    pub fn free_at(&mut self, outcome: PeerOutcome, now: Instant) {
        self.upstream.free_peer_at(&mut self.state, outcome, now);
    }
}

type Groups = HashMap<String, Arc<Upstream>>;

/// Manages upstream groups and their reloads.
#[derive(Debug)]
pub struct UpstreamManager {
    groups: ArcSwap<Groups>,
}

impl UpstreamManager {
    /// Create a new upstream manager from configuration.
    pub fn new(configs: &[UpstreamConfig]) -> Result<Self, ConfigError> {
        validate_upstreams(configs).map_err(ConfigError::Validation)?;

        let mut groups = Groups::new();
        for config in configs {
            let upstream = Upstream::from_config(config)?;
            tracing::info!(
                group = %config.name,
                method = config.method.as_str(),
                peers = config.peers.len(),
                "Upstream group configured"
            );
            groups.insert(config.name.clone(), Arc::new(upstream));
        }

        Ok(Self {
            groups: ArcSwap::from_pointee(groups),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.groups.load().get(name).cloned()
    }

    /// Group names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start selecting for a new request.
    pub fn request(
        &self,
        group: &str,
        client: Option<IpAddr>,
    ) -> Result<UpstreamRequest, SelectError> {
        let upstream = self.get(group).ok_or_else(|| {
            tracing::debug!(group = %group, "Group not found in UpstreamManager");
            SelectError::UnknownGroup(group.to_string())
        })?;
        Ok(UpstreamRequest::new(upstream, client))
    }

    /// Apply a new set of upstream groups.
    ///
    /// Groups that keep their name and method are reconfigured in place so
    /// in-flight requests see the new peers; the rest are replaced. Nothing
    /// changes if any group is invalid.
    pub fn reload(&self, configs: &[UpstreamConfig]) -> Result<(), ConfigError> {
        validate_upstreams(configs).map_err(ConfigError::Validation)?;

        let current = self.groups.load();
        let mut next = Groups::new();
        let mut reconfigure = Vec::new();

        for config in configs {
            match current.get(&config.name) {
                Some(existing) if existing.method() == config.method => {
                    reconfigure.push((existing.clone(), config));
                    next.insert(config.name.clone(), existing.clone());
                }
                _ => {
                    next.insert(config.name.clone(), Arc::new(Upstream::from_config(config)?));
                }
            }
        }

        for (upstream, config) in reconfigure {
            upstream.registry().reconfigure(config)?;
        }

        let removed = current.keys().filter(|name| !next.contains_key(*name)).count();
        tracing::info!(groups = next.len(), removed, "Upstream groups reloaded");

        self.groups.store(Arc::new(next));
        Ok(())
    }
}
