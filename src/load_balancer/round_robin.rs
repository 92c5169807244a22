//! Smooth weighted round-robin strategy.
//!
//! Every eligible peer gains its effective weight on each pick; the peer with
//! the highest running total wins and pays back the sum. Over one cycle each
//! peer is picked `weight` times, interleaved rather than in bursts.
//!
//! Also the fallback for [`IpHash`](crate::load_balancer::IpHash).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::load_balancer::{
    peer::PeerTarget,
    registry::{PeerHandle, PeerRegistry, Peers},
    tried::TriedPeers,
    PeerSelector, SelectError,
};
use crate::observability::metrics;

/// Round-robin per-request state.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinState {
    pub(crate) tried: TriedPeers,
    pub(crate) current: Option<PeerHandle>,
    generation: u64,
}

impl RoundRobinState {
    pub fn new(peers: &Peers) -> Self {
        Self {
            tried: TriedPeers::with_capacity(peers.len()),
            current: None,
            generation: peers.generation(),
        }
    }

    /// Peers already handed out or rejected during this request.
    pub fn tried(&self) -> &TriedPeers {
        &self.tried
    }

    /// Peer handed out by the last successful selection, until released.
    pub fn current(&self) -> Option<usize> {
        self.current.as_ref().map(PeerHandle::index)
    }

    /// Registry generation the tried set refers to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Carry the tried set over to a reconfigured registry.
    ///
    /// Only one reconfiguration is tracked; a request further behind starts
    /// over with an empty set.
    pub(crate) fn resync(&mut self, peers: &Peers) {
        if self.generation == peers.generation() {
            return;
        }
        self.tried = if self.generation + 1 == peers.generation() {
            self.tried.remap(peers.previous_positions())
        } else {
            TriedPeers::with_capacity(peers.len())
        };
        self.generation = peers.generation();
    }
}

/// Round-robin selector.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    registry: Arc<PeerRegistry>,
}

impl RoundRobin {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    fn no_live_peers(&self) -> SelectError {
        tracing::debug!(group = %self.registry.name(), "No live peers for round robin");
        SelectError::NoLivePeers {
            group: self.registry.name().to_string(),
        }
    }
}

impl PeerSelector for RoundRobin {
    type State = RoundRobinState;

    fn init_peer(&self, _client: Option<IpAddr>) -> RoundRobinState {
        RoundRobinState::new(&self.registry.read())
    }

    fn select_at(
        &self,
        state: &mut RoundRobinState,
        now: Instant,
    ) -> Result<PeerTarget, SelectError> {
        let mut peers = self.registry.write();
        state.resync(&peers);

        let index = if peers.is_single() {
            // failure accounting is not applied to a lone peer
            if peers.list()[0].down {
                return Err(self.no_live_peers());
            }
            0
        } else {
            let mut best: Option<(usize, i64)> = None;
            let mut total: i64 = 0;

            for (i, peer) in peers.list_mut().iter_mut().enumerate() {
                if state.tried.contains(i) || !peer.is_available(now) {
                    continue;
                }

                peer.current_weight += peer.effective_weight;
                total += peer.effective_weight;

                if peer.effective_weight < i64::from(peer.weight) {
                    peer.effective_weight += 1;
                }

                if best.map_or(true, |(_, weight)| peer.current_weight > weight) {
                    best = Some((i, peer.current_weight));
                }
            }

            let Some((index, _)) = best else {
                return Err(self.no_live_peers());
            };

            let peer = &mut peers.list_mut()[index];
            peer.current_weight -= total;
            peer.refresh_checked(now);
            index
        };

        let peer = &mut peers.list_mut()[index];
        peer.conns += 1;
        let target = PeerTarget::new(index, peer);
        let conns = peer.conns;
        let handle = peers.handle(index);
        drop(peers);

        state.current = Some(handle);
        state.tried.insert(index);

        tracing::debug!(
            group = %self.registry.name(),
            peer = %target.name,
            index,
            "Selected round robin peer"
        );
        metrics::record_selection(self.registry.name(), "round_robin", &target.name);
        metrics::record_active_connections(self.registry.name(), &target.name, conns);

        Ok(target)
    }
}
