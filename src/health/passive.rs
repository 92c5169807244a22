//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe connection outcomes reported by the caller
//! - Count failures within the peer's failure window
//! - Release the connection slot taken at selection time
//!
//! # Design Decisions
//! - A failure also lowers the peer's effective weight for round robin; it
//!   recovers by one per round-robin pick
//! - A success only clears the counter when the last failure happened before
//!   the current window started
//! - A lone peer is never marked failed

use std::time::Instant;

use crate::load_balancer::{registry::PeerRegistry, round_robin::RoundRobinState};
use crate::observability::metrics;

/// How the connection attempt to the selected peer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Success,
    Failed,
}

/// Report the outcome for the request's current peer.
pub fn free_peer(registry: &PeerRegistry, state: &mut RoundRobinState, outcome: PeerOutcome) {
    free_peer_at(registry, state, outcome, Instant::now())
}

/// Same as [`free_peer`] as of `now`.
pub fn free_peer_at(
    registry: &PeerRegistry,
    state: &mut RoundRobinState,
    outcome: PeerOutcome,
    now: Instant,
) {
    let Some(handle) = state.current.take() else {
        return;
    };

    let mut peers = registry.write();
    let single = peers.is_single();
    let Some(index) = peers.resolve(&handle) else {
        tracing::debug!(
            group = %registry.name(),
            index = handle.index(),
            "Released peer was removed by reconfiguration"
        );
        return;
    };
    let Some(peer) = peers.get_mut(index) else {
        return;
    };

    if !single {
        match outcome {
            PeerOutcome::Failed => {
                peer.fails += 1;
                peer.accessed = Some(now);
                peer.checked = now;

                if peer.max_fails > 0 {
                    peer.effective_weight -= i64::from(peer.weight / peer.max_fails);

                    if peer.fails >= peer.max_fails {
                        tracing::warn!(
                            group = %registry.name(),
                            peer = %peer.name,
                            fails = peer.fails,
                            "Upstream server temporarily disabled"
                        );
                    }
                }

                if peer.effective_weight < 0 {
                    peer.effective_weight = 0;
                }

                metrics::record_peer_failure(registry.name(), &peer.name);
            }
            PeerOutcome::Success => {
                // window was reset by a selection after the last failure
                if peer.accessed.is_some_and(|accessed| accessed < peer.checked) {
                    peer.fails = 0;
                }
            }
        }
    }

    peer.conns = peer.conns.saturating_sub(1);
    metrics::record_active_connections(registry.name(), &peer.name, peer.conns);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{peer::Peer, round_robin::RoundRobin, PeerSelector};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry(count: usize) -> Arc<PeerRegistry> {
        let peers = (0..count)
            .map(|i| Peer::new(format!("127.0.0.1:{}", 8080 + i).parse().unwrap(), 2))
            .collect();
        Arc::new(PeerRegistry::new("web", peers).unwrap())
    }

    #[test]
    fn test_failure_marks_peer_failed() {
        let registry = registry(2);
        let lb = RoundRobin::new(registry.clone());
        let now = Instant::now();

        let mut state = lb.init_peer(None);
        let target = lb.select_at(&mut state, now).unwrap();
        assert_eq!(registry.read().get(target.index).unwrap().conns, 1);

        free_peer_at(&registry, &mut state, PeerOutcome::Failed, now);
        assert_eq!(state.current(), None);

        let peers = registry.read();
        let peer = peers.get(target.index).unwrap();
        assert_eq!(peer.fails, 1);
        assert_eq!(peer.conns, 0);
        assert_eq!(peer.checked, now);
        assert_eq!(peer.effective_weight, 0);
        assert!(peer.is_failed(now));
    }

    #[test]
    fn test_success_clears_failures_after_window() {
        let registry = registry(2);
        let lb = RoundRobin::new(registry.clone());
        let start = Instant::now();

        let mut state = lb.init_peer(None);
        let target = lb.select_at(&mut state, start).unwrap();
        free_peer_at(&registry, &mut state, PeerOutcome::Failed, start);

        // inside the window a success does not reset the counter
        let mut state = lb.init_peer(None);
        state.current = Some(registry.read().handle(target.index));
        free_peer_at(&registry, &mut state, PeerOutcome::Success, start);
        assert_eq!(registry.read().get(target.index).unwrap().fails, 1);

        // a selection after the window expires opens a new one
        let later = start + Duration::from_secs(11);
        registry
            .write()
            .get_mut(target.index)
            .unwrap()
            .refresh_checked(later);

        let mut state = lb.init_peer(None);
        state.current = Some(registry.read().handle(target.index));
        free_peer_at(&registry, &mut state, PeerOutcome::Success, later);
        assert_eq!(registry.read().get(target.index).unwrap().fails, 0);
    }

    #[test]
    fn test_single_peer_never_fails() {
        let registry = registry(1);
        let lb = RoundRobin::new(registry.clone());

        let mut state = lb.init_peer(None);
        lb.select(&mut state).unwrap();
        free_peer(&registry, &mut state, PeerOutcome::Failed);

        let peers = registry.read();
        assert_eq!(peers.get(0).unwrap().fails, 0);
        assert_eq!(peers.get(0).unwrap().conns, 0);
    }

    #[test]
    fn test_without_current_peer_is_noop() {
        let registry = registry(2);
        let mut state = RoundRobinState::new(&registry.read());
        free_peer(&registry, &mut state, PeerOutcome::Failed);
        assert!(registry.read().list().iter().all(|p| p.fails == 0));
    }
}
