//! Client address affinity strategy.
//!
//! # Algorithm
//! ```text
//! hash = 89
//! loop:
//!     for byte in client key: hash = (hash * 113 + byte) % 6271
//!     w = hash % total_weight → walk peers until w falls inside one's weight
//!     reject if tried, down, or failed → tries += 1, loop (hash keeps chaining)
//! accept → conns += 1, mark tried, remember hash for the next attempt
//! ```
//!
//! # Design Decisions
//! - Same client key and same registry give the same first choice
//! - A retry continues the hash chain instead of starting over, so each
//!   attempt lands on a different slice of the weight space
//! - After more than 20 rejected candidates, or for a single-peer group,
//!   selection is handed to round robin using the embedded state
//! - All non-IP clients share one key and therefore one peer

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::load_balancer::{
    peer::PeerTarget,
    registry::{PeerRegistry, Peers},
    round_robin::{RoundRobin, RoundRobinState},
    tried::TriedPeers,
    PeerSelector, SelectError,
};
use crate::observability::metrics;

/// Hash value before the first attempt.
pub const INITIAL_HASH: u32 = 89;

/// Rejected candidates tolerated before falling back to round robin.
pub const MAX_TRIES: u8 = 20;

const HASH_MULTIPLIER: u32 = 113;
const HASH_MODULUS: u32 = 6271;

/// Key shared by every client without an IP address.
pub static PSEUDO_ADDR: [u8; 3] = [0; 3];

/// The bytes of a client address that drive the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKey {
    /// First three octets: clients in one /24 share a peer.
    V4([u8; 3]),
    V6([u8; 16]),
    /// Unix sockets and other non-IP transports.
    Pseudo,
}

impl ClientKey {
    pub fn new(client: Option<IpAddr>) -> Self {
        match client {
            Some(IpAddr::V4(ip)) => {
                let [a, b, c, _] = ip.octets();
                ClientKey::V4([a, b, c])
            }
            Some(IpAddr::V6(ip)) => ClientKey::V6(ip.octets()),
            None => ClientKey::Pseudo,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ClientKey::V4(bytes) => bytes.as_slice(),
            ClientKey::V6(bytes) => bytes.as_slice(),
            ClientKey::Pseudo => PSEUDO_ADDR.as_slice(),
        }
    }
}

impl From<Option<IpAddr>> for ClientKey {
    fn from(client: Option<IpAddr>) -> Self {
        Self::new(client)
    }
}

/// Fold `key` into `hash`.
pub fn fold_hash(mut hash: u32, key: &[u8]) -> u32 {
    for &byte in key {
        hash = (hash * HASH_MULTIPLIER + u32::from(byte)) % HASH_MODULUS;
    }
    hash
}

/// Why a hashed candidate was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Tried,
    Down,
    Failed,
}

impl Rejection {
    fn as_str(&self) -> &'static str {
        match self {
            Rejection::Tried => "tried",
            Rejection::Down => "down",
            Rejection::Failed => "failed",
        }
    }
}

/// Per-request affinity state.
///
/// Wraps the round-robin state so a fallback continues with the same
/// tried bitmap.
#[derive(Debug, Clone)]
pub struct IpHashState {
    pub(crate) rr: RoundRobinState,
    key: ClientKey,
    hash: u32,
    tries: u8,
}

impl IpHashState {
    pub fn new(client: Option<IpAddr>, peers: &Peers) -> Self {
        Self {
            rr: RoundRobinState::new(peers),
            key: ClientKey::new(client),
            hash: INITIAL_HASH,
            tries: 0,
        }
    }

    /// Hash produced by the last successful attempt.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Candidates rejected so far.
    pub fn tries(&self) -> u8 {
        self.tries
    }

    pub fn tried(&self) -> &TriedPeers {
        &self.rr.tried
    }

    pub fn round_robin(&self) -> &RoundRobinState {
        &self.rr
    }

    pub fn round_robin_mut(&mut self) -> &mut RoundRobinState {
        &mut self.rr
    }

    /// Whether selection has been handed to round robin for good.
    pub fn is_exhausted(&self) -> bool {
        self.tries > MAX_TRIES
    }
}

/// Client address affinity selector.
#[derive(Debug, Clone)]
pub struct IpHash {
    registry: Arc<PeerRegistry>,
    fallback: RoundRobin,
}

impl IpHash {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self {
            fallback: RoundRobin::new(registry.clone()),
            registry,
        }
    }

    /// The round-robin selector used when hashing cannot make progress.
    pub fn fallback(&self) -> &RoundRobin {
        &self.fallback
    }

    fn fall_back(
        &self,
        state: &mut IpHashState,
        now: Instant,
    ) -> Result<PeerTarget, SelectError> {
        tracing::debug!(
            group = %self.registry.name(),
            tries = state.tries,
            "ip_hash falling back to round robin"
        );
        metrics::record_fallback(self.registry.name());
        self.fallback.select_at(&mut state.rr, now)
    }
}

impl PeerSelector for IpHash {
    type State = IpHashState;

    fn init_peer(&self, client: Option<IpAddr>) -> IpHashState {
        IpHashState::new(client, &self.registry.read())
    }

    fn select_at(&self, state: &mut IpHashState, now: Instant) -> Result<PeerTarget, SelectError> {
        let group = self.registry.name();
        tracing::trace!(group = %group, tries = state.tries, "get ip hash peer");

        let mut peers = self.registry.write();
        state.rr.resync(&peers);

        if state.tries > MAX_TRIES || peers.is_single() {
            drop(peers);
            return self.fall_back(state, now);
        }

        let mut hash = state.hash;
        let mut rejected = Vec::new();
        let accepted = loop {
            hash = fold_hash(hash, state.key.as_bytes());
            let index = peers.position_of(hash % peers.total_weight());
            let peer = &peers.list()[index];

            let rejection = if state.rr.tried.contains(index) {
                Rejection::Tried
            } else if peer.down {
                Rejection::Down
            } else if peer.is_failed(now) {
                Rejection::Failed
            } else {
                break Some(index);
            };

            tracing::trace!(
                group = %group,
                peer = %peer.name,
                hash,
                reason = rejection.as_str(),
                "ip_hash candidate rejected"
            );
            metrics::record_rejection(group, rejection.as_str());

            rejected.push(index);
            state.tries += 1;
            if state.tries > MAX_TRIES {
                break None;
            }
        };

        let selected = match accepted {
            Some(index) => {
                let peer = &mut peers.list_mut()[index];
                peer.conns += 1;
                peer.refresh_checked(now);
                let target = PeerTarget::new(index, peer);
                let conns = peer.conns;
                Some((target, conns, peers.handle(index)))
            }
            None => None,
        };
        drop(peers);

        for index in rejected {
            state.rr.tried.insert(index);
        }

        let Some((target, conns, handle)) = selected else {
            return self.fall_back(state, now);
        };

        state.rr.current = Some(handle);
        state.rr.tried.insert(target.index);
        state.hash = hash;
        let index = target.index;

        tracing::debug!(
            group = %group,
            peer = %target.name,
            index,
            hash,
            tries = state.tries,
            "Selected ip_hash peer"
        );
        metrics::record_selection(group, "ip_hash", &target.name);
        metrics::record_active_connections(group, &target.name, conns);

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::peer::Peer;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn registry(weights: &[u32]) -> Arc<PeerRegistry> {
        let peers = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| Peer::new(format!("127.0.0.1:{}", 8080 + i).parse().unwrap(), w))
            .collect();
        Arc::new(PeerRegistry::new("web", peers).unwrap())
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    #[test]
    fn test_client_key_classification() {
        assert_eq!(ClientKey::new(v4(1, 2, 3, 4)).as_bytes(), &[1, 2, 3]);

        let ip6 = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let key = ClientKey::new(Some(IpAddr::V6(ip6)));
        assert_eq!(key.as_bytes(), &ip6.octets());
        assert_eq!(key.as_bytes().len(), 16);

        assert_eq!(ClientKey::new(None), ClientKey::Pseudo);
        assert_eq!(ClientKey::Pseudo.as_bytes(), &[0, 0, 0]);
    }

    #[test]
    fn test_fold_hash() {
        // (89 * 113 + 1) % 6271 = 3787
        // (3787 * 113 + 2) % 6271 = 1505
        // (1505 * 113 + 3) % 6271 = 751
        assert_eq!(fold_hash(INITIAL_HASH, &[1]), 3787);
        assert_eq!(fold_hash(INITIAL_HASH, &[1, 2, 3]), 751);
        assert_eq!(fold_hash(751, &[1, 2, 3]), 6116);
    }

    #[test]
    fn test_first_choice_and_hash_chaining() {
        let lb = IpHash::new(registry(&[1, 1]));
        let mut state = lb.init_peer(v4(1, 2, 3, 4));
        assert_eq!(state.hash(), INITIAL_HASH);

        // 751 % 2 = 1
        let first = lb.select(&mut state).unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(state.hash(), 751);
        assert_eq!(state.tries(), 0);

        // 6116 % 2 = 0
        let second = lb.select(&mut state).unwrap();
        assert_eq!(second.index, 0);
        assert_eq!(state.hash(), 6116);
        assert_eq!(state.tried().len(), 2);
    }

    #[test]
    fn test_same_slash24_same_peer() {
        let lb = IpHash::new(registry(&[1, 1, 1]));
        let a = lb.select(&mut lb.init_peer(v4(192, 168, 7, 1))).unwrap();
        let b = lb.select(&mut lb.init_peer(v4(192, 168, 7, 254))).unwrap();
        assert_eq!(a.index, b.index);
    }

    #[test]
    fn test_down_candidate_is_recorded() {
        let registry = registry(&[1, 1]);
        registry.write().get_mut(0).unwrap().down = true;
        let lb = IpHash::new(registry);

        // 10.0.1.x hashes to 2566 (peer 0), then 2321 (peer 1)
        let mut state = lb.init_peer(v4(10, 0, 1, 7));
        let target = lb.select(&mut state).unwrap();

        assert_eq!(target.index, 1);
        assert_eq!(state.tries(), 1);
        assert!(state.tried().contains(0));
        assert!(state.tried().contains(1));
        assert_eq!(state.hash(), 2321);
    }

    #[test]
    fn test_single_peer_delegates() {
        let registry = registry(&[4]);
        let lb = IpHash::new(registry.clone());
        let mut state = lb.init_peer(v4(1, 2, 3, 4));

        let target = lb.select(&mut state).unwrap();
        assert_eq!(target.index, 0);
        assert_eq!(state.tries(), 0);
        assert_eq!(state.hash(), INITIAL_HASH);
        assert_eq!(registry.read().get(0).unwrap().conns, 1);
    }

    #[test]
    fn test_all_down_falls_back_after_bounded_attempts() {
        let registry = registry(&[1, 1, 1]);
        for peer in registry.write().list_mut() {
            peer.down = true;
        }
        let lb = IpHash::new(registry);
        let mut state = lb.init_peer(v4(1, 2, 3, 4));

        let err = lb.select(&mut state).unwrap_err();
        assert_eq!(err, SelectError::NoLivePeers { group: "web".into() });
        assert_eq!(state.tries(), MAX_TRIES + 1);
        assert!(state.is_exhausted());
        // the failed walk does not advance the stored hash
        assert_eq!(state.hash(), INITIAL_HASH);

        // later attempts go straight to round robin
        assert!(lb.select(&mut state).is_err());
        assert_eq!(state.tries(), MAX_TRIES + 1);
    }

    #[test]
    fn test_failed_peer_skipped_until_window_expires() {
        let registry = registry(&[1, 1]);
        let start = Instant::now();
        {
            let mut peers = registry.write();
            let peer = peers.get_mut(1).unwrap();
            peer.fails = 1;
            peer.checked = start;
        }
        let lb = IpHash::new(registry.clone());

        // 1.2.3.x prefers peer 1
        let inside = lb.select_at(&mut lb.init_peer(v4(1, 2, 3, 4)), start).unwrap();
        assert_eq!(inside.index, 0);

        let later = start + std::time::Duration::from_secs(11);
        let after = lb.select_at(&mut lb.init_peer(v4(1, 2, 3, 4)), later).unwrap();
        assert_eq!(after.index, 1);
        assert_eq!(registry.read().get(1).unwrap().checked, later);
    }
}
