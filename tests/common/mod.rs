//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use upstream_balancer::config::{BalanceMethod, PeerConfig, UpstreamConfig};
use upstream_balancer::load_balancer::{Peer, PeerRegistry};

/// Registry "web" with peers on 127.0.0.1:8080.. and the given weights.
pub fn registry(weights: &[u32]) -> Arc<PeerRegistry> {
    let peers = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let addr = format!("127.0.0.1:{}", 8080 + i).parse().unwrap();
            Peer::with_name(format!("peer-{}", i), addr, w)
        })
        .collect();
    Arc::new(PeerRegistry::new("web", peers).unwrap())
}

pub fn upstream_config(name: &str, method: BalanceMethod, weights: &[u32]) -> UpstreamConfig {
    UpstreamConfig {
        name: name.into(),
        method,
        peers: weights
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let mut peer = PeerConfig::new(format!("127.0.0.1:{}", 8080 + i));
                peer.weight = w;
                peer
            })
            .collect(),
    }
}

pub fn v4(a: u8, b: u8, c: u8, d: u8) -> Option<IpAddr> {
    Some(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

/// A config file path unique to this test process.
pub fn temp_config_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "upstream-balancer-{}-{}.toml",
        tag,
        std::process::id()
    ))
}

/// An empty scratch directory unique to this test process.
pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "upstream-balancer-{}-{}",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
