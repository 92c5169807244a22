//! Configuration loading and hot reload tests.

use std::fs;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use upstream_balancer::config::watcher::ConfigWatcher;
use upstream_balancer::config::{load_config, BalanceMethod, ConfigError};
use upstream_balancer::{BalancerConfig, PeerOutcome, SelectError, UpstreamManager};

mod common;

const TWO_PEERS: &str = r#"
[[upstreams]]
name = "web"
method = "ip_hash"

[[upstreams.peers]]
address = "127.0.0.1:8080"

[[upstreams.peers]]
address = "127.0.0.1:8081"
"#;

const THREE_PEERS: &str = r#"
[[upstreams]]
name = "web"
method = "ip_hash"

[[upstreams.peers]]
address = "127.0.0.1:8080"

[[upstreams.peers]]
address = "127.0.0.1:8081"

[[upstreams.peers]]
address = "127.0.0.1:8082"
weight = 2
"#;

#[test]
fn test_load_and_select_from_file() {
    let path = common::temp_config_path("load");
    fs::write(&path, TWO_PEERS).unwrap();

    let config = load_config(&path).unwrap();
    fs::remove_file(&path).unwrap();

    let manager = UpstreamManager::new(&config.upstreams).unwrap();
    let web = manager.get("web").unwrap();
    assert_eq!(web.method(), BalanceMethod::IpHash);

    let mut request = manager.request("web", common::v4(1, 2, 3, 4)).unwrap();
    let target = request.select().unwrap();
    assert_eq!(target.addr.port(), 8081);
    request.free(PeerOutcome::Success);
}

#[test]
fn test_zero_weight_rejected_at_load() {
    let path = common::temp_config_path("zero");
    fs::write(
        &path,
        r#"
        [[upstreams]]
        name = "web"

        [[upstreams.peers]]
        address = "127.0.0.1:8080"
        weight = 0
        "#,
    )
    .unwrap();

    let err = load_config(&path).unwrap_err();
    fs::remove_file(&path).unwrap();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_reload_reaches_in_flight_requests() {
    let manager = UpstreamManager::new(&[common::upstream_config(
        "web",
        BalanceMethod::IpHash,
        &[1, 1],
    )])
    .unwrap();

    let mut request = manager.request("web", common::v4(1, 2, 3, 4)).unwrap();
    let first = request.select().unwrap();
    request.free(PeerOutcome::Failed);

    manager
        .reload(&[common::upstream_config("web", BalanceMethod::IpHash, &[1, 1, 1])])
        .unwrap();

    // the retry walks the grown registry; the tried bitmap still holds
    let second = request.select().unwrap();
    assert_ne!(second.index, first.index);
    assert_eq!(request.upstream().registry().len(), 3);

    manager.reload(&[]).unwrap();
    assert!(matches!(
        manager.request("web", None),
        Err(SelectError::UnknownGroup(_))
    ));
}

#[test]
fn test_reload_removing_peer_charges_the_held_peer() {
    let manager = UpstreamManager::new(&[common::upstream_config(
        "web",
        BalanceMethod::IpHash,
        &[1, 1, 1],
    )])
    .unwrap();

    // 751 % 3 = 1
    let mut request = manager.request("web", common::v4(1, 2, 3, 4)).unwrap();
    let held = request.select().unwrap();
    assert_eq!(held.addr.port(), 8081);

    let mut next = common::upstream_config("web", BalanceMethod::IpHash, &[1, 1, 1]);
    next.peers.remove(0);
    manager.reload(&[next]).unwrap();

    request.free(PeerOutcome::Failed);
    {
        let peers = request.upstream().registry().read();
        let by_port = |port| peers.list().iter().find(|p| p.addr.port() == port).unwrap();
        assert_eq!(by_port(8081).fails, 1);
        assert_eq!(by_port(8081).conns, 0);
        assert_eq!(by_port(8082).fails, 0);
        assert_eq!(by_port(8082).conns, 0);
    }

    // the retry still avoids the peer it already used
    let retry = request.select().unwrap();
    assert_eq!(retry.addr.port(), 8082);
    assert_eq!(request.state().round_robin().generation(), 1);
}

/// Next update whose first group has `peers` peers; a write can surface as
/// several events and the first may see a partial file.
async fn next_with_peers(
    updates: &mut UnboundedReceiver<BalancerConfig>,
    peers: usize,
) -> Option<BalancerConfig> {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(config) = updates.recv().await {
            if config.upstreams.first().map(|u| u.peers.len()) == Some(peers) {
                return Some(config);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_watcher_delivers_valid_updates() {
    let path = common::temp_config_path("watch");
    fs::write(&path, TWO_PEERS).unwrap();

    let (watcher, mut updates) = ConfigWatcher::new(&path);
    let _watcher = watcher.run().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    fs::write(&path, THREE_PEERS).unwrap();

    let received = next_with_peers(&mut updates, 3).await;
    fs::remove_file(&path).unwrap();

    let config = received.expect("no config update within timeout");
    assert_eq!(config.upstreams[0].peers[2].weight, 2);
}

#[tokio::test]
async fn test_watcher_survives_rename_saves() {
    let dir = common::temp_dir("rename");
    let path = dir.join("balancer.toml");
    fs::write(&path, TWO_PEERS).unwrap();

    let (watcher, mut updates) = ConfigWatcher::new(&path);
    let _watcher = watcher.run().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // save the way editors do: write a sibling, rename it over the file
    let mut received = Vec::new();
    for (content, peers) in [(THREE_PEERS, 3), (TWO_PEERS, 2)] {
        let staged = dir.join("balancer.toml.tmp");
        fs::write(&staged, content).unwrap();
        fs::rename(&staged, &path).unwrap();
        received.push(next_with_peers(&mut updates, peers).await.is_some());
    }

    fs::remove_dir_all(&dir).unwrap();
    assert_eq!(received, vec![true, true]);
}
