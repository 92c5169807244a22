//! upstream-balancer: dry-run tool for upstream peer selection.
//!
//! Loads a balancer configuration and runs the real selectors against it,
//! without opening any connection.
//!
//! ```text
//! upstream-balancer -c balancer.toml check
//! upstream-balancer -c balancer.toml pick --group web --client 1.2.3.4 --failures 2
//! upstream-balancer -c balancer.toml spread --group web --samples 100000
//! upstream-balancer -c balancer.toml watch
//! ```

use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use upstream_balancer::config::watcher::ConfigWatcher;
use upstream_balancer::config::{load_config, BalancerConfig};
use upstream_balancer::load_balancer::{PeerSnapshot, PeerTarget, SelectionState};
use upstream_balancer::observability::{logging, metrics};
use upstream_balancer::{PeerOutcome, UpstreamManager};

#[derive(Parser)]
#[command(name = "upstream-balancer")]
#[command(about = "Dry-run peer selection for upstream groups", long_about = None)]
struct Cli {
    /// Path to the balancer configuration (TOML).
    #[arg(short, long, default_value = "balancer.toml")]
    config: PathBuf,

    /// Print machine-readable JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and list upstream groups
    Check,
    /// Select a peer for one client, simulating failed connection attempts
    Pick {
        #[arg(short, long)]
        group: String,

        /// Client IP address, or "unix" for a non-IP client.
        #[arg(long, value_parser = parse_client)]
        client: Client,

        /// Connection failures to simulate before the attempt that succeeds.
        #[arg(short, long, default_value_t = 0)]
        failures: u32,
    },
    /// Show how random IPv4 clients spread over a group's peers
    Spread {
        #[arg(short, long)]
        group: String,

        #[arg(short, long, default_value_t = 10_000)]
        samples: u32,
    },
    /// Keep groups live and apply configuration file changes
    Watch,
}

#[derive(Debug, Clone, Copy)]
struct Client(Option<IpAddr>);

fn parse_client(value: &str) -> Result<Client, String> {
    if value.eq_ignore_ascii_case("unix") {
        return Ok(Client(None));
    }
    value
        .parse::<IpAddr>()
        .map(|ip| Client(Some(ip)))
        .map_err(|e| format!("invalid client address \"{}\": {}", value, e))
}

#[derive(Serialize)]
struct GroupReport {
    name: String,
    method: &'static str,
    peers: Vec<PeerSnapshot>,
}

#[derive(Serialize)]
struct Attempt {
    attempt: u32,
    peer: Option<PeerTarget>,
    error: Option<String>,
    tries: u8,
    hash: Option<u32>,
}

#[derive(Serialize)]
struct Share {
    peer: String,
    weight: u32,
    expected: f64,
    observed: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(&config.observability)?;
    tracing::debug!(path = ?cli.config, upstreams = config.upstreams.len(), "Configuration loaded");

    let manager = UpstreamManager::new(&config.upstreams)?;

    match cli.command {
        Commands::Check => check(&manager, cli.json)?,
        Commands::Pick {
            group,
            client,
            failures,
        } => pick(&manager, &group, client.0, failures, cli.json)?,
        Commands::Spread { group, samples } => spread(&manager, &group, samples, cli.json)?,
        Commands::Watch => watch(&manager, &cli.config, &config).await?,
    }

    Ok(())
}

fn check(manager: &UpstreamManager, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let reports: Vec<GroupReport> = manager
        .names()
        .into_iter()
        .filter_map(|name| manager.get(&name))
        .map(|upstream| GroupReport {
            name: upstream.name().to_string(),
            method: upstream.method().as_str(),
            peers: upstream.snapshot(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    for report in &reports {
        println!("upstream {} ({})", report.name, report.method);
        for peer in &report.peers {
            println!(
                "  {:<24} {:<22} weight={}{}",
                peer.name,
                peer.addr,
                peer.weight,
                if peer.down { " down" } else { "" }
            );
        }
    }
    println!("configuration OK");
    Ok(())
}

fn pick(
    manager: &UpstreamManager,
    group: &str,
    client: Option<IpAddr>,
    failures: u32,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = manager.request(group, client)?;
    let mut attempts = Vec::new();

    for attempt in 0..=failures {
        let result = request.select();
        let hash = match request.state() {
            SelectionState::IpHash(state) => Some(state.hash()),
            SelectionState::RoundRobin(_) => None,
        };
        let tries = request.state().tries();

        match result {
            Ok(target) => {
                attempts.push(Attempt {
                    attempt,
                    peer: Some(target),
                    error: None,
                    tries,
                    hash,
                });
                let outcome = if attempt < failures {
                    PeerOutcome::Failed
                } else {
                    PeerOutcome::Success
                };
                request.free(outcome);
            }
            Err(e) => {
                attempts.push(Attempt {
                    attempt,
                    peer: None,
                    error: Some(e.to_string()),
                    tries,
                    hash,
                });
                break;
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }

    for a in &attempts {
        match (&a.peer, &a.error) {
            (Some(peer), _) => println!(
                "attempt {}: {} ({}) tries={}{}",
                a.attempt,
                peer.name,
                peer.addr,
                a.tries,
                a.hash.map(|h| format!(" hash={}", h)).unwrap_or_default()
            ),
            (None, Some(error)) => println!("attempt {}: {}", a.attempt, error),
            (None, None) => {}
        }
    }
    Ok(())
}

fn spread(
    manager: &UpstreamManager,
    group: &str,
    samples: u32,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let upstream = manager
        .get(group)
        .ok_or_else(|| format!("unknown upstream \"{}\"", group))?;

    let peers = upstream.snapshot();
    let total_weight: u32 = peers.iter().map(|p| p.weight).sum();
    let mut hits = vec![0u64; peers.len()];
    let mut rng = rand::thread_rng();

    for _ in 0..samples {
        let client = IpAddr::V4(Ipv4Addr::from(rng.gen::<u32>()));
        let mut request = manager.request(group, Some(client))?;
        if let Ok(target) = request.select() {
            if let Some(count) = hits.get_mut(target.index) {
                *count += 1;
            }
            request.free(PeerOutcome::Success);
        }
    }

    let shares: Vec<Share> = peers
        .iter()
        .zip(&hits)
        .map(|(peer, &count)| Share {
            peer: peer.name.clone(),
            weight: peer.weight,
            expected: f64::from(peer.weight) / f64::from(total_weight.max(1)),
            observed: count as f64 / f64::from(samples.max(1)),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&shares)?);
        return Ok(());
    }

    println!("{:<24} {:>6} {:>9} {:>9}", "peer", "weight", "expected", "observed");
    for share in &shares {
        println!(
            "{:<24} {:>6} {:>8.2}% {:>8.2}%",
            share.peer,
            share.weight,
            share.expected * 100.0,
            share.observed * 100.0
        );
    }
    Ok(())
}

async fn watch(
    manager: &UpstreamManager,
    path: &std::path::Path,
    config: &BalancerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let (watcher, mut updates) = ConfigWatcher::new(path);
    let _watcher = watcher.run()?;

    tracing::info!(groups = ?manager.names(), "Watching configuration, Ctrl-C to exit");

    loop {
        tokio::select! {
            Some(new_config) = updates.recv() => {
                match manager.reload(&new_config.upstreams) {
                    Ok(()) => tracing::info!(groups = ?manager.names(), "Configuration applied"),
                    Err(e) => tracing::error!(error = %e, "Rejected configuration update"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
