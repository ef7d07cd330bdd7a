//! Persistent client example.
//!
//! Connects to the echo peer, runs a few commands, and keeps going across
//! peer restarts. Set `RUST_LOG=cmdlink=debug` to watch state transitions,
//! reconnects and heartbeats.
//!
//! Run with: cargo run --example client
//! (start the peer first with: cargo run --example echo_peer)

use std::thread;
use std::time::Duration;

use cmdlink::{ConnectionConfig, PersistentConnection};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cmdlink=info")),
        )
        .init();

    let config = ConnectionConfig::default()
        .with_io_timeout(Duration::from_secs(5))
        .with_heartbeat_interval(Duration::from_secs(2))
        .with_max_reconnect_attempts(3);
    let conn = PersistentConnection::new(config);

    println!("Connecting to {}...", conn.config().endpoint());
    if !conn.connect() {
        println!("Peer not reachable yet; commands will reconnect on demand");
    }

    println!("Probe: {}", conn.probe());

    let params = json!({"name": "BP_Door", "parent": "Actor"}).as_object().cloned();
    let result = conn.execute("create_blueprint", params);
    println!("create_blueprint ->\n{}", result.to_json_pretty());

    let result = conn.execute("fail", None);
    println!("fail ->\n{}", result.to_json_pretty());

    // Restart the peer during this loop to watch the reconnect path.
    for round in 1..=5 {
        let params = json!({"round": round}).as_object().cloned();
        let result = conn.execute("get_context", params);
        println!(
            "round {round}: success={} recoverable={} state={}",
            result.success,
            result.recoverable,
            conn.state()
        );
        thread::sleep(Duration::from_secs(3));
    }

    let stats = conn.stats();
    println!(
        "connects={} reconnects={} sent={} received={}",
        stats.connect_count, stats.reconnect_count, stats.commands_sent, stats.replies_received
    );

    conn.disconnect();
}
