//! Node configuration.
//!
//! Parsed from CLI flags with environment fallbacks. Every delivery knob
//! the scheduler and router use lives here so tests can compress time.

use clap::Parser;

/// Configuration for a YapYap node.
#[derive(Parser, Debug, Clone)]
#[command(name = "yapyap-node", about = "Decentralized p2p messaging node")]
pub struct NodeConfig {
    /// Data directory holding the database and WAL files.
    #[arg(long, env = "YAPYAP_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Transport listen address (multiaddr; only the tcp port is honored,
    /// 0 picks an ephemeral port).
    #[arg(long, env = "YAPYAP_LISTEN_ADDR", default_value = "/ip4/0.0.0.0/tcp/0")]
    pub listen_addr: String,

    /// Bootstrap peers to dial on startup (peer ids or multiaddrs with a
    /// /p2p/<peerId> suffix).
    #[arg(long, env = "YAPYAP_BOOTSTRAP_ADDRS", value_delimiter = ',')]
    pub bootstrap_addrs: Vec<String>,

    /// Log filter (folded into RUST_LOG-style filtering).
    #[arg(long, env = "YAPYAP_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Dispatcher worker pool size.
    #[arg(long, default_value_t = 4)]
    pub dispatch_workers: usize,

    /// How many due entries one claim drains at most.
    #[arg(long, default_value_t = 16)]
    pub claim_batch: usize,

    /// Milliseconds to wait for a correlated ACK/NAK.
    #[arg(long, default_value_t = 30_000)]
    pub ack_timeout_ms: u64,

    /// Dial timeout, milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    /// Stream write timeout, milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Retry backoff base, milliseconds.
    #[arg(long, default_value_t = 2_000)]
    pub backoff_base_ms: u64,

    /// Retry backoff cap, milliseconds.
    #[arg(long, default_value_t = 300_000)]
    pub backoff_cap_ms: u64,

    /// Direct delivery attempts before store-and-forward hand-off.
    #[arg(long, default_value_t = 8)]
    pub max_direct_attempts: u32,

    /// Message TTL, milliseconds (default 7 days).
    #[arg(long, default_value_t = 7 * 24 * 60 * 60 * 1000)]
    pub default_ttl_ms: u64,

    /// Sweeper tick, milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub sweeper_interval_ms: u64,

    /// Bootstrap redial interval, milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub bootstrap_interval_ms: u64,

    /// Relay fan-out for store-and-forward replication.
    #[arg(long, default_value_t = 3)]
    pub relay_fanout: usize,

    /// Replicate as soon as the target is unreachable instead of waiting
    /// for direct attempts to exhaust.
    #[arg(long, default_value_t = false)]
    pub replicate_immediately: bool,

    /// Bound on pending + in-flight outbox entries; enqueue past this is
    /// rejected.
    #[arg(long, default_value_t = 10_000)]
    pub max_outbox_entries: u64,

    /// Retention window for processed markers and replica rows,
    /// milliseconds (default 7 days).
    #[arg(long, default_value_t = 7 * 24 * 60 * 60 * 1000)]
    pub retention_ms: u64,

    /// Bounded wait for in-flight work on shutdown, milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub shutdown_timeout_ms: u64,
}

impl NodeConfig {
    /// Extract the tcp port from the listen multiaddr, if one is present.
    pub fn listen_port(&self) -> Option<u16> {
        let mut parts = self.listen_addr.split('/');
        while let Some(part) = parts.next() {
            if part == "tcp" {
                return parts.next().and_then(|p| p.parse().ok());
            }
        }
        None
    }

    /// Bootstrap peer ids, with any multiaddr prefix stripped.
    pub fn bootstrap_peers(&self) -> Vec<String> {
        self.bootstrap_addrs
            .iter()
            .filter(|s| !s.is_empty())
            .map(|addr| match addr.rsplit_once("/p2p/") {
                Some((_, peer_id)) => peer_id.to_string(),
                None => addr.trim().to_string(),
            })
            .collect()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            listen_addr: "/ip4/0.0.0.0/tcp/0".to_string(),
            bootstrap_addrs: Vec::new(),
            log_level: None,
            dispatch_workers: 4,
            claim_batch: 16,
            ack_timeout_ms: 30_000,
            dial_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            max_direct_attempts: 8,
            default_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            sweeper_interval_ms: 1_000,
            bootstrap_interval_ms: 5_000,
            relay_fanout: 3,
            replicate_immediately: false,
            max_outbox_entries: 10_000,
            retention_ms: 7 * 24 * 60 * 60 * 1000,
            shutdown_timeout_ms: 5_000,
        }
    }
}
