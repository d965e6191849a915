use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the pairing server.
#[derive(Parser, Debug, Clone)]
#[command(name = "duos")]
#[command(about = "duo pairing and handshake relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on for WebSocket clients.
    #[arg(long, default_value = "0.0.0.0:8080", env = "DUO_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and admin endpoints.
    #[arg(long, default_value = "127.0.0.1:9090", env = "DUO_ADMIN")]
    pub admin_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "DUO_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "16", env = "DUO_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "DUO_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Interval between transport-level WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "DUO_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Outbound events buffered per connection before new ones are dropped.
    #[arg(long, default_value = "256", env = "DUO_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,
    /// Minimum milliseconds between two match requests from one session.
    #[arg(long, default_value = "800", env = "DUO_MATCH_COOLDOWN_MS")]
    pub match_cooldown_ms: u64,
    /// Minimum milliseconds between two `next` requests from one session.
    #[arg(long, default_value = "1000", env = "DUO_NEXT_COOLDOWN_MS")]
    pub next_cooldown_ms: u64,
    /// Minimum milliseconds between two reports from one session.
    #[arg(long, default_value = "5000", env = "DUO_REPORT_COOLDOWN_MS")]
    pub report_cooldown_ms: u64,
    /// Number of reports against one id that bans it.
    #[arg(long, default_value = "3", env = "DUO_BAN_THRESHOLD")]
    pub ban_threshold: usize,
    /// Seconds two sessions are kept from being paired again.
    #[arg(long, default_value = "60", env = "DUO_RECENT_PAIR_TTL")]
    pub recent_pair_ttl: u64,
    /// Seconds between liveness sweeps.
    #[arg(long, default_value = "20", env = "DUO_REAP_INTERVAL")]
    pub reap_interval: u64,
    /// Seconds without a heartbeat after which a session is reaped.
    #[arg(long, default_value = "40", env = "DUO_STALE_AFTER")]
    pub stale_after: u64,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Matching and abuse-control policy.
///
/// All of these are tunable; none of them is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Cooldown between match requests.
    pub match_cooldown: Duration,
    /// Cooldown between `next` requests.
    pub next_cooldown: Duration,
    /// Cooldown between reports.
    pub report_cooldown: Duration,
    /// Reports against one id that trigger a ban.
    pub ban_threshold: usize,
    /// How long a finished pairing blocks the same two sessions.
    pub recent_pair_ttl: Duration,
    /// Period of the liveness sweep.
    pub reap_interval: Duration,
    /// Heartbeat silence after which a session is reaped.
    pub stale_after: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            match_cooldown: Duration::from_millis(800),
            next_cooldown: Duration::from_millis(1000),
            report_cooldown: Duration::from_millis(5000),
            ban_threshold: 3,
            recent_pair_ttl: Duration::from_secs(60),
            reap_interval: Duration::from_secs(20),
            stale_after: Duration::from_secs(40),
        }
    }
}

impl Policy {
    /// Validates the policy values are within acceptable bounds.
    pub fn validate(&self) -> Result<(), String> {
        const MAX_COOLDOWN: Duration = Duration::from_secs(600);
        for (name, value) in [
            ("match_cooldown", self.match_cooldown),
            ("next_cooldown", self.next_cooldown),
            ("report_cooldown", self.report_cooldown),
        ] {
            if value > MAX_COOLDOWN {
                return Err(format!("{name} exceeds reasonable limit (600 seconds)"));
            }
        }

        if self.ban_threshold == 0 {
            return Err("ban_threshold must be greater than 0".to_string());
        }
        if self.ban_threshold > 1000 {
            return Err("ban_threshold exceeds reasonable limit (1000)".to_string());
        }

        if self.recent_pair_ttl.is_zero() {
            return Err("recent_pair_ttl must be greater than 0".to_string());
        }
        if self.recent_pair_ttl > Duration::from_secs(86_400) {
            return Err("recent_pair_ttl exceeds reasonable limit (86400 seconds)".to_string());
        }

        if self.reap_interval.is_zero() {
            return Err("reap_interval must be greater than 0".to_string());
        }
        if self.stale_after.is_zero() {
            return Err("stale_after must be greater than 0".to_string());
        }
        if self.stale_after > Duration::from_secs(3600) {
            return Err("stale_after exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.reap_interval > self.stale_after {
            return Err("reap_interval cannot exceed stale_after".to_string());
        }
        Ok(())
    }
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on for WebSocket clients.
    pub listen: SocketAddr,
    /// Socket address for the metrics and admin endpoints.
    pub admin_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Interval between transport-level WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Outbound events buffered per connection.
    pub outbound_queue: usize,
    /// Matching and abuse-control policy.
    pub policy: Policy,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        // Handshake blobs are small; anything past 1 MiB is a misconfiguration
        const MAX_ALLOWED_PAYLOAD: usize = 1 << 20;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.outbound_queue == 0 {
            return Err("outbound_queue must be greater than 0".to_string());
        }
        if self.outbound_queue > 65_536 {
            return Err("outbound_queue exceeds reasonable limit (65536)".to_string());
        }

        self.policy.validate()
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            admin_addr: args.admin_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_payload: args.max_payload,
            ping_interval: args.ping_interval,
            outbound_queue: args.outbound_queue,
            policy: Policy {
                match_cooldown: Duration::from_millis(args.match_cooldown_ms),
                next_cooldown: Duration::from_millis(args.next_cooldown_ms),
                report_cooldown: Duration::from_millis(args.report_cooldown_ms),
                ban_threshold: args.ban_threshold,
                recent_pair_ttl: Duration::from_secs(args.recent_pair_ttl),
                reap_interval: Duration::from_secs(args.reap_interval),
                stale_after: Duration::from_secs(args.stale_after),
            },
        }
    }
}
