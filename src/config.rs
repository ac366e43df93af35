use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Leaky bucket parameters: `burst` tokens refilled evenly over `period_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub burst: u32,
    pub period_ms: u64,
}

impl BucketConfig {
    pub const fn new(burst: u32, period_ms: u64) -> Self {
        Self { burst, period_ms }
    }
}

/// Address-keyed and per-client flood limits
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Challenge requests per address
    pub challenge: BucketConfig,
    /// Connect attempts per address
    pub connect: BucketConfig,
    /// Status/info queries per address
    pub query: BucketConfig,
    /// Remote console attempts per address
    pub rcon: BucketConfig,
    /// Reliable client commands per address (all slots from that address)
    pub command: BucketConfig,
    /// Full gamestate requests per address
    pub gamestate: BucketConfig,
    /// Reliable client commands per connection
    pub client_command: BucketConfig,
    /// Userinfo changes per connection
    pub client_userinfo: BucketConfig,
    /// Gamestate retransmissions per connection
    pub client_gamestate: BucketConfig,
    /// Number of buckets in each address-family pool
    pub pool_size: usize,
    /// Rejections in a row before an address is marked toxic
    pub toxic_threshold: u32,
    /// How long a toxic address is dropped outright
    pub toxic_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            challenge: BucketConfig::new(10, 1000),
            connect: BucketConfig::new(10, 1000),
            query: BucketConfig::new(10, 1000),
            rcon: BucketConfig::new(10, 1000),
            command: BucketConfig::new(40, 1000),
            gamestate: BucketConfig::new(4, 1000),
            client_command: BucketConfig::new(20, 1000),
            client_userinfo: BucketConfig::new(5, 1000),
            client_gamestate: BucketConfig::new(1, 1000),
            pool_size: 2048,
            toxic_threshold: 20,
            toxic_cooldown_ms: 10_000,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Name reported to status and info queries
    pub hostname: String,
    /// Number of client slots
    pub max_clients: usize,
    /// Simulation and send ticks per second
    pub tick_rate: u32,
    /// Silence tolerated from an Active client
    pub client_timeout_ms: u64,
    /// Silence tolerated from a Connected or Primed client
    pub connect_timeout_ms: u64,
    /// Grace period a dropped slot spends as a zombie
    pub zombie_time_ms: u64,
    /// Minimum age of a live slot before the same address may replace it
    pub reconnect_limit_ms: u64,
    /// Maximum live slots per IP address
    pub max_clients_per_ip: usize,
    /// Reliable command log entries per connection (power of two)
    pub reliable_log_capacity: usize,
    /// Longest reliable command accepted or queued
    pub max_command_length: usize,
    /// Largest payload sent in one datagram before fragmenting
    pub fragment_size: usize,
    /// Outbound messages waiting behind an in-flight fragmented message
    pub fragment_queue_limit: usize,
    /// Largest reassembled message accepted from a client
    pub max_message_size: usize,
    /// Bandwidth bounds in bytes per second
    pub min_rate: u32,
    pub max_rate: u32,
    /// Rate assumed until the client's userinfo says otherwise
    pub default_rate: u32,
    /// Snapshots per second requested by default
    pub default_snaps: u32,
    /// Per-client snapshot records kept for delta baselines (power of two)
    pub packet_backup: usize,
    /// Common snapshot frames kept in the shared ring
    pub snapshot_frames: usize,
    /// Entity records held by the shared ring across all frames
    pub snapshot_storage: usize,
    /// Largest entity count in one world frame
    pub max_frame_entities: usize,
    /// Largest entity count sent to one client in one snapshot
    pub max_snapshot_entities: usize,
    /// Skip flooding clients' commands
    pub flood_protect: bool,
    pub rate_limits: RateLimitConfig,
    /// Remote console password; rcon disabled when `None`
    pub rcon_password: Option<String>,
    /// Serve downloads from `download_dir`
    pub allow_download: bool,
    pub download_dir: Option<PathBuf>,
    pub download_block_size: usize,
    pub download_window: usize,
    pub download_timeout_ms: u64,
    /// Port for the metrics HTTP endpoint
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 27960,
            hostname: "snapwire".to_string(),
            max_clients: 32,
            tick_rate: 20,
            client_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            zombie_time_ms: 2_000,
            reconnect_limit_ms: 3_000,
            max_clients_per_ip: 3,
            reliable_log_capacity: 64,
            max_command_length: 1024,
            fragment_size: 1300,
            fragment_queue_limit: 64,
            max_message_size: 16_384,
            min_rate: 4_000,
            max_rate: 90_000,
            default_rate: 25_000,
            default_snaps: 20,
            packet_backup: 32,
            snapshot_frames: 128,
            snapshot_storage: 32 * 4 * 256,
            max_frame_entities: 1024,
            max_snapshot_entities: 256,
            flood_protect: true,
            rate_limits: RateLimitConfig::default(),
            rcon_password: None,
            allow_download: false,
            download_dir: None,
            download_block_size: 1024,
            download_window: 8,
            download_timeout_ms: 1_000,
            metrics_port: 9090,
        }
    }
}

/// Read and parse an environment variable, warning on garbage
fn read_env<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = read_env::<IpAddr>("BIND_ADDRESS") {
            config.bind_address = addr;
        }

        if let Some(port) = read_env::<u16>("PORT") {
            if port > 0 {
                config.port = port;
            } else {
                tracing::warn!("PORT must be > 0, using default");
            }
        }

        if let Ok(hostname) = std::env::var("SERVER_HOSTNAME") {
            if !hostname.is_empty() {
                config.hostname = hostname;
            }
        }

        if let Some(max_clients) = read_env::<usize>("MAX_CLIENTS") {
            if (1..=1024).contains(&max_clients) {
                config.max_clients = max_clients;
            } else {
                tracing::warn!("MAX_CLIENTS must be 1-1024, using default");
            }
        }

        if let Some(tick_rate) = read_env::<u32>("TICK_RATE") {
            if (1..=1000).contains(&tick_rate) {
                config.tick_rate = tick_rate;
            } else {
                tracing::warn!("TICK_RATE must be 1-1000, using default");
            }
        }

        if let Some(ms) = read_env::<u64>("CLIENT_TIMEOUT_MS") {
            config.client_timeout_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = ms;
        }
        if let Some(ms) = read_env::<u64>("ZOMBIE_TIME_MS") {
            config.zombie_time_ms = ms;
        }
        if let Some(n) = read_env::<usize>("MAX_CLIENTS_PER_IP") {
            config.max_clients_per_ip = n;
        }
        if let Some(rate) = read_env::<u32>("MIN_RATE") {
            config.min_rate = rate;
        }
        if let Some(rate) = read_env::<u32>("MAX_RATE") {
            config.max_rate = rate;
        }
        if let Some(size) = read_env::<usize>("FRAGMENT_SIZE") {
            config.fragment_size = size;
        }
        if let Some(flag) = read_env::<bool>("FLOOD_PROTECT") {
            config.flood_protect = flag;
        }
        if let Some(port) = read_env::<u16>("METRICS_PORT") {
            config.metrics_port = port;
        }

        if let Ok(password) = std::env::var("RCON_PASSWORD") {
            if !password.is_empty() {
                config.rcon_password = Some(password);
            }
        }

        if let Ok(dir) = std::env::var("DOWNLOAD_DIR") {
            config.download_dir = Some(PathBuf::from(dir));
            config.allow_download = true;
        }

        config
    }

    /// Milliseconds between ticks
    pub fn frame_msec(&self) -> u64 {
        (1000 / self.tick_rate.max(1) as u64).max(1)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1"));
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be at least 1"));
        }
        if self.max_clients_per_ip == 0 {
            return Err(ConfigError::Invalid("max_clients_per_ip must be at least 1"));
        }
        if !self.reliable_log_capacity.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo("reliable_log_capacity", self.reliable_log_capacity));
        }
        if !self.packet_backup.is_power_of_two() || self.packet_backup < 4 {
            return Err(ConfigError::NotPowerOfTwo("packet_backup", self.packet_backup));
        }
        if !(64..=1400).contains(&self.fragment_size) {
            return Err(ConfigError::FragmentSize(self.fragment_size));
        }
        if self.max_message_size < self.fragment_size {
            return Err(ConfigError::Invalid("max_message_size must be at least fragment_size"));
        }
        if self.min_rate > self.max_rate {
            return Err(ConfigError::RateBounds(self.min_rate, self.max_rate));
        }
        if self.snapshot_frames < self.packet_backup {
            return Err(ConfigError::Invalid("snapshot_frames must cover packet_backup"));
        }
        if self.max_snapshot_entities > self.max_frame_entities {
            return Err(ConfigError::Invalid("max_snapshot_entities cannot exceed max_frame_entities"));
        }
        // One frame must always fit or no snapshot could ever be built
        if self.snapshot_storage < self.max_frame_entities {
            return Err(ConfigError::SnapshotStorage {
                storage: self.snapshot_storage,
                frame: self.max_frame_entities,
            });
        }
        if self.allow_download && self.download_dir.is_none() {
            return Err(ConfigError::Invalid("allow_download requires download_dir"));
        }
        if self.download_window == 0 || self.download_block_size == 0 {
            return Err(ConfigError::Invalid("download window and block size must be non-zero"));
        }

        let limits = &self.rate_limits;
        for (name, bucket) in [
            ("challenge", limits.challenge),
            ("connect", limits.connect),
            ("query", limits.query),
            ("rcon", limits.rcon),
            ("command", limits.command),
            ("gamestate", limits.gamestate),
            ("client_command", limits.client_command),
            ("client_userinfo", limits.client_userinfo),
            ("client_gamestate", limits.client_gamestate),
        ] {
            if bucket.burst == 0 || bucket.period_ms == 0 {
                return Err(ConfigError::Bucket(name));
            }
        }
        if limits.pool_size == 0 {
            return Err(ConfigError::Invalid("rate limit pool_size must be at least 1"));
        }

        Ok(())
    }
}

/// Fatal configuration problems, detected before any socket is bound
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("{0} must be a power of two, got {1}")]
    NotPowerOfTwo(&'static str, usize),
    #[error("fragment_size {0} outside 64..=1400")]
    FragmentSize(usize),
    #[error("min_rate {0} exceeds max_rate {1}")]
    RateBounds(u32, u32),
    #[error("snapshot storage of {storage} entities cannot hold one frame of {frame}")]
    SnapshotStorage { storage: usize, frame: usize },
    #[error("rate limit bucket '{0}' needs a non-zero burst and period")]
    Bucket(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 27960);
        assert_eq!(config.tick_rate, 20);
        assert_eq!(config.reliable_log_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_msec() {
        let config = ServerConfig {
            tick_rate: 40,
            ..Default::default()
        };
        assert_eq!(config.frame_msec(), 25);
    }

    #[test]
    fn test_snapshot_storage_smaller_than_frame_is_fatal() {
        let config = ServerConfig {
            snapshot_storage: 100,
            max_frame_entities: 1024,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SnapshotStorage { storage: 100, frame: 1024 })
        ));
    }

    #[test]
    fn test_reliable_capacity_must_be_power_of_two() {
        let config = ServerConfig {
            reliable_log_capacity: 48,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPowerOfTwo("reliable_log_capacity", 48))
        ));
    }

    #[test]
    fn test_rate_bounds() {
        let config = ServerConfig {
            min_rate: 10_000,
            max_rate: 5_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RateBounds(_, _))));
    }

    #[test]
    fn test_zero_bucket_rejected() {
        let mut config = ServerConfig::default();
        config.rate_limits.connect = BucketConfig::new(0, 1000);
        assert_eq!(config.validate(), Err(ConfigError::Bucket("connect")));
    }

    #[test]
    fn test_download_requires_directory() {
        let config = ServerConfig {
            allow_download: true,
            download_dir: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }
}
