use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};

use crate::cli::ServeArgs;

pub const INIT_POOL_CAPACITY: usize = 8192;
pub const INIT_POOL_TTL: Duration = Duration::from_secs(10 * 60);
pub const WAITING_POOL_CAPACITY: usize = 20_000;
pub const WAITING_POOL_TTL: Duration = Duration::from_secs(10 * 60);
pub const PAIRED_POOL_CAPACITY: usize = 20_000;
pub const PAIRED_POOL_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CODE_ATTEMPTS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub capacity: usize,
    pub ttl: Duration,
}

impl PoolSettings {
    pub const fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }
}

/// Pool bounds and pairing limits for a relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Sockets that have not declared a role yet.
    pub init: PoolSettings,
    /// Senders holding a pairing code, keyed by that code.
    pub waiting: PoolSettings,
    /// Peers with a partner.
    pub paired: PoolSettings,
    pub code_attempts: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            init: PoolSettings::new(INIT_POOL_CAPACITY, INIT_POOL_TTL),
            waiting: PoolSettings::new(WAITING_POOL_CAPACITY, WAITING_POOL_TTL),
            paired: PoolSettings::new(PAIRED_POOL_CAPACITY, PAIRED_POOL_TTL),
            code_attempts: DEFAULT_CODE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub count_file: PathBuf,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub relay: RelayConfig,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(args.sweep_interval_ms > 0, "sweep interval must be positive");
        ensure!(args.code_attempts > 0, "code attempts must be positive");
        Ok(ServerConfig {
            listen_addr,
            count_file: args.count_file,
            sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            relay: RelayConfig {
                code_attempts: args.code_attempts,
                ..RelayConfig::default()
            },
        })
    }
}
