use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fastsend-relay",
    author,
    version,
    about = "FastSend pairing relay and probe client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(
        long,
        env = "FASTSEND_RELAY_LISTEN_ADDR",
        default_value = "0.0.0.0:3000"
    )]
    pub listen_addr: String,

    /// File holding the number of completed pairings.
    #[arg(long, env = "FASTSEND_RELAY_COUNT_FILE", default_value = "transCount")]
    pub count_file: PathBuf,

    /// How often expired pool entries are swept.
    #[arg(long, env = "FASTSEND_RELAY_SWEEP_INTERVAL_MS", default_value_t = 1000)]
    pub sweep_interval_ms: u64,

    /// Random draws tried before a sender is told no code is free.
    #[arg(long, env = "FASTSEND_RELAY_CODE_ATTEMPTS", default_value_t = 2048)]
    pub code_attempts: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FASTSEND_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a relay as a sender or receiver and print what comes back
    Probe {
        /// Relay websocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000/api/connect")]
        url: String,

        #[command(subcommand)]
        role: ProbeRole,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum ProbeRole {
    /// Ask for a pairing code and wait for a receiver
    Send {
        /// Seconds to keep listening after the code arrives
        #[arg(short, long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Join a waiting sender by code
    Receive {
        #[arg(short, long)]
        code: String,

        /// Text to relay to the sender once paired
        #[arg(short, long)]
        message: Option<String>,
    },
}
