//! Pairing relay for FastSend.
//!
//! A sender asks for a four-digit code, a receiver presents it, and the relay
//! forwards their handshake messages verbatim until either side goes away.

pub mod actor;
pub mod cli;
pub mod codes;
pub mod config;
pub mod counter;
pub mod peer;
pub mod pool;
pub mod probe;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod websocket;
