//! shoal-proxy: a transparent multiplexing proxy for RESP shards.
//!
//! Sits in front of several key-value store shards and speaks the store's
//! native wire protocol, so clients issue commands without knowing the
//! sharding scheme. Commands are tokenized incrementally, classified for
//! multiplexed safety, routed over a consistent-hash ring to pooled
//! backend connections, and forwarded byte-for-byte. Responses come back
//! strictly FIFO per client session. Publish/subscribe channels get a
//! dedicated fan-out worker each.
//!
//! The library surface exists so integration tests can drive a proxy
//! against in-process mock shards; the `shoal` binary in `main.rs` is a
//! thin wrapper that parses flags, loads the JSON config, and wires up
//! signal handling.

pub mod backend;
pub mod classify;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod pubsub;
pub mod ring;
pub mod server;
pub mod session;

pub use config::ProxyConfig;
pub use server::Multiplexer;
