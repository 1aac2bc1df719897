//! Retrieval and peer scoring core of the Odf light client.
//!
//! Fetches chain data on demand from untrusted server peers. The
//! [`light_client::LightClient`] facade owns the peer set, the value tracker,
//! the server pool and the request distributor.
pub mod config;
pub mod data;
pub mod distributor;
pub mod light_client;
pub mod peers;
pub mod retrieve;
pub mod server_pool;
pub mod shutdown;
pub mod types;
pub mod utils;
pub mod value_tracker;
