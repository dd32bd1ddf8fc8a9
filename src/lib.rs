//! Request-forwarding core of a layer-7 reverse proxy: endpoint pools with lifecycle and health
//! state, a round-robin/least-connection iterator with sticky-session pinning and AZ-locality
//! preference, a composable error classifier, and a request dispatcher implementing the retry
//! loop, sticky-cookie installation, and the raw-TCP/WebSocket upgrade path. TLS material
//! provisioning and route resolution live outside this crate; see `dispatcher::TransportFactory`
//! for the seam where an embedder plugs those in.

pub mod admin;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod error_handler;
pub mod iterator;
pub mod pool;
pub mod sticky;
pub mod telemetry;
pub mod transport;
