//! peervault-daemon: headless vault sync node.
//!
//! Wires peervault-core to real storage (one file per key), a WebSocket
//! transport, and a CLI. The daemon owns scheduling only: autosync and GC
//! periods, pairing policy, shutdown.

pub mod config;
pub mod fs_storage;
pub mod ws_transport;

pub use config::DaemonConfig;
pub use fs_storage::FsStorage;
pub use ws_transport::WsTransport;
