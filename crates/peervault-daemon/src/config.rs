//! Daemon configuration assembled from CLI arguments.

use peervault_core::{GcConfig, ManagerConfig, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the vault's persistent state.
    pub data_dir: PathBuf,
    /// TCP address the transport listens on.
    pub listen: String,
    /// Display name advertised to peers.
    pub nickname: Option<String>,
    /// Accept pairing requests without interaction.
    pub auto_accept: bool,
    /// Autosync period; zero relies on pushed updates only.
    pub auto_sync_interval: Duration,
    /// Period of the background GC loop; zero disables it.
    pub gc_interval: Duration,
    pub gc: GcConfig,
    /// 32-byte key enabling at-rest encryption.
    pub encryption_key: Option<[u8; 32]>,
}

impl DaemonConfig {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            auto_sync_interval: self.auto_sync_interval,
            auto_accept_pairing: self.auto_accept,
            hostname: hostname(),
            nickname: self.nickname.clone(),
            session: SessionConfig::default(),
        }
    }
}

/// Best-effort machine name for the handshake.
pub fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}
