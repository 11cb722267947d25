use modem::net::channel::ClosePolicy;
use modem::net::pacer::PacerConfig;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5190;

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub address: Option<String>,
    pub max_clients: u16,
    pub log_level: String,
}

impl Default for Server {
    fn default() -> Server {
        Server {
            address: Some(format!("0.0.0.0:{}", DEFAULT_PORT)),
            max_clients: 256,
            log_level: "debug".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Pacer {
    pub inter_frame_delay_ms: u64,
    pub max_burst_frames: usize,
}

impl Default for Pacer {
    fn default() -> Pacer {
        Pacer {
            inter_frame_delay_ms: 5,
            max_burst_frames: 10,
        }
    }
}

/// Collaborator-facing knobs the core itself never reads.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Upload {
    pub phase_timeout_ms: u64,
}

impl Default for Upload {
    fn default() -> Upload {
        Upload {
            phase_timeout_ms: 30_000,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub close_on_peer_silence: bool,
    pub close_on_window_violation: bool,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            close_on_peer_silence: true,
            close_on_window_violation: false,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub pacer: Pacer,
    pub upload: Upload,
    pub policy: Policy,
}

impl ServerConfig {
    /// Unknown keys in the file are ignored; missing sections fall back to
    /// their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn address(&self) -> String {
        self.server
            .address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT))
    }

    pub fn pacer_config(&self) -> PacerConfig {
        PacerConfig {
            max_burst_frames: self.pacer.max_burst_frames,
            inter_frame_delay: Duration::from_millis(self.pacer.inter_frame_delay_ms),
            ..PacerConfig::default()
        }
    }

    pub fn close_policy(&self) -> ClosePolicy {
        ClosePolicy {
            close_on_peer_silence: self.policy.close_on_peer_silence,
            close_on_window_violation: self.policy.close_on_window_violation,
        }
    }
}
