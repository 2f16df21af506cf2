use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [transfer]
//                    timeout_secs = 600
//
//   env var:         PIPEDROP_TRANSFER__TIMEOUT_SECS=600   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub signaling: SignalingFileConfig,
    #[serde(default)]
    pub transfer: TransferFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Directory of static UI assets served at `/` (disabled when unset).
    #[serde(default)]
    pub ui_dir: Option<PathBuf>,
}

/// Signaling socket tunables (lives under `[signaling]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingFileConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SignalingFileConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Streaming tunables (lives under `[transfer]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferFileConfig {
    /// How long either side waits for its counterpart to attach (0 = forever)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_copy_buffer_kb")]
    pub copy_buffer_kb: usize,
    #[serde(default = "default_pipe_buffer_kb")]
    pub pipe_buffer_kb: usize,
}

impl Default for TransferFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            copy_buffer_kb: default_copy_buffer_kb(),
            pipe_buffer_kb: default_pipe_buffer_kb(),
        }
    }
}

/// Transfer history tunables (lives under `[history]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_history_enabled(),
        }
    }
}

fn default_channel_capacity() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30 * 60
}
fn default_copy_buffer_kb() -> usize {
    1024
}
fn default_pipe_buffer_kb() -> usize {
    64
}
fn default_history_enabled() -> bool {
    true
}

/// Build a figment that layers: defaults → config.toml → PIPEDROP_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PIPEDROP_SERVER__PORT=8080`  →  `server.port = 8080`
///   `PIPEDROP_TRANSFER__PIPE_BUFFER_KB=256`  →  `transfer.pipe_buffer_kb = 256`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PIPEDROP_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Server configuration for runtime behavior.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub signaling: SignalingConfig,
    pub transfer: TransferConfig,
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// Outbound queue depth per signaling connection
    pub channel_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Wait bound for the counterpart of a stream to attach (None = unbounded)
    pub attach_timeout: Option<Duration>,
    /// Intermediate buffer for copying request bodies and pipe output
    pub copy_buffer_bytes: usize,
    /// In-memory capacity of each pipe before writes block
    pub pipe_buffer_bytes: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            signaling: SignalingConfig {
                channel_capacity: fc.signaling.channel_capacity.max(1),
            },
            transfer: TransferConfig {
                attach_timeout: if fc.transfer.timeout_secs == 0 {
                    None
                } else {
                    Some(Duration::from_secs(fc.transfer.timeout_secs))
                },
                copy_buffer_bytes: fc.transfer.copy_buffer_kb.max(1) * 1024,
                pipe_buffer_bytes: fc.transfer.pipe_buffer_kb.max(1) * 1024,
            },
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct PipedropConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl PipedropConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".pipedrop"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("pipedrop.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
