//! Application configuration.
//!
//! The top-level [`Config`] is deserialized from a TOML file and carries the
//! media root, server binding, cache location, and streaming tunables. Every
//! field except `root_path` defaults sensibly so a minimal config file is
//! valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capacity of the media descriptor LRU. Fixed; the deployment contract
/// requires `max_client_number` to stay below this so a media descriptor is
/// never evicted while a client is still attached to one of its backends.
pub const MEDIA_CACHE_CAPACITY: usize = 20;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory whose media files are exposed by the server.
    pub root_path: PathBuf,
    pub server: ServerConfig,
    /// Scratch directory for transcoded segments. Removed on shutdown.
    pub cache_path: Option<PathBuf>,
    /// Directory containing the ffmpeg/ffprobe binaries. When unset the
    /// binaries are resolved from `PATH`.
    pub ffmpeg_binary_dir: Option<PathBuf>,
    /// Minimum per-client buffered lookahead in seconds. Encoders run until
    /// every attached client is buffered to twice this value.
    pub buffer_length: f64,
    /// Maximum number of concurrently tracked streaming clients.
    pub max_client_number: usize,
    /// Raise the default log level to debug.
    pub debug: bool,
    /// Disable the "maybe natively supported" playback hint.
    pub no_short_circuit: bool,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4040,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::new(),
            server: ServerConfig::default(),
            cache_path: None,
            ffmpeg_binary_dir: None,
            buffer_length: 30.0,
            max_client_number: 5,
            debug: false,
            no_short_circuit: false,
        }
    }
}

impl Config {
    /// Resolved scratch directory for transcoded segments.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("reelcast-cache"))
    }

    /// Path to the ffmpeg binary, honoring `ffmpeg_binary_dir`.
    pub fn ffmpeg_path(&self) -> PathBuf {
        self.tool_path("ffmpeg")
    }

    /// Path to the ffprobe binary, honoring `ffmpeg_binary_dir`.
    pub fn ffprobe_path(&self) -> PathBuf {
        self.tool_path("ffprobe")
    }

    fn tool_path(&self, name: &str) -> PathBuf {
        match &self.ffmpeg_binary_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Maximum per-client buffered lookahead in seconds.
    pub fn max_buffer_length(&self) -> f64 {
        self.buffer_length * 2.0
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return the default config.
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./reelcast.toml",
        "~/.config/reelcast/config.toml",
        "/etc/reelcast/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.root_path.as_os_str().is_empty() {
        anyhow::bail!("root_path is required");
    }

    if config.buffer_length <= 0.0 {
        anyhow::bail!("buffer_length must be positive");
    }

    if config.max_client_number == 0 {
        anyhow::bail!("max_client_number must be at least 1");
    }

    // Keeping the client table smaller than the media cache guarantees a
    // media descriptor is never evicted out from under a tracked client.
    if config.max_client_number >= MEDIA_CACHE_CAPACITY {
        anyhow::bail!(
            "max_client_number must stay below the media cache capacity ({})",
            MEDIA_CACHE_CAPACITY
        );
    }

    Ok(())
}
