use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Configuration for the sticker conversion worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Bitrate in kbps used for short clips when the job carries none
    pub default_bitrate: u32,
    /// Clip duration ceiling in seconds when the job carries none
    pub default_max_duration: u32,
    /// Number of concurrent workers (defaults to the logical CPU count)
    pub parallelism: Option<usize>,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Directory for downloaded sources and encoded artifacts
    pub temp_dir: PathBuf,
    /// Directory where job records are stored
    pub job_state_dir: PathBuf,
    /// Directory holding the circle and corner mask templates
    pub assets_dir: PathBuf,
    /// Jobs older than this (since enqueue) are rejected
    pub stale_job_secs: u64,
    /// Finished job records are pruned after this many seconds
    pub job_retention_secs: u64,
    /// Interval between job record sweeps
    pub sweep_interval_secs: u64,
    /// Idle workers poll the job store at this interval
    pub poll_interval_ms: u64,
    /// Wall-clock grace added to the clip duration for the encode deadline
    pub encode_grace_secs: u64,
    /// Upper bound for a single ffprobe run
    pub probe_timeout_secs: u64,
    /// Upper bound for downloading a remote source
    pub download_timeout_secs: u64,
    /// Title written into every produced sticker
    pub output_title: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            default_bitrate: 400,
            default_max_duration: 10,
            parallelism: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            temp_dir: std::env::temp_dir().join("stickerd"),
            job_state_dir: PathBuf::from("/tmp/stickerd-jobs"),
            assets_dir: PathBuf::from("assets"),
            stale_job_secs: 10 * 60,
            job_retention_secs: 60,
            sweep_interval_secs: 5,
            poll_interval_ms: 500,
            encode_grace_secs: 30,
            probe_timeout_secs: 30,
            download_timeout_secs: 60,
            output_title: "https://t.me/fstikbot".to_string(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Apply overrides from process environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup; unparseable values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "DEFAULT_BITRATE") {
            self.default_bitrate = v;
        }
        if let Some(v) = parse_var(&lookup, "DEFAULT_MAX_DURATION") {
            self.default_max_duration = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "MAX_PROCESS") {
            if v > 0 {
                self.parallelism = Some(v);
            }
        }
        if let Some(v) = lookup("FFMPEG_BIN") {
            self.ffmpeg_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("FFPROBE_BIN") {
            self.ffprobe_bin = PathBuf::from(v);
        }
        if let Some(v) = lookup("STICKER_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STICKER_JOB_DIR") {
            self.job_state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STICKER_ASSETS_DIR") {
            self.assets_dir = PathBuf::from(v);
        }
    }

    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        self.parallelism.filter(|n| *n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
