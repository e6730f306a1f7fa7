use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    engine::PollPolicy,
    sequencer::{SequenceOptions, ShortTrackPolicy, StaticBed},
};

pub const CONFIG_FILE_NAME: &str = "splicer.config.toml";
pub const CONFIG_PATH_ENV: &str = "SPLICER_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub polling: PollingConfig,
    pub render: RenderConfig,
    pub session: SessionConfig,
    pub routing: RoutingConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub address: String,
    /// Spawn the engine in server mode instead of expecting one to be running.
    pub launch: bool,
    pub binary: PathBuf,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub settle_ms: u64,
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub crossfade_seconds: f64,
    pub work_dir: PathBuf,
    pub sample_format: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub short_track_policy: ShortTrackPolicy,
    pub bed_source: Option<PathBuf>,
    pub bed_amplitude_pct: f64,
    pub length_cache: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub root: PathBuf,
    pub default_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Client name the engine registers its ports under.
    pub engine_client: String,
    pub hardware_owner: String,
    pub hardware_playback_prefix: String,
    pub connect_binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
    pub log_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2868".to_string(),
            launch: false,
            binary: PathBuf::from("ecasound"),
            port: 2868,
            connect_timeout_ms: 2_000,
            io_timeout_ms: 30_000,
            connect_attempts: 20,
            connect_retry_delay_ms: 250,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 500,
            interval_ms: 100,
            max_interval_ms: 1_000,
            timeout_secs: 3_600,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            crossfade_seconds: 10.0,
            work_dir: PathBuf::from("data/render"),
            sample_format: "s16_le".to_string(),
            channels: 2,
            sample_rate: 44_100,
            short_track_policy: ShortTrackPolicy::Reject,
            bed_source: None,
            bed_amplitude_pct: 30.0,
            length_cache: Some(PathBuf::from("data/lengths.json")),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sessions"),
            default_name: "default".to_string(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            engine_client: "ecasound".to_string(),
            hardware_owner: "system".to_string(),
            hardware_playback_prefix: "playback".to_string(),
            connect_binary: PathBuf::from("jack_connect"),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: "info,splicer_core=trace".to_string(),
            trace_file_prefix: "splicer".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PollingConfig {
    #[must_use]
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            settle: Duration::from_millis(self.settle_ms),
            interval: Duration::from_millis(self.interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.max(self.interval_ms)),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl RenderConfig {
    /// `-f` style format string for a chain with `channels` channels.
    #[must_use]
    pub fn audio_format(&self, channels: u16) -> String {
        format!(
            "{},{},{}",
            self.sample_format,
            channels.max(1),
            self.sample_rate
        )
    }

    #[must_use]
    pub fn sequence_options(&self) -> SequenceOptions {
        SequenceOptions {
            crossfade: self.crossfade_seconds,
            static_bed: self.bed_source.as_ref().map(|source| StaticBed {
                source: source.clone(),
                amplitude_pct: self.bed_amplitude_pct,
            }),
            short_track_policy: self.short_track_policy,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = discover_config_path().with_context(|| {
            format!("failed to locate {CONFIG_FILE_NAME}; looked in cwd and parent directory")
        })?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| {
            format!("failed to parse config TOML from {}", config_path.display())
        })?;

        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults. A present but broken file is an error.
    pub fn load_or_default() -> Result<Self> {
        match discover_config_path() {
            Ok(path) => Self::load_from(&path),
            Err(error) => {
                debug!(%error, "no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| anyhow::anyhow!("{CONFIG_FILE_NAME} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let config: AppConfig = toml::from_str(
            r#"
            [render]
            crossfade_seconds = 6.5
            bed_source = "beds/static.wav"

            [engine]
            launch = true
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(config.render.crossfade_seconds, 6.5);
        assert_eq!(config.render.sample_rate, 44_100);
        assert!(config.engine.launch);
        assert_eq!(config.engine.address, "127.0.0.1:2868");
        assert_eq!(config.routing.engine_client, "ecasound");

        let options = config.render.sequence_options();
        let bed = options.static_bed.expect("bed should be configured");
        assert_eq!(bed.amplitude_pct, 30.0);
    }

    #[test]
    fn polling_policy_never_shrinks_the_max_interval() {
        let polling = PollingConfig {
            settle_ms: 0,
            interval_ms: 400,
            max_interval_ms: 100,
            timeout_secs: 5,
        };
        let policy = polling.policy();
        assert_eq!(policy.max_interval, Duration::from_millis(400));
        assert_eq!(policy.timeout, Duration::from_secs(5));
    }

    #[test]
    fn audio_format_clamps_channels() {
        let render = RenderConfig::default();
        assert_eq!(render.audio_format(0), "s16_le,1,44100");
        assert_eq!(render.audio_format(2), "s16_le,2,44100");
    }
}
