use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "webphone.toml")]
    pub conf: Option<String>,

    /// Client identity sent with token requests, overrides the config file
    #[clap(long)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub backend: BackendConfig,
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
    pub ring_group: RingGroupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub token_path: String,
    pub mute_path: String,
    pub transfer_path: String,
    pub identity: String,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub codec_preferences: Vec<String>,
    pub enable_ringing_state: bool,
    pub debug: bool,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: u32,
    pub output_device: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub retry_interval_secs: u64,
    /// 0 disables the escalation of unanswered calls
    pub ring_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RingGroupConfig {
    pub agents: Vec<String>,
    pub backup_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            backend: BackendConfig::default(),
            signaling: SignalingConfig::default(),
            media: MediaConfig::default(),
            session: SessionConfig::default(),
            ring_group: RingGroupConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/".to_string(),
            token_path: "token".to_string(),
            mute_path: "mute_call".to_string(),
            transfer_path: "transfer_call".to_string(),
            identity: "user".to_string(),
            timeout_ms: Some(5000),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/signal".to_string(),
            codec_preferences: vec!["opus".to_string(), "pcmu".to_string()],
            enable_ringing_state: true,
            debug: false,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: 48000,
            output_device: "default".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 5,
            ring_timeout_secs: 23,
        }
    }
}

impl Default for RingGroupConfig {
    fn default() -> Self {
        Self {
            agents: (1..=7).map(|i| format!("agent{}", i)).collect(),
            backup_agent: Some("agent8".to_string()),
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        match self.ring_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Environment wins over the file, the command line wins over both.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Ok(url) = std::env::var("WEBPHONE_BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Ok(url) = std::env::var("WEBPHONE_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Ok(identity) = std::env::var("WEBPHONE_IDENTITY") {
            self.backend.identity = identity;
        }
        if let Some(identity) = &cli.identity {
            self.backend.identity = identity.clone();
        }
    }
}
