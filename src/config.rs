//! Runtime configuration.
//!
//! Everything has a sensible default; deployments override individual
//! fields through `LIVEVOICE_*` environment variables.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value for {key}: {value}")]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Websocket endpoint of the voice service
    pub server_url: String,
    /// Bearer token; empty disables the Authorization header
    pub api_token: String,
    /// System persona sent at session setup
    pub persona: String,

    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Outbound frame rate in Hz
    pub input_sample_rate: u32,
    /// Inbound segment rate in Hz
    pub output_sample_rate: u32,
    /// Samples per outbound frame
    pub frame_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9750/v1/live".to_string(),
            api_token: String::new(),
            persona: "You are a friendly, helpful voice assistant. \
                      Keep your answers concise and conversational."
                .to_string(),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            frame_window: 4096,
        }
    }
}

impl Config {
    /// Defaults overridden by `LIVEVOICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("LIVEVOICE_URL") {
            config.server_url = v;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_TOKEN") {
            config.api_token = v;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_PERSONA") {
            config.persona = v;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_CAPTURE_DEVICE") {
            config.capture_device = v;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_PLAYBACK_DEVICE") {
            config.playback_device = v;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_INPUT_RATE") {
            config.input_sample_rate = parse(&v, "LIVEVOICE_INPUT_RATE")?;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_OUTPUT_RATE") {
            config.output_sample_rate = parse(&v, "LIVEVOICE_OUTPUT_RATE")?;
        }
        if let Ok(v) = std::env::var("LIVEVOICE_FRAME_WINDOW") {
            config.frame_window = parse(&v, "LIVEVOICE_FRAME_WINDOW")?;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError {
        key,
        value: value.to_string(),
    })
}
