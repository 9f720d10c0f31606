use anyhow::Context;
use gemini_realtime::GeminiConfig;
use gemini_realtime::config::{
    DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_voice: String,
    pub gemini_endpoint: String,
    pub system_prompt_path: Option<PathBuf>,
    /// Rate of the PCM16 audio clients send.
    pub input_sample_rate: u32,
    /// Rate clients expect for `audio_output`.
    pub output_sample_rate: u32,
    pub max_connections: usize,
    pub log_level: Level,
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}")))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:5050")?;

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;
        let gemini_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let gemini_voice =
            std::env::var("GEMINI_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.to_string());
        let gemini_endpoint =
            std::env::var("GEMINI_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let system_prompt_path = std::env::var("SYSTEM_PROMPT_PATH").ok().map(PathBuf::from);

        let input_sample_rate = parse_var::<u32>("INPUT_SAMPLE_RATE", "16000")?;
        let output_sample_rate = parse_var::<u32>("OUTPUT_SAMPLE_RATE", "24000")?;
        for (name, rate) in [
            ("INPUT_SAMPLE_RATE", input_sample_rate),
            ("OUTPUT_SAMPLE_RATE", output_sample_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "sample rate must be positive".to_string(),
                ));
            }
        }
        let max_connections = parse_var::<usize>("MAX_CONNECTIONS", "100")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            gemini_api_key,
            gemini_model,
            gemini_voice,
            gemini_endpoint,
            system_prompt_path,
            input_sample_rate,
            output_sample_rate,
            max_connections,
            log_level,
        })
    }

    /// Builds the upstream settings, reading the system prompt file if one
    /// is configured.
    pub fn gemini_config(&self) -> anyhow::Result<GeminiConfig> {
        let system_instruction = match &self.system_prompt_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt from {}", path.display()))?,
            None => DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        };
        let mut gemini = GeminiConfig::new(self.gemini_api_key.clone());
        gemini.endpoint = self.gemini_endpoint.clone();
        gemini.model = self.gemini_model.clone();
        gemini.voice = self.gemini_voice.clone();
        gemini.system_instruction = system_instruction;
        Ok(gemini)
    }
}
