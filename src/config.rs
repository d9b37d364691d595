use std::path::PathBuf;
use std::time::Duration;

use crate::constants;

/// Where the dialogue collaborator lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    pub runtime_url: String,
    pub api_key: String,
    /// No timeout unless configured; a hung call keeps the turn in flight.
    pub request_timeout: Option<Duration>,
}

impl DialogueConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            runtime_url: constants::DEFAULT_RUNTIME_URL.to_string(),
            api_key: api_key.into(),
            request_timeout: None,
        }
    }

    pub fn with_runtime_url(mut self, url: impl Into<String>) -> Self {
        self.runtime_url = url.into();
        self
    }

    /// `{runtime_url}/state/user/{session_id}/interact`
    pub fn interact_url(&self, session_id: &str) -> String {
        format!(
            "{}/state/user/{}/interact",
            self.runtime_url.trim_end_matches('/'),
            session_id
        )
    }
}

/// Model definition and metadata resources (local paths or http(s) URLs) plus the
/// endpoint that runs inference for them.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_url: String,
    pub metadata_url: String,
    pub inference_url: String,
}

impl ModelConfig {
    pub fn new(inference_url: impl Into<String>) -> Self {
        Self {
            model_url: constants::DEFAULT_MODEL_URL.to_string(),
            metadata_url: constants::DEFAULT_METADATA_URL.to_string(),
            inference_url: inference_url.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub template_dir: PathBuf,
    pub static_dir: PathBuf,
    pub animation_delay: Duration,
    pub session_idle: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: constants::DEFAULT_PORT,
            template_dir: PathBuf::from(constants::DEFAULT_TEMPLATE_DIR),
            static_dir: PathBuf::from(constants::DEFAULT_STATIC_DIR),
            animation_delay: constants::DEFAULT_ANIMATION_DELAY,
            session_idle: constants::DEFAULT_SESSION_IDLE,
        }
    }
}
