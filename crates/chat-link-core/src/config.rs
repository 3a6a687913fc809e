//! Static per-environment configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("features.useWebSocket is set but websocketUrl is missing")]
    MissingWebsocketUrl,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Resolve an environment by name. Unknown names map to development.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "staging" => Self::Staging,
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Feature switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Features {
    /// Use the WebSocket transport instead of the event stream.
    pub use_web_socket: bool,
    /// Show session/connection diagnostics in the UI.
    pub show_debug_info: bool,
    /// Install the tracing subscriber.
    pub enable_logging: bool,
    /// UI-side mock mode. Carried through, not interpreted here.
    pub mock_mode: bool,
}

/// Agent endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Display name of the application.
    #[serde(default)]
    pub app_name: String,
    /// Event stream URL.
    pub agent_url: String,
    /// Base URL for the HTTP send endpoints.
    pub agent_api_base_url: String,
    /// WebSocket URL.
    #[serde(default)]
    pub websocket_url: Option<String>,
    /// User id attached to outbound messages when the UI supplies none.
    pub default_user_id: String,
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub features: Features,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl AgentConfig {
    /// Local development agent.
    #[must_use]
    pub fn development() -> Self {
        Self {
            app_name: "Chat MFE (Development)".to_string(),
            agent_url: "http://localhost:3001/sse".to_string(),
            agent_api_base_url: "http://localhost:3001".to_string(),
            websocket_url: None,
            default_user_id: "dev-user".to_string(),
            debug: true,
            features: Features {
                use_web_socket: false,
                show_debug_info: true,
                enable_logging: true,
                mock_mode: false,
            },
        }
    }

    /// Staging agent.
    #[must_use]
    pub fn staging() -> Self {
        let base = "https://storefront-agent-api.kindflower-89fe6492.eastus.azurecontainerapps.io";
        Self {
            app_name: "Chat MFE (Staging)".to_string(),
            agent_url: format!("{base}/sse/chat"),
            agent_api_base_url: base.to_string(),
            websocket_url: None,
            default_user_id: "staging-user".to_string(),
            debug: false,
            features: Features {
                use_web_socket: false,
                show_debug_info: false,
                enable_logging: true,
                mock_mode: false,
            },
        }
    }

    /// Production agent.
    #[must_use]
    pub fn production() -> Self {
        let host = "mcp-storefront-agent-app.bluesky-3a89aa0f.eastus.azurecontainerapps.io";
        Self {
            app_name: "Chat MFE".to_string(),
            agent_url: format!("https://{host}/sse/chat"),
            agent_api_base_url: format!("https://{host}"),
            websocket_url: Some(format!("wss://{host}/ws/chat")),
            default_user_id: "prod-user".to_string(),
            debug: false,
            features: Features::default(),
        }
    }

    /// Preset for `env`.
    #[must_use]
    pub fn for_environment(env: Environment) -> Self {
        match env {
            Environment::Development => Self::development(),
            Environment::Staging => Self::staging(),
            Environment::Production => Self::production(),
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check URLs and feature consistency.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("agentUrl", &self.agent_url)?;
        check_url("agentApiBaseUrl", &self.agent_api_base_url)?;
        match &self.websocket_url {
            Some(ws) => check_url("websocketUrl", ws)?,
            None if self.features.use_web_socket => return Err(ConfigError::MissingWebsocketUrl),
            None => {}
        }
        Ok(())
    }

    /// URL the selected transport should connect to.
    #[must_use]
    pub fn connect_url(&self) -> &str {
        match (&self.websocket_url, self.features.use_web_socket) {
            (Some(ws), true) => ws,
            _ => &self.agent_url,
        }
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidUrl {
            field,
            reason: e.to_string(),
        })
}
