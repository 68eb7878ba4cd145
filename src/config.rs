use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use strum_macros::{AsRefStr, Display};
use url::Url;

use crate::error::{HaError, Result};

// =============================================================================
// Command Line & Environment
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    /// Streamable HTTP on `/mcp`
    Http,
    /// JSON-RPC over stdin/stdout
    Stdio,
}

#[derive(Debug, Parser)]
#[command(name = "smarthome-mcp")]
#[command(about = "MCP server exposing Home Assistant entities as tools")]
#[command(version)]
pub struct Cli {
    /// Home Assistant URL (e.g., http://homeassistant.local:8123)
    #[arg(long = "url", env = "HA_URL")]
    pub url: Option<String>,

    /// Home Assistant long-lived access token
    #[arg(long = "token", env = "HA_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Transport used to talk to MCP clients
    #[arg(long, env = "MCP_TRANSPORT", value_enum, default_value_t = TransportKind::Http)]
    pub transport: TransportKind,

    /// Address the HTTP transport binds to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port the HTTP transport listens on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Timeout in seconds for each request to Home Assistant
    #[arg(long = "timeout-secs", env = "HA_TIMEOUT_SECS", default_value_t = 10)]
    pub timeout_secs: u64,

    /// Evict HTTP sessions idle for longer than this many seconds (0 disables)
    #[arg(long = "session-idle-secs", env = "MCP_SESSION_IDLE_SECS", default_value_t = 1800)]
    pub session_idle_secs: u64,
}

impl Cli {
    pub fn home_assistant(&self) -> Result<HomeAssistantConfig> {
        HomeAssistantConfig::new(
            self.url.clone().unwrap_or_default(),
            self.token.clone().unwrap_or_default(),
            Duration::from_secs(self.timeout_secs),
        )
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| HaError::InvalidConfig(format!("invalid bind address: {e}")))
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        (self.session_idle_secs > 0).then(|| Duration::from_secs(self.session_idle_secs))
    }
}

// =============================================================================
// Home Assistant Connection Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

impl HomeAssistantConfig {
    pub fn new(url: String, token: String, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() || token.trim().is_empty() {
            return Err(HaError::InvalidConfig(
                "Missing required settings: HA_URL and HA_TOKEN".into(),
            ));
        }

        let parsed = Url::parse(&url)
            .map_err(|e| HaError::InvalidConfig(format!("HA_URL '{url}' is not a valid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HaError::InvalidConfig(format!(
                "HA_URL must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let url = url.strip_suffix('/').map(str::to_string).unwrap_or(url);
        Ok(Self {
            url,
            token,
            timeout,
        })
    }
}
