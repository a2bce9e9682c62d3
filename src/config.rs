//! Configuration management

use anyhow::Result;
use std::collections::HashSet;

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control endpoint base URL of the injected agent
    pub control_url: String,

    /// Bind host for the event listener
    pub event_host: String,

    /// Bind port for the event listener (0 picks a free port)
    pub event_port: u16,

    /// Host advertised to the agent when it differs from the bind host
    /// (e.g. binding all interfaces while advertising loopback)
    pub advertise_host: Option<String>,

    /// Sender display names permitted to trigger single-chat dispatch
    pub whitelist: HashSet<String>,

    /// Retry budget for timed-out control requests
    pub max_retries: u32,

    /// Per-request control timeout in seconds
    pub timeout_secs: u64,

    /// Unhook/re-hook cycles permitted during hook registration
    pub hook_retries: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let control_url = std::env::var("HOOKBRIDGE_CONTROL_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:19088/".to_string());

        let event_host =
            std::env::var("HOOKBRIDGE_EVENT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let event_port = std::env::var("HOOKBRIDGE_EVENT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(19099);

        let advertise_host = std::env::var("HOOKBRIDGE_ADVERTISE_HOST").ok();

        let whitelist = std::env::var("HOOKBRIDGE_WHITELIST")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_retries = std::env::var("HOOKBRIDGE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let timeout_secs = std::env::var("HOOKBRIDGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let hook_retries = std::env::var("HOOKBRIDGE_HOOK_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        Ok(Self {
            control_url,
            event_host,
            event_port,
            advertise_host,
            whitelist,
            max_retries,
            timeout_secs,
            hook_retries,
        })
    }
}
