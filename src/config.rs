//! Session configuration.

use std::{num::NonZeroU64, time::Duration};

use url::Url;

use crate::token::AuthToken;

/// Configuration for one guild music session.
#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Guild whose player this session mirrors and controls.
    pub guild_id: NonZeroU64,

    /// Bearer token for the Evict API and WebSocket.
    pub token: AuthToken,

    /// Base URL of the music WebSocket endpoint.
    pub websocket_url: Url,

    /// Base URL of the enrichment REST endpoints.
    pub api_url: Url,

    pub user_agent: String,

    /// Reconnect attempts after an abnormal connection loss.
    pub reconnect_attempts: u32,

    /// Base delay of the exponential reconnect backoff.
    pub reconnect_base: Duration,
}

impl Config {
    /// Default WebSocket endpoint of the Evict music service.
    const WEBSOCKET_URL: &'static str = "wss://api.evict.bot";

    /// Default REST endpoint of the Evict API.
    const API_URL: &'static str = "https://api.evict.bot";

    /// Default number of reconnect attempts.
    const RECONNECT_ATTEMPTS: u32 = 3;

    /// Default base delay of the reconnect backoff.
    const RECONNECT_BASE: Duration = Duration::from_millis(1000);

    /// Creates a configuration for `guild_id` with the service defaults.
    ///
    /// # Panics
    ///
    /// Panics if the compiled-in application name or version would produce
    /// an invalid `User-Agent`.
    #[must_use]
    pub fn new(guild_id: NonZeroU64, token: AuthToken) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
        {
            panic!("application name and/or version invalid (\"{app_name}\"; \"{app_version}\")");
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            guild_id,
            token,
            websocket_url: Url::parse(Self::WEBSOCKET_URL).expect("invalid websocket url"),
            api_url: Url::parse(Self::API_URL).expect("invalid api url"),
            user_agent,
            reconnect_attempts: Self::RECONNECT_ATTEMPTS,
            reconnect_base: Self::RECONNECT_BASE,
        }
    }
}
