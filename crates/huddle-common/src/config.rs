//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Later calls return the
/// configuration loaded by the first one.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let hub = HubConfig::default();
    let sfu = SfuConfig::default();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("hub.send_queue_capacity", hub.send_queue_capacity as u64)?
        .set_default("hub.inbox_capacity", hub.inbox_capacity as u64)?
        .set_default("hub.write_wait_ms", hub.write_wait_ms)?
        .set_default("hub.pong_wait_ms", hub.pong_wait_ms)?
        .set_default("hub.ping_period_ms", hub.ping_period_ms)?
        .set_default("hub.max_message_bytes", hub.max_message_bytes as u64)?
        .set_default("sfu.hub_url", sfu.hub_url)?
        .set_default("sfu.reconnect_interval_ms", sfu.reconnect_interval_ms)?
        .set_default("sfu.heartbeat_interval_ms", sfu.heartbeat_interval_ms)?
        .set_default("sfu.write_wait_ms", sfu.write_wait_ms)?
        .set_default("sfu.read_timeout_ms", sfu.read_timeout_ms)?
        .set_default("sfu.outbound_capacity", sfu.outbound_capacity as u64)?
        .set_default("sfu.stun_urls", sfu.stun_urls)?
        .set_default("sfu.turn_urls", Vec::<String>::new())?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HUDDLE_AUTH__JWT_SECRET, HUDDLE_SFU__HUB_URL, etc.)
        .add_source(
            config::Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.stun_urls")
                .with_list_parse_key("sfu.turn_urls")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Only the Hub needs a signing secret; the SFU process runs without one.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    pub hub: HubConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret (HS256) shared with the issuer of client tokens
    pub jwt_secret: String,
}

/// Transport and actor limits for the signaling Hub.
#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Bound of each connection's outbound queue. A full queue evicts the peer.
    pub send_queue_capacity: usize,
    /// Bound of the Hub actor inbox.
    pub inbox_capacity: usize,
    pub write_wait_ms: u64,
    /// Read deadline. Any inbound frame (pongs included) resets it.
    pub pong_wait_ms: u64,
    /// Must be shorter than `pong_wait_ms`.
    pub ping_period_ms: u64,
    pub max_message_bytes: usize,
    /// Shared secret the SFU presents as `?sfu_token=`. Unset means no check.
    #[serde(default)]
    pub sfu_token: Option<String>,
}

impl HubConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            inbox_capacity: 1024,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            max_message_bytes: 512 * 1024,
            sfu_token: None,
        }
    }
}

/// SFU process settings: where the Hub lives, how to stay connected to it,
/// and which ICE servers peer connections use.
#[derive(Debug, Deserialize, Clone)]
pub struct SfuConfig {
    pub hub_url: String,
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub write_wait_ms: u64,
    pub read_timeout_ms: u64,
    pub outbound_capacity: usize,
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    #[serde(default)]
    pub turn_username: Option<String>,
    #[serde(default)]
    pub turn_credential: Option<String>,
}

impl SfuConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://localhost:8080/ws/sfu-internal-channel".into(),
            reconnect_interval_ms: 5_000,
            heartbeat_interval_ms: 20_000,
            write_wait_ms: 5_000,
            read_timeout_ms: 60_000,
            outbound_capacity: 256,
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_is_inside_read_deadline() {
        let hub = HubConfig::default();
        assert!(hub.ping_period() < hub.pong_wait());
        assert!(hub.write_wait() < hub.pong_wait());
    }

    #[test]
    fn sfu_heartbeat_is_inside_read_deadline() {
        let sfu = SfuConfig::default();
        assert!(sfu.heartbeat_interval() < sfu.read_timeout());
        assert!(sfu.hub_url.ends_with(crate::protocol::SFU_CHANNEL));
    }
}
