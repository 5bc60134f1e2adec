use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use log::info;

use crate::error::ConfigError;
use crate::feed::{ReconnectConfig, ReconnectMode};
use crate::relay::{OverflowPolicy, SinkSettings};
use crate::websocket::ConnectionSettings;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:8081";
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

// Upstream Configuration
pub const DEFAULT_UPSTREAM_URL: &str = "wss://testnet.bitmex.com/realtime?subscribe=instrument";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 0;

// Broadcast Configuration
pub const UPDATE_CHANNEL_SIZE: usize = 1024;
pub const DEFAULT_SINK_QUEUE_CAPACITY: usize = 1024;
pub const SINK_OUTBOUND_BUFFER: usize = 16;

// Subscriber Connection Configuration
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 54;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub upstream_url: String,
    pub reconnect_mode: ReconnectMode,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub sink_queue_capacity: usize,
    pub sink_overflow_policy: OverflowPolicy,
    pub write_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_message_size: usize,
    pub stats_interval_secs: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_API_BIND_ADDRESS.to_string()),
            upstream_url: env::var("UPSTREAM_URL")
                .unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string()),
            reconnect_mode: parse_var("UPSTREAM_RECONNECT", ReconnectMode::None)?,
            reconnect_delay_ms: parse_var("UPSTREAM_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)?,
            reconnect_max_attempts: parse_var("UPSTREAM_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS)?,
            sink_queue_capacity: parse_var("SINK_QUEUE_CAPACITY", DEFAULT_SINK_QUEUE_CAPACITY)?,
            sink_overflow_policy: parse_var("SINK_OVERFLOW_POLICY", OverflowPolicy::DropOldest)?,
            write_timeout_secs: parse_var("WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS)?,
            pong_timeout_secs: parse_var("PONG_TIMEOUT_SECS", DEFAULT_PONG_TIMEOUT_SECS)?,
            ping_interval_secs: parse_var("PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS)?,
            max_message_size: parse_var("MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?,
            stats_interval_secs: parse_var("STATS_INTERVAL_SECS", DEFAULT_STATS_INTERVAL_SECS)?,
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("BIND_ADDRESS", &self.bind_address),
            ("API_BIND_ADDRESS", &self.api_bind_address),
        ] {
            if value.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.clone(),
                    reason: "expected a socket address such as 127.0.0.1:8080".to_string(),
                });
            }
        }

        if !(self.upstream_url.starts_with("ws://") || self.upstream_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                name: "UPSTREAM_URL",
                value: self.upstream_url.clone(),
                reason: "scheme must be ws or wss".to_string(),
            });
        }

        for (name, value) in [
            ("SINK_QUEUE_CAPACITY", self.sink_queue_capacity as u64),
            ("WRITE_TIMEOUT_SECS", self.write_timeout_secs),
            ("PONG_TIMEOUT_SECS", self.pong_timeout_secs),
            ("PING_INTERVAL_SECS", self.ping_interval_secs),
            ("MAX_MESSAGE_SIZE", self.max_message_size as u64),
            ("STATS_INTERVAL_SECS", self.stats_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.ping_interval_secs >= self.pong_timeout_secs {
            return Err(ConfigError::Invalid {
                name: "PING_INTERVAL_SECS",
                value: self.ping_interval_secs.to_string(),
                reason: format!("must be shorter than PONG_TIMEOUT_SECS ({})", self.pong_timeout_secs),
            });
        }

        if self.reconnect_mode == ReconnectMode::Fixed && self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "UPSTREAM_RECONNECT_DELAY_MS",
                value: self.reconnect_delay_ms.to_string(),
                reason: "must be greater than zero when UPSTREAM_RECONNECT is fixed".to_string(),
            });
        }

        Ok(())
    }

    pub fn log_config(&self) {
        info!("Server Configuration:");
        info!("  WebSocket Bind Address: {}", self.bind_address);
        info!("  API Bind Address: {}", self.api_bind_address);
        info!("  Upstream URL: {}", self.upstream_url);
        info!("  Upstream Reconnect: {} (delay {}ms, max attempts {})",
              self.reconnect_mode, self.reconnect_delay_ms, self.reconnect_max_attempts);
        info!("  Sink Queue: {} updates, overflow {}", self.sink_queue_capacity, self.sink_overflow_policy);
        info!("  Log Level: {}", self.log_level);
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            mode: self.reconnect_mode,
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.reconnect_max_attempts,
            ..ReconnectConfig::default()
        }
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            capacity: self.sink_queue_capacity,
            overflow: self.sink_overflow_policy,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            max_message_size: self.max_message_size,
            outbound_buffer: SINK_OUTBOUND_BUFFER,
            sink: self.sink_settings(),
        }
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
