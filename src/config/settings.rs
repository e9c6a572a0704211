use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::Backoff;
use crate::flow::AckMode;
use crate::session::DefaultHandlerPolicy;

/// Top-level configuration settings for the application.
///
/// Every section falls back to its defaults, so a config file or environment
/// only needs to name what it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub router: RouterSettings,
    pub session: SessionSettings,
    pub flow: FlowSettings,
    pub logging: LoggingSettings,
}

/// Address the WebSocket router front-end binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Behavior of the in-process router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Username to password. Empty accepts every login.
    pub credentials: HashMap<String, String>,
    /// Reject guaranteed topic publishes nothing would receive.
    pub reject_unmatched_guaranteed: bool,
    /// Directory of the cache history store; temporary when unset.
    pub cache_path: Option<String>,
    pub cache_ttl_secs: Option<i64>,
    pub cache_max_messages_per_topic: Option<usize>,
    /// History older than this is returned but flagged suspect.
    pub cache_suspect_after_secs: Option<i64>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            credentials: HashMap::new(),
            reject_unmatched_guaranteed: true,
            cache_path: None,
            cache_ttl_secs: Some(3600),
            cache_max_messages_per_topic: Some(1000),
            cache_suspect_after_secs: None,
        }
    }
}

/// Client-side session and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub url: String,
    pub vpn: String,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub compression_level: u8,
    pub connect_retries: u32,
    pub reconnect_retries: u32,
    pub reconnect_retry_wait_ms: u64,
    pub reconnect_backoff: Backoff,
    pub connect_timeout_ms: u64,
    pub send_queue_capacity: usize,
    pub send_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub publish_window: usize,
    pub no_local: bool,
    pub default_handler_policy: DefaultHandlerPolicy,
    pub generate_sender_id: bool,
    pub generate_sequence_numbers: bool,
    pub generate_send_timestamps: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            vpn: "default".to_string(),
            username: "default".to_string(),
            password: String::new(),
            client_name: "popmsg".to_string(),
            compression_level: 0,
            connect_retries: 3,
            reconnect_retries: 3,
            reconnect_retry_wait_ms: 3000,
            reconnect_backoff: Backoff::Fixed,
            connect_timeout_ms: 10_000,
            send_queue_capacity: 256,
            send_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            publish_window: 50,
            no_local: false,
            default_handler_policy: DefaultHandlerPolicy::Fallback,
            generate_sender_id: true,
            generate_sequence_numbers: true,
            generate_send_timestamps: true,
        }
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.reconnect_backoff
            .delay(Duration::from_millis(self.reconnect_retry_wait_ms), attempt)
    }
}

/// Defaults applied to flows that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub window_size: usize,
    pub ack_mode: AckMode,
    pub bind_timeout_ms: u64,
}

impl FlowSettings {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            window_size: 255,
            ack_mode: AckMode::Client,
            bind_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub show_targets: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_targets: false,
        }
    }
}
