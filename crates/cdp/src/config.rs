//! Client configuration
//!
//! Plain data, serde-friendly, sensible defaults. No env or file loading.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Policy constants for `networkidle0` / `networkidle2`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkIdleConfig {
    /// How long the in-flight count must stay under the threshold
    pub quiet_window_ms: u64,

    /// Threshold for `networkidle2`
    pub almost_idle_max_inflight: usize,
}

impl Default for NetworkIdleConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: 500,
            almost_idle_max_inflight: 2,
        }
    }
}

impl NetworkIdleConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

/// Browser client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Identifies this client instance in logs
    pub id: String,

    /// Browser-level DevTools WebSocket endpoint
    pub ws_url: String,

    /// Upper bound for a single command round trip (0 = unbounded)
    pub protocol_timeout_ms: u64,

    /// Default bound for navigation waits (0 = unbounded)
    pub navigation_timeout_ms: u64,

    /// Default bound for other waits, e.g. execution contexts (0 = unbounded)
    pub default_timeout_ms: u64,

    pub network_idle: NetworkIdleConfig,

    /// Name of the instrumentation world created in every frame
    pub isolated_world_name: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            ws_url: "ws://localhost:9222/devtools/browser".to_string(),
            protocol_timeout_ms: 180_000,
            navigation_timeout_ms: 30_000,
            default_timeout_ms: 30_000,
            network_idle: NetworkIdleConfig::default(),
            isolated_world_name: "__devtools_utility_world__".to_string(),
        }
    }
}

impl BrowserConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }

    pub fn with_protocol_timeout(mut self, timeout: Duration) -> Self {
        self.protocol_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_network_idle(mut self, network_idle: NetworkIdleConfig) -> Self {
        self.network_idle = network_idle;
        self
    }

    pub fn with_isolated_world_name(mut self, name: impl Into<String>) -> Self {
        self.isolated_world_name = name.into();
        self
    }

    pub fn protocol_timeout(&self) -> Option<Duration> {
        millis(self.protocol_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Option<Duration> {
        millis(self.navigation_timeout_ms)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        millis(self.default_timeout_ms)
    }
}

/// 0 means "no deadline"
pub(crate) fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
