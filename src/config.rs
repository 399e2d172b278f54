//! Service configuration.
//!
//! [`ServiceConfig`] is what the server runs with. [`ServiceSettings`] is its YAML
//! form, converted with [`ServiceSettings::into_config`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::congestion::DEFAULT_INITIAL_WINDOW_PACKETS;
use crate::masquerade::{MasqueradeHandler, NotFoundHandler, StringHandler};

pub const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 8 * 1024 * 1024;
pub const DEFAULT_CONNECTION_RECEIVE_WINDOW: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_INCOMING_STREAMS: u64 = 1024;
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport tuning. Zero values are replaced by the defaults above.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuicTuning {
    pub stream_receive_window: u64,
    pub connection_receive_window: u64,
    pub max_idle_timeout: Duration,
    pub keep_alive_period: Duration,
    pub max_incoming_streams: u64,
    pub disable_path_mtu_discovery: bool,
}

impl QuicTuning {
    fn with_defaults(mut self) -> Self {
        if self.stream_receive_window == 0 {
            self.stream_receive_window = DEFAULT_STREAM_RECEIVE_WINDOW;
        }
        if self.connection_receive_window == 0 {
            self.connection_receive_window = DEFAULT_CONNECTION_RECEIVE_WINDOW;
        }
        if self.max_idle_timeout.is_zero() {
            self.max_idle_timeout = DEFAULT_MAX_IDLE_TIMEOUT;
        }
        if self.keep_alive_period.is_zero() {
            self.keep_alive_period = DEFAULT_KEEP_ALIVE_PERIOD;
        }
        if self.max_incoming_streams == 0 {
            self.max_incoming_streams = DEFAULT_MAX_INCOMING_STREAMS;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Server send cap in bytes per second, 0 for none.
    pub send_bps: u64,
    /// Server receive rate in bytes per second, 0 for unspecified.
    pub receive_bps: u64,
    pub ignore_client_bandwidth: bool,
    pub salamander_password: Option<String>,
    pub udp_disabled: bool,
    pub udp_timeout: Duration,
    /// Initial window of the adaptive controller, in packets.
    pub initial_congestion_window: u64,
    pub brutal_debug: bool,
    pub quic: QuicTuning,
    pub masquerade: Arc<dyn MasqueradeHandler>,
    /// When cancelled, every authenticated connection is closed.
    pub shutdown: Option<CancellationToken>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            send_bps: 0,
            receive_bps: 0,
            ignore_client_bandwidth: false,
            salamander_password: None,
            udp_disabled: false,
            udp_timeout: Duration::ZERO,
            initial_congestion_window: 0,
            brutal_debug: false,
            quic: QuicTuning::default(),
            masquerade: Arc::new(NotFoundHandler),
            shutdown: None,
        }
    }
}

impl ServiceConfig {
    /// Replaces every zero valued tunable with its default.
    pub fn with_defaults(mut self) -> Self {
        self.quic = self.quic.with_defaults();
        if self.udp_timeout.is_zero() {
            self.udp_timeout = DEFAULT_UDP_TIMEOUT;
        }
        if self.initial_congestion_window == 0 {
            self.initial_congestion_window = DEFAULT_INITIAL_WINDOW_PACKETS;
        }
        if self
            .salamander_password
            .as_ref()
            .is_some_and(|password| password.is_empty())
        {
            self.salamander_password = None;
        }
        self
    }

    pub fn udp_enabled(&self) -> bool {
        !self.udp_disabled
    }
}

/// Rate in bytes per second, written either as a plain number of bytes per second
/// or as a string with a bit rate unit such as `"100 mbps"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Bandwidth(pub u64);

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum BandwidthValue {
            Bytes(u64),
            Text(String),
        }

        match BandwidthValue::deserialize(deserializer)? {
            BandwidthValue::Bytes(bytes) => Ok(Bandwidth(bytes)),
            BandwidthValue::Text(text) => parse_bandwidth(&text)
                .map(Bandwidth)
                .map_err(|err| D::Error::custom(err.to_string())),
        }
    }
}

/// Parses a bit rate such as `"100 mbps"` or `"1g"` into bytes per second.
pub fn parse_bandwidth(s: &str) -> std::io::Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u64 = number.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bandwidth: {s}"),
        )
    })?;
    let bits_per_unit: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bps" => 1,
        "k" | "kb" | "kbps" => 1_000,
        "m" | "mb" | "mbps" => 1_000_000,
        "g" | "gb" | "gbps" => 1_000_000_000,
        "t" | "tb" | "tbps" => 1_000_000_000_000,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid bandwidth unit: {s}"),
            ));
        }
    };
    number
        .checked_mul(bits_per_unit)
        .map(|bits| bits / 8)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bandwidth too large: {s}"),
            )
        })
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QuicSettings {
    #[serde(default)]
    pub stream_receive_window: u64,
    #[serde(default)]
    pub connection_receive_window: u64,
    #[serde(default)]
    pub max_idle_timeout_secs: u64,
    #[serde(default)]
    pub keep_alive_period_secs: u64,
    #[serde(default)]
    pub max_incoming_streams: u64,
    #[serde(default)]
    pub disable_path_mtu_discovery: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum MasqueradeSettings {
    #[default]
    NotFound,
    #[serde(rename = "string")]
    Fixed {
        #[serde(default = "default_status_code")]
        status_code: u16,
        #[serde(default = "default_content_type")]
        content_type: String,
        content: String,
    },
}

fn default_status_code() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    #[serde(alias = "up", default)]
    pub send_bandwidth: Bandwidth,
    #[serde(alias = "down", default)]
    pub receive_bandwidth: Bandwidth,
    #[serde(default)]
    pub ignore_client_bandwidth: bool,
    #[serde(alias = "obfs_password", default)]
    pub salamander_password: Option<String>,
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
    #[serde(default)]
    pub udp_timeout_secs: u64,
    #[serde(default)]
    pub initial_congestion_window: u64,
    #[serde(default)]
    pub brutal_debug: bool,
    #[serde(default)]
    pub quic: QuicSettings,
    #[serde(default)]
    pub masquerade: MasqueradeSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            send_bandwidth: Bandwidth::default(),
            receive_bandwidth: Bandwidth::default(),
            ignore_client_bandwidth: false,
            salamander_password: None,
            udp_enabled: true,
            udp_timeout_secs: 0,
            initial_congestion_window: 0,
            brutal_debug: false,
            quic: QuicSettings::default(),
            masquerade: MasqueradeSettings::default(),
        }
    }
}

impl ServiceSettings {
    pub fn from_yaml(yaml: &str) -> std::io::Result<Self> {
        serde_yaml::from_str(yaml).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid service settings: {err}"),
            )
        })
    }

    pub fn into_config(self) -> std::io::Result<ServiceConfig> {
        let masquerade: Arc<dyn MasqueradeHandler> = match self.masquerade {
            MasqueradeSettings::NotFound => Arc::new(NotFoundHandler),
            MasqueradeSettings::Fixed {
                status_code,
                content_type,
                content,
            } => Arc::new(StringHandler::new(status_code, &content_type, content)?),
        };

        let config = ServiceConfig {
            send_bps: self.send_bandwidth.0,
            receive_bps: self.receive_bandwidth.0,
            ignore_client_bandwidth: self.ignore_client_bandwidth,
            salamander_password: self.salamander_password,
            udp_disabled: !self.udp_enabled,
            udp_timeout: Duration::from_secs(self.udp_timeout_secs),
            initial_congestion_window: self.initial_congestion_window,
            brutal_debug: self.brutal_debug,
            quic: QuicTuning {
                stream_receive_window: self.quic.stream_receive_window,
                connection_receive_window: self.quic.connection_receive_window,
                max_idle_timeout: Duration::from_secs(self.quic.max_idle_timeout_secs),
                keep_alive_period: Duration::from_secs(self.quic.keep_alive_period_secs),
                max_incoming_streams: self.quic.max_incoming_streams,
                disable_path_mtu_discovery: self.quic.disable_path_mtu_discovery,
            },
            masquerade,
            shutdown: None,
        };
        Ok(config.with_defaults())
    }
}
