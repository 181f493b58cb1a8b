//! # NetPulse Hub - Live Telemetry for SDN Dashboards
//!
//! The real-time half of the NetPulse switch/bridge/controller dashboard.
//! One shared transport per live-data channel, fanned out to any number of
//! chart consumers, each keeping its own bounded, time-ordered window of
//! samples.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            NETPULSE HUB                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  TRANSPORT → CHANNEL CONNECTION → HUB FAN-OUT → PROJECTION → WINDOW       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Channel Connection**: one transport connection per channel, decodes
//!   frames into typed messages, drops anything malformed.
//! - **Hub**: reference-counted registry of connections and subscribers.
//! - **Projection**: relevance filter plus port-key resolution per consumer.
//! - **Sample Window**: per-consumer sliding window, evicted on every append.
//!
//! Device/bridge/meter CRUD, authentication and chart drawing live elsewhere;
//! this crate only consumes the telemetry stream and produces snapshots.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use futures::stream::{Stream, StreamExt};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot, DashMap, Flume
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use dashmap::DashMap;
use flume::Sender as FlumeSender;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Config, Async Traits, CLI
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use figment::{providers::{Env, Format, Toml}, Figment};
use async_trait::async_trait;
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const HUB_NAME: &str = "netpulse-hub";
pub const HUB_FULL_NAME: &str = "NetPulse Telemetry Hub";

// ----------------------------------------------------------------------------
// Channels
// ----------------------------------------------------------------------------

/// Device CPU/memory/disk feed
pub const DEVICE_STATS_CHANNEL: &str = "deviceStats";

/// Per-port OpenFlow throughput feed
pub const OPENFLOW_CHANNEL: &str = "openflow";

/// Traffic classification feed
pub const CLASSIFICATIONS_CHANNEL: &str = "classifications";

/// Default base URL of the telemetry backend
pub const DEFAULT_BASE_URL: &str = "ws://127.0.0.1:8000";

/// Frames larger than this are treated as malformed (bytes)
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Windows & Timing
// ----------------------------------------------------------------------------

/// Default sliding window length (milliseconds) - 5 minutes
pub const DEFAULT_WINDOW_MS: u64 = 300_000;

/// Smallest window the config accepts (milliseconds)
pub const MIN_WINDOW_MS: u64 = 1_000;

/// Default interval of the background eviction sweep (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// First reconnect delay under the backoff policy (milliseconds)
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;

/// Upper bound of the reconnect delay (milliseconds)
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

// ----------------------------------------------------------------------------
// Key Resolution
// ----------------------------------------------------------------------------

/// Resolution tiers, in the order they are tried
pub const DEFAULT_RESOLUTION_TIERS: [&str; 3] = ["exact", "port_number", "normalized"];

/// Interface prefixes stripped by the normalized tier
pub const DEFAULT_STRIP_PREFIXES: [&str; 1] = ["eth"];

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

pub const DEFAULT_CONFIG_PATH: &str = "netpulse.toml";
pub const ENV_PREFIX: &str = "NETPULSE_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Timestamps, channel identity, port targets and samples. Everything that
// crosses a module boundary in the hub is one of these.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is in the future.
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

/// Atomic timestamp, shared by manual clocks.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Timestamp {
        Timestamp(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, ordering: AtomicOrdering) {
        self.0.store(ts.0, ordering);
    }

    /// Move the timestamp forward by `by`, returning the new value.
    #[inline]
    pub fn advance(&self, by: Duration) -> Timestamp {
        let delta = by.as_nanos() as i64;
        Timestamp(self.0.fetch_add(delta, AtomicOrdering::AcqRel).saturating_add(delta))
    }
}

impl Default for AtomicTimestamp {
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Sample Clock - Capture Time Source
// ----------------------------------------------------------------------------

/// Source of capture timestamps for projected samples.
///
/// `System` reads the wall clock; `Manual` is driven explicitly, which is
/// what replay tools and tests use.
#[derive(Debug, Clone, Default)]
pub enum SampleClock {
    #[default]
    System,
    Manual(Arc<AtomicTimestamp>),
}

impl SampleClock {
    pub fn manual(start: Timestamp) -> Self {
        SampleClock::Manual(Arc::new(AtomicTimestamp::new(start)))
    }

    pub fn now(&self) -> Timestamp {
        match self {
            SampleClock::System => Timestamp::now(),
            SampleClock::Manual(ts) => ts.load(AtomicOrdering::Acquire),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let SampleClock::Manual(ts) = self {
            ts.advance(by);
        }
    }

    /// Set a manual clock. No-op on the system clock.
    pub fn set(&self, to: Timestamp) {
        if let SampleClock::Manual(ts) = self {
            ts.store(to, AtomicOrdering::Release);
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Channel Identity
// ----------------------------------------------------------------------------

/// Name of a logical live-data feed, e.g. `deviceStats`.
pub type ChannelId = CompactString;

/// Payload family carried by a channel; selects the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    DeviceStats,
    PortStats,
    Classifications,
}

impl Display for ChannelKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::DeviceStats => write!(f, "device_stats"),
            ChannelKind::PortStats => write!(f, "port_stats"),
            ChannelKind::Classifications => write!(f, "classifications"),
        }
    }
}

/// One entry of the channel registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: ChannelId,
    pub kind: ChannelKind,
    /// Path appended to the configured base URL
    pub path: String,
}

impl ChannelSpec {
    pub fn new(name: impl Into<ChannelId>, kind: ChannelKind, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            path: path.into(),
        }
    }

    /// Full endpoint URL of this channel under `base_url`.
    pub fn endpoint(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }
}

fn default_channels() -> Vec<ChannelSpec> {
    vec![
        ChannelSpec::new(DEVICE_STATS_CHANNEL, ChannelKind::DeviceStats, "/ws/device-stats"),
        ChannelSpec::new(OPENFLOW_CHANNEL, ChannelKind::PortStats, "/ws/openflow-port-stats"),
        ChannelSpec::new(CLASSIFICATIONS_CHANNEL, ChannelKind::Classifications, "/ws/classifications"),
    ]
}

// ----------------------------------------------------------------------------
// 3.4 Port Targets
// ----------------------------------------------------------------------------

/// A port as the dashboard knows it from the configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortTarget {
    /// Configured port name, e.g. `eth1`
    pub name: CompactString,
    /// OVS port number, when known
    #[serde(default, alias = "ovs_port_number")]
    pub port_number: Option<u32>,
}

impl PortTarget {
    pub fn new(name: impl Into<CompactString>, port_number: u32) -> Self {
        Self {
            name: name.into(),
            port_number: Some(port_number),
        }
    }

    pub fn named(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            port_number: None,
        }
    }
}

impl Display for PortTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.port_number {
            Some(n) => write!(f, "{}:{}", self.name, n),
            None => write!(f, "{}", self.name),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Samples
// ----------------------------------------------------------------------------

/// Metric key -> value. `None` is an explicit null from upstream.
pub type FieldMap = BTreeMap<CompactString, Option<f64>>;

/// One timestamped, filtered, re-keyed data point. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub ts: Timestamp,
    pub fields: FieldMap,
}

impl Sample {
    pub fn new(ts: Timestamp, fields: FieldMap) -> Self {
        Self { ts, fields }
    }

    /// Numeric value of `key`; `None` if absent or null.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied().flatten()
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every layer of the hub: configuration, transport, frame
// decoding and the hub itself. Decode errors never reach subscribers; they
// exist for logging and statistics.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Hub Errors
// ----------------------------------------------------------------------------

/// Top-level error type. All layer errors convert into it.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Unknown channel: {name}")]
    UnknownChannel { name: String },

    #[error("Channel '{channel}' carries {found} messages, projection expects {expected}")]
    ProjectionMismatch {
        channel: String,
        expected: ChannelKind,
        found: ChannelKind,
    },

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl HubError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            HubError::Config(_) => false,
            HubError::Transport(e) => e.is_recoverable(),
            HubError::Decode(_) => true,
            HubError::UnknownChannel { .. } => false,
            HubError::ProjectionMismatch { .. } => false,
            HubError::NoRuntime(_) => false,
            HubError::Io(_) => true,
            HubError::Internal(_) => false,
            HubError::ShuttingDown => false,
        }
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            HubError::Config(_) => "config",
            HubError::Transport(_) => "transport",
            HubError::Decode(_) => "decode",
            HubError::UnknownChannel { .. } => "unknown_channel",
            HubError::ProjectionMismatch { .. } => "projection",
            HubError::NoRuntime(_) => "runtime",
            HubError::Io(_) => "io",
            HubError::Internal(_) => "internal",
            HubError::ShuttingDown => "shutdown",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            HubError::Config(_) => RecoveryHint::FixConfiguration,
            HubError::Transport(e) => e.recovery_hint(),
            HubError::Decode(_) => RecoveryHint::Skip,
            HubError::UnknownChannel { .. } | HubError::ProjectionMismatch { .. } => {
                RecoveryHint::FixConfiguration
            }
            HubError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry immediately
    RetryImmediate,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect to the backend
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Transport Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to '{endpoint}' failed: {message}")]
    ConnectFailed { endpoint: String, message: String },

    #[error("Invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Protocol error on '{endpoint}': {message}")]
    Protocol { endpoint: String, message: String },

    #[error("Connection to '{endpoint}' closed")]
    Closed { endpoint: String },
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::InvalidEndpoint { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            TransportError::ConnectFailed { .. } => RecoveryHint::RetryWithBackoff,
            TransportError::Protocol { .. } | TransportError::Closed { .. } => RecoveryHint::Reconnect,
            TransportError::InvalidEndpoint { .. } => RecoveryHint::FixConfiguration,
        }
    }

    pub fn connect_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::ConnectFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Decode Errors
// ----------------------------------------------------------------------------

/// Why a frame was rejected at the connection boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    #[error("{kind} message is not a JSON object")]
    NotAnObject { kind: ChannelKind },

    #[error("{kind} message is missing '{field}'")]
    MissingField { kind: ChannelKind, field: &'static str },

    #[error("{kind} message has invalid '{field}': {message}")]
    InvalidField {
        kind: ChannelKind,
        field: &'static str,
        message: String,
    },
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type HubResult<T> = Result<T, HubError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type DecodeResult<T> = Result<T, DecodeError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Hierarchical configuration: defaults, then a TOML file, then NETPULSE_*
// environment variables (double underscore separates nesting levels, e.g.
// NETPULSE_WINDOW__WINDOW=10m).
// ============================================================================

/// Root configuration of the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub: GeneralConfig,
    pub channels: Vec<ChannelSpec>,
    pub window: WindowConfig,
    pub resolution: ResolutionConfig,
    pub reconnect: ReconnectPolicy,
    pub logging: LoggingConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub: GeneralConfig::default(),
            channels: default_channels(),
            window: WindowConfig::default(),
            resolution: ResolutionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load configuration from file, with environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: HubConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.hub.base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::missing_field("hub.base_url"));
        }
        if !base.contains("://") {
            return Err(ConfigError::invalid_value(
                "hub.base_url",
                format!("'{}' has no scheme (expected ws:// or wss://)", base),
            ));
        }

        if self.channels.is_empty() {
            return Err(ConfigError::invalid_value("channels", "at least one channel is required"));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(ConfigError::invalid_value("channels.name", "must not be empty"));
            }
            if channel.path.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "channels.path",
                    format!("channel '{}' has an empty path", channel.name),
                ));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "channels.name",
                    format!("duplicate channel '{}'", channel.name),
                ));
            }
        }

        if self.window.window < Duration::from_millis(MIN_WINDOW_MS) {
            return Err(ConfigError::invalid_value(
                "window.window",
                format!("must be at least {}ms", MIN_WINDOW_MS),
            ));
        }

        self.resolution.validate()?;
        self.reconnect.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("must be one of: {:?}", valid_levels),
            ));
        }
        let valid_formats = ["json", "compact", "pretty"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("must be one of: {:?}", valid_formats),
            ));
        }

        Ok(())
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn endpoint_for(&self, name: &str) -> Option<String> {
        self.channel(name).map(|c| c.endpoint(&self.hub.base_url))
    }

    /// Default configuration rendered as TOML.
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&HubConfig::default())
            .unwrap_or_else(|e| format!("# failed to render default config: {}\n", e))
    }
}

// ---- 5.1 General ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Instance name, used in log lines
    pub instance_name: String,
    /// Base URL every channel path is appended to
    pub base_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

fn default_instance_name() -> String {
    "netpulse".to_string()
}

// ---- 5.2 Window ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Background sweep interval; zero disables the sweeper
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

// ---- 5.3 Key Resolution ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Tier names in precedence order: exact, port_number, normalized
    pub tiers: Vec<String>,
    /// Prefixes stripped by the normalized tier
    pub strip_prefixes: Vec<String>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_RESOLUTION_TIERS.iter().map(|s| s.to_string()).collect(),
            strip_prefixes: DEFAULT_STRIP_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ResolutionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::invalid_value("resolution.tiers", "at least one tier is required"));
        }
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !DEFAULT_RESOLUTION_TIERS.contains(&tier.as_str()) {
                return Err(ConfigError::invalid_value(
                    "resolution.tiers",
                    format!("unknown tier '{}', expected one of {:?}", tier, DEFAULT_RESOLUTION_TIERS),
                ));
            }
            if !seen.insert(tier.as_str()) {
                return Err(ConfigError::invalid_value(
                    "resolution.tiers",
                    format!("tier '{}' listed twice", tier),
                ));
            }
        }
        Ok(())
    }
}

// ---- 5.4 Reconnect ----

/// What happens after a channel connection closes on its own.
///
/// Under `Never` a closed connection stays closed until the next subscribe
/// (or an explicit [`Hub::retry`]) creates a fresh instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    #[default]
    Never,
    Backoff {
        #[serde(with = "humantime_serde", default = "default_reconnect_initial")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde", default = "default_reconnect_max")]
        max_delay: Duration,
        /// Zero means unlimited
        #[serde(default)]
        max_attempts: u32,
    },
}

fn default_reconnect_initial() -> Duration {
    Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS)
}

fn default_reconnect_max() -> Duration {
    Duration::from_millis(DEFAULT_RECONNECT_MAX_MS)
}

impl ReconnectPolicy {
    pub fn backoff(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        ReconnectPolicy::Backoff {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt number `attempt` (zero based), or
    /// `None` once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff {
                initial_delay,
                max_delay,
                max_attempts,
            } => {
                if *max_attempts != 0 && attempt >= *max_attempts {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt.min(31));
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let ReconnectPolicy::Backoff {
            initial_delay,
            max_delay,
            ..
        } = self
        {
            if initial_delay.is_zero() {
                return Err(ConfigError::invalid_value("reconnect.initial_delay", "must be greater than zero"));
            }
            if max_delay < initial_delay {
                return Err(ConfigError::invalid_value(
                    "reconnect.max_delay",
                    "must not be smaller than initial_delay",
                ));
            }
        }
        Ok(())
    }
}

// ---- 5.5 Logging ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// json, compact, pretty
    pub format: String,
    pub colors: bool,
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            colors: true,
            source_location: false,
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING
// ============================================================================
// Targets: netpulse::init, netpulse::hub, netpulse::connection,
// netpulse::view. RUST_LOG overrides the configured level.
// ============================================================================

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> HubResult<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.to_lowercase().as_str() {
        "json" => {
            let layer = tracing_fmt::layer()
                .json()
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .with_target(true);
            tracing::subscriber::set_global_default(subscriber.with(layer))
        }
        "pretty" => {
            let layer = tracing_fmt::layer()
                .pretty()
                .with_ansi(config.colors)
                .with_file(config.source_location)
                .with_line_number(config.source_location);
            tracing::subscriber::set_global_default(subscriber.with(layer))
        }
        _ => {
            let layer = tracing_fmt::layer()
                .compact()
                .with_ansi(config.colors)
                .with_target(true);
            tracing::subscriber::set_global_default(subscriber.with(layer))
        }
    };

    result.map_err(|e| HubError::Internal(format!("Failed to set subscriber: {}", e)))?;

    info!(
        target: "netpulse::init",
        version = HUB_VERSION,
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TRANSPORT LAYER
// ============================================================================
// A transport turns an endpoint URL into a stream of frames. The hub never
// touches sockets directly; production uses WebSocketTransport, tests and
// replay tools use MemoryTransport.
// ============================================================================

/// One transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frames of one open connection. The stream ending means the peer closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<Frame>> + Send>>;

/// Connection factory behind every channel connection.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Transport name, for logs
    fn name(&self) -> &str;

    /// Open a connection to `endpoint`.
    async fn connect(&self, endpoint: &str) -> TransportResult<FrameStream>;
}

// ----------------------------------------------------------------------------
// 7.1 WebSocket Transport
// ----------------------------------------------------------------------------

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use super::*;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    /// WebSocket client transport. Text and binary frames are forwarded,
    /// control frames are handled by tungstenite and skipped.
    #[derive(Debug, Clone, Default)]
    pub struct WebSocketTransport;

    impl WebSocketTransport {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Transport for WebSocketTransport {
        fn name(&self) -> &str {
            "websocket"
        }

        async fn connect(&self, endpoint: &str) -> TransportResult<FrameStream> {
            if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                return Err(TransportError::InvalidEndpoint {
                    endpoint: endpoint.to_string(),
                    message: "expected a ws:// or wss:// URL".to_string(),
                });
            }

            let (socket, _response) = tokio_tungstenite::connect_async(endpoint)
                .await
                .map_err(|e| TransportError::connect_failed(endpoint, e.to_string()))?;

            debug!(target: "netpulse::connection", endpoint = endpoint, "WebSocket handshake complete");

            let endpoint = endpoint.to_string();
            let frames = socket.filter_map(move |item| {
                let endpoint = endpoint.clone();
                async move {
                    match item {
                        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes))),
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
                        Ok(Message::Close(_)) => None,
                        Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => None,
                        Err(e) => Some(Err(TransportError::Protocol {
                            endpoint,
                            message: e.to_string(),
                        })),
                    }
                }
            });

            Ok(Box::pin(frames))
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Memory Transport
// ----------------------------------------------------------------------------

/// In-process transport. Every `connect` registers a peer for the endpoint;
/// frames pushed with [`MemoryTransport::send_text`] reach all live peers of
/// that endpoint.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

#[derive(Debug, Default)]
struct MemoryTransportInner {
    peers: DashMap<String, Vec<FlumeSender<TransportResult<Frame>>>>,
    connects: DashMap<String, u64>,
    pending_failures: DashMap<String, u32>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `connect` calls made for `endpoint`, failed ones included.
    pub fn connect_count(&self, endpoint: &str) -> u64 {
        self.inner.connects.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    /// Peers of `endpoint` whose stream is still held by a connection.
    pub fn live_connections(&self, endpoint: &str) -> usize {
        self.inner
            .peers
            .get(endpoint)
            .map(|peers| peers.iter().filter(|tx| !tx.is_disconnected()).count())
            .unwrap_or(0)
    }

    pub fn send_text(&self, endpoint: &str, text: impl Into<String>) -> usize {
        self.send_frame(endpoint, Frame::Text(text.into()))
    }

    pub fn send_frame(&self, endpoint: &str, frame: Frame) -> usize {
        self.push(endpoint, Ok(frame))
    }

    /// Inject a transport error into every live peer of `endpoint`.
    pub fn send_error(&self, endpoint: &str, message: impl Into<String>) -> usize {
        let error = TransportError::Protocol {
            endpoint: endpoint.to_string(),
            message: message.into(),
        };
        self.push(endpoint, Err(error))
    }

    /// Close every peer of `endpoint` from the server side.
    pub fn disconnect(&self, endpoint: &str) -> usize {
        self.inner
            .peers
            .remove(endpoint)
            .map(|(_, peers)| peers.len())
            .unwrap_or(0)
    }

    /// Make the next `count` connects to `endpoint` fail.
    pub fn fail_next_connects(&self, endpoint: &str, count: u32) {
        *self.inner.pending_failures.entry(endpoint.to_string()).or_insert(0) += count;
    }

    fn push(&self, endpoint: &str, item: TransportResult<Frame>) -> usize {
        let Some(mut peers) = self.inner.peers.get_mut(endpoint) else {
            return 0;
        };
        peers.retain(|tx| !tx.is_disconnected());
        peers.iter().filter(|tx| tx.send(item.clone()).is_ok()).count()
    }

    fn take_failure(&self, endpoint: &str) -> bool {
        match self.inner.pending_failures.get_mut(endpoint) {
            Some(mut pending) if *pending > 0 => {
                *pending -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, endpoint: &str) -> TransportResult<FrameStream> {
        *self.inner.connects.entry(endpoint.to_string()).or_insert(0) += 1;

        if self.take_failure(endpoint) {
            return Err(TransportError::connect_failed(endpoint, "connection refused"));
        }

        let (tx, rx) = flume::unbounded();
        self.inner.peers.entry(endpoint.to_string()).or_default().push(tx);
        Ok(Box::pin(rx.into_stream()))
    }
}

// ============================================================================
// SECTION 8: MESSAGE DECODING
// ============================================================================
// Tolerant decoding of the three payload families. Numeric fields accept
// JSON numbers or numeric strings; null and unparseable values become None.
// Structural problems (bad JSON, wrong shape, missing identity fields) are
// errors and the frame is dropped.
// ============================================================================

/// A decoded channel message, before any consumer-side filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    DeviceStats(DeviceStatsMessage),
    PortStats(PortStatsMessage),
    Classification(ClassificationMessage),
}

impl RawMessage {
    pub fn kind(&self) -> ChannelKind {
        match self {
            RawMessage::DeviceStats(_) => ChannelKind::DeviceStats,
            RawMessage::PortStats(_) => ChannelKind::PortStats,
            RawMessage::Classification(_) => ChannelKind::Classifications,
        }
    }

    pub fn ip_address(&self) -> Option<&str> {
        match self {
            RawMessage::DeviceStats(m) => Some(m.ip_address.as_str()),
            RawMessage::PortStats(m) => Some(m.ip_address.as_str()),
            RawMessage::Classification(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatsMessage {
    pub ip_address: CompactString,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortStatsMessage {
    pub ip_address: CompactString,
    /// Raw port key -> throughput
    pub ports: BTreeMap<CompactString, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationMessage {
    /// A single classified flow
    Flow { label: CompactString },
    /// Aggregated count for one class
    Count { classification: CompactString, count: f64 },
}

impl ClassificationMessage {
    pub fn label(&self) -> &str {
        match self {
            ClassificationMessage::Flow { label } => label,
            ClassificationMessage::Count { classification, .. } => classification,
        }
    }

    /// Contribution of this message: 1 for a flow, the count otherwise.
    pub fn amount(&self) -> f64 {
        match self {
            ClassificationMessage::Flow { .. } => 1.0,
            ClassificationMessage::Count { count, .. } => *count,
        }
    }
}

/// Decode one frame of a `kind` channel.
pub fn decode_frame(kind: ChannelKind, frame: &Frame) -> DecodeResult<RawMessage> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::FrameTooLarge {
            size: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    let text = match frame {
        Frame::Text(text) => text.as_str(),
        Frame::Binary(bytes) => std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?,
    };

    let value: JsonValue = serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson {
        message: e.to_string(),
    })?;

    decode_value(kind, &value)
}

/// Decode an already parsed JSON value of a `kind` channel.
pub fn decode_value(kind: ChannelKind, value: &JsonValue) -> DecodeResult<RawMessage> {
    let object = value.as_object().ok_or(DecodeError::NotAnObject { kind })?;

    match kind {
        ChannelKind::DeviceStats => Ok(RawMessage::DeviceStats(DeviceStatsMessage {
            ip_address: required_address(object, kind)?,
            cpu: object.get("cpu").and_then(coerce_number),
            memory: object.get("memory").and_then(coerce_number),
            disk: object.get("disk").and_then(coerce_number),
        })),
        ChannelKind::PortStats => {
            let ip_address = required_address(object, kind)?;
            let ports = match object.get("ports") {
                Some(JsonValue::Object(ports)) => ports
                    .iter()
                    .map(|(key, value)| (CompactString::from(key.as_str()), coerce_number(value)))
                    .collect(),
                Some(JsonValue::Null) | None => {
                    return Err(DecodeError::MissingField { kind, field: "ports" });
                }
                Some(other) => {
                    return Err(DecodeError::InvalidField {
                        kind,
                        field: "ports",
                        message: format!("expected an object, got {}", json_type_name(other)),
                    });
                }
            };
            Ok(RawMessage::PortStats(PortStatsMessage { ip_address, ports }))
        }
        ChannelKind::Classifications => decode_classification(object).map(RawMessage::Classification),
    }
}

fn decode_classification(object: &serde_json::Map<String, JsonValue>) -> DecodeResult<ClassificationMessage> {
    let kind = ChannelKind::Classifications;

    if let Some(flow) = object.get("flow") {
        let label = match flow {
            JsonValue::String(s) => Some(s.trim()),
            JsonValue::Object(fields) => fields
                .get("classification")
                .or_else(|| fields.get("label"))
                .and_then(JsonValue::as_str)
                .map(str::trim),
            _ => None,
        };
        return match label {
            Some(label) if !label.is_empty() => Ok(ClassificationMessage::Flow {
                label: CompactString::from(label),
            }),
            _ => Err(DecodeError::InvalidField {
                kind,
                field: "flow",
                message: "flow carries no classification label".to_string(),
            }),
        };
    }

    let classification = object
        .get("classification")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(DecodeError::MissingField {
            kind,
            field: "classification",
        })?;

    let count = object
        .get("count")
        .and_then(coerce_number)
        .ok_or_else(|| DecodeError::InvalidField {
            kind,
            field: "count",
            message: "expected a number".to_string(),
        })?;

    Ok(ClassificationMessage::Count {
        classification: CompactString::from(classification),
        count,
    })
}

fn required_address(object: &serde_json::Map<String, JsonValue>, kind: ChannelKind) -> DecodeResult<CompactString> {
    match object.get("ip_address").and_then(JsonValue::as_str).map(str::trim) {
        Some(addr) if !addr.is_empty() => Ok(CompactString::from(addr)),
        _ => Err(DecodeError::MissingField {
            kind,
            field: "ip_address",
        }),
    }
}

/// Numbers and numeric strings become finite f64s; everything else is None.
fn coerce_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// ============================================================================
// SECTION 9: CHANNEL CONNECTIONS
// ============================================================================
// One connection instance per open channel. State machine:
//
//   Unopened -> Opening -> Open -> Closed
//                  \__________________^
//
// Closed is terminal for an instance; reopening always creates a new
// instance with a higher generation. Only the current generation publishes
// status and dispatches messages.
// ============================================================================

// ---- 9.1 Connection State ----

/// Lifecycle state of a channel connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Unopened,
    Opening,
    Open,
    Closed { reason: CloseReason },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed { .. })
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            ConnectionState::Closed { reason } => Some(reason),
            _ => None,
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unopened => write!(f, "unopened"),
            ConnectionState::Opening => write!(f, "opening"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed { reason } => write!(f, "closed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// Last subscriber left, or the hub shut down
    Requested,
    /// The peer ended the stream
    PeerClosed,
    /// The transport reported an error mid-stream
    TransportError(String),
    /// The connection never opened
    ConnectFailed(String),
}

impl CloseReason {
    /// Whether the close was not asked for.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::Requested)
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed on request"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
        }
    }
}

// ---- 9.2 Channel Statistics ----

/// Per-channel counters, updated by the connection task.
#[derive(Debug, Default)]
pub struct ChannelStats {
    frames_received: AtomicU64,
    messages_dispatched: AtomicU64,
    malformed_dropped: AtomicU64,
    deliveries: AtomicU64,
    connections_opened: AtomicU64,
    connect_failures: AtomicU64,
    subscriber_high_water_mark: AtomicUsize,
}

impl ChannelStats {
    #[inline]
    fn record_frame(&self) {
        self.frames_received.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn record_dispatch(&self, delivered: usize) {
        self.messages_dispatched.fetch_add(1, AtomicOrdering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn record_open(&self) {
        self.connections_opened.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[inline]
    fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn update_high_water_mark(&self, subscribers: usize) {
        let mut current = self.subscriber_high_water_mark.load(AtomicOrdering::Relaxed);
        while subscribers > current {
            match self.subscriber_high_water_mark.compare_exchange_weak(
                current,
                subscribers,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            frames_received: self.frames_received.load(AtomicOrdering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(AtomicOrdering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(AtomicOrdering::Relaxed),
            deliveries: self.deliveries.load(AtomicOrdering::Relaxed),
            connections_opened: self.connections_opened.load(AtomicOrdering::Relaxed),
            connect_failures: self.connect_failures.load(AtomicOrdering::Relaxed),
            subscriber_high_water_mark: self.subscriber_high_water_mark.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatsSnapshot {
    pub frames_received: u64,
    pub messages_dispatched: u64,
    pub malformed_dropped: u64,
    pub deliveries: u64,
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub subscriber_high_water_mark: usize,
}

// ---- 9.3 Shared Channel State ----

/// State that outlives individual connection instances of a channel.
#[derive(Debug)]
struct ChannelShared {
    spec: ChannelSpec,
    endpoint: String,
    listeners: ListenerSet,
    status: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    stats: ChannelStats,
}

impl ChannelShared {
    fn new(spec: ChannelSpec, endpoint: String) -> Self {
        let (status, _) = watch::channel(ConnectionState::Unopened);
        Self {
            spec,
            endpoint,
            listeners: ListenerSet::default(),
            status,
            generation: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            stats: ChannelStats::default(),
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }
}

// ---- 9.4 Connection Instance ----

type ClosedCallback = Arc<dyn Fn(u64, CloseReason) + Send + Sync>;

/// Handle to one connection instance. Dropping it closes the connection.
pub struct ChannelConnection {
    link: ConnectionLink,
    cancel: CancellationToken,
    task: Option<TokioJoinHandle<()>>,
}

impl Debug for ChannelConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("channel", &self.link.shared.spec.name)
            .field("generation", &self.link.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelConnection {
    fn open(
        shared: Arc<ChannelShared>,
        transport: Arc<dyn Transport>,
        runtime: &RuntimeHandle,
        on_closed: ClosedCallback,
    ) -> Self {
        let generation = shared.generation.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let link = ConnectionLink {
            shared,
            state: Arc::new(Mutex::new(ConnectionState::Unopened)),
            generation,
        };
        link.transition(ConnectionState::Opening);

        let cancel = CancellationToken::new();
        let task = runtime.spawn(run_connection(link.clone(), transport, cancel.clone(), on_closed));

        Self {
            link,
            cancel,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.link.generation
    }

    /// Close the connection. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        self.cancel.cancel();
        self.task.take();
        self.link.transition(ConnectionState::Closed {
            reason: CloseReason::Requested,
        })
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// The parts of a connection instance its task needs.
#[derive(Debug, Clone)]
struct ConnectionLink {
    shared: Arc<ChannelShared>,
    state: Arc<Mutex<ConnectionState>>,
    generation: u64,
}

impl ConnectionLink {
    fn is_current(&self) -> bool {
        self.shared.current_generation() == self.generation
    }

    /// Move to `next`. Closed is terminal, so this fails once closed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.is_closed() {
            return false;
        }
        *state = next.clone();
        if self.is_current() {
            self.shared.status.send_replace(next);
        }
        true
    }

    fn handle_frame(&self, frame: &Frame, cancel: &CancellationToken) {
        let shared = &self.shared;
        shared.stats.record_frame();

        let message = match decode_frame(shared.spec.kind, frame) {
            Ok(message) => message,
            Err(e) => {
                shared.stats.record_malformed();
                debug!(
                    target: "netpulse::connection",
                    channel = %shared.spec.name,
                    error = %e,
                    "Dropping malformed frame"
                );
                return;
            }
        };

        if cancel.is_cancelled() || !self.is_current() {
            return;
        }

        let delivered = shared.listeners.dispatch(&message);
        shared.stats.record_dispatch(delivered);
        trace!(
            target: "netpulse::connection",
            channel = %shared.spec.name,
            delivered = delivered,
            "Message dispatched"
        );
    }

    fn finish(&self, reason: CloseReason, on_closed: &ClosedCallback) {
        if self.transition(ConnectionState::Closed { reason: reason.clone() }) {
            on_closed(self.generation, reason);
        }
    }
}

async fn run_connection(
    link: ConnectionLink,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    on_closed: ClosedCallback,
) {
    let channel = link.shared.spec.name.clone();
    let endpoint = link.shared.endpoint.clone();

    debug!(
        target: "netpulse::connection",
        channel = %channel,
        endpoint = %endpoint,
        transport = transport.name(),
        generation = link.generation,
        "Opening connection"
    );

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = transport.connect(&endpoint) => result,
    };

    let mut frames = match connected {
        Ok(frames) => frames,
        Err(e) => {
            link.shared.stats.record_connect_failure();
            warn!(
                target: "netpulse::connection",
                channel = %channel,
                endpoint = %endpoint,
                error = %e,
                "Connection failed"
            );
            link.finish(CloseReason::ConnectFailed(e.to_string()), &on_closed);
            return;
        }
    };

    if !link.transition(ConnectionState::Open) {
        return;
    }
    link.shared.stats.record_open();
    link.shared.reconnect_attempts.store(0, AtomicOrdering::Release);
    info!(
        target: "netpulse::connection",
        channel = %channel,
        endpoint = %endpoint,
        generation = link.generation,
        "Connection open"
    );

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => link.handle_frame(&frame, &cancel),
            Some(Err(e)) => break CloseReason::TransportError(e.to_string()),
            None => break CloseReason::PeerClosed,
        }
    };
    drop(frames);

    warn!(
        target: "netpulse::connection",
        channel = %channel,
        reason = %reason,
        "Connection closed"
    );
    link.finish(reason, &on_closed);
}

// ============================================================================
// SECTION 10: HUB & SUBSCRIPTIONS
// ============================================================================
// The hub maps channel names to connections and fans every decoded message
// out to the channel's subscribers in subscription order. The first
// subscriber opens the connection, the last one leaving closes it.
//
// Lock order: listener gate, then hub channel table. A thread that is inside
// a delivery never waits on another listener's gate, so handlers may
// subscribe or unsubscribe any subscription, on any channel.
// ============================================================================

// ---- 10.1 Listeners ----

/// Unique per hub; also the dispatch order within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type MessageHandler = Box<dyn Fn(&RawMessage) + Send + Sync>;

thread_local! {
    /// Number of deliveries running on this thread.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(|d| d.get() > 0)
}

struct DispatchMarker;

impl DispatchMarker {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        DispatchMarker
    }
}

impl Drop for DispatchMarker {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// A subscriber's handler plus the gate that makes unsubscribe final.
///
/// Deliveries run with the gate held and re-check `active` under it. Outside
/// a delivery, `deactivate` waits on the gate, so once it returns no delivery
/// is running on another thread and none will start. From inside a delivery
/// it only clears the flag: waiting there could block on a handler that is
/// itself waiting on us. The gate is re-entrant so a handler can unsubscribe
/// itself.
struct Listener {
    id: SubscriptionId,
    handler: MessageHandler,
    active: AtomicBool,
    gate: ReentrantMutex<()>,
}

impl Debug for Listener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Listener {
    fn new(id: SubscriptionId, handler: MessageHandler) -> Self {
        Self {
            id,
            handler,
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        }
    }

    fn deliver(&self, message: &RawMessage) -> bool {
        if !self.is_active() {
            return false;
        }
        let _gate = self.gate.lock();
        if !self.is_active() {
            return false;
        }
        let _marker = DispatchMarker::enter();
        (self.handler)(message);
        true
    }

    /// Returns whether the listener was active.
    fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, AtomicOrdering::AcqRel);
        if !in_dispatch() {
            drop(self.gate.lock());
        }
        was_active
    }

    fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ListenerSet {
    listeners: RwLock<Vec<Arc<Listener>>>,
}

impl ListenerSet {
    fn insert(&self, listener: Arc<Listener>) -> usize {
        let mut listeners = self.listeners.write();
        listeners.push(listener);
        listeners.len()
    }

    /// Remove `id`; returns how many listeners remain.
    fn remove(&self, id: SubscriptionId) -> usize {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.id != id);
        listeners.len()
    }

    fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver to a snapshot of the current listeners, in subscription order.
    fn dispatch(&self, message: &RawMessage) -> usize {
        let snapshot: SmallVec<[Arc<Listener>; 8]> = self.listeners.read().iter().cloned().collect();
        snapshot.iter().filter(|l| l.deliver(message)).count()
    }
}

// ---- 10.2 Hub ----

struct ChannelEntry {
    shared: Arc<ChannelShared>,
    connection: Option<ChannelConnection>,
}

impl ChannelEntry {
    fn needs_connection(&self) -> bool {
        self.connection.as_ref().map_or(true, |c| c.state().is_closed())
    }
}

struct HubInner {
    config: HubConfig,
    chain: Arc<ResolutionChain>,
    transport: Arc<dyn Transport>,
    runtime: RuntimeHandle,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    next_subscription: AtomicU64,
    shutting_down: AtomicBool,
}

/// Shared multiplexer of live-data channels. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Debug for Hub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("instance", &self.inner.config.hub.instance_name)
            .field("transport", &self.inner.transport.name())
            .field("open_channels", &self.open_channels())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Create a hub on the current Tokio runtime.
    pub fn new(config: HubConfig, transport: Arc<dyn Transport>) -> HubResult<Self> {
        let runtime = RuntimeHandle::try_current().map_err(|e| HubError::NoRuntime(e.to_string()))?;
        Self::with_runtime(config, transport, runtime)
    }

    /// Create a hub whose connection tasks run on `runtime`.
    pub fn with_runtime(config: HubConfig, transport: Arc<dyn Transport>, runtime: RuntimeHandle) -> HubResult<Self> {
        config.validate()?;
        let chain = Arc::new(ResolutionChain::from_config(&config.resolution)?);

        info!(
            target: "netpulse::hub",
            instance = %config.hub.instance_name,
            base_url = %config.hub.base_url,
            channels = config.channels.len(),
            transport = transport.name(),
            "Hub created"
        );

        Ok(Self {
            inner: Arc::new(HubInner {
                config,
                chain,
                transport,
                runtime,
                channels: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn channel_spec(&self, channel: &str) -> Option<&ChannelSpec> {
        self.inner.config.channel(channel)
    }

    pub fn endpoint(&self, channel: &str) -> Option<String> {
        self.inner.config.endpoint_for(channel)
    }

    /// Port-key resolution chain shared by the views of this hub.
    pub fn resolution_chain(&self) -> Arc<ResolutionChain> {
        Arc::clone(&self.inner.chain)
    }

    /// Register `handler` for every message on `channel`.
    ///
    /// Opens the channel's connection if this is the first subscriber, or
    /// if the previous connection instance has closed. The returned
    /// [`Subscription`] unsubscribes when dropped.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> HubResult<Subscription>
    where
        F: Fn(&RawMessage) + Send + Sync + 'static,
    {
        if self.inner.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(HubError::ShuttingDown);
        }
        let spec = self
            .inner
            .config
            .channel(channel)
            .cloned()
            .ok_or_else(|| HubError::UnknownChannel {
                name: channel.to_string(),
            })?;

        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, AtomicOrdering::Relaxed));
        let listener = Arc::new(Listener::new(id, Box::new(handler)));

        let subscribers = {
            let mut channels = self.inner.channels.lock();
            let entry = channels.entry(spec.name.clone()).or_insert_with(|| {
                let endpoint = spec.endpoint(&self.inner.config.hub.base_url);
                ChannelEntry {
                    shared: Arc::new(ChannelShared::new(spec.clone(), endpoint)),
                    connection: None,
                }
            });

            let subscribers = entry.shared.listeners.insert(Arc::clone(&listener));
            entry.shared.stats.update_high_water_mark(subscribers);
            if entry.needs_connection() {
                self.inner.open_connection(entry);
            }
            subscribers
        };

        debug!(
            target: "netpulse::hub",
            channel = %spec.name,
            subscription = %id,
            subscribers = subscribers,
            "Subscribed"
        );

        Ok(Subscription {
            id,
            channel: spec.name,
            listener,
            hub: Arc::downgrade(&self.inner),
            active: true,
        })
    }

    /// Reopen a closed channel connection. Returns `Ok(false)` if the
    /// channel has no subscribers or its connection is still live.
    pub fn retry(&self, channel: &str) -> HubResult<bool> {
        if self.inner.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(HubError::ShuttingDown);
        }
        if self.inner.config.channel(channel).is_none() {
            return Err(HubError::UnknownChannel {
                name: channel.to_string(),
            });
        }

        let mut channels = self.inner.channels.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return Ok(false);
        };
        if !entry.needs_connection() {
            return Ok(false);
        }
        entry.shared.reconnect_attempts.store(0, AtomicOrdering::Release);
        self.inner.open_connection(entry);
        Ok(true)
    }

    /// Status feed of `channel`, available while it has subscribers.
    pub fn status(&self, channel: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| entry.shared.status.subscribe())
    }

    /// Current connection state; `None` if the channel has no subscribers.
    pub fn connection_state(&self, channel: &str) -> Option<ConnectionState> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| entry.shared.status.borrow().clone())
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| entry.shared.listeners.len())
            .unwrap_or(0)
    }

    /// Channels that currently have subscribers, sorted by name.
    pub fn open_channels(&self) -> Vec<ChannelId> {
        let mut names: Vec<ChannelId> = self.inner.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self, channel: &str) -> Option<ChannelStatsSnapshot> {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|entry| entry.shared.stats.snapshot())
    }

    /// Close every connection and refuse new subscriptions.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let mut channels = self.inner.channels.lock();
        for entry in channels.values_mut() {
            if let Some(mut connection) = entry.connection.take() {
                connection.close();
            }
        }
        info!(target: "netpulse::hub", channels = channels.len(), "Hub shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(AtomicOrdering::Acquire)
    }
}

impl HubInner {
    /// Replace the entry's connection with a fresh instance.
    fn open_connection(self: &Arc<Self>, entry: &mut ChannelEntry) {
        let weak = Arc::downgrade(self);
        let channel = entry.shared.spec.name.clone();
        let on_closed: ClosedCallback = Arc::new(move |generation, reason| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(&channel, generation, &reason);
            }
        });

        let connection = ChannelConnection::open(
            Arc::clone(&entry.shared),
            Arc::clone(&self.transport),
            &self.runtime,
            on_closed,
        );
        entry.connection = Some(connection);
    }

    fn remove_listener(&self, channel: &str, id: SubscriptionId) {
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get(channel) else {
            return;
        };
        let remaining = entry.shared.listeners.remove(id);
        debug!(
            target: "netpulse::hub",
            channel = channel,
            subscription = %id,
            remaining = remaining,
            "Unsubscribed"
        );

        if remaining == 0 {
            if let Some(mut entry) = channels.remove(channel) {
                if let Some(mut connection) = entry.connection.take() {
                    connection.close();
                }
            }
            info!(target: "netpulse::hub", channel = channel, "Last subscriber left, channel closed");
        }
    }

    /// Called by a connection task after its instance closed on its own.
    fn connection_lost(self: &Arc<Self>, channel: &ChannelId, generation: u64, reason: &CloseReason) {
        if self.shutting_down.load(AtomicOrdering::Acquire) || !reason.is_failure() {
            return;
        }

        let channels = self.channels.lock();
        let Some(entry) = channels.get(channel) else {
            return;
        };
        if entry.shared.current_generation() != generation {
            return;
        }

        let attempt = entry.shared.reconnect_attempts.fetch_add(1, AtomicOrdering::AcqRel);
        let Some(delay) = self.config.reconnect.delay_for(attempt) else {
            if matches!(self.config.reconnect, ReconnectPolicy::Backoff { .. }) {
                error!(
                    target: "netpulse::hub",
                    channel = %channel,
                    attempts = attempt,
                    "Reconnect attempts exhausted"
                );
            }
            return;
        };
        drop(channels);

        info!(
            target: "netpulse::hub",
            channel = %channel,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        let channel = channel.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reopen_if_current(&channel, generation);
            }
        });
    }

    fn reopen_if_current(self: &Arc<Self>, channel: &str, generation: u64) {
        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return;
        }
        let mut channels = self.channels.lock();
        let Some(entry) = channels.get_mut(channel) else {
            return;
        };
        if entry.shared.current_generation() == generation && entry.needs_connection() {
            self.open_connection(entry);
        }
    }
}

// ---- 10.3 Subscriptions ----

/// Registration of one handler on one channel. Unsubscribes on drop.
///
/// After `unsubscribe` (or drop) returns, the handler is never invoked
/// again, even by a message already being fanned out on another thread.
/// Called from outside a handler, it also waits for a delivery already in
/// progress to finish. From inside a handler it does not wait.
pub struct Subscription {
    id: SubscriptionId,
    channel: ChannelId,
    listener: Arc<Listener>,
    hub: Weak<HubInner>,
    active: bool,
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active && self.listener.is_active()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.listener.deactivate();
        if let Some(inner) = self.hub.upgrade() {
            inner.remove_listener(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// SECTION 11: SLIDING SAMPLE WINDOW
// ============================================================================
// Per-consumer, time-ordered sample store. Every append evicts samples that
// fell out of the window; the most recent sample is always retained, even if
// it is itself older than the window.
// ============================================================================

/// Bounded, time-ordered window of samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    span: Duration,
    samples: VecDeque<Sample>,
    evicted: u64,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_WINDOW_MS))
    }
}

impl SampleWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Append a sample, evicting relative to its own timestamp.
    pub fn append(&mut self, sample: Sample) -> usize {
        let now = sample.ts;
        self.append_at(sample, now)
    }

    /// Append a sample and evict everything older than `now - span`.
    ///
    /// A sample stamped earlier than the current tail is clamped to the
    /// tail's timestamp so the store stays ordered. Returns the number of
    /// evicted samples.
    pub fn append_at(&mut self, mut sample: Sample, now: Timestamp) -> usize {
        if let Some(tail) = self.samples.back() {
            if sample.ts < tail.ts {
                sample.ts = tail.ts;
            }
        }
        self.samples.push_back(sample);
        self.evict_expired(now)
    }

    /// Drop samples older than `now - span`, keeping at least the tail.
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        let cutoff = self.cutoff(now);
        let mut evicted = 0;
        while self.samples.len() > 1 && self.samples.front().map_or(false, |s| s.ts < cutoff) {
            self.samples.pop_front();
            evicted += 1;
        }
        self.evicted += evicted as u64;
        evicted
    }

    /// Oldest timestamp still inside the window at `now`.
    pub fn cutoff(&self, now: Timestamp) -> Timestamp {
        now.sub_duration(self.span)
    }

    /// Owned copy of the samples, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&Sample> {
        self.samples.front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted
    }

    /// Non-null values of `key`, oldest first.
    pub fn values(&self, key: &str) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.get(key)).collect()
    }

    /// Aggregate `key` over the window; `None` if it has no values.
    pub fn aggregate(&self, key: &str, function: AggregateFunction) -> Option<f64> {
        let values = self.values(key);
        if values.is_empty() {
            return None;
        }
        Some(function.apply(&values))
    }

    /// Aggregate every key present in the window.
    pub fn aggregate_all(&self, function: AggregateFunction) -> BTreeMap<CompactString, f64> {
        let keys: HashSet<&CompactString> = self.samples.iter().flat_map(|s| s.fields.keys()).collect();
        keys.into_iter()
            .filter_map(|key| self.aggregate(key, function).map(|v| (key.clone(), v)))
            .collect()
    }
}

// ---- 11.1 Aggregation ----

/// Reductions over the values of one key inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl AggregateFunction {
    /// Apply to `values`; 0.0 for an empty slice.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggregateFunction::Sum => values.iter().sum(),
            AggregateFunction::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregateFunction::Count => values.len() as f64,
            AggregateFunction::First => values[0],
            AggregateFunction::Last => values[values.len() - 1],
        }
    }
}

// ============================================================================
// SECTION 12: PORT KEY RESOLUTION
// ============================================================================
// Port-stats payloads key ports inconsistently: sometimes by configured
// name, sometimes by OVS port number, sometimes by a name carrying a bridge
// prefix. A chain of matchers is tried in order; each unresolved target
// falls through to the next tier. Learned mappings are then reused for the
// lifetime of the target set.
// ============================================================================

/// One strategy for matching a configured port to a payload key.
pub trait KeyMatcher: Send + Sync + Debug {
    fn tier(&self) -> &'static str;

    fn matches(&self, target: &PortTarget, key: &str) -> bool;
}

/// Key equals the configured port name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactNameMatcher;

impl KeyMatcher for ExactNameMatcher {
    fn tier(&self) -> &'static str {
        "exact"
    }

    fn matches(&self, target: &PortTarget, key: &str) -> bool {
        key == target.name.as_str()
    }
}

/// Key is the target's OVS port number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortNumberMatcher;

impl KeyMatcher for PortNumberMatcher {
    fn tier(&self) -> &'static str {
        "port_number"
    }

    fn matches(&self, target: &PortTarget, key: &str) -> bool {
        match (target.port_number, key.trim().parse::<u64>()) {
            (Some(number), Ok(parsed)) => u64::from(number) == parsed,
            _ => false,
        }
    }
}

/// Key and name agree after normalization: lowercase, bridge prefix
/// (`s1-eth1`, `br0:eth1`) dropped, interface prefix (`eth`) stripped.
#[derive(Debug, Clone, Default)]
pub struct NormalizedNameMatcher {
    prefixes: Vec<String>,
}

impl NormalizedNameMatcher {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes.into_iter().map(|p| p.as_ref().to_lowercase()).collect(),
        }
    }

    pub fn normalize(&self, raw: &str) -> String {
        let lowered = raw.trim().to_lowercase();
        let local = lowered.rsplit(['-', ':', '/']).next().unwrap_or(&lowered);
        let stripped = self
            .prefixes
            .iter()
            .find_map(|prefix| local.strip_prefix(prefix.as_str()))
            .unwrap_or(local);
        stripped.to_string()
    }
}

impl KeyMatcher for NormalizedNameMatcher {
    fn tier(&self) -> &'static str {
        "normalized"
    }

    fn matches(&self, target: &PortTarget, key: &str) -> bool {
        let name = self.normalize(&target.name);
        !name.is_empty() && name == self.normalize(key)
    }
}

/// A target mapped to a payload key by one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: CompactString,
    pub key: CompactString,
    pub tier: &'static str,
}

/// Ordered matchers; earlier tiers claim keys first.
#[derive(Debug)]
pub struct ResolutionChain {
    matchers: Vec<Box<dyn KeyMatcher>>,
}

impl Default for ResolutionChain {
    fn default() -> Self {
        Self::standard(DEFAULT_STRIP_PREFIXES)
    }
}

impl ResolutionChain {
    pub fn new(matchers: Vec<Box<dyn KeyMatcher>>) -> Self {
        Self { matchers }
    }

    /// exact, then port number, then normalized name.
    pub fn standard<I, S>(strip_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(vec![
            Box::new(ExactNameMatcher),
            Box::new(PortNumberMatcher),
            Box::new(NormalizedNameMatcher::new(strip_prefixes)),
        ])
    }

    pub fn from_config(config: &ResolutionConfig) -> Result<Self, ConfigError> {
        let mut matchers: Vec<Box<dyn KeyMatcher>> = Vec::with_capacity(config.tiers.len());
        for tier in &config.tiers {
            let matcher: Box<dyn KeyMatcher> = match tier.as_str() {
                "exact" => Box::new(ExactNameMatcher),
                "port_number" => Box::new(PortNumberMatcher),
                "normalized" => Box::new(NormalizedNameMatcher::new(&config.strip_prefixes)),
                other => {
                    return Err(ConfigError::invalid_value(
                        "resolution.tiers",
                        format!("unknown tier '{}'", other),
                    ))
                }
            };
            matchers.push(matcher);
        }
        Ok(Self::new(matchers))
    }

    pub fn tiers(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.tier()).collect()
    }

    /// Resolve `pending` targets against `keys`.
    ///
    /// Tiers run in order, each over the targets no earlier tier resolved,
    /// so an exact match always beats a fallback for the same key. A key is
    /// claimed by at most one target, and keys in `claimed` are never
    /// handed out.
    pub fn resolve(&self, pending: &[&PortTarget], keys: &[&str], claimed: &HashSet<&str>) -> Vec<Resolution> {
        let mut taken: HashSet<&str> = claimed.clone();
        let mut remaining: Vec<&PortTarget> = pending.to_vec();
        let mut found = Vec::new();

        for matcher in &self.matchers {
            if remaining.is_empty() {
                break;
            }
            remaining.retain(|target| {
                let hit = keys
                    .iter()
                    .copied()
                    .find(|key| !taken.contains(key) && matcher.matches(target, key));
                match hit {
                    Some(key) => {
                        taken.insert(key);
                        found.push(Resolution {
                            target: target.name.clone(),
                            key: CompactString::from(key),
                            tier: matcher.tier(),
                        });
                        false
                    }
                    None => true,
                }
            });
        }
        found
    }
}

// ---- 12.1 Learned Key Map ----

#[derive(Debug, Clone, PartialEq, Eq)]
struct LearnedKey {
    key: CompactString,
    tier: &'static str,
}

/// Target name -> payload key, learned on first resolution.
#[derive(Debug, Clone, Default)]
pub struct PortKeyMap {
    learned: HashMap<CompactString, LearnedKey>,
}

impl PortKeyMap {
    pub fn get(&self, target: &str) -> Option<&str> {
        self.learned.get(target).map(|l| l.key.as_str())
    }

    /// Tier that resolved `target`.
    pub fn tier(&self, target: &str) -> Option<&'static str> {
        self.learned.get(target).map(|l| l.tier)
    }

    pub fn learn(&mut self, resolution: &Resolution) {
        self.learned.insert(
            resolution.target.clone(),
            LearnedKey {
                key: resolution.key.clone(),
                tier: resolution.tier,
            },
        );
    }

    pub fn claimed_keys(&self) -> HashSet<&str> {
        self.learned.values().map(|l| l.key.as_str()).collect()
    }

    pub fn reset(&mut self) {
        self.learned.clear();
    }

    pub fn len(&self) -> usize {
        self.learned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learned.is_empty()
    }
}

// ============================================================================
// SECTION 13: FILTERED PROJECTION
// ============================================================================
// Turns a raw channel message into a consumer's sample: drop messages for
// other devices, keep only the fields the consumer asked for, re-key port
// values under the configured port names.
// ============================================================================

/// What a consumer wants out of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectionSpec {
    DeviceStats {
        ip_address: CompactString,
    },
    PortStats {
        ip_address: CompactString,
        targets: Vec<PortTarget>,
    },
    /// Empty `classes` accepts every class.
    Classifications {
        #[serde(default)]
        classes: Vec<CompactString>,
    },
}

impl ProjectionSpec {
    pub fn device_stats(ip_address: impl Into<CompactString>) -> Self {
        ProjectionSpec::DeviceStats {
            ip_address: ip_address.into(),
        }
    }

    pub fn port_stats(ip_address: impl Into<CompactString>, targets: Vec<PortTarget>) -> Self {
        ProjectionSpec::PortStats {
            ip_address: ip_address.into(),
            targets,
        }
    }

    pub fn classifications<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        ProjectionSpec::Classifications {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ProjectionSpec::DeviceStats { .. } => ChannelKind::DeviceStats,
            ProjectionSpec::PortStats { .. } => ChannelKind::PortStats,
            ProjectionSpec::Classifications { .. } => ChannelKind::Classifications,
        }
    }
}

/// Applies a [`ProjectionSpec`], keeping the learned port-key map.
#[derive(Debug)]
pub struct Projector {
    spec: ProjectionSpec,
    chain: Arc<ResolutionChain>,
    key_map: PortKeyMap,
}

impl Projector {
    pub fn new(spec: ProjectionSpec, chain: Arc<ResolutionChain>) -> Self {
        Self {
            spec,
            chain,
            key_map: PortKeyMap::default(),
        }
    }

    pub fn spec(&self) -> &ProjectionSpec {
        &self.spec
    }

    pub fn key_map(&self) -> &PortKeyMap {
        &self.key_map
    }

    /// Replace the port targets. A different target set resets the learned
    /// key map; reordering the same ports does not. Returns whether the set
    /// changed.
    pub fn set_targets(&mut self, new_targets: Vec<PortTarget>) -> bool {
        match &mut self.spec {
            ProjectionSpec::PortStats { targets, .. } if !same_target_set(targets, &new_targets) => {
                *targets = new_targets;
                self.key_map.reset();
                true
            }
            _ => false,
        }
    }

    /// Project `message` into a sample stamped `now`. `None` means the
    /// message is irrelevant to this consumer.
    pub fn project(&mut self, message: &RawMessage, now: Timestamp) -> Option<Sample> {
        let Self { spec, chain, key_map } = self;

        let fields = match (spec, message) {
            (ProjectionSpec::DeviceStats { ip_address }, RawMessage::DeviceStats(m)) => {
                if !address_matches(ip_address, &m.ip_address) {
                    return None;
                }
                let mut fields = FieldMap::new();
                fields.insert(CompactString::from("cpu"), m.cpu);
                fields.insert(CompactString::from("memory"), m.memory);
                fields.insert(CompactString::from("disk"), m.disk);
                fields
            }
            (ProjectionSpec::PortStats { ip_address, targets }, RawMessage::PortStats(m)) => {
                if !address_matches(ip_address, &m.ip_address) {
                    return None;
                }
                project_ports(targets, chain, key_map, m)
            }
            (ProjectionSpec::Classifications { classes }, RawMessage::Classification(m)) => {
                let label = m.label();
                // one series per class, whatever case the label arrives in
                let key = if classes.is_empty() {
                    CompactString::from(label.to_lowercase())
                } else {
                    classes.iter().find(|c| c.eq_ignore_ascii_case(label))?.clone()
                };
                let mut fields = FieldMap::new();
                fields.insert(key, Some(m.amount()));
                fields
            }
            _ => return None,
        };

        if fields.is_empty() {
            return None;
        }
        Some(Sample::new(now, fields))
    }
}

fn project_ports(
    targets: &[PortTarget],
    chain: &ResolutionChain,
    key_map: &mut PortKeyMap,
    message: &PortStatsMessage,
) -> FieldMap {
    let mut fields = FieldMap::new();
    let mut pending: Vec<&PortTarget> = Vec::new();

    for target in targets {
        match key_map.get(&target.name) {
            Some(key) => {
                if let Some(value) = message.ports.get(key) {
                    fields.insert(target.name.clone(), *value);
                }
            }
            None => pending.push(target),
        }
    }

    if pending.is_empty() {
        return fields;
    }

    let resolutions = {
        let keys: Vec<&str> = message.ports.keys().map(|k| k.as_str()).collect();
        let claimed = key_map.claimed_keys();
        chain.resolve(&pending, &keys, &claimed)
    };

    for resolution in &resolutions {
        if let Some(value) = message.ports.get(resolution.key.as_str()) {
            fields.insert(resolution.target.clone(), *value);
        }
        debug!(
            target: "netpulse::view",
            port = %resolution.target,
            key = %resolution.key,
            tier = resolution.tier,
            "Learned port key"
        );
        key_map.learn(resolution);
    }

    fields
}

fn same_target_set(current: &[PortTarget], next: &[PortTarget]) -> bool {
    let current: HashSet<&PortTarget> = current.iter().collect();
    let next: HashSet<&PortTarget> = next.iter().collect();
    current == next
}

/// Addresses compare as IPs when both parse, as trimmed text otherwise.
fn address_matches(wanted: &str, seen: &str) -> bool {
    let (wanted, seen) = (wanted.trim(), seen.trim());
    match (wanted.parse::<IpAddr>(), seen.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => wanted.eq_ignore_ascii_case(seen),
    }
}

// ============================================================================
// SECTION 14: LIVE VIEWS
// ============================================================================
// A live view is one chart's consumer: a hub subscription, a projector, a
// sample window and a change feed. Samples are captured at arrival time.
// ============================================================================

/// Mount options of a [`LiveView`].
#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub window: Duration,
    /// Background eviction interval; `None` disables the sweeper
    pub sweep_interval: Option<Duration>,
    pub clock: SampleClock,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self::from_config(&WindowConfig::default())
    }
}

impl ViewOptions {
    pub fn from_config(config: &WindowConfig) -> Self {
        Self {
            window: config.window,
            sweep_interval: (!config.sweep_interval.is_zero()).then_some(config.sweep_interval),
            clock: SampleClock::System,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_clock(mut self, clock: SampleClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn without_sweeper(mut self) -> Self {
        self.sweep_interval = None;
        self
    }
}

/// What a chart should draw right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RenderState {
    /// Connection not open yet and nothing received
    Connecting,
    /// Connected, but no relevant sample yet
    NoData,
    Live { samples: Vec<Sample> },
    /// Connection lost; the last window stays visible
    Disconnected { reason: String, samples: Vec<Sample> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewStats {
    pub accepted: u64,
    pub ignored: u64,
    pub evicted: u64,
    pub len: usize,
}

#[derive(Debug)]
struct ViewState {
    projector: Projector,
    window: SampleWindow,
    clock: SampleClock,
    accepted: u64,
    ignored: u64,
}

impl ViewState {
    fn ingest(&mut self, message: &RawMessage) -> bool {
        let now = self.clock.now();
        match self.projector.project(message, now) {
            Some(sample) => {
                self.window.append_at(sample, now);
                self.accepted += 1;
                true
            }
            None => {
                self.ignored += 1;
                false
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        self.window.evict_expired(now)
    }
}

/// One consumer's live window over a hub channel.
pub struct LiveView {
    channel: ChannelId,
    state: Arc<Mutex<ViewState>>,
    version: Arc<watch::Sender<u64>>,
    status: watch::Receiver<ConnectionState>,
    subscription: Option<Subscription>,
    sweeper: Option<TokioJoinHandle<()>>,
}

impl Debug for LiveView {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveView")
            .field("channel", &self.channel)
            .field("stats", &self.stats())
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl LiveView {
    /// Subscribe to `channel` and start collecting samples for `spec`.
    pub fn mount(hub: &Hub, channel: &str, spec: ProjectionSpec, options: ViewOptions) -> HubResult<Self> {
        let channel_spec = hub.channel_spec(channel).ok_or_else(|| HubError::UnknownChannel {
            name: channel.to_string(),
        })?;
        if channel_spec.kind != spec.kind() {
            return Err(HubError::ProjectionMismatch {
                channel: channel.to_string(),
                expected: spec.kind(),
                found: channel_spec.kind,
            });
        }

        let state = Arc::new(Mutex::new(ViewState {
            projector: Projector::new(spec, hub.resolution_chain()),
            window: SampleWindow::new(options.window),
            clock: options.clock,
            accepted: 0,
            ignored: 0,
        }));
        let (version, _) = watch::channel(0u64);
        let version = Arc::new(version);

        let subscription = {
            let state = Arc::clone(&state);
            let version = Arc::clone(&version);
            hub.subscribe(channel, move |message| {
                let changed = state.lock().ingest(message);
                if changed {
                    version.send_modify(|v| *v += 1);
                }
            })?
        };

        let status = hub.status(channel).ok_or_else(|| {
            HubError::Internal(format!("channel '{}' vanished while mounting", channel))
        })?;

        let sweeper = options.sweep_interval.map(|every| {
            spawn_sweeper(
                &hub.inner.runtime,
                Arc::downgrade(&state),
                Arc::downgrade(&version),
                every,
            )
        });

        debug!(
            target: "netpulse::view",
            channel = channel,
            subscription = %subscription.id(),
            window_ms = options.window.as_millis() as u64,
            "View mounted"
        );

        Ok(Self {
            channel: CompactString::from(channel),
            state,
            version,
            status,
            subscription: Some(subscription),
            sweeper,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Feed one message through this view's projection and window.
    /// Returns whether a sample was stored.
    pub fn ingest(&self, message: &RawMessage) -> bool {
        let changed = self.state.lock().ingest(message);
        if changed {
            self.version.send_modify(|v| *v += 1);
        }
        changed
    }

    /// Current window, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.state.lock().window.snapshot()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.state.lock().window.latest().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().window.is_empty()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    /// Connection status feed of the underlying channel.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Ticks whenever the window contents change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn render_state(&self) -> RenderState {
        let samples = self.snapshot();
        let status = self.status.borrow().clone();
        match status {
            ConnectionState::Closed { reason } => RenderState::Disconnected {
                reason: reason.to_string(),
                samples,
            },
            _ if !samples.is_empty() => RenderState::Live { samples },
            ConnectionState::Open => RenderState::NoData,
            ConnectionState::Unopened | ConnectionState::Opening => RenderState::Connecting,
        }
    }

    /// Replace the port targets; a change clears the window and the learned
    /// key map. Returns whether anything changed.
    pub fn set_targets(&self, targets: Vec<PortTarget>) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.projector.set_targets(targets);
            if changed {
                state.window.clear();
            }
            changed
        };
        if changed {
            debug!(target: "netpulse::view", channel = %self.channel, "Port targets changed, window reset");
            self.version.send_modify(|v| *v += 1);
        }
        changed
    }

    /// Evict expired samples now. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let evicted = self.state.lock().sweep();
        if evicted > 0 {
            self.version.send_modify(|v| *v += 1);
        }
        evicted
    }

    pub fn aggregate(&self, key: &str, function: AggregateFunction) -> Option<f64> {
        self.state.lock().window.aggregate(key, function)
    }

    pub fn aggregate_all(&self, function: AggregateFunction) -> BTreeMap<CompactString, f64> {
        self.state.lock().window.aggregate_all(function)
    }

    /// Learned port-key map, for diagnostics.
    pub fn key_map(&self) -> PortKeyMap {
        self.state.lock().projector.key_map().clone()
    }

    pub fn stats(&self) -> ViewStats {
        let state = self.state.lock();
        ViewStats {
            accepted: state.accepted,
            ignored: state.ignored,
            evicted: state.window.total_evicted(),
            len: state.window.len(),
        }
    }

    /// Unsubscribe and stop the sweeper.
    pub fn unmount(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            debug!(target: "netpulse::view", channel = %self.channel, "View unmounted");
        }
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.detach();
    }
}

fn spawn_sweeper(
    runtime: &RuntimeHandle,
    state: Weak<Mutex<ViewState>>,
    version: Weak<watch::Sender<u64>>,
    every: Duration,
) -> TokioJoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let evicted = state.lock().sweep();
            drop(state);
            if evicted > 0 {
                match version.upgrade() {
                    Some(version) => version.send_modify(|v| *v += 1),
                    None => break,
                }
            }
        }
    })
}

// ============================================================================
// SECTION 15: COMMAND LINE INTERFACE
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "netpulse")]
#[command(author = "NetPulse Team")]
#[command(version = HUB_VERSION)]
#[command(about = "NetPulse Telemetry Hub - live SDN device and port telemetry")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "NETPULSE_CONFIG")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long, env = "NETPULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration file
    Validate {
        /// Print the effective configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration
    GenerateConfig {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List configured channels and their endpoints
    Channels,

    /// Show version information
    Version,

    /// Stream one channel's projected samples to stdout as JSON lines
    Tail {
        /// Channel name, e.g. deviceStats
        channel: String,

        /// Device IP address (device and port channels)
        #[arg(long)]
        ip: Option<String>,

        /// Port target as NAME or NAME:PORT_NUMBER (repeatable)
        #[arg(short, long = "port", value_parser = parse_port_target)]
        ports: Vec<PortTarget>,

        /// Classification to keep (repeatable, default all)
        #[arg(long = "class")]
        classes: Vec<String>,

        /// Print a window summary instead of each sample
        #[arg(long, value_enum)]
        summary: Option<SummaryMode>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    Avg,
    Max,
    Last,
}

impl From<SummaryMode> for AggregateFunction {
    fn from(mode: SummaryMode) -> Self {
        match mode {
            SummaryMode::Avg => AggregateFunction::Avg,
            SummaryMode::Max => AggregateFunction::Max,
            SummaryMode::Last => AggregateFunction::Last,
        }
    }
}

/// Parse `eth1` or `eth1:1`.
pub fn parse_port_target(raw: &str) -> Result<PortTarget, String> {
    let raw = raw.trim();
    match raw.rsplit_once(':') {
        Some((name, number)) if !name.is_empty() => number
            .trim()
            .parse::<u32>()
            .map(|n| PortTarget::new(name, n))
            .map_err(|e| format!("invalid port number in '{}': {}", raw, e)),
        _ if raw.is_empty() => Err("port target must not be empty".to_string()),
        _ => Ok(PortTarget::named(raw)),
    }
}

/// Projection for `tail`, built from its flags.
pub fn build_projection(
    kind: ChannelKind,
    ip: Option<&str>,
    ports: Vec<PortTarget>,
    classes: Vec<String>,
) -> Result<ProjectionSpec, ConfigError> {
    let ip = || {
        ip.map(str::trim)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| ConfigError::missing_field("--ip"))
    };
    match kind {
        ChannelKind::DeviceStats => Ok(ProjectionSpec::device_stats(ip()?)),
        ChannelKind::PortStats => {
            if ports.is_empty() {
                return Err(ConfigError::missing_field("--port"));
            }
            Ok(ProjectionSpec::port_stats(ip()?, ports))
        }
        ChannelKind::Classifications => Ok(ProjectionSpec::classifications(classes)),
    }
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("🔍 Validating configuration: {}", config_path.display());

    match HubConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid");
            if verbose {
                println!("\n{:#?}", config);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

fn handle_generate_config(output: Option<PathBuf>) -> AnyhowResult<()> {
    let config = HubConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(&path, &config).with_context(|| format!("writing {}", path.display()))?;
            println!("✅ Configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config);
        }
    }

    Ok(())
}

fn handle_channels(config: &HubConfig) {
    println!("📡 Channels ({})", config.channels.len());
    for channel in &config.channels {
        println!(
            "  {:<18} {:<16} {}",
            channel.name,
            channel.kind.to_string(),
            channel.endpoint(&config.hub.base_url)
        );
    }
}

fn handle_version() {
    println!("{} v{}", HUB_FULL_NAME, HUB_VERSION);
    println!("  Package: {}", HUB_NAME);
    println!(
        "  WebSocket transport: {}",
        if cfg!(feature = "websocket") { "enabled" } else { "disabled" }
    );
}

#[cfg(feature = "websocket")]
async fn handle_tail(
    config: HubConfig,
    channel: String,
    projection: ProjectionSpec,
    summary: Option<SummaryMode>,
) -> AnyhowResult<()> {
    let hub = Hub::new(config.clone(), Arc::new(WebSocketTransport::new()))?;
    let view = LiveView::mount(&hub, &channel, projection, ViewOptions::from_config(&config.window))?;

    let mut changes = view.changes();
    let mut status = view.status();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(target: "netpulse::init", "Interrupted");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = match summary {
                    Some(mode) => serde_json::to_string(&view.aggregate_all(mode.into()))?,
                    None => match view.latest() {
                        Some(sample) => serde_json::to_string(&sample)?,
                        None => continue,
                    },
                };
                println!("{}", line);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().clone();
                info!(target: "netpulse::init", channel = %channel, state = %state, "Connection state changed");
                if state.is_closed() && config.reconnect == ReconnectPolicy::Never {
                    eprintln!("❌ {}: {}", channel, state);
                    break;
                }
            }
        }
    }

    view.unmount();
    hub.shutdown();
    Ok(())
}

#[cfg(not(feature = "websocket"))]
async fn handle_tail(
    _config: HubConfig,
    _channel: String,
    _projection: ProjectionSpec,
    _summary: Option<SummaryMode>,
) -> AnyhowResult<()> {
    anyhow::bail!("netpulse was built without the websocket transport")
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[allow(dead_code)]
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.clone());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let mut config = if cli.config.exists() {
        HubConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        HubConfig::default()
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    match cli.command {
        Some(Commands::Channels) => handle_channels(&config),
        Some(Commands::Tail {
            channel,
            ip,
            ports,
            classes,
            summary,
        }) => {
            let spec = config
                .channel(&channel)
                .ok_or_else(|| HubError::UnknownChannel { name: channel.clone() })?;
            let projection = build_projection(spec.kind, ip.as_deref(), ports, classes)?;
            handle_tail(config, channel, projection, summary).await?;
        }
        _ => {
            handle_version();
            println!();
            handle_channels(&config);
            println!("\nRun `netpulse tail <CHANNEL>` to stream live samples.");
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================



#[cfg(test)]
mod phase2_tests {
    use super::test_support::*;
    use super::*;
    use rstest::rstest;

    // ---- decoding ----

    #[test]
    fn test_decode_device_stats_tolerates_strings_and_nulls() {
        let frame = Frame::text(r#"{"ip_address":" 10.0.0.5 ","cpu":"42.5","memory":null,"disk":"n/a"}"#);
        let decoded = decode_frame(ChannelKind::DeviceStats, &frame).unwrap();
        assert_eq!(
            decoded,
            RawMessage::DeviceStats(DeviceStatsMessage {
                ip_address: "10.0.0.5".into(),
                cpu: Some(42.5),
                memory: None,
                disk: None,
            })
        );
        assert_eq!(decoded.ip_address(), Some("10.0.0.5"));
    }

    #[test]
    fn test_decode_port_stats() {
        let frame = Frame::Binary(br#"{"ip_address":"10.0.0.5","ports":{"1":120.5,"eth2":"7","s1-eth3":null}}"#.to_vec());
        let RawMessage::PortStats(message) = decode_frame(ChannelKind::PortStats, &frame).unwrap() else {
            panic!("expected port stats");
        };
        assert_eq!(message.ports.len(), 3);
        assert_eq!(message.ports.get("1"), Some(&Some(120.5)));
        assert_eq!(message.ports.get("eth2"), Some(&Some(7.0)));
        assert_eq!(message.ports.get("s1-eth3"), Some(&None));
    }

    #[rstest]
    #[case::flow_string(r#"{"flow":"video"}"#, "video", 1.0)]
    #[case::flow_object(r#"{"flow":{"classification":"web","src":"10.0.0.1"}}"#, "web", 1.0)]
    #[case::count(r#"{"classification":"voip","count":12}"#, "voip", 12.0)]
    #[case::count_as_string(r#"{"classification":"voip","count":"3"}"#, "voip", 3.0)]
    fn test_decode_classification_shapes(#[case] payload: &str, #[case] label: &str, #[case] amount: f64) {
        let decoded = decode_frame(ChannelKind::Classifications, &Frame::text(payload)).unwrap();
        let RawMessage::Classification(message) = decoded else {
            panic!("expected classification");
        };
        assert_eq!(message.label(), label);
        assert_eq!(message.amount(), amount);
    }

    #[rstest]
    #[case::not_json(ChannelKind::DeviceStats, "not json")]
    #[case::array(ChannelKind::DeviceStats, "[1,2,3]")]
    #[case::missing_ip(ChannelKind::DeviceStats, r#"{"cpu":1}"#)]
    #[case::empty_ip(ChannelKind::PortStats, r#"{"ip_address":"","ports":{}}"#)]
    #[case::ports_not_object(ChannelKind::PortStats, r#"{"ip_address":"10.0.0.1","ports":[1]}"#)]
    #[case::missing_ports(ChannelKind::PortStats, r#"{"ip_address":"10.0.0.1"}"#)]
    #[case::empty_flow(ChannelKind::Classifications, r#"{"flow":""}"#)]
    #[case::count_missing(ChannelKind::Classifications, r#"{"classification":"web"}"#)]
    #[case::no_label(ChannelKind::Classifications, r#"{"count":4}"#)]
    fn test_decode_rejects_malformed(#[case] kind: ChannelKind, #[case] payload: &str) {
        assert!(decode_frame(kind, &Frame::text(payload)).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let invalid_utf8 = Frame::Binary(vec![0xff, 0xfe, 0x00]);
        assert_eq!(decode_frame(ChannelKind::DeviceStats, &invalid_utf8), Err(DecodeError::InvalidUtf8));

        let huge = Frame::Text(" ".repeat(MAX_FRAME_BYTES + 1));
        assert!(matches!(
            decode_frame(ChannelKind::DeviceStats, &huge),
            Err(DecodeError::FrameTooLarge { .. })
        ));
    }

    // ---- memory transport ----

    #[tokio::test]
    async fn test_memory_transport_delivery() {
        let transport = MemoryTransport::new();
        let mut stream = transport.connect("mem://a").await.unwrap();
        assert_eq!(transport.connect_count("mem://a"), 1);
        assert_eq!(transport.live_connections("mem://a"), 1);
        assert_eq!(transport.send_text("mem://a", "hello"), 1);
        assert_eq!(transport.send_text("mem://b", "nobody"), 0);
        assert_eq!(stream.next().await, Some(Ok(Frame::text("hello"))));

        transport.fail_next_connects("mem://a", 1);
        assert!(transport.connect("mem://a").await.is_err());
        assert_eq!(transport.connect_count("mem://a"), 2);

        assert_eq!(transport.disconnect("mem://a"), 1);
        assert_eq!(stream.next().await, None);
        drop(stream);
        assert_eq!(transport.live_connections("mem://a"), 0);
    }

    // ---- hub ----

    #[test]
    fn test_hub_requires_runtime() {
        let result = Hub::new(HubConfig::default(), Arc::new(MemoryTransport::new()));
        assert!(matches!(result, Err(HubError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let result = hub.subscribe("nope", |_| {});
        assert!(matches!(result, Err(HubError::UnknownChannel { name }) if name == "nope"));
        assert!(hub.open_channels().is_empty());
        assert_eq!(transport.connect_count(&endpoint(&hub, DEVICE_STATS_CHANNEL)), 0);
    }

    #[tokio::test]
    async fn test_single_connection_shared_by_subscribers() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);

        let mut subs: Vec<Subscription> = (0..3)
            .map(|_| hub.subscribe(DEVICE_STATS_CHANNEL, |_| {}))
            .collect::<Result<_, _>>()
            .unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        assert_eq!(transport.connect_count(&ep), 1);
        assert_eq!(transport.live_connections(&ep), 1);
        assert_eq!(hub.subscriber_count(DEVICE_STATS_CHANNEL), 3);
        assert_eq!(hub.stats(DEVICE_STATS_CHANNEL).unwrap().subscriber_high_water_mark, 3);

        let last = subs.pop().unwrap();
        drop(subs);
        assert_eq!(hub.subscriber_count(DEVICE_STATS_CHANNEL), 1);
        assert_eq!(hub.connection_state(DEVICE_STATS_CHANNEL), Some(ConnectionState::Open));
        assert_eq!(transport.connect_count(&ep), 1);

        last.unsubscribe();
        assert_eq!(hub.connection_state(DEVICE_STATS_CHANNEL), None);
        assert!(hub.open_channels().is_empty());
        eventually("transport stream released", || transport.live_connections(&ep) == 0).await;
        assert_eq!(transport.connect_count(&ep), 1);
    }

    #[tokio::test]
    async fn test_fan_out_in_subscription_order() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = {
            let seen = Arc::clone(&seen);
            hub.subscribe(DEVICE_STATS_CHANNEL, move |_| seen.lock().push("first")).unwrap()
        };
        let _second = {
            let seen = Arc::clone(&seen);
            hub.subscribe(DEVICE_STATS_CHANNEL, move |_| seen.lock().push("second")).unwrap()
        };
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));
        transport.send_text(&ep, device_json(DEVICE_IP, 2.0));
        eventually("both deliveries", || seen.lock().len() == 4).await;
        assert_eq!(*seen.lock(), vec!["first", "second", "first", "second"]);

        let stats = hub.stats(DEVICE_STATS_CHANNEL).unwrap();
        assert_eq!(stats.messages_dispatched, 2);
        assert_eq!(stats.deliveries, 4);
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let (a_hits, a) = counting_handler();
        let (b_hits, b) = counting_handler();

        let sub_a = hub.subscribe(DEVICE_STATS_CHANNEL, a).unwrap();
        let _sub_b = hub.subscribe(DEVICE_STATS_CHANNEL, b).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));
        eventually("first delivery", || b_hits.load(AtomicOrdering::SeqCst) == 1).await;
        assert_eq!(a_hits.load(AtomicOrdering::SeqCst), 1);

        sub_a.unsubscribe();
        for cpu in 0..3 {
            transport.send_text(&ep, device_json(DEVICE_IP, cpu as f64));
        }
        eventually("observer deliveries", || b_hits.load(AtomicOrdering::SeqCst) == 4).await;
        assert_eq!(a_hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_delivery_after_unsubscribe_under_load() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let (a_hits, a) = counting_handler();
        let (b_hits, b) = counting_handler();

        let sub_a = hub.subscribe(DEVICE_STATS_CHANNEL, a).unwrap();
        let _sub_b = hub.subscribe(DEVICE_STATS_CHANNEL, b).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        let sender = {
            let transport = transport.clone();
            let ep = ep.clone();
            tokio::task::spawn_blocking(move || {
                for cpu in 0..500 {
                    transport.send_text(&ep, device_json(DEVICE_IP, cpu as f64));
                }
            })
        };

        eventually("deliveries started", || a_hits.load(AtomicOrdering::SeqCst) > 0).await;
        sub_a.unsubscribe();
        let frozen = a_hits.load(AtomicOrdering::SeqCst);

        sender.await.unwrap();
        eventually("observer saw every message", || b_hits.load(AtomicOrdering::SeqCst) == 500).await;
        assert_eq!(a_hits.load(AtomicOrdering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn test_handler_can_unsubscribe_itself() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            hub.subscribe(DEVICE_STATS_CHANNEL, move |_| {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
                let own = slot.lock().take();
                drop(own);
            })
            .unwrap()
        };
        *slot.lock() = Some(sub);

        let (observer_hits, observer) = counting_handler();
        let _observer = hub.subscribe(DEVICE_STATS_CHANNEL, observer).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        for cpu in 0..3 {
            transport.send_text(&ep, device_json(DEVICE_IP, cpu as f64));
        }
        eventually("observer deliveries", || observer_hits.load(AtomicOrdering::SeqCst) == 3).await;
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(DEVICE_STATS_CHANNEL), 1);
    }

    #[tokio::test]
    async fn test_handler_can_subscribe_from_dispatch() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let nested: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let _outer = {
            let hub = hub.clone();
            let nested = Arc::clone(&nested);
            hub.clone()
                .subscribe(DEVICE_STATS_CHANNEL, move |_| {
                    if let Ok(sub) = hub.subscribe(CLASSIFICATIONS_CHANNEL, |_| {}) {
                        nested.lock().push(sub);
                    }
                })
                .unwrap()
        };
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));
        eventually("nested subscription", || hub.subscriber_count(CLASSIFICATIONS_CHANNEL) == 1).await;
        nested.lock().clear();
        assert_eq!(hub.subscriber_count(CLASSIFICATIONS_CHANNEL), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handlers_on_different_channels_unsubscribe_each_other() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let device_ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let class_ep = endpoint(&hub, CLASSIFICATIONS_CHANNEL);
        let device_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let class_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let dropping_handler = |other: Arc<Mutex<Option<Subscription>>>, hits: Arc<AtomicUsize>| {
            move |_: &RawMessage| {
                hits.fetch_add(1, AtomicOrdering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                let sub = other.lock().take();
                drop(sub);
            }
        };

        let device_sub = hub
            .subscribe(
                DEVICE_STATS_CHANNEL,
                dropping_handler(Arc::clone(&class_slot), Arc::clone(&hits)),
            )
            .unwrap();
        let class_sub = hub
            .subscribe(
                CLASSIFICATIONS_CHANNEL,
                dropping_handler(Arc::clone(&device_slot), Arc::clone(&hits)),
            )
            .unwrap();
        *device_slot.lock() = Some(device_sub);
        *class_slot.lock() = Some(class_sub);
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;
        wait_open(&hub, CLASSIFICATIONS_CHANNEL).await;

        transport.send_text(&device_ep, device_json(DEVICE_IP, 1.0));
        transport.send_text(&class_ep, r#"{"flow": "video"}"#);

        eventually("both subscriptions released", || {
            hub.subscriber_count(DEVICE_STATS_CHANNEL) == 0 && hub.subscriber_count(CLASSIFICATIONS_CHANNEL) == 0
        })
        .await;
        assert!(hits.load(AtomicOrdering::SeqCst) >= 1);
        assert!(device_slot.lock().is_none());
        assert!(class_slot.lock().is_none());

        eventually("channels closed", || hub.open_channels().is_empty()).await;

        let (after_hits, after) = counting_handler();
        let _again = hub.subscribe(DEVICE_STATS_CHANNEL, after).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;
        transport.send_text(&device_ep, device_json(DEVICE_IP, 2.0));
        eventually("delivery after resubscribe", || after_hits.load(AtomicOrdering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let (hits, handler) = counting_handler();
        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, handler).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_text(&ep, "not json");
        transport.send_text(&ep, r#"{"cpu": 1}"#);
        transport.send_frame(&ep, Frame::Binary(vec![0xff]));
        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));

        eventually("valid delivery", || hits.load(AtomicOrdering::SeqCst) == 1).await;
        let stats = hub.stats(DEVICE_STATS_CHANNEL).unwrap();
        assert_eq!(stats.frames_received, 4);
        assert_eq!(stats.malformed_dropped, 3);
        assert_eq!(stats.messages_dispatched, 1);
        assert_eq!(hub.connection_state(DEVICE_STATS_CHANNEL), Some(ConnectionState::Open));
    }

    #[tokio::test]
    async fn test_connect_failure_closes_and_retry_reopens() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        transport.fail_next_connects(&ep, 1);

        let (hits, handler) = counting_handler();
        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, handler).unwrap();
        let mut status = hub.status(DEVICE_STATS_CHANNEL).unwrap();

        eventually("connect failure", || {
            matches!(
                hub.connection_state(DEVICE_STATS_CHANNEL),
                Some(ConnectionState::Closed { reason: CloseReason::ConnectFailed(_) })
            )
        })
        .await;
        assert!(status.borrow_and_update().is_closed());
        assert_eq!(hub.stats(DEVICE_STATS_CHANNEL).unwrap().connect_failures, 1);

        // never policy: nothing reconnects on its own
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(&ep), 1);

        assert!(hub.retry(DEVICE_STATS_CHANNEL).unwrap());
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;
        assert!(!hub.retry(DEVICE_STATS_CHANNEL).unwrap());
        assert_eq!(transport.connect_count(&ep), 2);

        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));
        eventually("delivery after retry", || hits.load(AtomicOrdering::SeqCst) == 1).await;
        assert!(status.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_retry_without_subscribers() {
        let (hub, _transport) = memory_hub(HubConfig::default());
        assert!(!hub.retry(DEVICE_STATS_CHANNEL).unwrap());
        assert!(matches!(hub.retry("nope"), Err(HubError::UnknownChannel { .. })));
    }

    #[tokio::test]
    async fn test_resubscribe_after_peer_close_opens_new_instance() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, OPENFLOW_CHANNEL);
        let _first = hub.subscribe(OPENFLOW_CHANNEL, |_| {}).unwrap();
        wait_open(&hub, OPENFLOW_CHANNEL).await;

        transport.disconnect(&ep);
        eventually("peer close", || {
            hub.connection_state(OPENFLOW_CHANNEL)
                == Some(ConnectionState::Closed {
                    reason: CloseReason::PeerClosed,
                })
        })
        .await;

        let (hits, handler) = counting_handler();
        let _second = hub.subscribe(OPENFLOW_CHANNEL, handler).unwrap();
        wait_open(&hub, OPENFLOW_CHANNEL).await;
        assert_eq!(transport.connect_count(&ep), 2);

        transport.send_text(&ep, ports_json(DEVICE_IP, serde_json::json!({ "1": 5 })));
        eventually("delivery on new instance", || hits.load(AtomicOrdering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_transport_error_closes_connection() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, |_| {}).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_error(&ep, "reset by peer");
        eventually("transport error", || {
            matches!(
                hub.connection_state(DEVICE_STATS_CHANNEL),
                Some(ConnectionState::Closed { reason: CloseReason::TransportError(_) })
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_backoff_reconnects_after_peer_close() {
        let mut config = HubConfig::default();
        config.reconnect = ReconnectPolicy::backoff(Duration::from_millis(10), Duration::from_millis(50), 0);
        let (hub, transport) = memory_hub(config);
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let (hits, handler) = counting_handler();
        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, handler).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.disconnect(&ep);
        eventually("reconnect", || transport.connect_count(&ep) == 2).await;
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        transport.send_text(&ep, device_json(DEVICE_IP, 1.0));
        eventually("delivery after reconnect", || hits.load(AtomicOrdering::SeqCst) == 1).await;
        assert_eq!(hub.stats(DEVICE_STATS_CHANNEL).unwrap().connections_opened, 2);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_max_attempts() {
        let mut config = HubConfig::default();
        config.reconnect = ReconnectPolicy::backoff(Duration::from_millis(5), Duration::from_millis(20), 2);
        let (hub, transport) = memory_hub(config);
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        transport.fail_next_connects(&ep, 10);

        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, |_| {}).unwrap();
        eventually("all attempts", || transport.connect_count(&ep) == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_count(&ep), 3);
        assert!(hub.connection_state(DEVICE_STATS_CHANNEL).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_refuses() {
        let (hub, transport) = memory_hub(HubConfig::default());
        let ep = endpoint(&hub, DEVICE_STATS_CHANNEL);
        let _sub = hub.subscribe(DEVICE_STATS_CHANNEL, |_| {}).unwrap();
        wait_open(&hub, DEVICE_STATS_CHANNEL).await;

        hub.shutdown();
        assert!(hub.is_shutting_down());
        assert_eq!(
            hub.connection_state(DEVICE_STATS_CHANNEL),
            Some(ConnectionState::Closed {
                reason: CloseReason::Requested
            })
        );
        assert!(matches!(hub.subscribe(DEVICE_STATS_CHANNEL, |_| {}), Err(HubError::ShuttingDown)));
        eventually("stream released", || transport.live_connections(&ep) == 0).await;
    }

    #[tokio::test]
    async fn test_independent_hubs() {
        let (hub_a, transport_a) = memory_hub(HubConfig::default());
        let (hub_b, transport_b) = memory_hub(HubConfig::default());
        let _a = hub_a.subscribe(DEVICE_STATS_CHANNEL, |_| {}).unwrap();
        let _b = hub_b.subscribe(DEVICE_STATS_CHANNEL, |_| {}).unwrap();
        wait_open(&hub_a, DEVICE_STATS_CHANNEL).await;
        wait_open(&hub_b, DEVICE_STATS_CHANNEL).await;

        let ep = endpoint(&hub_a, DEVICE_STATS_CHANNEL);
        assert_eq!(transport_a.connect_count(&ep), 1);
        assert_eq!(transport_b.connect_count(&ep), 1);
    }
}

#[cfg(test)]
mod phase3_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    // ---- sample window ----

    #[test]
    fn test_window_evicts_on_append() {
        let mut window = SampleWindow::new(Duration::from_secs(10));
        window.append(sample_at(t0(), 1.0));
        window.append(sample_at(t0().add_duration(Duration::from_secs(5)), 2.0));
        assert_eq!(window.len(), 2);

        let evicted = window.append(sample_at(t0().add_duration(Duration::from_secs(12)), 3.0));
        assert_eq!(evicted, 1);
        assert_eq!(window.values("value"), vec![2.0, 3.0]);
        assert_eq!(window.total_evicted(), 1);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let mut window = SampleWindow::new(Duration::from_secs(10));
        window.append(sample_at(t0(), 1.0));
        window.append(sample_at(t0().add_duration(Duration::from_secs(10)), 2.0));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_window_keeps_tail_when_everything_expired() {
        let mut window = SampleWindow::new(Duration::from_secs(1));
        window.append(sample_at(t0(), 1.0));
        window.append(sample_at(t0(), 2.0));

        let evicted = window.evict_expired(t0().add_duration(Duration::from_secs(60)));
        assert_eq!(evicted, 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.latest().and_then(|s| s.get("value")), Some(2.0));
    }

    #[test]
    fn test_window_clamps_out_of_order_samples() {
        let mut window = SampleWindow::new(Duration::from_secs(60));
        window.append(sample_at(t0().add_duration(Duration::from_secs(10)), 1.0));
        window.append(sample_at(t0(), 2.0));

        let snapshot = window.snapshot();
        assert_eq!(snapshot[1].ts, snapshot[0].ts);
        assert_eq!(snapshot[1].get("value"), Some(2.0));
    }

    #[test]
    fn test_window_snapshot_is_independent() {
        let mut window = SampleWindow::new(Duration::from_secs(60));
        window.append(sample_at(t0(), 1.0));
        let snapshot = window.snapshot();
        window.append(sample_at(t0(), 2.0));
        window.clear();
        assert_eq!(snapshot.len(), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_five_minutes_at_one_hertz() {
        let mut window = SampleWindow::new(Duration::from_millis(DEFAULT_WINDOW_MS));
        for second in 0..600 {
            let ts = t0().add_duration(Duration::from_secs(second));
            window.append(sample_at(ts, second as f64));
            if second >= 300 {
                // a sample exactly one window old stays; anything older is gone
                assert_eq!(window.len(), 301);
                let age = ts.duration_since(window.oldest().unwrap().ts);
                assert_eq!(age, Duration::from_millis(DEFAULT_WINDOW_MS));
            }
        }
        assert_eq!(window.len(), 301);
        assert_eq!(window.oldest().and_then(|s| s.get("value")), Some(299.0));
    }

    #[test]
    fn test_window_aggregates() {
        let mut window = SampleWindow::new(Duration::from_secs(60));
        for (i, v) in [4.0, 1.0, 7.0].into_iter().enumerate() {
            window.append(sample_at(t0().add_duration(Duration::from_secs(i as u64)), v));
        }
        let mut gap = FieldMap::new();
        gap.insert("value".into(), None);
        window.append(Sample::new(t0().add_duration(Duration::from_secs(3)), gap));

        assert_eq!(window.aggregate("value", AggregateFunction::Sum), Some(12.0));
        assert_eq!(window.aggregate("value", AggregateFunction::Avg), Some(4.0));
        assert_eq!(window.aggregate("value", AggregateFunction::Min), Some(1.0));
        assert_eq!(window.aggregate("value", AggregateFunction::Max), Some(7.0));
        assert_eq!(window.aggregate("value", AggregateFunction::Count), Some(3.0));
        assert_eq!(window.aggregate("value", AggregateFunction::First), Some(4.0));
        assert_eq!(window.aggregate("value", AggregateFunction::Last), Some(7.0));
        assert_eq!(window.aggregate("missing", AggregateFunction::Sum), None);
        assert_eq!(window.aggregate_all(AggregateFunction::Max).get("value"), Some(&7.0));
        assert_eq!(AggregateFunction::Avg.apply(&[]), 0.0);
    }

    proptest! {
        #[test]
        fn test_window_bound_holds(
            gaps in prop::collection::vec(0u64..120_000, 1..300),
            window_ms in 1_000u64..600_000,
        ) {
            let mut window = SampleWindow::new(Duration::from_millis(window_ms));
            let mut ts = t0();
            for gap in gaps {
                ts = ts.add_duration(Duration::from_millis(gap));
                window.append(sample_at(ts, 1.0));

                let snapshot = window.snapshot();
                let latest = snapshot[snapshot.len() - 1].ts;
                prop_assert_eq!(latest, ts);
                let cutoff = latest.sub_duration(window.span());
                for sample in &snapshot[..snapshot.len() - 1] {
                    prop_assert!(sample.ts >= cutoff);
                }
                prop_assert!(snapshot.windows(2).all(|w| w[0].ts <= w[1].ts));
            }
        }
    }

    // ---- key resolution ----

    #[rstest]
    #[case::same("eth1", "eth1", true)]
    #[case::case_differs("eth1", "ETH1", false)]
    #[case::prefixed("eth1", "s1-eth1", false)]
    fn test_exact_matcher(#[case] name: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(ExactNameMatcher.matches(&PortTarget::new(name, 1), key), expected);
    }

    #[rstest]
    #[case::number(Some(1), "1", true)]
    #[case::padded(Some(1), " 01", true)]
    #[case::other_number(Some(1), "2", false)]
    #[case::name_key(Some(1), "eth1", false)]
    #[case::no_number(None, "1", false)]
    fn test_port_number_matcher(#[case] number: Option<u32>, #[case] key: &str, #[case] expected: bool) {
        let target = PortTarget {
            name: "eth1".into(),
            port_number: number,
        };
        assert_eq!(PortNumberMatcher.matches(&target, key), expected);
    }

    #[rstest]
    #[case::bridge_prefix("eth1", "s1-eth1", true)]
    #[case::colon_prefix("eth1", "br0:eth1", true)]
    #[case::bare_number("eth1", "1", true)]
    #[case::uppercase("eth1", "ETH1", true)]
    #[case::longer_index("eth1", "s1-eth10", false)]
    #[case::other_port("eth2", "s1-eth1", false)]
    #[case::empty_name("eth", "s1-eth", false)]
    fn test_normalized_matcher(#[case] name: &str, #[case] key: &str, #[case] expected: bool) {
        let matcher = NormalizedNameMatcher::new(DEFAULT_STRIP_PREFIXES);
        assert_eq!(matcher.matches(&PortTarget::named(name), key), expected);
    }

    #[test]
    fn test_exact_match_takes_precedence() {
        let chain = ResolutionChain::default();
        let target = PortTarget::new("eth0", 3);
        let resolved = chain.resolve(&[&target], &["3", "eth0", "s1-eth0"], &HashSet::new());
        assert_eq!(
            resolved,
            vec![Resolution {
                target: "eth0".into(),
                key: "eth0".into(),
                tier: "exact",
            }]
        );
    }

    #[test]
    fn test_tiers_fall_through_per_target() {
        let chain = ResolutionChain::default();
        let eth1 = PortTarget::new("eth1", 1);
        let eth2 = PortTarget::new("eth2", 2);

        let resolved = chain.resolve(&[&eth1, &eth2], &["2", "eth1"], &HashSet::new());
        assert_eq!(
            resolved,
            vec![
                Resolution {
                    target: "eth1".into(),
                    key: "eth1".into(),
                    tier: "exact",
                },
                Resolution {
                    target: "eth2".into(),
                    key: "2".into(),
                    tier: "port_number",
                },
            ]
        );

        // an exact hit for a later target beats a fallback for an earlier one
        let eth3 = PortTarget::new("eth3", 1);
        let resolved = chain.resolve(&[&eth3, &eth1], &["eth1"], &HashSet::new());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].target, "eth1");
        assert_eq!(resolved[0].tier, "exact");
    }

    #[test]
    fn test_claimed_keys_are_not_reused() {
        let chain = ResolutionChain::default();
        let eth1 = PortTarget::named("eth1");
        let resolved = chain.resolve(&[&eth1], &["s1-eth1"], &HashSet::from(["s1-eth1"]));
        assert!(resolved.is_empty());

        let a = PortTarget::named("eth1");
        let b = PortTarget::named("ETH1");
        let resolved = chain.resolve(&[&a, &b], &["s1-eth1"], &HashSet::new());
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_custom_tier_order() {
        let config = ResolutionConfig {
            tiers: vec!["normalized".into(), "exact".into()],
            strip_prefixes: vec!["port".into()],
        };
        let chain = ResolutionChain::from_config(&config).unwrap();
        let target = PortTarget::named("port7");
        let resolved = chain.resolve(&[&target], &["port7", "s1-7"], &HashSet::new());
        assert_eq!(resolved[0].tier, "normalized");
        assert_eq!(resolved[0].key, "port7");
    }

    // ---- projection ----

    fn projector(spec: ProjectionSpec) -> Projector {
        Projector::new(spec, Arc::new(ResolutionChain::default()))
    }

    #[test]
    fn test_device_projection_filters_by_ip() {
        let mut projector = projector(ProjectionSpec::device_stats(DEVICE_IP));
        assert!(projector.project(&device_message(OTHER_IP, 50.0), t0()).is_none());

        let sample = projector.project(&device_message(DEVICE_IP, 50.0), t0()).unwrap();
        assert_eq!(sample.ts, t0());
        assert_eq!(sample.get("cpu"), Some(50.0));
        assert_eq!(sample.get("memory"), Some(60.0));
        assert_eq!(sample.get("disk"), Some(10.0));
        assert!(projector.project(&port_message(DEVICE_IP, &[("1", 1.0)]), t0()).is_none());
    }

    #[test]
    fn test_ip_comparison() {
        let mut v6 = projector(ProjectionSpec::device_stats("::1"));
        assert!(v6.project(&device_message("0:0:0:0:0:0:0:1", 1.0), t0()).is_some());
        let mut named = projector(ProjectionSpec::device_stats(" Switch-A "));
        assert!(named.project(&device_message("switch-a", 1.0), t0()).is_some());
    }

    #[test]
    fn test_port_projection_rekeys_numeric_fallback() {
        let mut projector = projector(ProjectionSpec::port_stats(DEVICE_IP, vec![PortTarget::new("eth1", 1)]));
        let sample = projector.project(&port_message(DEVICE_IP, &[("1", 120.5)]), t0()).unwrap();

        assert_eq!(sample.fields.len(), 1);
        assert_eq!(sample.get("eth1"), Some(120.5));
        assert!(!sample.has("1"));
        assert_eq!(projector.key_map().tier("eth1"), Some("port_number"));
    }

    #[test]
    fn test_learned_key_is_reused() {
        let mut projector = projector(ProjectionSpec::port_stats(DEVICE_IP, vec![PortTarget::named("eth1")]));

        let first = projector.project(&port_message(DEVICE_IP, &[("s1-eth1", 5.0)]), t0()).unwrap();
        assert_eq!(first.get("eth1"), Some(5.0));
        assert_eq!(projector.key_map().get("eth1"), Some("s1-eth1"));
        assert_eq!(projector.key_map().tier("eth1"), Some("normalized"));

        // an exact key showing up later does not displace the learned one
        let second = projector
            .project(&port_message(DEVICE_IP, &[("eth1", 7.0), ("s1-eth1", 6.0)]), t0())
            .unwrap();
        assert_eq!(second.get("eth1"), Some(6.0));

        // learned key absent: the target is omitted, nothing re-resolves
        assert!(projector.project(&port_message(DEVICE_IP, &[("eth1", 8.0)]), t0()).is_none());
        assert_eq!(projector.key_map().get("eth1"), Some("s1-eth1"));

        assert!(projector.set_targets(vec![PortTarget::named("eth1"), PortTarget::named("eth2")]));
        assert!(projector.key_map().is_empty());
        let third = projector
            .project(&port_message(DEVICE_IP, &[("eth1", 7.0), ("s1-eth1", 6.0)]), t0())
            .unwrap();
        assert_eq!(third.get("eth1"), Some(7.0));
        assert!(!third.has("eth2"));
    }

    #[test]
    fn test_set_targets_unchanged_keeps_map() {
        let targets = vec![PortTarget::new("eth1", 1)];
        let mut projector = projector(ProjectionSpec::port_stats(DEVICE_IP, targets.clone()));
        projector.project(&port_message(DEVICE_IP, &[("1", 1.0)]), t0());
        assert!(!projector.set_targets(targets));
        assert_eq!(projector.key_map().len(), 1);

        let mut pair = self::projector(ProjectionSpec::port_stats(
            DEVICE_IP,
            vec![PortTarget::new("eth1", 1), PortTarget::new("eth2", 2)],
        ));
        pair.project(&port_message(DEVICE_IP, &[("1", 1.0), ("2", 2.0)]), t0());
        assert!(!pair.set_targets(vec![PortTarget::new("eth2", 2), PortTarget::new("eth1", 1)]));
        assert_eq!(pair.key_map().len(), 2);
        // same name, different port number is a different set
        assert!(pair.set_targets(vec![PortTarget::new("eth2", 2), PortTarget::new("eth1", 3)]));
        assert!(pair.key_map().is_empty());

        let mut device = self::projector(ProjectionSpec::device_stats(DEVICE_IP));
        assert!(!device.set_targets(vec![PortTarget::named("eth1")]));
    }

    #[test]
    fn test_ports_resolve_from_one_message() {
        let mut projector = projector(ProjectionSpec::port_stats(
            DEVICE_IP,
            vec![PortTarget::new("eth1", 1), PortTarget::new("eth2", 2)],
        ));
        let message = port_message(DEVICE_IP, &[("2", 20.0), ("eth1", 10.0)]);

        let first = projector.project(&message, t0()).unwrap();
        assert_eq!(first.fields.len(), 2);
        assert_eq!(first.get("eth1"), Some(10.0));
        assert_eq!(first.get("eth2"), Some(20.0));
        assert_eq!(projector.key_map().tier("eth1"), Some("exact"));
        assert_eq!(projector.key_map().tier("eth2"), Some("port_number"));

        let second = projector.project(&message, t0()).unwrap();
        assert_eq!(second.get("eth1"), Some(10.0));
        assert_eq!(second.get("eth2"), Some(20.0));
    }

    #[test]
    fn test_null_port_value_is_kept_as_gap() {
        let mut projector = projector(ProjectionSpec::port_stats(DEVICE_IP, vec![PortTarget::named("eth1")]));
        let message = RawMessage::PortStats(PortStatsMessage {
            ip_address: DEVICE_IP.into(),
            ports: BTreeMap::from([(CompactString::from("eth1"), None)]),
        });
        let sample = projector.project(&message, t0()).unwrap();
        assert!(sample.has("eth1"));
        assert_eq!(sample.get("eth1"), None);
    }

    #[test]
    fn test_classification_projection() {
        let flow = RawMessage::Classification(ClassificationMessage::Flow { label: "Video".into() });
        let web = RawMessage::Classification(ClassificationMessage::Count {
            classification: "web".into(),
            count: 12.0,
        });

        let mut all = projector(ProjectionSpec::classifications(Vec::<CompactString>::new()));
        assert_eq!(all.project(&flow, t0()).unwrap().get("video"), Some(1.0));
        assert_eq!(all.project(&web, t0()).unwrap().get("web"), Some(12.0));

        let mut video_only = projector(ProjectionSpec::classifications(["video"]));
        assert_eq!(video_only.project(&flow, t0()).unwrap().get("video"), Some(1.0));
        assert!(video_only.project(&web, t0()).is_none());
    }

    #[test]
    fn test_classification_labels_share_one_series_across_case() {
        let upper = RawMessage::Classification(ClassificationMessage::Flow { label: "VIDEO".into() });
        let lower = RawMessage::Classification(ClassificationMessage::Flow { label: "video".into() });

        let mut configured = projector(ProjectionSpec::classifications(["Video"]));
        let mut window = SampleWindow::new(Duration::from_millis(DEFAULT_WINDOW_MS));
        for message in [&upper, &lower] {
            let sample = configured.project(message, t0()).unwrap();
            assert_eq!(sample.fields.keys().map(|k| k.as_str()).collect::<Vec<_>>(), vec!["Video"]);
            window.append(sample);
        }
        assert_eq!(window.aggregate("Video", AggregateFunction::Sum), Some(2.0));

        let mut all = projector(ProjectionSpec::classifications(Vec::<CompactString>::new()));
        assert_eq!(all.project(&upper, t0()).unwrap().get("video"), Some(1.0));
    }
}
