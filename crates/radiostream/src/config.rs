//! Configuration for the radiostream engine
//!
//! Constant modules hold defaults and bounds. [`PlayerConfig`] is the
//! runtime-tunable layer, loadable from a JSON settings file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::codec::Mp3Backend;
use crate::error::Result;

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("radiostream/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Per-read timeout in seconds. Also bounds how long `stop()` waits
    /// for an ingest thread blocked in a socket read.
    pub const READ_TIMEOUT_SECS: u64 = 10;

    /// URL schemes accepted for a station
    pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "icy"];
}

/// Station sanity bounds and defaults used for auto-correction
pub mod station {
    /// Default nominal bitrate (kbit/s)
    pub const DEFAULT_BITRATE_KBPS: u32 = 128;
    /// Lowest accepted bitrate (kbit/s)
    pub const MIN_BITRATE_KBPS: u32 = 8;
    /// Highest accepted bitrate (kbit/s)
    pub const MAX_BITRATE_KBPS: u32 = 1024;

    /// Default ingest chunk size (KB)
    pub const DEFAULT_CHUNK_KB: u32 = 32;
    /// Chunk size bounds (KB)
    pub const MIN_CHUNK_KB: u32 = 1;
    pub const MAX_CHUNK_KB: u32 = 512;

    /// Default pre-buffer size (KB)
    pub const DEFAULT_BUFFER_KB: u32 = 64;
    /// Buffer size bounds (KB)
    pub const MIN_BUFFER_KB: u32 = 1;
    pub const MAX_BUFFER_KB: u32 = 2048;
}

/// Timeout configuration for resilience
pub mod timeouts {
    /// Maximum time to wait for the codec header probe in seconds
    pub const PROBE_TIMEOUT_SECS: u64 = 10;

    /// Pause between tearing down a session and starting its replacement
    pub const RESTART_SETTLE_MS: u64 = 250;
}

/// Ring cache configuration
pub mod buffer {
    /// Ring capacity as a multiple of (buffer + chunk). Must stay above 1 so
    /// the pre-buffer threshold is reachable without lapping unread data.
    pub const DEFAULT_CAPACITY_FACTOR: usize = 4;

    /// Size of the PCM block pulled from the codec per refill (samples)
    pub const PCM_BLOCK_SAMPLES: usize = 4096;
}

/// Retry configuration
pub mod retry {
    /// Maximum consecutive failed sessions before giving up
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Base delay between retries in seconds (grows linearly with attempt)
    pub const DEFAULT_BASE_DELAY_SECS: u64 = 2;

    /// Uninterrupted playback after which the attempt counter resets
    pub const DEFAULT_RESET_AFTER_SECS: u64 = 30;
}

/// Engine scheduling configuration
pub mod engine {
    /// Scheduler tick interval in milliseconds
    pub const DEFAULT_TICK_MS: u64 = 100;

    /// Margin subtracted from the sample-index ceiling (seconds)
    pub const PLAY_TIME_SAFETY_MARGIN_SECS: f64 = 60.0;

    /// Volume bounds
    pub const MIN_VOLUME: f32 = 0.0;
    pub const MAX_VOLUME: f32 = 2.0;

    /// Pitch (playback rate) bounds
    pub const MIN_PITCH: f32 = 0.25;
    pub const MAX_PITCH: f32 = 4.0;
}

/// Runtime player configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Bitrate substituted for out-of-range station bitrates (kbit/s)
    #[serde(default = "default_bitrate")]
    pub default_bitrate_kbps: u32,

    /// Chunk size substituted for out-of-range station chunk sizes (KB)
    #[serde(default = "default_chunk")]
    pub default_chunk_kb: u32,

    /// Buffer size substituted for out-of-range station buffer sizes (KB)
    #[serde(default = "default_buffer")]
    pub default_buffer_kb: u32,

    /// Preferred MP3 backend when the station does not exclude it
    #[serde(default)]
    pub mp3_backend: Mp3Backend,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_reset")]
    pub retry_reset_after_secs: u64,

    /// Ring capacity as a multiple of the pre-buffer threshold
    #[serde(default = "default_capacity_factor")]
    pub ring_capacity_factor: usize,

    #[serde(default = "default_tick")]
    pub tick_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_volume")]
    pub volume: f32,

    #[serde(default = "default_pitch")]
    pub pitch: f32,
}

fn default_bitrate() -> u32 {
    station::DEFAULT_BITRATE_KBPS
}

fn default_chunk() -> u32 {
    station::DEFAULT_CHUNK_KB
}

fn default_buffer() -> u32 {
    station::DEFAULT_BUFFER_KB
}

fn default_max_retries() -> u32 {
    retry::DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay() -> u64 {
    retry::DEFAULT_BASE_DELAY_SECS
}

fn default_retry_reset() -> u64 {
    retry::DEFAULT_RESET_AFTER_SECS
}

fn default_capacity_factor() -> usize {
    buffer::DEFAULT_CAPACITY_FACTOR
}

fn default_tick() -> u64 {
    engine::DEFAULT_TICK_MS
}

fn default_connect_timeout() -> u64 {
    network::CONNECT_TIMEOUT_SECS
}

fn default_read_timeout() -> u64 {
    network::READ_TIMEOUT_SECS
}

fn default_volume() -> f32 {
    1.0
}

fn default_pitch() -> f32 {
    1.0
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_bitrate_kbps: default_bitrate(),
            default_chunk_kb: default_chunk(),
            default_buffer_kb: default_buffer(),
            mp3_backend: Mp3Backend::default(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            retry_reset_after_secs: default_retry_reset(),
            ring_capacity_factor: default_capacity_factor(),
            tick_ms: default_tick(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            volume: default_volume(),
            pitch: default_pitch(),
        }
    }
}

impl PlayerConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Load a config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Clamp every field into its valid range.
    ///
    /// The station defaults themselves must be valid, since they are what
    /// out-of-range station values get replaced with.
    pub fn sanitized(mut self) -> Self {
        self.default_bitrate_kbps = self
            .default_bitrate_kbps
            .clamp(station::MIN_BITRATE_KBPS, station::MAX_BITRATE_KBPS);
        self.default_chunk_kb = self
            .default_chunk_kb
            .clamp(station::MIN_CHUNK_KB, station::MAX_CHUNK_KB);
        self.default_buffer_kb = self
            .default_buffer_kb
            .clamp(station::MIN_BUFFER_KB, station::MAX_BUFFER_KB);
        self.ring_capacity_factor = self.ring_capacity_factor.max(2);
        self.tick_ms = self.tick_ms.clamp(5, 1000);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.volume = if self.volume.is_finite() {
            self.volume.clamp(engine::MIN_VOLUME, engine::MAX_VOLUME)
        } else {
            default_volume()
        };
        self.pitch = if self.pitch.is_finite() {
            self.pitch.clamp(engine::MIN_PITCH, engine::MAX_PITCH)
        } else {
            default_pitch()
        };
        self
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn retry_reset_after(&self) -> Duration {
        Duration::from_secs(self.retry_reset_after_secs)
    }
}
