//! Station descriptor and validation
//!
//! A `StationDescriptor` is produced by whatever lists stations (playlist
//! parsers, UI, CLI flags) and handed to the player read-only.

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::audio::codec::CodecKind;
use crate::config::{network, station, PlayerConfig};
use crate::error::{RadioError, Result};

/// Container format announced for a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioFormat {
    #[default]
    Mp3,
    Ogg,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFormat::Mp3 => write!(f, "MP3"),
            AudioFormat::Ogg => write!(f, "OGG"),
        }
    }
}

impl FromStr for AudioFormat {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" | "mpeg" | "audio/mpeg" => Ok(AudioFormat::Mp3),
            "ogg" | "vorbis" | "audio/ogg" | "application/ogg" => Ok(AudioFormat::Ogg),
            other => Err(RadioError::InvalidStation(format!(
                "unknown format '{other}'"
            ))),
        }
    }
}

/// Immutable station identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationDescriptor {
    pub name: String,
    pub url: String,
    pub format: AudioFormat,
    /// Nominal bitrate in kbit/s, used for track delay estimates
    pub bitrate_kbps: u32,
    /// Ingest read size in KB
    pub chunk_kb: u32,
    /// Pre-buffer size in KB
    pub buffer_kb: u32,
    /// Codec backend this station must not be decoded with
    pub excluded_codec: Option<CodecKind>,
}

impl StationDescriptor {
    /// Station with default sizing for the given URL and format
    pub fn new(name: impl Into<String>, url: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format,
            bitrate_kbps: station::DEFAULT_BITRATE_KBPS,
            chunk_kb: station::DEFAULT_CHUNK_KB,
            buffer_kb: station::DEFAULT_BUFFER_KB,
            excluded_codec: None,
        }
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = kbps;
        self
    }

    pub fn with_chunk_kb(mut self, kb: u32) -> Self {
        self.chunk_kb = kb;
        self
    }

    pub fn with_buffer_kb(mut self, kb: u32) -> Self {
        self.buffer_kb = kb;
        self
    }

    pub fn with_excluded_codec(mut self, codec: CodecKind) -> Self {
        self.excluded_codec = Some(codec);
        self
    }

    /// Check the URL and replace out-of-range sizing with configured defaults.
    ///
    /// A bad URL is an error. Bad sizing only logs a warning.
    pub fn validated(mut self, config: &PlayerConfig) -> Result<Self> {
        check_url(&self.url)?;

        if !(station::MIN_BITRATE_KBPS..=station::MAX_BITRATE_KBPS).contains(&self.bitrate_kbps) {
            warn!(
                station = %self.name,
                bitrate = self.bitrate_kbps,
                default = config.default_bitrate_kbps,
                "Bitrate out of range, using default"
            );
            self.bitrate_kbps = config.default_bitrate_kbps;
        }
        if !(station::MIN_CHUNK_KB..=station::MAX_CHUNK_KB).contains(&self.chunk_kb) {
            warn!(
                station = %self.name,
                chunk_kb = self.chunk_kb,
                default = config.default_chunk_kb,
                "Chunk size out of range, using default"
            );
            self.chunk_kb = config.default_chunk_kb;
        }
        if !(station::MIN_BUFFER_KB..=station::MAX_BUFFER_KB).contains(&self.buffer_kb) {
            warn!(
                station = %self.name,
                buffer_kb = self.buffer_kb,
                default = config.default_buffer_kb,
                "Buffer size out of range, using default"
            );
            self.buffer_kb = config.default_buffer_kb;
        }

        Ok(self)
    }

    /// Ingest read size in bytes
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_kb as usize * 1024
    }

    /// Bytes that must be buffered before playback starts
    pub fn start_threshold(&self) -> u64 {
        (self.buffer_kb as u64 + self.chunk_kb as u64) * 1024
    }

    /// Nominal stream rate in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        self.bitrate_kbps as f64 * 125.0
    }

    /// URL to hand to the HTTP client. `icy://` is plain HTTP on the wire.
    pub fn connect_url(&self) -> String {
        let url = self.url.trim();
        match url.get(..6) {
            Some(prefix) if prefix.eq_ignore_ascii_case("icy://") => {
                format!("http://{}", &url[6..])
            }
            _ => url.to_string(),
        }
    }

    /// Host part of the URL, for the connectivity check
    pub fn host(&self) -> Option<(String, u16)> {
        let url = reqwest::Url::parse(&self.connect_url()).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some((host, port))
    }
}

fn check_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(RadioError::InvalidStation("empty URL".to_string()));
    }

    let scheme = url
        .split_once("://")
        .map(|(s, _)| s.to_ascii_lowercase())
        .ok_or_else(|| RadioError::InvalidStation(format!("missing scheme in '{url}'")))?;
    if !network::SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Err(RadioError::InvalidStation(format!(
            "unsupported scheme '{scheme}'"
        )));
    }

    let normalized = if scheme == "icy" {
        format!("http://{}", &url[6..])
    } else {
        url.to_string()
    };
    let parsed = reqwest::Url::parse(&normalized)
        .map_err(|e| RadioError::InvalidStation(format!("{url}: {e}")))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(RadioError::InvalidStation(format!("missing host in '{url}'")));
    }

    Ok(())
}
