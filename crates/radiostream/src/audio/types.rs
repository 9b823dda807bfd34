//! Shared audio types
//!
//! Pure data types used across the player: states, commands and events.

use std::fmt;
use std::time::Duration;

use crate::audio::codec::CodecKind;
use crate::error::Failure;
use crate::stream::icy::IcyHeaders;
use crate::stream::metadata::TrackInfo;
use crate::stream::station::StationDescriptor;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Buffering,
    Playing,
    Stopped,
    Error,
}

impl PlaybackState {
    /// Whether a session is alive (ingest running or audio playing)
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Buffering | PlaybackState::Playing)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "Idle"),
            PlaybackState::Buffering => write!(f, "Buffering"),
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Stopped => write!(f, "Stopped"),
            PlaybackState::Error => write!(f, "Error"),
        }
    }
}

/// Decoder output format, known once the container header is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Codec information for the current stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub codec: CodecKind,
    pub codec_name: String,
    pub channels: u16,
    pub sample_rate: u32,
    /// Nominal station bitrate (kbit/s)
    pub bitrate: Option<u32>,
}

impl fmt::Display for CodecInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel_str = match self.channels {
            1 => "Mono".to_string(),
            2 => "Stereo".to_string(),
            n => format!("{n} ch"),
        };
        write!(f, "{}", self.codec_name)?;
        if let Some(br) = self.bitrate {
            write!(f, " · {} kbps", br)?;
        }
        write!(f, " · {} Hz · {}", self.sample_rate, channel_str)
    }
}

/// Commands sent to the player thread
#[derive(Debug, Clone)]
pub enum PlayerCommand {
    /// Start a session for the station
    Play(StationDescriptor),
    /// Stop the current session
    Stop,
    /// Set volume (0.0..=2.0)
    SetVolume(f32),
    /// Set pitch / playback rate (0.25..=4.0)
    SetPitch(f32),
    /// Shut down the player thread
    Shutdown,
}

/// Events broadcast by the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    PlaybackStart { station: String },
    PlaybackEnd { station: String },
    BufferingStart,
    /// Fill level toward the start threshold, 0.0..=1.0
    BufferingProgress(f32),
    BufferingEnd,
    StreamConnected(IcyHeaders),
    AudioStart(CodecInfo),
    AudioEnd,
    /// Total play time of the session
    AudioPlayTime(Duration),
    /// The current record changed. Carries the record that just started.
    RecordChange(TrackInfo),
    /// Play time of the current record
    RecordPlayTime(Duration),
    /// A record was announced and will start after its delay
    NextRecordChange(TrackInfo),
    /// Time left until the next record starts
    NextRecordDelay(Duration),
    RetryScheduled { attempt: u32, delay: Duration },
    Error {
        station: String,
        failure: Failure,
        /// No automatic restart follows
        terminal: bool,
    },
}
