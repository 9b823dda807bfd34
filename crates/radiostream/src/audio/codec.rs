//! Codec adapters
//!
//! A uniform decode interface over the codec libraries. Every adapter reads
//! compressed bytes from the session ring through a [`RingReader`] and
//! produces interleaved f32 PCM.
//!
//! Backends:
//! - `Mp3Symphonia`: MP3 through symphonia's MPEG audio reader
//! - `Mp3MiniMp3`: MP3 through minimp3
//! - `OggVorbis`: OGG container with Vorbis through symphonia
//!
//! Probing parses the container header, which may block on the reader, so it
//! runs on a helper thread and is abandoned after a timeout.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_MP3, CODEC_TYPE_NULL, CODEC_TYPE_VORBIS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info};

use crate::error::{RadioError, Result};
use crate::stream::ring::RingReader;
use crate::stream::station::AudioFormat;

use super::stats::DecoderStats;
use super::types::StreamSpec;

/// Consecutive unusable minimp3 results tolerated before giving up
const MAX_CONSECUTIVE_SKIPS: u32 = 32;

/// Concrete decoder backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecKind {
    #[serde(rename = "mp3-symphonia")]
    Mp3Symphonia,
    #[serde(rename = "mp3-minimp3")]
    Mp3MiniMp3,
    #[serde(rename = "ogg-vorbis")]
    OggVorbis,
}

impl CodecKind {
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Mp3Symphonia => "mp3-symphonia",
            CodecKind::Mp3MiniMp3 => "mp3-minimp3",
            CodecKind::OggVorbis => "ogg-vorbis",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecKind {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3-symphonia" => Ok(CodecKind::Mp3Symphonia),
            "mp3-minimp3" => Ok(CodecKind::Mp3MiniMp3),
            "ogg-vorbis" | "vorbis" => Ok(CodecKind::OggVorbis),
            other => Err(RadioError::UnsupportedCodec(format!(
                "unknown codec '{other}'"
            ))),
        }
    }
}

/// Preferred MP3 decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mp3Backend {
    #[default]
    Symphonia,
    MiniMp3,
}

impl Mp3Backend {
    fn kind(self) -> CodecKind {
        match self {
            Mp3Backend::Symphonia => CodecKind::Mp3Symphonia,
            Mp3Backend::MiniMp3 => CodecKind::Mp3MiniMp3,
        }
    }

    fn other(self) -> Self {
        match self {
            Mp3Backend::Symphonia => Mp3Backend::MiniMp3,
            Mp3Backend::MiniMp3 => Mp3Backend::Symphonia,
        }
    }
}

impl FromStr for Mp3Backend {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symphonia" => Ok(Mp3Backend::Symphonia),
            "minimp3" => Ok(Mp3Backend::MiniMp3),
            other => Err(RadioError::UnsupportedCodec(format!(
                "unknown MP3 backend '{other}'"
            ))),
        }
    }
}

/// Pick the decoder for a station.
///
/// An excluded MP3 backend falls back to the other MP3 backend. OGG has a
/// single backend, so excluding it leaves nothing to decode with.
pub fn select_codec(
    format: AudioFormat,
    preferred: Mp3Backend,
    excluded: Option<CodecKind>,
) -> Result<CodecKind> {
    match format {
        AudioFormat::Mp3 => {
            let backend = if excluded == Some(preferred.kind()) {
                info!(excluded = %preferred.kind(), "MP3 backend excluded, using the other one");
                preferred.other()
            } else {
                preferred
            };
            Ok(backend.kind())
        }
        AudioFormat::Ogg => {
            if excluded == Some(CodecKind::OggVorbis) {
                return Err(RadioError::ExcludedCodec(CodecKind::OggVorbis.to_string()));
            }
            Ok(CodecKind::OggVorbis)
        }
    }
}

/// Uniform decode interface
pub trait CodecAdapter: Send {
    fn kind(&self) -> CodecKind;

    /// Human-readable codec name ("MP3", "Vorbis")
    fn codec_name(&self) -> &str;

    /// Parse the container header. Blocks on the reader.
    fn probe(&mut self) -> Result<StreamSpec>;

    /// Fill `out` with interleaved samples and return how many were written.
    ///
    /// A drained ring is `Underrun`, never end of stream.
    fn decode(&mut self, out: &mut [f32]) -> Result<usize>;

    fn stats(&self) -> Arc<DecoderStats>;
}

/// Build the adapter for `kind`, not yet probed
pub fn create_codec(kind: CodecKind, reader: RingReader) -> Box<dyn CodecAdapter> {
    match kind {
        CodecKind::Mp3Symphonia | CodecKind::OggVorbis => Box::new(SymphoniaCodec::new(kind, reader)),
        CodecKind::Mp3MiniMp3 => Box::new(MiniMp3Codec::new(reader)),
    }
}

// ---------------------------------------------------------------------------
// Probe on a helper thread
// ---------------------------------------------------------------------------

/// A probed adapter, ready to decode
pub struct ProbedCodec {
    pub codec: Box<dyn CodecAdapter>,
    pub spec: StreamSpec,
}

impl fmt::Debug for ProbedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbedCodec")
            .field("codec", &self.codec.kind())
            .field("spec", &self.spec)
            .finish()
    }
}

/// A probe running on its own thread
pub struct PendingProbe {
    rx: Receiver<Result<ProbedCodec>>,
    deadline: Instant,
    timeout: Duration,
}

/// Spawn a `"codec-probe"` thread and return immediately.
pub fn start_probe(mut codec: Box<dyn CodecAdapter>, timeout: Duration) -> Result<PendingProbe> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("codec-probe".to_string())
        .spawn(move || {
            let result = codec.probe().map(|spec| ProbedCodec { codec, spec });
            let _ = tx.send(result);
        })
        .map_err(|e| RadioError::Audio(format!("Failed to spawn probe thread: {}", e)))?;

    Ok(PendingProbe {
        rx,
        deadline: Instant::now() + timeout,
        timeout,
    })
}

impl PendingProbe {
    /// `None` while the probe is still running
    pub fn poll(&self) -> Option<Result<ProbedCodec>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= self.deadline {
                    Some(Err(self.timed_out()))
                } else {
                    None
                }
            }
            Err(TryRecvError::Disconnected) => {
                Some(Err(RadioError::Decode("Probe thread panicked".to_string())))
            }
        }
    }

    /// Block until the probe finishes or times out
    pub fn wait(self) -> Result<ProbedCodec> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(self.timed_out()),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(RadioError::Decode("Probe thread panicked".to_string()))
            }
        }
    }

    fn timed_out(&self) -> RadioError {
        RadioError::Decode(format!(
            "Format probe timed out after {}s",
            self.timeout.as_secs_f32()
        ))
    }
}

// ---------------------------------------------------------------------------
// Symphonia
// ---------------------------------------------------------------------------

struct SymphoniaState {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_idx: usize,
    spec: StreamSpec,
}

/// MP3 or OGG/Vorbis decoding through symphonia
pub struct SymphoniaCodec {
    kind: CodecKind,
    reader: Option<RingReader>,
    state: Option<SymphoniaState>,
    pending_error: Option<RadioError>,
    codec_name: String,
    stats: Arc<DecoderStats>,
}

impl SymphoniaCodec {
    pub fn new(kind: CodecKind, reader: RingReader) -> Self {
        let codec_name = match kind {
            CodecKind::OggVorbis => "Vorbis",
            _ => "MP3",
        };
        Self {
            kind,
            reader: Some(reader),
            state: None,
            pending_error: None,
            codec_name: codec_name.to_string(),
            stats: Arc::new(DecoderStats::new()),
        }
    }
}

impl SymphoniaState {
    /// Decode packets until one yields samples
    fn decode_next_packet(&mut self, stats: &DecoderStats) -> Result<()> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(RadioError::Underrun("ring buffer drained".to_string()));
                }
                Err(e) => return Err(RadioError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    stats.record_frame();
                    let spec = *decoded.spec();
                    let frames = decoded.capacity();
                    let channels = spec.channels.count();

                    self.spec = StreamSpec {
                        sample_rate: spec.rate,
                        channels: channels as u16,
                    };

                    let fits = self
                        .sample_buf
                        .as_ref()
                        .is_some_and(|b| b.capacity() >= frames * channels);
                    if !fits {
                        self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
                    }
                    if let Some(buf) = self.sample_buf.as_mut() {
                        buf.copy_interleaved_ref(decoded);
                    }
                    self.sample_idx = 0;
                    return Ok(());
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    stats.record_error();
                    debug!(error = e, "Skipping corrupt packet");
                    continue;
                }
                Err(e) => return Err(RadioError::Decode(e.to_string())),
            }
        }
    }

    fn buffered(&self) -> &[f32] {
        match &self.sample_buf {
            Some(buf) => &buf.samples()[self.sample_idx..],
            None => &[],
        }
    }
}

impl CodecAdapter for SymphoniaCodec {
    fn kind(&self) -> CodecKind {
        self.kind
    }

    fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn probe(&mut self) -> Result<StreamSpec> {
        if let Some(state) = &self.state {
            return Ok(state.spec);
        }
        let reader = self
            .reader
            .take()
            .ok_or_else(|| RadioError::Decode("probe already failed".to_string()))?;

        let source = ReadOnlySource::new(reader);
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        match self.kind {
            CodecKind::OggVorbis => hint.with_extension("ogg").mime_type("audio/ogg"),
            _ => hint.with_extension("mp3").mime_type("audio/mpeg"),
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| RadioError::Decode(format!("Probe error: {}", e)))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| RadioError::Decode("No audio track found".to_string()))?;

        let expected = match self.kind {
            CodecKind::OggVorbis => CODEC_TYPE_VORBIS,
            _ => CODEC_TYPE_MP3,
        };
        if track.codec_params.codec != expected {
            return Err(RadioError::UnsupportedCodec(format!(
                "stream carries {:?}, expected {}",
                track.codec_params.codec, self.codec_name
            )));
        }

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| RadioError::UnsupportedCodec(format!("Decoder creation error: {}", e)))?;

        let mut state = SymphoniaState {
            format,
            decoder,
            track_id,
            sample_buf: None,
            sample_idx: 0,
            spec: StreamSpec {
                sample_rate: codec_params.sample_rate.unwrap_or(44100),
                channels: codec_params.channels.map(|c| c.count() as u16).unwrap_or(2),
            },
        };

        // The header can disagree with the decoded output, so trust the
        // first decoded packet.
        state.decode_next_packet(&self.stats)?;
        let spec = state.spec;
        self.state = Some(state);

        info!(codec = %self.kind, sample_rate = spec.sample_rate, channels = spec.channels, "Codec probed");
        Ok(spec)
    }

    fn decode(&mut self, out: &mut [f32]) -> Result<usize> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| RadioError::Decode("decode before probe".to_string()))?;

        let mut written = 0;
        while written < out.len() {
            let buffered = state.buffered();
            if !buffered.is_empty() {
                let n = buffered.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&buffered[..n]);
                state.sample_idx += n;
                written += n;
                continue;
            }

            if let Some(e) = self.pending_error.take() {
                if written > 0 {
                    self.pending_error = Some(e);
                    break;
                }
                return Err(e);
            }

            if let Err(e) = state.decode_next_packet(&self.stats) {
                if written > 0 {
                    self.pending_error = Some(e);
                    break;
                }
                return Err(e);
            }
        }

        Ok(written)
    }

    fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }
}

// ---------------------------------------------------------------------------
// minimp3
// ---------------------------------------------------------------------------

/// MP3 decoding through minimp3
pub struct MiniMp3Codec {
    decoder: minimp3::Decoder<RingReader>,
    frame: Vec<f32>,
    frame_idx: usize,
    spec: Option<StreamSpec>,
    pending_error: Option<RadioError>,
    stats: Arc<DecoderStats>,
}

impl MiniMp3Codec {
    pub fn new(reader: RingReader) -> Self {
        Self {
            decoder: minimp3::Decoder::new(reader),
            frame: Vec::new(),
            frame_idx: 0,
            spec: None,
            pending_error: None,
            stats: Arc::new(DecoderStats::new()),
        }
    }

    fn next_frame(&mut self) -> Result<()> {
        let mut skips = 0;
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    if frame.channels == 0 || frame.sample_rate <= 0 {
                        self.stats.record_error();
                    } else {
                        self.stats.record_frame();
                        self.spec = Some(StreamSpec {
                            sample_rate: frame.sample_rate as u32,
                            channels: frame.channels as u16,
                        });
                        self.frame.clear();
                        self.frame
                            .extend(frame.data.iter().map(|&s| s as f32 / 32768.0));
                        self.frame_idx = 0;
                        if !self.frame.is_empty() {
                            return Ok(());
                        }
                    }
                }
                Err(minimp3::Error::Eof) => {
                    return Err(RadioError::Underrun("ring buffer drained".to_string()));
                }
                Err(minimp3::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(RadioError::Underrun("ring buffer drained".to_string()));
                }
                Err(minimp3::Error::Io(e)) => {
                    return Err(RadioError::Decode(format!("read error: {e}")));
                }
                Err(minimp3::Error::InsufficientData) | Err(minimp3::Error::SkippedData) => {
                    self.stats.record_error();
                }
            }

            skips += 1;
            if skips >= MAX_CONSECUTIVE_SKIPS {
                return Err(RadioError::Decode("no decodable MP3 frames".to_string()));
            }
        }
    }
}

impl CodecAdapter for MiniMp3Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Mp3MiniMp3
    }

    fn codec_name(&self) -> &str {
        "MP3"
    }

    fn probe(&mut self) -> Result<StreamSpec> {
        if let Some(spec) = self.spec {
            return Ok(spec);
        }
        self.next_frame().map_err(|e| match e {
            RadioError::Underrun(_) => RadioError::Decode("no MP3 frame in buffered data".to_string()),
            other => other,
        })?;
        let spec = self
            .spec
            .ok_or_else(|| RadioError::Decode("no MP3 frame in buffered data".to_string()))?;
        info!(codec = %CodecKind::Mp3MiniMp3, sample_rate = spec.sample_rate, channels = spec.channels, "Codec probed");
        Ok(spec)
    }

    fn decode(&mut self, out: &mut [f32]) -> Result<usize> {
        if self.spec.is_none() {
            return Err(RadioError::Decode("decode before probe".to_string()));
        }

        let mut written = 0;
        while written < out.len() {
            let remaining = self.frame.len() - self.frame_idx;
            if remaining > 0 {
                let n = remaining.min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&self.frame[self.frame_idx..self.frame_idx + n]);
                self.frame_idx += n;
                written += n;
                continue;
            }

            if let Some(e) = self.pending_error.take() {
                if written > 0 {
                    self.pending_error = Some(e);
                    break;
                }
                return Err(e);
            }

            if let Err(e) = self.next_frame() {
                if written > 0 {
                    self.pending_error = Some(e);
                    break;
                }
                return Err(e);
            }
        }

        Ok(written)
    }

    fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }
}
