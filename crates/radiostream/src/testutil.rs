//! Test fixtures: synthetic ICY streams, an in-memory connector and a
//! capture audio output. Nothing here touches the network or a sound card.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::output::{AudioOutput, OutputFactory};
use crate::audio::pcm::PcmSource;
use crate::error::{RadioError, Result};
use crate::stream::icy::{ConnectOptions, IcyConnection, IcyHeaders, StreamConnector};

/// Samples per channel in one MPEG-1 Layer III frame
pub const SILENT_FRAME_SAMPLES: usize = 1152;

/// One silent MPEG-1 Layer III frame: 128 kbit/s, 44.1 kHz, mono, 417 bytes.
/// Zeroed side info and main data decode to digital silence.
pub fn silent_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 417];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0xC4]);
    frame
}

pub fn silent_mp3(frames: usize) -> Vec<u8> {
    silent_frame().repeat(frames)
}

/// Length byte plus null-padded `StreamTitle` text
pub fn metadata_block(title: &str) -> Vec<u8> {
    let text = format!("StreamTitle='{title}';");
    let blocks = text.len().div_ceil(16);
    let mut out = Vec::with_capacity(1 + blocks * 16);
    out.push(blocks as u8);
    out.extend_from_slice(text.as_bytes());
    out.resize(1 + blocks * 16, 0);
    out
}

/// Interleave ICY metadata into `audio`. After audio block `i` (0-based)
/// comes the title listed for `i`, or an empty frame.
pub fn icy_stream(audio: &[u8], metaint: usize, titles: &[(usize, &str)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(audio.len() + audio.len() / metaint.max(1) * 2);
    for (i, block) in audio.chunks(metaint).enumerate() {
        out.extend_from_slice(block);
        if block.len() == metaint {
            match titles.iter().find(|(b, _)| *b == i) {
                Some((_, title)) => out.extend(metadata_block(title)),
                None => out.push(0),
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

enum BodySource {
    Fixed(Arc<Vec<u8>>),
    /// Silent MP3 frames with ICY framing, endless unless limited
    Generated {
        titles: Vec<(usize, String)>,
        audio_limit: Option<usize>,
    },
}

/// Serves canned ICY streams
pub struct MemoryConnector {
    source: BodySource,
    metaint: usize,
    pace: Option<u64>,
    hold: Option<Duration>,
    fail_connect: bool,
    offline: bool,
    connects: AtomicU32,
}

impl MemoryConnector {
    /// Serve `data` verbatim, then end the stream
    pub fn new(data: Vec<u8>, metaint: usize) -> Self {
        Self {
            source: BodySource::Fixed(Arc::new(data)),
            metaint,
            pace: None,
            hold: None,
            fail_connect: false,
            offline: false,
            connects: AtomicU32::new(0),
        }
    }

    /// Endless silent MP3 stream
    pub fn endless(metaint: usize) -> Self {
        Self {
            source: BodySource::Generated {
                titles: Vec::new(),
                audio_limit: None,
            },
            ..Self::new(Vec::new(), metaint)
        }
    }

    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Self::new(Vec::new(), 0)
        }
    }

    /// Titles for generated streams, as (metadata block index, title)
    pub fn with_titles(mut self, list: &[(usize, &str)]) -> Self {
        if let BodySource::Generated { titles, .. } = &mut self.source {
            *titles = list.iter().map(|(i, t)| (*i, t.to_string())).collect();
        }
        self
    }

    /// End generated streams after this many audio bytes
    pub fn eof_after(mut self, audio_bytes: usize) -> Self {
        if let BodySource::Generated { audio_limit, .. } = &mut self.source {
            *audio_limit = Some(audio_bytes);
        }
        self
    }

    /// Limit delivery to `bytes_per_sec`
    pub fn paced(mut self, bytes_per_sec: u64) -> Self {
        self.pace = Some(bytes_per_sec);
        self
    }

    /// Instead of ending, block the read after the last byte for `stall`,
    /// then fail it the way a read timeout would
    pub fn stall_at_end(mut self, stall: Duration) -> Self {
        self.hold = Some(stall);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StreamConnector for MemoryConnector {
    fn connect(&self, _url: &str, _options: &ConnectOptions) -> Result<IcyConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(RadioError::Stream("HTTP 503 Service Unavailable".to_string()));
        }

        let body: Box<dyn Read + Send> = match &self.source {
            BodySource::Fixed(data) => Box::new(Cursor::new(data.as_ref().clone())),
            BodySource::Generated {
                titles,
                audio_limit,
            } => Box::new(GeneratedBody::new(self.metaint, titles.clone(), *audio_limit)),
        };
        let body: Box<dyn Read + Send> = match self.hold {
            Some(stall) => Box::new(Stalling { inner: body, stall }),
            None => body,
        };
        let body: Box<dyn Read + Send> = match self.pace {
            Some(bps) => Box::new(Paced::new(body, bps)),
            None => body,
        };

        Ok(IcyConnection {
            headers: IcyHeaders {
                metaint: self.metaint,
                station_name: Some("Memory FM".to_string()),
                content_type: Some("audio/mpeg".to_string()),
                bitrate: Some(128),
            },
            body,
        })
    }

    fn check_connectivity(&self, host: &str, _port: u16) -> Result<()> {
        if self.offline {
            return Err(RadioError::NoConnectivity(format!("cannot resolve {host}")));
        }
        Ok(())
    }
}

struct GeneratedBody {
    frame: Vec<u8>,
    metaint: usize,
    titles: Vec<(usize, String)>,
    audio_limit: Option<usize>,
    audio_pos: usize,
    meta: VecDeque<u8>,
}

impl GeneratedBody {
    fn new(metaint: usize, titles: Vec<(usize, String)>, audio_limit: Option<usize>) -> Self {
        Self {
            frame: silent_frame(),
            metaint,
            titles,
            audio_limit,
            audio_pos: 0,
            meta: VecDeque::new(),
        }
    }
}

impl Read for GeneratedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.meta.is_empty() {
            let n = buf.len().min(self.meta.len());
            for (dst, src) in buf.iter_mut().zip(self.meta.drain(..n)) {
                *dst = src;
            }
            return Ok(n);
        }

        let mut n = buf.len();
        if let Some(limit) = self.audio_limit {
            n = n.min(limit.saturating_sub(self.audio_pos));
        }
        if self.metaint > 0 {
            n = n.min(self.metaint - self.audio_pos % self.metaint);
        }
        if n == 0 {
            return Ok(0);
        }

        for (i, dst) in buf[..n].iter_mut().enumerate() {
            *dst = self.frame[(self.audio_pos + i) % self.frame.len()];
        }
        self.audio_pos += n;

        if self.metaint > 0 && self.audio_pos % self.metaint == 0 {
            let block = self.audio_pos / self.metaint - 1;
            match self.titles.iter().find(|(b, _)| *b == block) {
                Some((_, title)) => self.meta.extend(metadata_block(title)),
                None => self.meta.push_back(0),
            }
        }
        Ok(n)
    }
}

/// Turns end of stream into a long blocking read
struct Stalling<R> {
    inner: R,
    stall: Duration,
}

impl<R: Read> Read for Stalling<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        thread::sleep(self.stall);
        Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
    }
}

/// Rate-limited reader
struct Paced<R> {
    inner: R,
    bytes_per_sec: u64,
    started: Option<Instant>,
    sent: u64,
}

impl<R> Paced<R> {
    const BURST: u64 = 2048;

    fn new(inner: R, bytes_per_sec: u64) -> Self {
        Self {
            inner,
            bytes_per_sec,
            started: None,
            sent: 0,
        }
    }
}

impl<R: Read> Read for Paced<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let allowed = loop {
            let allowed = (started.elapsed().as_secs_f64() * self.bytes_per_sec as f64) as u64
                + Self::BURST;
            if allowed > self.sent {
                break allowed;
            }
            thread::sleep(Duration::from_millis(5));
        };
        let n = buf.len().min((allowed - self.sent) as usize);
        let got = self.inner.read(&mut buf[..n])?;
        self.sent += got as u64;
        Ok(got)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureShared {
    samples: AtomicU64,
    starts: AtomicU32,
    speed: Mutex<f32>,
    volume: Mutex<f32>,
}

/// Observes what capture outputs created by a factory did
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
}

impl CaptureHandle {
    pub fn samples(&self) -> u64 {
        self.shared.samples.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> u32 {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn speed(&self) -> f32 {
        self.shared.speed.lock().map(|s| *s).unwrap_or(0.0)
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume.lock().map(|v| *v).unwrap_or(0.0)
    }
}

/// Pulls PCM at the pace a sound card would, scaled by speed
pub struct CaptureOutput {
    shared: Arc<CaptureShared>,
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    finished: Arc<AtomicBool>,
}

/// Factory producing capture outputs plus a handle to observe them
pub fn capture_factory() -> (OutputFactory, CaptureHandle) {
    let shared = Arc::new(CaptureShared {
        speed: Mutex::new(1.0),
        volume: Mutex::new(1.0),
        ..CaptureShared::default()
    });
    let handle = CaptureHandle {
        shared: shared.clone(),
    };
    let factory: OutputFactory = Box::new(move || {
        Ok(Box::new(CaptureOutput {
            shared: shared.clone(),
            worker: None,
            finished: Arc::new(AtomicBool::new(true)),
        }) as Box<dyn AudioOutput>)
    });
    (factory, handle)
}

pub fn failing_output_factory() -> OutputFactory {
    Box::new(|| Err(RadioError::Audio("no audio device".to_string())))
}

impl AudioOutput for CaptureOutput {
    fn start(&mut self, mut source: PcmSource) -> Result<()> {
        use rodio::Source;

        self.stop();
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        self.finished = finished.clone();

        let shared = self.shared.clone();
        let stop_flag = stop.clone();
        let rate = source.sample_rate() as f64 * source.channels() as f64;
        let handle = thread::Builder::new()
            .name("capture-output".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                let mut credit = 0.0f64;
                while !stop_flag.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    let speed = shared.speed.lock().map(|s| *s).unwrap_or(1.0) as f64;
                    credit += now.duration_since(last).as_secs_f64() * rate * speed;
                    last = now;
                    while credit >= 1.0 {
                        if source.next().is_none() {
                            finished.store(true, Ordering::SeqCst);
                            return;
                        }
                        shared.samples.fetch_add(1, Ordering::Relaxed);
                        credit -= 1.0;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })?;
        self.worker = Some((stop, handle));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((stop, handle)) = self.worker.take() {
            stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn set_volume(&mut self, volume: f32) {
        if let Ok(mut v) = self.shared.volume.lock() {
            *v = volume;
        }
    }

    fn set_speed(&mut self, speed: f32) {
        if let Ok(mut s) = self.shared.speed.lock() {
            *s = speed;
        }
    }
}

impl Drop for CaptureOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
