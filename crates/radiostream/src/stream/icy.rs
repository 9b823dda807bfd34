//! ICY stream ingest
//!
//! Connects to Icecast/Shoutcast streams, splits the byte stream into audio
//! payload and metadata frames, writes the payload into the session's ring
//! and reports tracks to the engine.
//!
//! Wire layout with `icy-metaint: M`:
//!
//!   [M audio bytes][N][N*16 metadata bytes][M audio bytes][N]...
//!
//! Frames may straddle socket reads at any byte. [`IcyDemuxer`] carries its
//! parse state across calls, so no minimum read size is assumed.

use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::audio::stats::PlayerTotals;
use crate::config::network::USER_AGENT;
use crate::config::PlayerConfig;
use crate::error::{Failure, RadioError, Result};
use crate::stream::metadata::TrackInfo;
use crate::stream::ring::RingCacheStream;
use crate::stream::station::StationDescriptor;

/// Headers parsed from an ICY stream response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcyHeaders {
    /// Audio bytes between metadata frames. 0 means no metadata.
    pub metaint: usize,
    pub station_name: Option<String>,
    pub content_type: Option<String>,
    pub bitrate: Option<u32>,
}

/// Extract ICY fields from response headers
pub fn parse_icy_headers(headers: &HeaderMap) -> IcyHeaders {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    IcyHeaders {
        metaint: text("icy-metaint")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0),
        station_name: text("icy-name"),
        content_type: text("content-type"),
        bitrate: text("icy-br").and_then(|v| {
            // Some servers send "128,128"
            v.split(',').next().and_then(|b| b.trim().parse::<u32>().ok())
        }),
    }
}

// ---------------------------------------------------------------------------
// Demuxer
// ---------------------------------------------------------------------------

/// One piece of demultiplexed stream, in wire order
#[derive(Debug, PartialEq)]
pub enum Demuxed<'a> {
    Audio(&'a [u8]),
    Track(TrackInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Audio { remaining: usize },
    Length,
    Meta { remaining: usize },
}

/// Incremental ICY demultiplexer
pub struct IcyDemuxer {
    metaint: usize,
    phase: Phase,
    meta_buf: Vec<u8>,
    last_info: Option<String>,
    overhead_bytes: u64,
    frames: u64,
}

impl IcyDemuxer {
    pub fn new(metaint: usize) -> Self {
        Self {
            metaint,
            phase: Phase::Audio { remaining: metaint },
            meta_buf: Vec::new(),
            last_info: None,
            overhead_bytes: 0,
            frames: 0,
        }
    }

    /// Split `input` into audio slices and parsed tracks, calling `sink` for
    /// each piece in order.
    ///
    /// Consecutive frames with the same `StreamTitle` produce one track.
    pub fn feed<F>(&mut self, mut input: &[u8], mut sink: F) -> Result<()>
    where
        F: FnMut(Demuxed<'_>) -> Result<()>,
    {
        if self.metaint == 0 {
            if !input.is_empty() {
                sink(Demuxed::Audio(input))?;
            }
            return Ok(());
        }

        while !input.is_empty() {
            match self.phase {
                Phase::Audio { remaining } => {
                    let n = remaining.min(input.len());
                    sink(Demuxed::Audio(&input[..n]))?;
                    input = &input[n..];
                    self.phase = if n == remaining {
                        Phase::Length
                    } else {
                        Phase::Audio {
                            remaining: remaining - n,
                        }
                    };
                }
                Phase::Length => {
                    let len = input[0] as usize * 16;
                    input = &input[1..];
                    self.overhead_bytes += 1;
                    self.phase = if len == 0 {
                        Phase::Audio {
                            remaining: self.metaint,
                        }
                    } else {
                        self.meta_buf.clear();
                        Phase::Meta { remaining: len }
                    };
                }
                Phase::Meta { remaining } => {
                    let n = remaining.min(input.len());
                    self.meta_buf.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    self.overhead_bytes += n as u64;
                    if n < remaining {
                        self.phase = Phase::Meta {
                            remaining: remaining - n,
                        };
                        continue;
                    }
                    self.phase = Phase::Audio {
                        remaining: self.metaint,
                    };
                    self.frames += 1;
                    if let Some(track) = self.finish_frame() {
                        sink(Demuxed::Track(track))?;
                    }
                }
            }
        }

        Ok(())
    }

    fn finish_frame(&mut self) -> Option<TrackInfo> {
        let track = TrackInfo::from_icy_block(&self.meta_buf)?;
        if track.info == self.last_info {
            debug!(title = ?track.info, "Repeated ICY title, ignoring");
            return None;
        }
        self.last_info = track.info.clone();
        Some(track)
    }

    /// Length bytes plus metadata bytes consumed so far
    pub fn overhead_bytes(&self) -> u64 {
        self.overhead_bytes
    }

    /// Non-empty metadata frames seen so far, duplicates included
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Network timeouts for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Applies to each read. Bounds how long a stopped ingest thread lingers
    /// on a stalled socket.
    pub read_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_config(config: &PlayerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        }
    }
}

/// An open stream: parsed headers plus the raw body
pub struct IcyConnection {
    pub headers: IcyHeaders,
    pub body: Box<dyn Read + Send>,
}

/// Opens ICY connections. Swappable so tests run without a network.
pub trait StreamConnector: Send + Sync {
    fn connect(&self, url: &str, options: &ConnectOptions) -> Result<IcyConnection>;

    /// Resolve the host before connecting, so an offline machine reports
    /// `NoConnectivity` instead of a retryable ingest failure.
    fn check_connectivity(&self, host: &str, port: u16) -> Result<()> {
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| RadioError::NoConnectivity(format!("cannot resolve {host}: {e}")))?;
        if addrs.next().is_none() {
            return Err(RadioError::NoConnectivity(format!(
                "{host} resolved to no addresses"
            )));
        }
        Ok(())
    }
}

/// Blocking HTTP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl StreamConnector for HttpConnector {
    fn connect(&self, url: &str, options: &ConnectOptions) -> Result<IcyConnection> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .build()?;

        let response = client.get(url).header("Icy-MetaData", "1").send()?;

        if !response.status().is_success() {
            return Err(RadioError::Stream(format!("HTTP {}", response.status())));
        }

        let headers = parse_icy_headers(response.headers());
        Ok(IcyConnection {
            headers,
            body: Box::new(response),
        })
    }
}

// ---------------------------------------------------------------------------
// Ingest thread
// ---------------------------------------------------------------------------

/// Messages from the ingest thread to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// Response headers received, audio is about to flow
    Connected(IcyHeaders),
    /// A new record, with its presentation delay filled in
    Track(TrackInfo),
    /// The session's ingest died. Always the last message.
    Failed(Failure),
}

/// Owns the ingest thread of one session
pub struct IngestHandle {
    stop_flag: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    events: Receiver<IngestEvent>,
    bytes_received: Arc<AtomicU64>,
}

struct IngestContext {
    station: StationDescriptor,
    ring: Arc<RingCacheStream>,
    connector: Arc<dyn StreamConnector>,
    options: ConnectOptions,
    stop_flag: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    events: Sender<IngestEvent>,
    bytes_received: Arc<AtomicU64>,
    totals: Arc<PlayerTotals>,
}

impl IngestHandle {
    /// Start ingesting `station` into `ring` on a new thread
    pub fn spawn(
        station: StationDescriptor,
        ring: Arc<RingCacheStream>,
        connector: Arc<dyn StreamConnector>,
        options: ConnectOptions,
        totals: Arc<PlayerTotals>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let ctx = IngestContext {
            station,
            ring,
            connector,
            options,
            stop_flag: stop_flag.clone(),
            exited: exited.clone(),
            events: tx,
            bytes_received: bytes_received.clone(),
            totals,
        };

        let handle = thread::Builder::new()
            .name("icy-ingest".to_string())
            .spawn(move || run_ingest(ctx))?;

        Ok(Self {
            stop_flag,
            exited,
            handle: Some(handle),
            events: rx,
            bytes_received,
        })
    }

    pub fn events(&self) -> &Receiver<IngestEvent> {
        &self.events
    }

    /// Bytes read from the network in this session, metadata included
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Whether the ingest thread has exited, including after a stop
    pub fn is_finished(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Signal the thread to exit without waiting for it.
    ///
    /// A thread blocked in a socket read only notices the flag once the read
    /// returns or times out, so the join moves to an `"icy-reaper"` thread.
    /// The ring is shared with the ingest thread and stays alive until it
    /// exits.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.is_finished() {
            reap(handle);
            return;
        }
        let spawned = thread::Builder::new()
            .name("icy-reaper".to_string())
            .spawn(move || reap(handle));
        if let Err(e) = spawned {
            warn!(error = %e, "Cannot spawn reaper, detaching ingest thread");
        }
    }
}

fn reap(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("Ingest thread panicked");
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ingest(ctx: IngestContext) {
    let _exit = ExitGuard(ctx.exited.clone());
    match ingest(&ctx) {
        Ok(()) => debug!(station = %ctx.station.name, "Ingest stopped"),
        Err(e) => {
            if ctx.stop_flag.load(Ordering::SeqCst) {
                debug!(station = %ctx.station.name, error = %e, "Ingest ended during stop");
                return;
            }
            warn!(station = %ctx.station.name, error = %e, "Ingest failed");
            let _ = ctx.events.send(IngestEvent::Failed(Failure::from(e)));
        }
    }
}

/// Marks the ingest thread as exited, also when it unwinds
struct ExitGuard(Arc<AtomicBool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn ingest(ctx: &IngestContext) -> Result<()> {
    let station = &ctx.station;

    if let Some((host, port)) = station.host() {
        ctx.connector.check_connectivity(&host, port)?;
    }
    if ctx.stop_flag.load(Ordering::SeqCst) {
        return Ok(());
    }

    let url = station.connect_url();
    ctx.totals.add_request();
    let IcyConnection { headers, mut body } = ctx.connector.connect(&url, &ctx.options)?;

    info!(
        station = %station.name,
        metaint = headers.metaint,
        name = ?headers.station_name,
        content_type = ?headers.content_type,
        icy_br = ?headers.bitrate,
        "Connected"
    );
    if let Some(br) = headers.bitrate {
        if br != station.bitrate_kbps {
            debug!(icy_br = br, station_br = station.bitrate_kbps, "Server bitrate differs from station bitrate");
        }
    }
    let _ = ctx.events.send(IngestEvent::Connected(headers.clone()));

    let mut demuxer = IcyDemuxer::new(headers.metaint);
    let mut chunk = vec![0u8; station.chunk_bytes()];
    let bytes_per_second = station.bytes_per_second();
    let mut seeded = false;

    loop {
        if ctx.stop_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        let n = match body.read(&mut chunk) {
            Ok(0) => return Err(RadioError::Stream("server closed the stream".to_string())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        // Data that arrives after a stop belongs to no session
        if ctx.stop_flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        ctx.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        ctx.totals.add_bytes(n as u64);

        demuxer.feed(&chunk[..n], |piece| match piece {
            Demuxed::Audio(bytes) => Ok(ctx.ring.write(bytes)?),
            Demuxed::Track(mut track) => {
                track.delay = if seeded {
                    let unread = ctx.ring.available_bytes() as f64;
                    Duration::from_secs_f64(unread / bytes_per_second)
                } else {
                    Duration::ZERO
                };
                seeded = true;
                debug!(title = ?track.info, delay = ?track.delay, "ICY track");
                let _ = ctx.events.send(IngestEvent::Track(track));
                Ok(())
            }
        })?;
    }
}
