//! Playback engine
//!
//! [`RadioPlayer`] owns a dedicated `"radio-engine"` thread. Commands arrive
//! over a crossbeam channel; between commands the thread ticks and drives the
//! session state machine:
//!
//! ```text
//! Idle -> Buffering -> Playing -> Stopped | Error
//! ```
//!
//! A session is one ingest thread filling one ring, one codec probe and one
//! PCM source feeding the output. Sessions are never reused. A restart tears
//! the old session down completely, waits a short settle delay and opens a
//! new one.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::engine::{
    MAX_PITCH, MAX_VOLUME, MIN_PITCH, MIN_VOLUME, PLAY_TIME_SAFETY_MARGIN_SECS,
};
use crate::config::timeouts::{PROBE_TIMEOUT_SECS, RESTART_SETTLE_MS};
use crate::config::PlayerConfig;
use crate::error::{ErrorKind, Failure, RadioError, Result};
use crate::stream::icy::{ConnectOptions, HttpConnector, IngestEvent, IngestHandle, StreamConnector};
use crate::stream::metadata::TrackInfo;
use crate::stream::ring::{RingCacheStream, RingReader};
use crate::stream::station::StationDescriptor;

use super::codec::{create_codec, select_codec, start_probe, CodecKind, PendingProbe, ProbedCodec};
use super::output::{default_output_factory, AudioOutput, OutputFactory};
use super::pcm::{FailureSlot, PcmSource};
use super::retry::{RetryDecision, RetryPolicy};
use super::stats::{
    new_shared_stats, DecoderStats, EventBus, PlayerStats, PlayerTotals, SharedStats,
    TotalsSnapshot,
};
use super::tracks::{RecordChanged, TrackScheduler};
use super::types::{CodecInfo, PlaybackState, PlayerCommand, PlayerEvent};

/// Longest play time a session may accumulate at `sample_rate` before it is
/// restarted. Sample positions downstream are 32-bit.
pub fn play_time_ceiling(sample_rate: u32) -> Duration {
    let secs = i32::MAX as f64 / sample_rate.max(1) as f64 - PLAY_TIME_SAFETY_MARGIN_SECS;
    Duration::from_secs_f64(secs.max(0.0))
}

/// Internet radio player running on its own thread
pub struct RadioPlayer {
    cmd_tx: Sender<PlayerCommand>,
    thread: Option<JoinHandle<()>>,
    shared_stats: SharedStats,
    event_bus: Arc<EventBus>,
    totals: Arc<PlayerTotals>,
}

impl RadioPlayer {
    /// Player fetching over HTTP and playing on the default sound device.
    /// The device is opened on first playback.
    pub fn new(config: PlayerConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(HttpConnector), default_output_factory())
    }

    /// Player with a custom transport and audio output
    pub fn with_parts(
        config: PlayerConfig,
        connector: Arc<dyn StreamConnector>,
        output_factory: OutputFactory,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<PlayerCommand>(32);
        let shared_stats = new_shared_stats();
        let event_bus = Arc::new(EventBus::new());
        let totals = Arc::new(PlayerTotals::default());

        let event_bus_thread = event_bus.clone();
        let shared_stats_thread = shared_stats.clone();
        let totals_thread = totals.clone();

        // The engine holds the output, which may be !Send, so it is built on
        // its own thread
        let thread = thread::Builder::new()
            .name("radio-engine".to_string())
            .spawn(move || {
                Engine::new(
                    config,
                    connector,
                    output_factory,
                    event_bus_thread,
                    shared_stats_thread,
                    totals_thread,
                )
                .run(cmd_rx)
            })
            .map_err(|e| RadioError::Audio(format!("Failed to spawn engine thread: {}", e)))?;

        Ok(Self {
            cmd_tx,
            thread: Some(thread),
            shared_stats,
            event_bus,
            totals,
        })
    }

    /// Send a command to the engine
    pub fn send(&self, cmd: PlayerCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Start a session. Ignored while another session is buffering or playing.
    pub fn play(&self, station: StationDescriptor) {
        self.send(PlayerCommand::Play(station));
    }

    pub fn stop(&self) {
        self.send(PlayerCommand::Stop);
    }

    /// Set volume (clamped to 0.0..=2.0)
    pub fn set_volume(&self, volume: f32) {
        self.send(PlayerCommand::SetVolume(volume));
    }

    /// Set playback rate (clamped to 0.25..=4.0). Play time is counted at
    /// this rate.
    pub fn set_pitch(&self, pitch: f32) {
        self.send(PlayerCommand::SetPitch(pitch));
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn shared_stats(&self) -> SharedStats {
        self.shared_stats.clone()
    }

    /// Copy of the current session snapshot
    pub fn stats(&self) -> PlayerStats {
        self.shared_stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Counters accumulated over the player's lifetime
    pub fn totals(&self) -> TotalsSnapshot {
        self.totals.snapshot()
    }

    /// Graceful shutdown (consumes self)
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.cmd_tx.send(PlayerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Engine thread panicked");
            }
        }
    }
}

impl Drop for RadioPlayer {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

// ---------------------------------------------------------------------------
// Engine thread
// ---------------------------------------------------------------------------

struct AudioSession {
    info: CodecInfo,
    failure: FailureSlot,
    decoder_stats: Arc<DecoderStats>,
    ceiling: Duration,
}

struct Session {
    station: StationDescriptor,
    ring: Arc<RingCacheStream>,
    ingest: IngestHandle,
    codec: CodecKind,
    threshold: u64,
    connected: bool,
    /// Last buffering percentage emitted
    reported_pct: Option<u32>,
    probe: Option<PendingProbe>,
    audio: Option<AudioSession>,
    play_time: Duration,
    tracks: TrackScheduler,
}

impl Session {
    fn buffer_progress(&self) -> f32 {
        if self.audio.is_some() || self.probe.is_some() {
            return 1.0;
        }
        (self.ring.available_bytes() as f32 / self.threshold.max(1) as f32).min(1.0)
    }
}

struct PendingRestart {
    station: StationDescriptor,
    at: Instant,
}

struct Engine {
    config: PlayerConfig,
    connector: Arc<dyn StreamConnector>,
    output_factory: OutputFactory,
    output: Option<Box<dyn AudioOutput>>,
    events: Arc<EventBus>,
    stats: SharedStats,
    totals: Arc<PlayerTotals>,
    retry: RetryPolicy,
    state: PlaybackState,
    session: Option<Session>,
    restart: Option<PendingRestart>,
    /// Some session since the last manual play reached audio
    chain_started_audio: bool,
    volume: f32,
    pitch: f32,
    last_tick: Instant,
}

impl Engine {
    fn new(
        config: PlayerConfig,
        connector: Arc<dyn StreamConnector>,
        output_factory: OutputFactory,
        events: Arc<EventBus>,
        stats: SharedStats,
        totals: Arc<PlayerTotals>,
    ) -> Self {
        let config = config.sanitized();
        Self {
            retry: RetryPolicy::from_config(&config),
            volume: config.volume,
            pitch: config.pitch,
            config,
            connector,
            output_factory,
            output: None,
            events,
            stats,
            totals,
            state: PlaybackState::Idle,
            session: None,
            restart: None,
            chain_started_audio: false,
            last_tick: Instant::now(),
        }
    }

    /// The engine's main loop, running on the dedicated thread
    fn run(mut self, cmd_rx: Receiver<PlayerCommand>) {
        debug!("Engine thread started");
        let tick = self.config.tick();
        loop {
            match cmd_rx.recv_timeout(tick) {
                Ok(PlayerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.tick();
        }
        self.stop();
        debug!("Engine thread exiting");
    }

    fn handle(&mut self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::Play(station) => self.play(station, true),
            PlayerCommand::Stop | PlayerCommand::Shutdown => self.stop(),
            PlayerCommand::SetVolume(volume) => {
                if !volume.is_finite() {
                    warn!(volume, "Ignoring invalid volume");
                    return;
                }
                self.volume = volume.clamp(MIN_VOLUME, MAX_VOLUME);
                if let Some(output) = self.output.as_mut() {
                    output.set_volume(self.volume);
                }
            }
            PlayerCommand::SetPitch(pitch) => {
                if !pitch.is_finite() {
                    warn!(pitch, "Ignoring invalid pitch");
                    return;
                }
                self.pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
                if let Some(output) = self.output.as_mut() {
                    output.set_speed(self.pitch);
                }
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let dt = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        if self.session.is_none() {
            if self.restart.as_ref().is_some_and(|r| now >= r.at) {
                if let Some(restart) = self.restart.take() {
                    info!(station = %restart.station.name, "Restarting session");
                    self.play(restart.station, false);
                }
            }
            return;
        }

        if let Some(failure) = self.drain_ingest() {
            self.fail_session(failure);
        } else {
            match self.state {
                PlaybackState::Buffering => self.tick_buffering(),
                PlaybackState::Playing => self.tick_playing(dt),
                _ => {}
            }
        }
        self.publish_stats();
    }

    // --- session lifecycle ---

    fn play(&mut self, station: StationDescriptor, manual: bool) {
        if self.session.is_some() {
            warn!(station = %station.name, "Session already active, ignoring play");
            return;
        }
        if manual {
            self.restart = None;
            self.retry.reset();
            self.chain_started_audio = false;
        }

        match self.open_session(station.clone()) {
            Ok(session) => {
                info!(
                    station = %session.station.name,
                    url = %session.station.url,
                    format = %session.station.format,
                    codec = %session.codec,
                    threshold = session.threshold,
                    "Starting session"
                );
                let name = session.station.name.clone();
                self.totals.add_session();
                self.session = Some(session);
                self.state = PlaybackState::Buffering;
                self.events.emit(PlayerEvent::PlaybackStart { station: name });
                self.events.emit(PlayerEvent::BufferingStart);
            }
            Err(e) => self.handle_failure(station, Failure::from(e), false),
        }
        self.publish_stats();
    }

    fn open_session(&self, station: StationDescriptor) -> Result<Session> {
        let station = station.validated(&self.config)?;
        let codec = select_codec(
            station.format,
            self.config.mp3_backend,
            station.excluded_codec,
        )?;

        let threshold = station.start_threshold();
        let capacity = threshold as usize * self.config.ring_capacity_factor;
        let ring = Arc::new(RingCacheStream::new(capacity));
        let ingest = IngestHandle::spawn(
            station.clone(),
            ring.clone(),
            self.connector.clone(),
            ConnectOptions::from_config(&self.config),
            self.totals.clone(),
        )?;

        Ok(Session {
            station,
            ring,
            ingest,
            codec,
            threshold,
            connected: false,
            reported_pct: None,
            probe: None,
            audio: None,
            play_time: Duration::ZERO,
            tracks: TrackScheduler::new(),
        })
    }

    /// Stop ingest and output and drop the session. Returns whether a session
    /// existed. Never waits on the network: the ingest thread is reaped in the
    /// background and keeps its own reference to the ring until it exits.
    fn end_session(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.probe = None;
        session.ingest.stop();
        if let Some(output) = self.output.as_mut() {
            output.stop();
        }
        if session.audio.is_some() {
            self.events.emit(PlayerEvent::AudioEnd);
        }
        debug!(station = %session.station.name, "Session torn down");
        true
    }

    fn stop(&mut self) {
        self.restart = None;
        let station = self.session.as_ref().map(|s| s.station.name.clone());
        self.end_session();
        if let Some(station) = station {
            info!(station = %station, "Playback stopped");
            self.events.emit(PlayerEvent::PlaybackEnd { station });
        }
        self.retry.reset();
        self.chain_started_audio = false;
        if self.state != PlaybackState::Idle {
            self.state = PlaybackState::Stopped;
        }
        self.publish_stats();
    }

    fn fail_session(&mut self, failure: Failure) {
        let Some(station) = self.session.as_ref().map(|s| s.station.clone()) else {
            return;
        };
        self.end_session();
        self.handle_failure(station, failure, true);
    }

    fn handle_failure(&mut self, station: StationDescriptor, failure: Failure, had_session: bool) {
        let decision = self.retry.on_failure(failure.kind, self.chain_started_audio);
        let terminal = decision == RetryDecision::GiveUp;
        if terminal {
            error!(station = %station.name, %failure, "Playback failed");
        } else {
            warn!(station = %station.name, %failure, "Playback interrupted");
        }

        self.state = PlaybackState::Error;
        self.events.emit(PlayerEvent::Error {
            station: station.name.clone(),
            failure,
            terminal,
        });
        if had_session {
            self.events.emit(PlayerEvent::PlaybackEnd {
                station: station.name.clone(),
            });
        }

        if let RetryDecision::RetryAfter { attempt, delay } = decision {
            let delay = delay.max(Duration::from_millis(RESTART_SETTLE_MS));
            info!(attempt, delay = ?delay, "Scheduling restart");
            self.events.emit(PlayerEvent::RetryScheduled { attempt, delay });
            self.restart = Some(PendingRestart {
                station,
                at: Instant::now() + delay,
            });
        }
    }

    /// Restart a healthy session whose play time hit the ceiling
    fn roll_over(&mut self) {
        let Some(station) = self.session.as_ref().map(|s| s.station.clone()) else {
            return;
        };
        info!(station = %station.name, "Play time limit reached, restarting session");
        self.end_session();
        self.events.emit(PlayerEvent::PlaybackEnd {
            station: station.name.clone(),
        });
        self.state = PlaybackState::Idle;
        self.restart = Some(PendingRestart {
            station,
            at: Instant::now() + Duration::from_millis(RESTART_SETTLE_MS),
        });
    }

    // --- per-tick work ---

    fn drain_ingest(&mut self) -> Option<Failure> {
        let events: Vec<IngestEvent> = self.session.as_ref()?.ingest.events().try_iter().collect();
        for event in events {
            match event {
                IngestEvent::Connected(headers) => {
                    if let Some(session) = self.session.as_mut() {
                        session.connected = true;
                    }
                    self.events.emit(PlayerEvent::StreamConnected(headers));
                }
                IngestEvent::Track(track) => self.on_track(track),
                IngestEvent::Failed(failure) => return Some(failure),
            }
        }
        None
    }

    fn on_track(&mut self, track: TrackInfo) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.tracks.announce(track.clone()) {
            Some(change) => emit_record_change(&self.events, change),
            None => {
                debug!(record = %track, delay = ?track.delay, "Next record announced");
                self.events.emit(PlayerEvent::NextRecordChange(track));
                if session.tracks.pending_len() == 1 {
                    if let Some(delay) = session.tracks.next_delay() {
                        self.events.emit(PlayerEvent::NextRecordDelay(delay));
                    }
                }
            }
        }
    }

    fn tick_buffering(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.probe.is_some() {
            let Some(result) = session.probe.as_ref().and_then(|p| p.poll()) else {
                return;
            };
            session.probe = None;
            match result {
                Ok(probed) => self.start_audio(probed),
                Err(e) => self.fail_session(Failure::from(e)),
            }
            return;
        }

        let available = session.ring.available_bytes();
        let progress = (available as f32 / session.threshold.max(1) as f32).min(1.0);
        let pct = (progress * 100.0) as u32;
        if session.reported_pct != Some(pct) {
            session.reported_pct = Some(pct);
            self.events.emit(PlayerEvent::BufferingProgress(progress));
        }
        if !session.connected || available < session.threshold {
            return;
        }

        self.events.emit(PlayerEvent::BufferingEnd);
        debug!(available, threshold = session.threshold, "Start threshold reached, probing");
        let codec = create_codec(session.codec, RingReader::new(session.ring.clone()));
        match start_probe(codec, Duration::from_secs(PROBE_TIMEOUT_SECS)) {
            Ok(probe) => session.probe = Some(probe),
            Err(e) => self.fail_session(Failure::from(e)),
        }
    }

    fn start_audio(&mut self, probed: ProbedCodec) {
        if self.output.is_none() {
            match (self.output_factory)() {
                Ok(output) => self.output = Some(output),
                Err(e) => {
                    self.fail_session(Failure::from(e));
                    return;
                }
            }
        }
        let (Some(session), Some(output)) = (self.session.as_mut(), self.output.as_mut()) else {
            return;
        };

        let spec = probed.spec;
        let info = CodecInfo {
            codec: probed.codec.kind(),
            codec_name: probed.codec.codec_name().to_string(),
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bitrate: Some(session.station.bitrate_kbps),
        };
        let source = PcmSource::new(probed.codec, spec);
        let audio = AudioSession {
            info: info.clone(),
            failure: source.failure_slot(),
            decoder_stats: source.decoder_stats(),
            ceiling: play_time_ceiling(spec.sample_rate),
        };

        output.set_volume(self.volume);
        output.set_speed(self.pitch);
        if let Err(e) = output.start(source) {
            self.fail_session(Failure::from(e));
            return;
        }

        session.audio = Some(audio);
        self.state = PlaybackState::Playing;
        self.chain_started_audio = true;
        info!(station = %session.station.name, codec = %info, "Audio started");
        self.events.emit(PlayerEvent::AudioStart(info));
    }

    fn tick_playing(&mut self, dt: Duration) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(audio) = session.audio.as_ref() else {
            return;
        };

        let failure = audio.failure.lock().ok().and_then(|slot| slot.clone());
        if let Some(failure) = failure {
            self.fail_session(failure);
            return;
        }
        if self.output.as_ref().map_or(true, |o| o.is_finished()) {
            self.fail_session(Failure::new(ErrorKind::BufferUnderrun, "audio output ran dry"));
            return;
        }
        let ceiling = audio.ceiling;

        let play_dt = dt.mul_f32(self.pitch);
        session.play_time += play_dt;
        self.totals.add_play_time(play_dt);
        if self.retry.on_playback_progress(play_dt) {
            debug!("Uninterrupted playback, retry attempts reset");
        }

        for change in session.tracks.advance(play_dt) {
            emit_record_change(&self.events, change);
        }
        if let Some(delay) = session.tracks.next_delay() {
            self.events.emit(PlayerEvent::NextRecordDelay(delay));
        }
        self.events.emit(PlayerEvent::AudioPlayTime(session.play_time));
        self.events
            .emit(PlayerEvent::RecordPlayTime(session.tracks.record_play_time()));

        if session.play_time >= ceiling {
            self.roll_over();
        }
    }

    fn publish_stats(&self) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let Some(session) = &self.session else {
            *stats = PlayerStats {
                state: self.state,
                retry_attempt: self.retry.attempt(),
                ..PlayerStats::default()
            };
            return;
        };

        let (frames, errors, samples) = session
            .audio
            .as_ref()
            .map_or((0, 0, 0), |a| a.decoder_stats.snapshot());

        stats.state = self.state;
        stats.station = Some(session.station.name.clone());
        stats.codec_info = session.audio.as_ref().map(|a| a.info.clone());
        stats.current_record = session.tracks.current().cloned();
        stats.next_record = session.tracks.next().cloned();
        stats.buffer_progress = session.buffer_progress();
        stats.available_bytes = session.ring.available_bytes();
        stats.ring_capacity = session.ring.capacity();
        stats.bytes_received = session.ingest.bytes_received();
        stats.play_time = session.play_time;
        stats.record_play_time = session.tracks.record_play_time();
        stats.frames_decoded = frames;
        stats.decode_errors = errors;
        stats.samples_played = samples;
        stats.retry_attempt = self.retry.attempt();
    }
}

fn emit_record_change(events: &EventBus, change: RecordChanged) {
    if let Some(previous) = &change.previous {
        debug!(record = %previous, duration = ?previous.duration, "Record ended");
    }
    info!(record = %change.current, "Now playing");
    events.emit(PlayerEvent::RecordChange(change.current));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::station::AudioFormat;
    use crate::testutil::{
        capture_factory, failing_output_factory, icy_stream, silent_mp3, CaptureHandle,
        MemoryConnector,
    };

    struct Harness {
        engine: Engine,
        events: Receiver<PlayerEvent>,
        capture: CaptureHandle,
        connector: Arc<MemoryConnector>,
    }

    impl Harness {
        fn new(connector: MemoryConnector, config: PlayerConfig) -> Self {
            let (factory, capture) = capture_factory();
            Self::with_output(connector, config, factory, capture)
        }

        fn with_output(
            connector: MemoryConnector,
            config: PlayerConfig,
            factory: OutputFactory,
            capture: CaptureHandle,
        ) -> Self {
            let connector = Arc::new(connector);
            let bus = Arc::new(EventBus::new());
            let events = bus.subscribe();
            let engine = Engine::new(
                config,
                connector.clone(),
                factory,
                bus,
                new_shared_stats(),
                Arc::new(PlayerTotals::default()),
            );
            Self {
                engine,
                events,
                capture,
                connector,
            }
        }

        /// Tick until `done` holds or the timeout passes
        fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Engine) -> bool) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                self.engine.tick();
                if done(&self.engine) {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            false
        }

        fn drain(&self) -> Vec<PlayerEvent> {
            self.events.try_iter().collect()
        }

        fn stats(&self) -> PlayerStats {
            self.engine.stats.lock().unwrap().clone()
        }
    }

    fn test_config() -> PlayerConfig {
        PlayerConfig {
            tick_ms: 20,
            retry_base_delay_secs: 0,
            ring_capacity_factor: 64,
            ..PlayerConfig::default()
        }
    }

    fn station() -> StationDescriptor {
        StationDescriptor::new("Memory FM", "http://radio.test/stream", AudioFormat::Mp3)
            .with_buffer_kb(8)
            .with_chunk_kb(1)
    }

    fn endless() -> MemoryConnector {
        MemoryConnector::endless(8192).paced(64_000)
    }

    fn position(events: &[PlayerEvent], pred: fn(&PlayerEvent) -> bool) -> usize {
        events
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("event missing from {events:?}"))
    }

    fn errors(events: &[PlayerEvent]) -> Vec<(ErrorKind, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Error {
                    failure, terminal, ..
                } => Some((failure.kind, *terminal)),
                _ => None,
            })
            .collect()
    }

    fn count(events: &[PlayerEvent], pred: fn(&PlayerEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    // --- ceiling ---

    #[test]
    fn ceiling_leaves_safety_margin() {
        let ceiling = play_time_ceiling(44_100).as_secs_f64();
        let exact = i32::MAX as f64 / 44_100.0;
        assert!((exact - ceiling - PLAY_TIME_SAFETY_MARGIN_SECS).abs() < 1e-6);
        assert!(play_time_ceiling(48_000) < play_time_ceiling(44_100));
        assert!(play_time_ceiling(0) > Duration::ZERO);
    }

    // --- state machine ---

    #[test]
    fn buffers_then_plays() {
        let mut h = Harness::new(endless(), test_config());
        assert_eq!(h.engine.state, PlaybackState::Idle);

        h.engine.handle(PlayerCommand::Play(station()));
        assert_eq!(h.engine.state, PlaybackState::Buffering);
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));

        let events = h.drain();
        let start = position(&events, |e| matches!(e, PlayerEvent::PlaybackStart { .. }));
        let buffering = position(&events, |e| matches!(e, PlayerEvent::BufferingStart));
        let connected = position(&events, |e| matches!(e, PlayerEvent::StreamConnected(_)));
        let end = position(&events, |e| matches!(e, PlayerEvent::BufferingEnd));
        let audio = position(&events, |e| matches!(e, PlayerEvent::AudioStart(_)));
        assert!(start < buffering && buffering < end && connected < end && end < audio);

        let progress: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::BufferingProgress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.last(), Some(&1.0));

        match &events[audio] {
            PlayerEvent::AudioStart(info) => {
                assert_eq!(info.codec, CodecKind::Mp3Symphonia);
                assert_eq!(info.sample_rate, 44_100);
                assert_eq!(info.channels, 1);
                assert_eq!(info.bitrate, Some(128));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.engine.tick();
        let stats = h.stats();
        assert_eq!(stats.state, PlaybackState::Playing);
        assert_eq!(stats.station.as_deref(), Some("Memory FM"));
        assert_eq!(stats.buffer_progress, 1.0);
        assert!(stats.bytes_received > 0);
        assert!(stats.codec_info.is_some());
        assert_eq!(h.capture.starts(), 1);
    }

    #[test]
    fn second_play_while_active_is_ignored() {
        let mut h = Harness::new(endless(), test_config());
        h.engine.handle(PlayerCommand::Play(station()));
        h.engine.handle(PlayerCommand::Play(StationDescriptor::new(
            "Other",
            "http://other.test/",
            AudioFormat::Mp3,
        )));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));

        let events = h.drain();
        assert_eq!(count(&events, |e| matches!(e, PlayerEvent::PlaybackStart { .. })), 1);
        assert_eq!(h.engine.session.as_ref().unwrap().station.name, "Memory FM");
        assert_eq!(h.connector.connects(), 1);
    }

    #[test]
    fn stop_from_any_state_zeroes_counters() {
        let mut h = Harness::new(endless(), test_config());

        // While buffering
        h.engine.handle(PlayerCommand::Play(station()));
        h.engine.handle(PlayerCommand::Stop);
        assert_eq!(h.engine.state, PlaybackState::Stopped);
        assert!(h.engine.session.is_none());
        let events = h.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::PlaybackEnd { .. })));
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::AudioEnd)));

        // While playing
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));
        assert!(h.run_until(Duration::from_secs(5), |e| {
            e.session.as_ref().is_some_and(|s| s.play_time > Duration::ZERO)
        }));
        h.drain();
        h.engine.handle(PlayerCommand::Stop);

        let events = h.drain();
        let audio_end = position(&events, |e| matches!(e, PlayerEvent::AudioEnd));
        let end = position(&events, |e| matches!(e, PlayerEvent::PlaybackEnd { .. }));
        assert!(audio_end < end);

        let stats = h.stats();
        assert_eq!(stats.state, PlaybackState::Stopped);
        assert_eq!(stats.station, None);
        assert_eq!(stats.play_time, Duration::ZERO);
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.available_bytes, 0);
        assert_eq!(stats.retry_attempt, 1);
        assert_eq!(h.connector.connects(), 2);

        // Idle ticks emit nothing
        h.run_until(Duration::from_millis(100), |_| false);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn stop_returns_while_ingest_read_stalls() {
        let connector =
            MemoryConnector::new(vec![0u8; 10], 0).stall_at_end(Duration::from_secs(3));
        let mut h = Harness::new(connector, test_config());
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| {
            e.session
                .as_ref()
                .is_some_and(|s| s.connected && s.ring.len() == 10)
        }));

        let started = Instant::now();
        h.engine.handle(PlayerCommand::Stop);
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(500), "stop took {elapsed:?}");
        assert_eq!(h.engine.state, PlaybackState::Stopped);
        assert!(h.engine.session.is_none());

        // Commands are still served right away
        h.engine.handle(PlayerCommand::SetVolume(0.3));
        assert_eq!(h.engine.volume, 0.3);
    }

    #[test]
    fn stop_when_idle_stays_idle() {
        let mut h = Harness::new(endless(), test_config());
        h.engine.handle(PlayerCommand::Stop);
        assert_eq!(h.engine.state, PlaybackState::Idle);
        assert!(h.drain().is_empty());
    }

    // --- failures ---

    #[test]
    fn invalid_station_is_terminal() {
        let mut h = Harness::new(endless(), test_config());
        h.engine.handle(PlayerCommand::Play(StationDescriptor::new(
            "Broken",
            "ftp://radio.test/",
            AudioFormat::Mp3,
        )));

        assert_eq!(h.engine.state, PlaybackState::Error);
        assert!(h.engine.restart.is_none());
        let events = h.drain();
        assert_eq!(errors(&events), vec![(ErrorKind::InvalidStation, true)]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlayerEvent::PlaybackStart { .. } | PlayerEvent::PlaybackEnd { .. })));
        assert_eq!(h.connector.connects(), 0);
    }

    #[test]
    fn excluded_ogg_codec_is_terminal() {
        let mut h = Harness::new(endless(), test_config());
        let station = StationDescriptor::new("Vorbis FM", "http://radio.test/ogg", AudioFormat::Ogg)
            .with_excluded_codec(CodecKind::OggVorbis);
        h.engine.handle(PlayerCommand::Play(station));
        assert_eq!(errors(&h.drain()), vec![(ErrorKind::ExcludedCodec, true)]);
        assert_eq!(h.engine.state, PlaybackState::Error);
    }

    #[test]
    fn offline_host_is_terminal() {
        let mut h = Harness::new(endless().offline(), test_config());
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Error));

        let events = h.drain();
        assert_eq!(errors(&events), vec![(ErrorKind::NoConnectivity, true)]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlayerEvent::RetryScheduled { .. })));
        assert_eq!(h.connector.connects(), 0);
    }

    #[test]
    fn failure_before_audio_is_not_retried() {
        let mut h = Harness::new(MemoryConnector::failing_connect(), test_config());
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Error));

        h.run_until(Duration::from_millis(500), |_| false);
        assert_eq!(errors(&h.drain()), vec![(ErrorKind::IngestFailure, true)]);
        assert_eq!(h.connector.connects(), 1);
    }

    #[test]
    fn output_failure_is_terminal() {
        let (_, capture) = capture_factory();
        let mut h = Harness::with_output(endless(), test_config(), failing_output_factory(), capture);
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Error));

        let events = h.drain();
        assert_eq!(errors(&events), vec![(ErrorKind::Output, true)]);
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::AudioStart(_))));
    }

    #[test]
    fn retries_are_bounded() {
        let config = PlayerConfig {
            max_retries: 3,
            ..test_config()
        };
        let connector = endless().eof_after(48 * 1024);
        let mut h = Harness::new(connector, config);
        h.engine.handle(PlayerCommand::Play(station()));

        assert!(h.run_until(Duration::from_secs(20), |e| {
            e.state == PlaybackState::Error && e.restart.is_none()
        }));
        // Nothing further is scheduled
        h.run_until(Duration::from_millis(500), |_| false);

        let events = h.drain();
        let outcomes: Vec<bool> = errors(&events).iter().map(|(_, terminal)| *terminal).collect();
        assert_eq!(outcomes, vec![false, false, true]);

        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::RetryScheduled { attempt, delay } => {
                    assert!(*delay >= Duration::from_millis(RESTART_SETTLE_MS));
                    Some(*attempt)
                }
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(h.connector.connects(), 3);
        assert_eq!(count(&events, |e| matches!(e, PlayerEvent::AudioStart(_))), 3);
        assert_eq!(h.capture.starts(), 3);
    }

    #[test]
    fn manual_play_resets_retry_history() {
        let config = PlayerConfig {
            max_retries: 2,
            ..test_config()
        };
        let mut h = Harness::new(endless().eof_after(48 * 1024), config);
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.retry.attempt() == 2));

        h.engine.handle(PlayerCommand::Stop);
        h.engine.handle(PlayerCommand::Play(station()));
        assert_eq!(h.engine.retry.attempt(), 1);
        assert!(!h.engine.chain_started_audio);
    }

    // --- play time ---

    #[test]
    fn ceiling_restarts_without_error() {
        let mut h = Harness::new(endless(), test_config());
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));
        h.drain();

        if let Some(audio) = h.engine.session.as_mut().and_then(|s| s.audio.as_mut()) {
            audio.ceiling = Duration::from_millis(50);
        }
        let connector = h.connector.clone();
        assert!(h.run_until(Duration::from_secs(5), |e| {
            e.state == PlaybackState::Playing && connector.connects() == 2
        }));

        let events = h.drain();
        assert!(errors(&events).is_empty(), "{events:?}");
        let end = position(&events, |e| matches!(e, PlayerEvent::PlaybackEnd { .. }));
        let start = position(&events, |e| matches!(e, PlayerEvent::PlaybackStart { .. }));
        assert!(end < start);
        assert_eq!(h.engine.retry.attempt(), 1);
    }

    #[test]
    fn pitch_scales_play_time() {
        let config = PlayerConfig {
            pitch: 2.0,
            ..test_config()
        };
        let mut h = Harness::new(endless(), config);
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));

        let before = h.engine.session.as_ref().unwrap().play_time;
        let started = Instant::now();
        h.run_until(Duration::from_millis(600), |_| false);
        let wall = started.elapsed();
        let played = h.engine.session.as_ref().unwrap().play_time - before;

        assert!(played >= wall.mul_f32(1.5), "played {played:?} in {wall:?}");
        assert!(played <= wall.mul_f32(2.0) + Duration::from_millis(100));
        assert_eq!(h.capture.speed(), 2.0);
    }

    #[test]
    fn volume_and_pitch_are_clamped() {
        let mut h = Harness::new(endless(), test_config());
        h.engine.handle(PlayerCommand::SetVolume(5.0));
        assert_eq!(h.engine.volume, MAX_VOLUME);
        h.engine.handle(PlayerCommand::SetVolume(f32::NAN));
        assert_eq!(h.engine.volume, MAX_VOLUME);
        h.engine.handle(PlayerCommand::SetPitch(0.0));
        assert_eq!(h.engine.pitch, MIN_PITCH);
        h.engine.handle(PlayerCommand::SetPitch(8.0));
        assert_eq!(h.engine.pitch, MAX_PITCH);

        h.engine.handle(PlayerCommand::SetVolume(0.5));
        h.engine.handle(PlayerCommand::SetPitch(1.0));
        h.engine.handle(PlayerCommand::Play(station()));
        assert!(h.run_until(Duration::from_secs(5), |e| e.state == PlaybackState::Playing));
        assert_eq!(h.capture.volume(), 0.5);

        h.engine.handle(PlayerCommand::SetVolume(1.5));
        assert_eq!(h.capture.volume(), 1.5);
    }

    // --- records ---

    #[test]
    fn records_change_in_stream_order() {
        let config = PlayerConfig {
            pitch: 4.0,
            ..test_config()
        };
        let connector = MemoryConnector::endless(16_384)
            .with_titles(&[
                (0, "Artist A - One"),
                (1, "Artist B - Two"),
                (2, "Artist C - Three"),
            ])
            .paced(96_000);
        let mut h = Harness::new(connector, config);
        h.engine.handle(PlayerCommand::Play(station()));

        let mut changes: Vec<String> = Vec::new();
        let mut delays: Vec<(usize, Duration)> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(15);
        while changes.len() < 3 && Instant::now() < deadline {
            h.engine.tick();
            for event in h.events.try_iter() {
                match event {
                    PlayerEvent::RecordChange(track) => {
                        changes.push(track.title.unwrap_or_default());
                    }
                    PlayerEvent::NextRecordDelay(delay) => delays.push((changes.len(), delay)),
                    _ => {}
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(changes, vec!["One", "Two", "Three"]);

        // Countdowns never go back up for the same record
        for group in 0..3 {
            let values: Vec<Duration> = delays
                .iter()
                .filter(|(g, _)| *g == group)
                .map(|(_, d)| *d)
                .collect();
            assert!(values.windows(2).all(|w| w[1] < w[0]), "{values:?}");
        }

        h.run_until(Duration::from_millis(300), |_| false);
        assert!(!h
            .drain()
            .iter()
            .any(|e| matches!(e, PlayerEvent::RecordChange(_))));
        let current = h.stats().current_record.unwrap();
        assert_eq!(current.artist.as_deref(), Some("Artist C"));
    }

    #[test]
    fn fixture_records_change_exactly_three_times() {
        let config = PlayerConfig {
            pitch: 4.0,
            max_retries: 1,
            ..test_config()
        };
        let mut audio = silent_mp3(64 * 1024 / 417 + 1);
        audio.truncate(64 * 1024);
        let titles = [(0, "One - A"), (1, "Two - B"), (2, "Three - C")];
        let fixture = icy_stream(&audio, 16_384, &titles);
        let connector = MemoryConnector::new(fixture.clone(), 16_384)
            .stall_at_end(Duration::from_secs(10))
            .paced(96_000);
        let mut h = Harness::new(connector, config);
        h.engine.handle(PlayerCommand::Play(station()));
        let ring = h.engine.session.as_ref().unwrap().ring.clone();

        // Plays the whole fixture, then runs dry
        let mut changes: Vec<String> = Vec::new();
        let mut failed = false;
        let deadline = Instant::now() + Duration::from_secs(15);
        while !failed && Instant::now() < deadline {
            h.engine.tick();
            for event in h.events.try_iter() {
                match event {
                    PlayerEvent::RecordChange(track) => {
                        changes.push(track.info.unwrap_or_default());
                    }
                    PlayerEvent::Error { .. } => failed = true,
                    _ => {}
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(failed);
        assert_eq!(changes, vec!["One - A", "Two - B", "Three - C"]);

        // Payload is the fixture minus length bytes and metadata blocks
        assert_eq!(ring.len() as usize, audio.len());
        assert!(fixture.len() > audio.len());
        assert_eq!(h.connector.connects(), 1);
    }

    // --- player thread ---

    #[test]
    fn player_thread_plays_and_shuts_down() {
        let connector = Arc::new(endless());
        let (factory, capture) = capture_factory();
        let player = RadioPlayer::with_parts(test_config(), connector.clone(), factory).unwrap();
        let events = player.subscribe();

        player.play(station());
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut started = false;
        while !started && Instant::now() < deadline {
            if let Ok(PlayerEvent::AudioStart(_)) = events.recv_timeout(Duration::from_millis(100)) {
                started = true;
            }
        }
        assert!(started);
        assert_eq!(capture.starts(), 1);

        thread::sleep(Duration::from_millis(200));
        let stats = player.stats();
        assert_eq!(stats.state, PlaybackState::Playing);
        let totals = player.totals();
        assert_eq!(totals.sessions, 1);
        assert_eq!(totals.requests, 1);
        assert!(totals.bytes_downloaded > 0);
        assert!(totals.play_time > Duration::ZERO);

        player.shutdown();
        let ended = events
            .try_iter()
            .any(|e| matches!(e, PlayerEvent::PlaybackEnd { .. }));
        assert!(ended);
    }
}
