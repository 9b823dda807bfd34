//! Player statistics and event broadcasting
//!
//! `PlayerStats` is a shared snapshot of the session, updated by the engine
//! on every tick. `EventBus` broadcasts discrete `PlayerEvent`s to
//! subscribers. `DecoderStats` provides atomic counters for the hot decode
//! path and `PlayerTotals` accumulates across sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::audio::types::{CodecInfo, PlaybackState, PlayerEvent};
use crate::stream::metadata::TrackInfo;

/// Snapshot of the current session
#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    pub state: PlaybackState,
    pub station: Option<String>,
    pub codec_info: Option<CodecInfo>,
    pub current_record: Option<TrackInfo>,
    /// Announced record still waiting for its delay to run out
    pub next_record: Option<TrackInfo>,

    pub buffer_progress: f32,
    pub available_bytes: u64,
    pub ring_capacity: usize,
    pub bytes_received: u64,

    pub play_time: Duration,
    pub record_play_time: Duration,

    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub samples_played: u64,

    pub retry_attempt: u32,
}

/// Thread-safe handle to shared stats
pub type SharedStats = Arc<Mutex<PlayerStats>>;

/// Create a new shared stats instance
pub fn new_shared_stats() -> SharedStats {
    Arc::new(Mutex::new(PlayerStats::default()))
}

/// Broadcast mechanism for player events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: PlayerEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Atomic counters for the hot decode path (lock-free)
#[derive(Debug, Default)]
pub struct DecoderStats {
    pub frames_decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub samples_played: AtomicU64,
}

impl DecoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// A corrupt packet was skipped
    pub fn record_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_samples(&self, n: usize) {
        self.samples_played.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// (frames decoded, decode errors, samples played)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.frames_decoded.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.samples_played.load(Ordering::Relaxed),
        )
    }
}

/// Counters that survive across sessions
#[derive(Debug, Default)]
pub struct PlayerTotals {
    bytes_downloaded: AtomicU64,
    requests: AtomicU64,
    play_time_us: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time copy of [`PlayerTotals`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TotalsSnapshot {
    pub bytes_downloaded: u64,
    pub requests: u64,
    pub play_time: Duration,
    pub sessions: u64,
}

impl PlayerTotals {
    pub fn add_bytes(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_play_time(&self, dt: Duration) {
        self.play_time_us
            .fetch_add(dt.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            play_time: Duration::from_micros(self.play_time_us.load(Ordering::Relaxed)),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}
