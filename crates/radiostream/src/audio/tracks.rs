//! Record scheduling
//!
//! Tracks announced by ingest are ahead of what is audible by the unread
//! depth of the ring. Each carries a delay; the scheduler counts the delays
//! down with play time and promotes a track to current when its delay runs
//! out. Tracks announced while others are pending queue up in arrival order.

use std::collections::VecDeque;
use std::time::Duration;

use crate::stream::metadata::TrackInfo;

/// A track became current
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChanged {
    /// The record it replaced, with its final play duration
    pub previous: Option<TrackInfo>,
    pub current: TrackInfo,
}

#[derive(Debug, Default)]
pub struct TrackScheduler {
    current: Option<TrackInfo>,
    pending: VecDeque<TrackInfo>,
    record_play_time: Duration,
}

impl TrackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a track from ingest.
    ///
    /// Returns the change if the track is due now and nothing is queued ahead
    /// of it, otherwise queues it and returns `None`.
    pub fn announce(&mut self, track: TrackInfo) -> Option<RecordChanged> {
        if track.delay.is_zero() && self.pending.is_empty() {
            return Some(self.promote(track));
        }
        self.pending.push_back(track);
        None
    }

    /// Advance by `dt` of play time. Returns the tracks that became current,
    /// in order.
    pub fn advance(&mut self, dt: Duration) -> Vec<RecordChanged> {
        self.record_play_time += dt;
        for track in self.pending.iter_mut() {
            track.delay = track.delay.saturating_sub(dt);
        }

        let mut changes = Vec::new();
        while self.pending.front().is_some_and(|t| t.delay.is_zero()) {
            if let Some(track) = self.pending.pop_front() {
                changes.push(self.promote(track));
            }
        }
        changes
    }

    fn promote(&mut self, track: TrackInfo) -> RecordChanged {
        let previous = self.current.take().map(|mut prev| {
            prev.duration = self.record_play_time;
            prev
        });
        self.record_play_time = Duration::ZERO;
        self.current = Some(track.clone());
        RecordChanged {
            previous,
            current: track,
        }
    }

    pub fn current(&self) -> Option<&TrackInfo> {
        self.current.as_ref()
    }

    /// The next track to become current
    pub fn next(&self) -> Option<&TrackInfo> {
        self.pending.front()
    }

    /// Remaining delay of the next track
    pub fn next_delay(&self) -> Option<Duration> {
        self.pending.front().map(|t| t.delay)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Play time of the current record
    pub fn record_play_time(&self) -> Duration {
        self.record_play_time
    }
}
