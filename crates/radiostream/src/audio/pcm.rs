//! Pull-based PCM source
//!
//! `PcmSource` sits between the audio output and the codec adapter. The
//! output's real-time thread pulls samples one at a time; the source refills
//! a fixed block from the codec when it runs dry.
//!
//! The stream never ends on its own. When the codec fails or runs out of
//! bytes the failure is parked in a shared slot for the engine and the
//! iterator returns `None`, which stops the output.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::Source;

use crate::config::buffer::PCM_BLOCK_SAMPLES;
use crate::error::{Failure, RadioError};

use super::codec::CodecAdapter;
use super::stats::DecoderStats;
use super::types::StreamSpec;

/// Failure slot shared between the audio thread and the engine
pub type FailureSlot = Arc<Mutex<Option<Failure>>>;

pub struct PcmSource {
    codec: Box<dyn CodecAdapter>,
    spec: StreamSpec,
    block: Vec<f32>,
    block_len: usize,
    block_idx: usize,
    failure: FailureSlot,
    stats: Arc<DecoderStats>,
    done: bool,
}

impl PcmSource {
    pub fn new(codec: Box<dyn CodecAdapter>, spec: StreamSpec) -> Self {
        let stats = codec.stats();
        // Whole frames only, so a refill never splits a channel group
        let channels = spec.channels.max(1) as usize;
        let block_size = (PCM_BLOCK_SAMPLES / channels).max(1) * channels;
        Self {
            codec,
            spec,
            block: vec![0.0; block_size],
            block_len: 0,
            block_idx: 0,
            failure: Arc::new(Mutex::new(None)),
            stats,
            done: false,
        }
    }

    /// Where the reason for the end of the stream is recorded
    pub fn failure_slot(&self) -> FailureSlot {
        self.failure.clone()
    }

    pub fn decoder_stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }

    pub fn spec(&self) -> StreamSpec {
        self.spec
    }

    fn refill(&mut self) -> bool {
        match self.codec.decode(&mut self.block) {
            Ok(0) => self.fail(RadioError::Underrun("decoder produced no samples".to_string())),
            Ok(n) => {
                self.block_len = n;
                self.block_idx = 0;
                self.stats.record_samples(n);
                true
            }
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, e: RadioError) -> bool {
        self.done = true;
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert_with(|| Failure::from(e));
        }
        false
    }
}

impl Iterator for PcmSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.block_idx >= self.block_len {
            if self.done || !self.refill() {
                return None;
            }
        }
        let sample = self.block[self.block_idx];
        self.block_idx += 1;
        Some(sample)
    }
}

impl Source for PcmSource {
    fn current_span_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
