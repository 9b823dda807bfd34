//! Audio subsystem
//!
//! Codec adapters, the pull-based PCM source, the output seam and the
//! playback engine that ties a session together.

pub mod codec;
pub mod engine;
pub mod output;
pub mod pcm;
pub mod retry;
pub mod stats;
pub mod tracks;
pub mod types;

pub use codec::{select_codec, CodecAdapter, CodecKind, Mp3Backend};
pub use engine::{play_time_ceiling, RadioPlayer};
pub use output::{default_output_factory, AudioOutput, OutputFactory, RodioOutput};
pub use pcm::PcmSource;
pub use retry::{RetryDecision, RetryPolicy};
pub use stats::{new_shared_stats, EventBus, PlayerStats, PlayerTotals, SharedStats, TotalsSnapshot};
pub use tracks::TrackScheduler;
pub use types::{CodecInfo, PlaybackState, PlayerCommand, PlayerEvent, StreamSpec};
