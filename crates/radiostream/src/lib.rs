//! Radiostream: Internet Radio Engine
//!
//! ICY stream ingest, a lock-free ring cache, MP3/Ogg decoding and a
//! playback state machine with bounded retries.
//!
//! ## Quick start
//!
//! ```no_run
//! use radiostream::audio::RadioPlayer;
//! use radiostream::config::PlayerConfig;
//! use radiostream::stream::{AudioFormat, StationDescriptor};
//!
//! let player = RadioPlayer::new(PlayerConfig::default())?;
//! let events = player.subscribe();
//! player.play(StationDescriptor::new(
//!     "Example FM",
//!     "http://radio.example.com:8000/stream",
//!     AudioFormat::Mp3,
//! ));
//! for event in events.iter().take(10) {
//!     println!("{event:?}");
//! }
//! player.shutdown();
//! # Ok::<(), radiostream::error::RadioError>(())
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{RadioError, Result};
