//! Stream handling
//!
//! Station descriptors, the ICY transport and demuxer, stream metadata and
//! the ring cache that decouples network ingest from decoding.

pub mod icy;
pub mod metadata;
pub mod ring;
pub mod station;

pub use icy::{HttpConnector, IcyDemuxer, IcyHeaders, StreamConnector};
pub use metadata::TrackInfo;
pub use ring::{RingCacheStream, RingReader};
pub use station::{AudioFormat, StationDescriptor};
