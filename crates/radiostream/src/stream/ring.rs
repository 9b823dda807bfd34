//! Fixed-capacity ring cache between network ingest and decode
//!
//! The ingest thread is the only writer and the decode path is the only
//! reader. Each cursor therefore has exactly one mutating thread and no lock
//! is taken on either side:
//!
//!   ingest thread ──write()──▶ [ capacity bytes ] ──read()──▶ codec (audio thread)
//!
//! `length` counts every byte ever written and doubles as the absolute write
//! position. The writer publishes it with `Release` after storing the bytes,
//! the reader loads it with `Acquire` before copying them out.
//!
//! The ring never blocks the writer. A producer that gets more than
//! `capacity` bytes ahead of the reader overwrites the oldest unread bytes.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Circular byte cache with independent read and write cursors
pub struct RingCacheStream {
    data: Box<[AtomicU8]>,
    /// Total bytes ever written (absolute write position)
    length: AtomicU64,
    /// Absolute read position
    read_pos: AtomicU64,
}

impl RingCacheStream {
    /// Create a ring holding `capacity` bytes (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let data = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        Self {
            data,
            length: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total bytes ever written
    pub fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute write position. Always equal to [`len`](Self::len).
    pub fn write_position(&self) -> u64 {
        self.len()
    }

    /// Absolute read position
    pub fn read_position(&self) -> u64 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Bytes written but not yet read
    pub fn available_bytes(&self) -> u64 {
        let len = self.length.load(Ordering::Acquire);
        len.saturating_sub(self.read_pos.load(Ordering::Acquire))
    }

    /// Append `bytes`, wrapping at the capacity boundary.
    ///
    /// Fails without writing anything if a single write exceeds the capacity.
    /// Must only be called from the single producer.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let capacity = self.capacity();
        if bytes.len() > capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes exceeds ring capacity of {} bytes",
                    bytes.len(),
                    capacity
                ),
            ));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let start = self.length.load(Ordering::Relaxed);
        let offset = (start % capacity as u64) as usize;
        let first = bytes.len().min(capacity - offset);

        for (slot, &b) in self.data[offset..offset + first].iter().zip(&bytes[..first]) {
            slot.store(b, Ordering::Relaxed);
        }
        for (slot, &b) in self.data.iter().zip(&bytes[first..]) {
            slot.store(b, Ordering::Relaxed);
        }

        self.length
            .store(start + bytes.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Copy unread bytes into `out`, wrapping at the capacity boundary.
    ///
    /// Returns 0 when the reader has caught up with the writer. That means
    /// "not ready yet", never end of stream. After an overrun the cursor
    /// first skips to the oldest byte still held. Must only be called from
    /// the single consumer.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let capacity = self.capacity();
        let len = self.length.load(Ordering::Acquire);
        let mut pos = self.read_pos.load(Ordering::Relaxed);
        if len.saturating_sub(pos) > capacity as u64 {
            pos = len - capacity as u64;
        }
        let available = len.saturating_sub(pos) as usize;
        let n = out.len().min(available);
        if n == 0 {
            return 0;
        }

        let offset = (pos % capacity as u64) as usize;
        let first = n.min(capacity - offset);

        for (dst, slot) in out[..first].iter_mut().zip(&self.data[offset..offset + first]) {
            *dst = slot.load(Ordering::Relaxed);
        }
        for (dst, slot) in out[first..n].iter_mut().zip(self.data.iter()) {
            *dst = slot.load(Ordering::Relaxed);
        }

        self.read_pos.store(pos + n as u64, Ordering::Release);
        n
    }

    /// Move the read cursor. The position is clamped to `len()`.
    ///
    /// Seeking further back than `capacity` bytes behind `len()` lands on
    /// bytes that have already been overwritten.
    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.length.load(Ordering::Acquire);
        let current = self.read_pos.load(Ordering::Relaxed);

        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => current as i128 + d as i128,
            SeekFrom::End(d) => len as i128 + d as i128,
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek to negative position",
            ));
        }

        let target = (target as u64).min(len);
        self.read_pos.store(target, Ordering::Release);
        Ok(target)
    }

    /// Set the read cursor to an absolute position (clamped to `len()`)
    pub fn set_position(&self, pos: u64) -> u64 {
        let len = self.length.load(Ordering::Acquire);
        let target = pos.min(len);
        self.read_pos.store(target, Ordering::Release);
        target
    }
}

impl std::fmt::Debug for RingCacheStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingCacheStream")
            .field("capacity", &self.capacity())
            .field("length", &self.len())
            .field("read_position", &self.read_position())
            .finish()
    }
}

/// Consumer handle implementing `Read + Seek` for codec libraries
#[derive(Clone)]
pub struct RingReader {
    ring: Arc<RingCacheStream>,
}

impl RingReader {
    pub fn new(ring: Arc<RingCacheStream>) -> Self {
        Self { ring }
    }

    pub fn ring(&self) -> &Arc<RingCacheStream> {
        &self.ring
    }
}

impl Read for RingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.ring.read(buf))
    }
}

impl Seek for RingReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ring.seek(pos)
    }
}
