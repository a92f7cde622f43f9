//! Client-side frame reassembly
//!
//! Chunks may arrive lost, duplicated or out of order. Each frame which has seen at least one
//! chunk, or which has been requested, gets a sparse entry holding a chunk bit set and the
//! resolution it was last requested at. Frames are promoted into the playback buffer strictly in
//! order: the scan stops at the first incomplete frame, so a complete frame beyond a gap waits.
//!
//!   next
//!    v
//!   [####][##_#][####]   -> nothing promoted, frame `next` is missing chunk 2
//!   [####][####][####]   -> three frames promoted, next += 3

use std::collections::BTreeMap;
use std::ops::Range;

use crate::frame::{self, DataFrame};

/// Record of which chunk indices of a frame have arrived.
#[derive(Clone, Debug, Default)]
pub struct ChunkBitmap {
    words: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a chunk as received. Returns false if it was already marked.
    pub fn set(&mut self, chunk_index: u32) -> bool {
        let (word, bit) = Self::locate(chunk_index);

        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }

        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;

        !was_set
    }

    #[cfg(test)]
    pub fn contains(&self, chunk_index: u32) -> bool {
        let (word, bit) = Self::locate(chunk_index);

        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    /// Returns true if every chunk index in `0..count` is marked.
    pub fn is_complete(&self, count: u32) -> bool {
        let full_words = (count / 64) as usize;
        let tail_bits = count % 64;

        if self.words.len() < full_words + (tail_bits != 0) as usize {
            return false;
        }

        if self.words[..full_words].iter().any(|&w| w != u64::MAX) {
            return false;
        }

        if tail_bits != 0 {
            let mask = (1u64 << tail_bits) - 1;
            return self.words[full_words] & mask == mask;
        }

        true
    }

    /// Number of marked chunks.
    #[cfg(test)]
    pub fn len(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    fn locate(chunk_index: u32) -> (usize, u64) {
        ((chunk_index / 64) as usize, 1u64 << (chunk_index % 64))
    }
}

#[derive(Debug, Default)]
struct FrameEntry {
    // Resolution of the most recent request covering this frame
    resolution: Option<u32>,
    chunks: ChunkBitmap,
}

impl FrameEntry {
    fn is_complete(&self, chunk_size: u32) -> bool {
        match self.resolution {
            Some(resolution) => self
                .chunks
                .is_complete(frame::chunk_count(resolution, chunk_size)),
            None => false,
        }
    }
}

/// Result of handing a DATA message to the tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Receipt {
    /// The chunk was recorded; `completed` frames were promoted into the buffer as a result.
    Accepted { completed: u32 },
    /// The chunk had already been recorded.
    Duplicate,
    /// The chunk belongs to a frame which was already promoted.
    Stale,
    /// The frame or chunk index lies outside the stream.
    OutOfRange,
}

/// Tracks chunk arrivals and the contiguous prefix of complete frames.
#[derive(Debug)]
pub struct FrameTracker {
    chunk_size: u32,
    total_frames: u32,
    // Highest chunk index any ladder level can use, plus one
    chunk_limit: u32,
    // Entries for frames >= next_frame only
    frames: BTreeMap<u32, FrameEntry>,
    // Number of frames received contiguously from the start, i.e. the next frame needed
    next_frame: u32,
    // Promoted frames not yet consumed
    buffered_frames: u32,
}

impl FrameTracker {
    pub fn new(chunk_size: u32, total_frames: u32, resolution_max: u32) -> Self {
        Self {
            chunk_size,
            total_frames,
            chunk_limit: frame::chunk_count(resolution_max, chunk_size),
            frames: BTreeMap::new(),
            next_frame: 0,
            buffered_frames: 0,
        }
    }

    /// Index of the next frame needed; equivalently, the number of frames received in order.
    pub fn last_received_frame(&self) -> u32 {
        self.next_frame
    }

    pub fn buffered_frames(&self) -> u32 {
        self.buffered_frames
    }

    /// True once every frame of the stream has been received.
    pub fn is_exhausted(&self) -> bool {
        self.next_frame >= self.total_frames
    }

    /// Records that the frames in `window` were requested at `resolution`, replacing any earlier
    /// resolution. Returns the number of frames promoted as a result.
    pub fn expect(&mut self, window: Range<u32>, resolution: u32) -> u32 {
        let start = window.start.max(self.next_frame);
        let end = window.end.min(self.total_frames);

        for frame_index in start..end {
            self.frames.entry(frame_index).or_default().resolution = Some(resolution);
        }

        self.advance()
    }

    pub fn receive(&mut self, data: &DataFrame) -> Receipt {
        if data.frame_index >= self.total_frames || data.chunk_index >= self.chunk_limit {
            return Receipt::OutOfRange;
        }

        if data.frame_index < self.next_frame {
            return Receipt::Stale;
        }

        let entry = self.frames.entry(data.frame_index).or_default();

        if !entry.chunks.set(data.chunk_index) {
            return Receipt::Duplicate;
        }

        let completed = if data.frame_index == self.next_frame {
            self.advance()
        } else {
            0
        };

        Receipt::Accepted { completed }
    }

    /// Removes up to `count` frames from the buffer, returning how many were removed.
    pub fn consume(&mut self, count: u32) -> u32 {
        let consumed = count.min(self.buffered_frames);
        self.buffered_frames -= consumed;
        consumed
    }

    /// Returns true if `frame_index` has been promoted, or has all chunks for its requested
    /// resolution.
    #[cfg(test)]
    pub fn is_frame_complete(&self, frame_index: u32) -> bool {
        frame_index < self.next_frame
            || self
                .frames
                .get(&frame_index)
                .map_or(false, |entry| entry.is_complete(self.chunk_size))
    }

    /// Number of frames beyond the contiguous prefix with partial state.
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    fn advance(&mut self) -> u32 {
        let mut completed = 0;

        while self.next_frame < self.total_frames {
            let complete = self
                .frames
                .get(&self.next_frame)
                .map_or(false, |entry| entry.is_complete(self.chunk_size));

            if !complete {
                break;
            }

            self.frames.remove(&self.next_frame);
            self.next_frame += 1;
            self.buffered_frames += 1;
            completed += 1;
        }

        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_SIZE: u32 = 100;

    fn data(frame_index: u32, chunk_index: u32) -> DataFrame {
        DataFrame {
            frame_index,
            chunk_index,
        }
    }

    fn tracker() -> FrameTracker {
        // Frames of 250 bytes need 3 chunks; the ladder tops out at 1000 bytes (10 chunks)
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 10, 1000);
        tracker.expect(0..10, 250);
        tracker
    }

    #[test]
    fn bitmap_completion() {
        let mut bitmap = ChunkBitmap::new();

        assert!(bitmap.is_complete(0));
        assert!(!bitmap.is_complete(1));

        for idx in 0..130 {
            assert!(bitmap.set(idx));
        }

        assert!(!bitmap.set(64));
        assert!(bitmap.contains(129));
        assert!(!bitmap.contains(130));
        assert!(bitmap.is_complete(64));
        assert!(bitmap.is_complete(130));
        assert!(!bitmap.is_complete(131));
        assert_eq!(bitmap.len(), 130);
    }

    #[test]
    fn bitmap_gap() {
        let mut bitmap = ChunkBitmap::new();

        bitmap.set(0);
        bitmap.set(2);

        assert!(bitmap.is_complete(1));
        assert!(!bitmap.is_complete(3));
        assert!(!bitmap.is_empty());
    }

    #[test]
    fn frame_completes_only_with_all_chunks() {
        let mut tracker = tracker();

        assert_eq!(tracker.receive(&data(0, 0)), Receipt::Accepted { completed: 0 });
        assert_eq!(tracker.receive(&data(0, 2)), Receipt::Accepted { completed: 0 });
        assert_eq!(tracker.buffered_frames(), 0);
        assert!(!tracker.is_frame_complete(0));

        assert_eq!(tracker.receive(&data(0, 1)), Receipt::Accepted { completed: 1 });
        assert_eq!(tracker.buffered_frames(), 1);
        assert_eq!(tracker.last_received_frame(), 1);
    }

    #[test]
    fn even_division_requires_every_chunk() {
        // 300 bytes at 100 bytes per chunk is exactly 3 chunks, indices 0..3
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 1, 1000);
        tracker.expect(0..1, 300);

        tracker.receive(&data(0, 0));
        tracker.receive(&data(0, 1));
        assert_eq!(tracker.buffered_frames(), 0);

        tracker.receive(&data(0, 2));
        assert_eq!(tracker.buffered_frames(), 1);
    }

    #[test]
    fn duplicate_does_not_double_count() {
        let mut tracker = tracker();

        for chunk in 0..3 {
            tracker.receive(&data(0, chunk));
        }

        assert_eq!(tracker.buffered_frames(), 1);
        assert_eq!(tracker.receive(&data(0, 2)), Receipt::Stale);
        assert_eq!(tracker.buffered_frames(), 1);

        tracker.receive(&data(1, 0));
        assert_eq!(tracker.receive(&data(1, 0)), Receipt::Duplicate);
        assert_eq!(tracker.buffered_frames(), 1);
    }

    #[test]
    fn complete_frame_beyond_gap_waits() {
        let mut tracker = tracker();

        for chunk in 0..3 {
            tracker.receive(&data(1, chunk));
            tracker.receive(&data(2, chunk));
        }

        assert_eq!(tracker.buffered_frames(), 0);
        assert_eq!(tracker.last_received_frame(), 0);
        assert!(tracker.is_frame_complete(1));

        tracker.receive(&data(0, 1));
        tracker.receive(&data(0, 0));
        assert_eq!(tracker.buffered_frames(), 0);

        assert_eq!(tracker.receive(&data(0, 2)), Receipt::Accepted { completed: 3 });
        assert_eq!(tracker.last_received_frame(), 3);
        assert_eq!(tracker.pending_frames(), 7);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut tracker = tracker();

        assert_eq!(tracker.receive(&data(10, 0)), Receipt::OutOfRange);
        assert_eq!(tracker.receive(&data(0, 10)), Receipt::OutOfRange);
        assert_eq!(tracker.pending_frames(), 10);
    }

    #[test]
    fn unrequested_frame_never_completes() {
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 10, 1000);

        for chunk in 0..10 {
            tracker.receive(&data(0, chunk));
        }

        assert_eq!(tracker.buffered_frames(), 0);

        // Once requested, the chunks already present are enough
        assert_eq!(tracker.expect(0..5, 250), 1);
        assert_eq!(tracker.buffered_frames(), 1);
    }

    #[test]
    fn lower_resolution_request_completes_partial_frame() {
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 10, 1000);
        tracker.expect(0..5, 500);

        for chunk in 0..3 {
            tracker.receive(&data(0, chunk));
        }

        assert_eq!(tracker.buffered_frames(), 0);
        assert_eq!(tracker.expect(0..5, 300), 1);
        assert_eq!(tracker.last_received_frame(), 1);
    }

    #[test]
    fn higher_resolution_request_raises_requirement() {
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 10, 1000);
        tracker.expect(0..5, 200);
        tracker.expect(0..5, 400);

        tracker.receive(&data(0, 0));
        tracker.receive(&data(0, 1));
        assert_eq!(tracker.buffered_frames(), 0);

        tracker.receive(&data(0, 2));
        tracker.receive(&data(0, 3));
        assert_eq!(tracker.buffered_frames(), 1);
    }

    #[test]
    fn consume_and_exhaust() {
        let mut tracker = FrameTracker::new(CHUNK_SIZE, 2, 100);
        tracker.expect(0..5, 100);

        tracker.receive(&data(0, 0));
        assert!(!tracker.is_exhausted());
        tracker.receive(&data(1, 0));
        assert!(tracker.is_exhausted());

        assert_eq!(tracker.consume(5), 2);
        assert_eq!(tracker.buffered_frames(), 0);
        assert_eq!(tracker.pending_frames(), 0);
    }
}
