//! Accumulates the host's MFM write words for one track until commit.

use crate::cache::{MAX_TRACK_BITS, MAX_TRACK_SAMPLES};
use crate::proto::DiskSide;

/// A committed track write waiting for the worker.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub cylinder: u8,
    pub side: DiskSide,
    pub mfm: Vec<u8>,
    pub bits: u32,
    pub align_to_index: bool,
}

/// Host-side staging buffer. The host streams 16-bit words as its DMA
/// emulation produces them; the buffer snapshots the target track on
/// the first word and turns into a [`WriteJob`] at commit time.
#[derive(Debug, Default)]
pub struct TrackWriteBuffer {
    target: Option<(u8, DiskSide)>,
    data: Vec<u8>,
    bits: u32,
    start_bit_position: u32,
}

impl TrackWriteBuffer {
    /// Appends one word. The first word latches the target track and
    /// the bit position the host started writing at; words past the
    /// track capacity are dropped.
    pub fn push_word(&mut self, cylinder: u8, side: DiskSide, word: u16, bit_position: u32) {
        if self.bits >= MAX_TRACK_BITS - 16 {
            return;
        }
        if self.bits == 0 {
            self.target = Some((cylinder, side));
            self.start_bit_position = bit_position;
            self.data.reserve(MAX_TRACK_SAMPLES);
        }
        self.data.extend_from_slice(&word.to_be_bytes());
        self.bits += 16;
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// The track the buffered data belongs to, if any.
    pub fn target(&self) -> Option<(u8, DiskSide)> {
        self.target
    }

    pub fn start_bit_position(&self) -> u32 {
        self.start_bit_position
    }

    /// Converts the buffer into a write job when it matches the track
    /// the host is committing. `track_bits` is the current track length
    /// in bits; a write that started within 10 bits of the index wrap
    /// is flagged for index-aligned writing.
    pub fn commit(&mut self, cylinder: u8, side: DiskSide, track_bits: u32) -> Option<WriteJob> {
        let job = match self.target {
            Some(target) if target == (cylinder, side) && self.bits > 0 => {
                let align_to_index = self.start_bit_position <= 10
                    || self.start_bit_position >= track_bits.saturating_sub(10);
                Some(WriteJob {
                    cylinder,
                    side,
                    mfm: std::mem::take(&mut self.data),
                    bits: self.bits,
                    align_to_index,
                })
            }
            _ => None,
        };
        self.reset();
        job
    }

    /// Drops everything buffered. Must run on any cylinder or side
    /// change before new words arrive.
    pub fn reset(&mut self) {
        self.target = None;
        self.data.clear();
        self.bits = 0;
        self.start_bit_position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_word_latches_target_and_position() {
        let mut buf = TrackWriteBuffer::default();
        assert!(buf.is_empty());

        buf.push_word(20, DiskSide::Lower, 0x4489, 1234);
        buf.push_word(20, DiskSide::Lower, 0x5555, 1250);
        assert_eq!(buf.target(), Some((20, DiskSide::Lower)));
        assert_eq!(buf.start_bit_position(), 1234);

        let job = buf.commit(20, DiskSide::Lower, 100_000).unwrap();
        assert_eq!(job.bits, 32);
        assert_eq!(job.mfm, [0x44, 0x89, 0x55, 0x55]);
        assert!(!job.align_to_index);
        assert!(buf.is_empty());
    }

    #[test]
    fn commit_for_the_wrong_track_discards() {
        let mut buf = TrackWriteBuffer::default();
        buf.push_word(20, DiskSide::Lower, 0x4489, 0);
        assert!(buf.commit(21, DiskSide::Lower, 100_000).is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn writes_near_the_index_wrap_align_to_index() {
        let mut buf = TrackWriteBuffer::default();
        buf.push_word(5, DiskSide::Upper, 0xAAAA, 4);
        let job = buf.commit(5, DiskSide::Upper, 100_000).unwrap();
        assert!(job.align_to_index);

        buf.push_word(5, DiskSide::Upper, 0xAAAA, 99_995);
        let job = buf.commit(5, DiskSide::Upper, 100_000).unwrap();
        assert!(job.align_to_index);

        buf.push_word(5, DiskSide::Upper, 0xAAAA, 50_000);
        let job = buf.commit(5, DiskSide::Upper, 100_000).unwrap();
        assert!(!job.align_to_index);
    }

    #[test]
    fn capacity_limit_drops_excess_words() {
        let mut buf = TrackWriteBuffer::default();
        for i in 0..(MAX_TRACK_BITS / 16) + 10 {
            buf.push_word(0, DiskSide::Lower, 0x4489, i * 16);
        }
        let job = buf.commit(0, DiskSide::Lower, MAX_TRACK_BITS).unwrap();
        assert!(job.bits <= MAX_TRACK_BITS - 16 + 16);
        assert_eq!(job.mfm.len() as u32 * 8, job.bits);
    }

    #[test]
    fn reset_discards_everything() {
        let mut buf = TrackWriteBuffer::default();
        buf.push_word(9, DiskSide::Lower, 0x1234, 77);
        buf.reset();
        assert!(buf.is_empty());
        assert!(buf.target().is_none());
        assert!(buf.commit(9, DiskSide::Lower, 100_000).is_none());
    }
}
