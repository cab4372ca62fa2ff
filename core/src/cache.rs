//! Per-(cylinder, side) double-buffered track cache.
//!
//! The worker fills `next` while the host reads `current`; promotion is
//! the only writer-to-reader handoff. Each entry sits behind its own
//! mutex, held only for per-run appends, promotion, invalidation and
//! single-bit reads — never across I/O.

use std::sync::Mutex;

use log::*;

use fluxbridge_mfm::{Fingerprint, MfmRun, MfmSample, NOMINAL_SPEED};

use crate::proto::DiskSide;

/// Cylinders the bridge exposes to the host.
pub const MAX_CYLINDERS: usize = 82;

/// Worst-case revolution size in samples (bytes of MFM data).
pub const MAX_TRACK_SAMPLES: usize = 0x3800;

/// Worst-case revolution size in bits.
pub const MAX_TRACK_BITS: u32 = MAX_TRACK_SAMPLES as u32 * 8;

/// One revolution buffer.
#[derive(Debug, Default)]
pub struct Slot {
    samples: Vec<MfmSample>,
    bits: u32,
    ready: bool,
    /// Trailing partial byte has been shifted up to MSB order
    aligned: bool,
}

impl Slot {
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Appends one bit with its read speed. False when the slot is full.
    fn push_bit(&mut self, one: bool, speed: u16) -> bool {
        if self.bits >= MAX_TRACK_BITS {
            return false;
        }
        let byte = (self.bits / 8) as usize;
        if byte >= self.samples.len() {
            self.samples.push(MfmSample::default());
        }
        let sample = &mut self.samples[byte];
        sample.data = (sample.data << 1) | u8::from(one);
        sample.speed = sample.speed.saturating_add(speed);
        self.bits += 1;
        true
    }

    /// Shifts a trailing partial byte up to MSB order so it reads like
    /// a complete one, padding the missing bits' speed as nominal. The
    /// bit count stays exact.
    fn finish_partial(&mut self) {
        self.aligned = true;
        let rem = (self.bits % 8) as u8;
        if rem == 0 {
            return;
        }
        let shift = 8 - rem;
        let sample = &mut self.samples[(self.bits / 8) as usize];
        sample.data <<= shift;
        sample.speed = sample
            .speed
            .saturating_add(u16::from(shift) * NOMINAL_SPEED);
    }

    /// True when `pos` falls inside a still-building trailing byte,
    /// which holds its bits right-aligned until [`Self::finish_partial`].
    fn in_building_byte(&self, pos: u32) -> bool {
        !self.aligned && pos / 8 == self.bits / 8
    }

    /// Reads a bit, coping with a still-building trailing byte.
    pub fn bit_at(&self, pos: u32) -> bool {
        if pos >= self.bits {
            return false;
        }
        let filled = if self.in_building_byte(pos) {
            (self.bits % 8) as u8
        } else {
            8
        };
        let shift = filled - 1 - (pos % 8) as u8;
        (self.samples[(pos / 8) as usize].data >> shift) & 1 != 0
    }

    /// Summed per-bit speed of the byte containing `pos`, normalized to
    /// a full byte's worth.
    pub fn speed_at(&self, pos: u32) -> Option<u16> {
        if pos >= self.bits {
            return None;
        }
        let filled = if self.in_building_byte(pos) {
            u32::from(self.bits % 8)
        } else {
            8
        };
        let speed = u32::from(self.samples[(pos / 8) as usize].speed) * 8 / filled;
        Some(speed.min(u32::from(u16::MAX)) as u16)
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.bits = 0;
        self.ready = false;
        self.aligned = false;
    }
}

/// Double buffer plus the revolution fingerprint for one track.
#[derive(Debug, Default)]
pub struct CacheEntry {
    pub current: Slot,
    pub next: Slot,
    pub fingerprint: Fingerprint,
}

/// What a promotion attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing was buffered; the stream produced no data
    Empty,
    /// `next` went live as `current`; streaming may continue
    Promoted,
    /// `next` is ready but `current` still holds host data
    Held,
}

/// The whole disk's worth of track buffers.
pub struct TrackCache {
    entries: [[Mutex<CacheEntry>; 2]; MAX_CYLINDERS],
}

impl Default for TrackCache {
    fn default() -> Self {
        Self {
            entries: core::array::from_fn(|_| core::array::from_fn(|_| Mutex::default())),
        }
    }
}

impl TrackCache {
    fn entry(&self, cylinder: u8, side: DiskSide) -> &Mutex<CacheEntry> {
        &self.entries[usize::from(cylinder).min(MAX_CYLINDERS - 1)][side.is_upper() as usize]
    }

    /// Runs `f` with the entry locked.
    pub fn with<R>(&self, cylinder: u8, side: DiskSide, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        f(&mut self.entry(cylinder, side).lock().unwrap())
    }

    /// Appends one spliced run to the `next` slot. Returns false on
    /// overflow, after salvaging the data read so far: the slot is
    /// marked ready and promoted so the host still sees a full buffer.
    pub fn write_run(&self, cylinder: u8, side: DiskSide, run: MfmRun) -> bool {
        let overflowed = self.with(cylinder, side, |e| {
            for _ in 0..=run.run {
                if !e.next.push_bit(false, run.speed) {
                    return true;
                }
            }
            !e.next.push_bit(true, run.speed)
        });

        if overflowed {
            warn!(
                "Track buffer overflow on cylinder {} {}; forcing the revolution closed",
                cylinder, side
            );
            self.save_next(cylinder, side);
            return false;
        }
        true
    }

    /// Closes the revolution building in `next`: marks it ready and
    /// promotes it when the host is not holding `current`.
    pub fn save_next(&self, cylinder: u8, side: DiskSide) -> SaveOutcome {
        self.with(cylinder, side, |e| {
            e.next.finish_partial();
            if e.next.bits == 0 {
                return SaveOutcome::Empty;
            }
            e.next.ready = true;
            if e.current.ready {
                return SaveOutcome::Held;
            }
            std::mem::swap(&mut e.current, &mut e.next);
            e.next.clear();
            SaveOutcome::Promoted
        })
    }

    /// Host-driven buffer switch: promotes unconditionally when a fresh
    /// revolution is waiting.
    pub fn switch_buffer(&self, cylinder: u8, side: DiskSide) -> bool {
        self.with(cylinder, side, |e| {
            if !e.next.ready {
                return false;
            }
            std::mem::swap(&mut e.current, &mut e.next);
            e.next.clear();
            true
        })
    }

    /// Prepares `next` for a fresh background fill.
    pub fn reset_next(&self, cylinder: u8, side: DiskSide) {
        self.with(cylinder, side, |e| e.next.clear());
    }

    /// Discards a partial fill that never completed a revolution.
    pub fn abort_next(&self, cylinder: u8, side: DiskSide) {
        self.with(cylinder, side, |e| {
            if !e.next.ready {
                e.next.clear();
            }
        });
    }

    /// Marks the live buffer stale without touching the in-progress one.
    pub fn invalidate_current(&self, cylinder: u8, side: DiskSide) {
        self.with(cylinder, side, |e| e.current.clear());
    }

    /// Drops both buffers of one track (fingerprint survives).
    pub fn invalidate(&self, cylinder: u8, side: DiskSide) {
        self.with(cylinder, side, |e| {
            e.current.clear();
            e.next.clear();
        });
    }

    /// Full reset: every buffer and every fingerprint.
    pub fn invalidate_all(&self) {
        for cylinder in &self.entries {
            for entry in cylinder {
                let mut e = entry.lock().unwrap();
                e.current.clear();
                e.next.clear();
                e.fingerprint.clear();
            }
        }
    }

    pub fn current_ready(&self, cylinder: u8, side: DiskSide) -> bool {
        self.with(cylinder, side, |e| e.current.ready)
    }

    pub fn next_ready(&self, cylinder: u8, side: DiskSide) -> bool {
        self.with(cylinder, side, |e| e.next.ready)
    }

    /// Bits in the live buffer, if one is ready.
    pub fn current_bits(&self, cylinder: u8, side: DiskSide) -> Option<u32> {
        self.with(cylinder, side, |e| e.current.ready.then_some(e.current.bits))
    }

    /// Bits read so far into the in-progress buffer.
    pub fn next_bits(&self, cylinder: u8, side: DiskSide) -> u32 {
        self.with(cylinder, side, |e| e.next.bits)
    }

    /// Reads from the live buffer only.
    pub fn read_bit_current(&self, cylinder: u8, side: DiskSide, pos: u32) -> Option<bool> {
        self.with(cylinder, side, |e| {
            e.current.ready.then(|| e.current.bit_at(pos))
        })
    }

    /// Reads from the live buffer, falling back to the partial one.
    pub fn read_bit_any(&self, cylinder: u8, side: DiskSide, pos: u32) -> Option<bool> {
        self.with(cylinder, side, |e| {
            if e.current.ready {
                Some(e.current.bit_at(pos))
            } else if pos < e.next.bits {
                Some(e.next.bit_at(pos))
            } else {
                None
            }
        })
    }

    /// Speed lookup with the same fallback as [`Self::read_bit_any`].
    pub fn read_speed_any(&self, cylinder: u8, side: DiskSide, pos: u32) -> Option<u16> {
        self.with(cylinder, side, |e| {
            if e.current.ready {
                e.current.speed_at(pos)
            } else {
                e.next.speed_at(pos)
            }
        })
    }

    pub fn take_fingerprint(&self, cylinder: u8, side: DiskSide) -> Fingerprint {
        self.with(cylinder, side, |e| std::mem::take(&mut e.fingerprint))
    }

    pub fn store_fingerprint(&self, cylinder: u8, side: DiskSide, fingerprint: Fingerprint) {
        self.with(cylinder, side, |e| e.fingerprint = fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: u8) -> MfmRun {
        MfmRun {
            run: code,
            speed: 100,
            at_index: false,
        }
    }

    #[test]
    fn slot_bits_are_msb_first() {
        let mut slot = Slot::default();
        for one in [false, true, false, false, true, false, false, false] {
            slot.push_bit(one, 100);
        }
        assert_eq!(slot.bits(), 8);
        assert!(!slot.bit_at(0));
        assert!(slot.bit_at(1));
        assert!(slot.bit_at(4));
        assert!(!slot.bit_at(7));
        assert_eq!(slot.speed_at(0), Some(800));
    }

    #[test]
    fn slot_partial_byte_reads_in_written_order() {
        let mut slot = Slot::default();
        slot.push_bit(true, 100);
        slot.push_bit(false, 100);
        slot.push_bit(true, 100);
        assert!(slot.bit_at(0));
        assert!(!slot.bit_at(1));
        assert!(slot.bit_at(2));
        assert!(!slot.bit_at(3));

        slot.finish_partial();
        // The exact bit count survives finalization
        assert_eq!(slot.bits(), 3);
        assert!(slot.bit_at(0));
        assert!(!slot.bit_at(1));
        assert!(slot.bit_at(2));
        assert_eq!(slot.speed_at(0), Some(800));
    }

    #[test]
    fn write_run_expands_cells() {
        let cache = TrackCache::default();
        // 001 then 01
        assert!(cache.write_run(0, DiskSide::Lower, run(1)));
        assert!(cache.write_run(0, DiskSide::Lower, run(0)));
        assert_eq!(cache.next_bits(0, DiskSide::Lower), 5);

        cache.save_next(0, DiskSide::Lower);
        assert!(cache.current_ready(0, DiskSide::Lower));
        let bits: Vec<bool> = (0..5)
            .map(|p| cache.read_bit_current(0, DiskSide::Lower, p).unwrap())
            .collect();
        assert_eq!(bits, [false, false, true, false, true]);
    }

    #[test]
    fn save_next_promotes_only_when_current_is_free() {
        let cache = TrackCache::default();
        let side = DiskSide::Upper;

        cache.write_run(1, side, run(0));
        assert_eq!(cache.save_next(1, side), SaveOutcome::Promoted);
        assert!(cache.current_ready(1, side));
        assert!(!cache.next_ready(1, side));

        // Second revolution parks in next
        cache.write_run(1, side, run(3));
        assert_eq!(cache.save_next(1, side), SaveOutcome::Held);
        assert!(cache.next_ready(1, side));

        // Host switches: the parked revolution goes live
        assert!(cache.switch_buffer(1, side));
        assert_eq!(cache.current_bits(1, side), Some(5));
        assert!(!cache.next_ready(1, side));
        assert!(!cache.switch_buffer(1, side));
    }

    #[test]
    fn empty_stream_saves_nothing() {
        let cache = TrackCache::default();
        assert_eq!(cache.save_next(2, DiskSide::Lower), SaveOutcome::Empty);
        assert!(!cache.current_ready(2, DiskSide::Lower));
    }

    #[test]
    fn overflow_salvages_a_full_buffer() {
        let cache = TrackCache::default();
        let side = DiskSide::Lower;

        let mut aborted = false;
        for _ in 0..MAX_TRACK_BITS {
            if !cache.write_run(3, side, run(3)) {
                aborted = true;
                break;
            }
        }
        assert!(aborted);
        // The salvaged buffer went live and respects the size bound
        let bits = cache.current_bits(3, side).unwrap();
        assert!(bits > 0 && bits <= MAX_TRACK_BITS);
    }

    #[test]
    fn invalidate_clears_buffers_but_keeps_fingerprint() {
        let cache = TrackCache::default();
        let side = DiskSide::Lower;
        cache.store_fingerprint(4, side, vec![1; 32]);
        cache.write_run(4, side, run(0));
        cache.save_next(4, side);

        cache.invalidate(4, side);
        assert!(!cache.current_ready(4, side));
        assert_eq!(cache.next_bits(4, side), 0);
        assert_eq!(cache.take_fingerprint(4, side).len(), 32);
    }

    #[test]
    fn invalidate_all_wipes_fingerprints_too() {
        let cache = TrackCache::default();
        cache.store_fingerprint(5, DiskSide::Upper, vec![2; 32]);
        cache.invalidate_all();
        assert!(cache.take_fingerprint(5, DiskSide::Upper).is_empty());
    }

    #[test]
    fn read_bit_any_falls_back_to_partial_data() {
        let cache = TrackCache::default();
        let side = DiskSide::Lower;

        cache.write_run(6, side, run(0)); // 01
        assert_eq!(cache.read_bit_any(6, side, 0), Some(false));
        assert_eq!(cache.read_bit_any(6, side, 1), Some(true));
        assert_eq!(cache.read_bit_any(6, side, 2), None);

        cache.save_next(6, side);
        assert_eq!(cache.read_bit_any(6, side, 1), Some(true));
    }
}
