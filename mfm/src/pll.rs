//! Software PLL: turns a stream of flux transition timings into MFM
//! bit-cell runs.
//!
//! The accumulator carries across sub-threshold transitions so that a
//! glitchy short flux merges into the following cell instead of
//! producing a phantom run.

use crate::{ticks_to_ns, MfmRun, BITCELL_NS};

/// Longest run code we emit; anything slower collapses to `00001`.
pub const MAX_RUN: u8 = 3;

/// Decoder state for one read stream. Reset between streams, never
/// across them.
#[derive(Debug)]
pub struct Pll {
    sample_freq: u32,
    ticks: u32,
    index_pending: bool,
}

impl Pll {
    pub fn new(sample_freq: u32) -> Self {
        Self {
            sample_freq,
            ticks: 0,
            index_pending: false,
        }
    }

    /// Marks that the hardware index pulse fired; the next emitted run
    /// will carry `at_index`.
    pub fn mark_index(&mut self) {
        self.index_pending = true;
    }

    /// Adds a fluxless gap (variant-F `Space` opcode) to the accumulator.
    pub fn add_space(&mut self, ticks: u32) {
        self.ticks = self.ticks.saturating_add(ticks);
    }

    /// Feeds one flux transition, `ticks` after the previous one.
    /// Returns a run once enough time has accumulated for at least one
    /// whole bit cell.
    pub fn push_flux(&mut self, ticks: u32) -> Option<MfmRun> {
        self.ticks = self.ticks.saturating_add(ticks);

        let ns = ticks_to_ns(self.ticks, self.sample_freq);
        if ns <= u64::from(BITCELL_NS) {
            return None;
        }
        self.ticks = 0;

        // Zero cells before the terminating one, rounded to the nearest
        // cell boundary. A transition inside the first half of cell two
        // still counts as a single zero.
        let zeros = ((ns - u64::from(BITCELL_NS) / 2) / u64::from(BITCELL_NS)).max(1);
        let run = (zeros - 1).min(u64::from(MAX_RUN)) as u8;

        let speed = (ns * 100 / (u64::from(run) + 2) / u64::from(BITCELL_NS)).min(2000) as u16;

        Some(MfmRun {
            run,
            speed,
            at_index: std::mem::take(&mut self.index_pending),
        })
    }
}
