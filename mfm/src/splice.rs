//! Index-aligned revolution splicing.
//!
//! Hardware index pulses drift by a few bit cells from revolution to
//! revolution. Cutting the stream raw on the pulse would insert or drop
//! cells every lap and wreck the host's bit-clock simulation, so the
//! splicer fingerprints the runs just after an index and re-locates that
//! fingerprint with a sliding-window correlator at every subsequent
//! pulse, cutting each revolution on the same bit boundary.

use log::*;

use crate::{Fingerprint, MfmRun};

/// Fingerprint length, in runs.
pub const WINDOW: usize = 32;

/// Lookahead kept on both sides of a suspected cut point.
pub const LOOKAHEAD: usize = WINDOW * 2;

/// Ring capacity; sized so a full lookahead plus a cut remainder fits.
const QUEUE_SIZE: usize = WINDOW * 4;

/// Where spliced runs go. `push_run` and `end_revolution` return false
/// to abort the stream.
pub trait SpliceSink {
    /// Appends one run to the revolution being assembled.
    fn push_run(&mut self, run: MfmRun) -> bool;

    /// Closes a byte-aligned revolution. Returning false stops the
    /// stream (the consumer has no room for another revolution).
    fn end_revolution(&mut self) -> bool;
}

/// Fixed-size ring buffer for the splicer queues. The hot path must not
/// allocate per run, and the queues are bounded by design.
#[derive(Debug, Clone)]
pub struct FastQueue<T: Copy + Default> {
    buf: [T; QUEUE_SIZE],
    read: usize,
    len: usize,
}

impl<T: Copy + Default> Default for FastQueue<T> {
    fn default() -> Self {
        Self {
            buf: [T::default(); QUEUE_SIZE],
            read: 0,
            len: 0,
        }
    }
}

impl<T: Copy + Default> FastQueue<T> {
    pub fn push(&mut self, value: T) {
        if self.len >= QUEUE_SIZE {
            warn!("Splice queue overflow, dropping run");
            return;
        }
        self.buf[(self.read + self.len) % QUEUE_SIZE] = value;
        self.len += 1;
    }

    /// Pushes, evicting from the front to keep at most `bound` entries.
    pub fn push_bounded(&mut self, bound: usize, value: T) {
        self.push(value);
        while self.len > bound {
            self.pop();
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.buf[self.read];
        self.read = (self.read + 1) % QUEUE_SIZE;
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).map(move |i| &self.buf[(self.read + i) % QUEUE_SIZE])
    }
}

/// Finds the cut point: the offset into `head ++ tail` where
/// `fingerprint` matches best. Scanning fans outward from the midpoint
/// (where the raw index pulse landed) so near misses beat far ones, and
/// short-circuits on a perfect score.
fn locate_cut(fingerprint: &[u8], head: &FastQueue<MfmRun>, tail: &FastQueue<MfmRun>) -> usize {
    if fingerprint.len() < WINDOW || head.len() < WINDOW || tail.len() < WINDOW {
        return 0;
    }

    let area: Vec<u8> = head
        .iter()
        .map(|r| r.run)
        .chain(tail.iter().map(|r| r.run))
        .collect();

    let mut best_index = head.len() - 1;
    let mut best_score = 0;
    let mid = (area.len() - fingerprint.len()) / 2;

    for offset in 0..=mid {
        for start in [mid - offset, mid + offset] {
            let score = fingerprint
                .iter()
                .zip(&area[start..])
                .filter(|(f, a)| f == a)
                .count();
            if score > best_score {
                best_index = start;
                best_score = score;
                if score == fingerprint.len() {
                    return best_index;
                }
            }
        }
    }

    best_index
}

/// Stream splicer state for one read stream.
///
/// Runs flow in through [`Splicer::push`]; byte-aligned revolutions flow
/// out through the [`SpliceSink`]. The fingerprint passed in (from a
/// previous stream over the same track) corrects the very first cut;
/// it is re-captured after every cut and handed back through
/// [`Splicer::into_fingerprint`] for the next stream.
pub struct Splicer {
    fingerprint: Fingerprint,
    old: FastQueue<MfmRun>,
    current: FastQueue<MfmRun>,
    future: FastQueue<MfmRun>,
    prior_available: bool,
    origin_found: bool,
    skip_index: usize,
    revolutions: u32,
    max_revolutions: u32,
}

impl Splicer {
    pub fn new(mut fingerprint: Fingerprint, max_revolutions: u32) -> Self {
        // A short fingerprint is useless for correlation
        if fingerprint.len() < WINDOW {
            fingerprint.clear();
        }
        let prior_available = !fingerprint.is_empty();

        Self {
            fingerprint,
            old: FastQueue::default(),
            current: FastQueue::default(),
            future: FastQueue::default(),
            prior_available,
            origin_found: false,
            skip_index: 0,
            revolutions: 0,
            max_revolutions,
        }
    }

    /// Feeds one decoded run. Returns false when the sink aborted.
    pub fn push(&mut self, run: MfmRun, sink: &mut dyn SpliceSink) -> bool {
        self.future.push(run);
        self.process(LOOKAHEAD, sink)
    }

    /// Drains the lookahead at end of stream.
    pub fn finish(&mut self, sink: &mut dyn SpliceSink) -> bool {
        self.process(0, sink)
    }

    /// Hands back the (possibly re-captured) fingerprint.
    pub fn into_fingerprint(self) -> Fingerprint {
        self.fingerprint
    }

    fn process(&mut self, limit: usize, sink: &mut dyn SpliceSink) -> bool {
        while self.future.len() > limit {
            let next = self.future.pop().unwrap();

            if self.origin_found {
                self.current.push(next);
                while self.current.len() > limit {
                    let out = self.current.pop().unwrap();
                    if !sink.push_run(out) {
                        return false;
                    }
                }
            } else if self.prior_available && !self.fingerprint.is_empty() {
                // Keep a tail of pre-index runs; the first index pulse may
                // land late and the real cut can lie behind it
                self.old.push_bounded(LOOKAHEAD, next);
            }

            if self.origin_found && self.fingerprint.len() < WINDOW {
                self.fingerprint.push(next.run);
            }

            if self.skip_index > 0 {
                self.skip_index -= 1;
            }
            if next.at_index && self.skip_index == 0 {
                if !self.origin_found {
                    self.first_index(next);
                } else if !self.cut_revolution(sink) {
                    return false;
                }
            }
        }
        true
    }

    /// The first index pulse of the stream: either correct it against
    /// the prior fingerprint, or adopt it as the new origin.
    fn first_index(&mut self, next: MfmRun) {
        if self.prior_available && !self.old.is_empty() {
            let mut cut = locate_cut(&self.fingerprint, &self.old, &self.future);
            // Everything before the cut is a partial revolution; drop it
            while cut > 0 && self.old.pop().is_some() {
                cut -= 1;
            }
            while cut > 0 && self.future.pop().is_some() {
                cut -= 1;
            }
            std::mem::swap(&mut self.current, &mut self.old);
            self.old.clear();
        } else {
            if self.fingerprint.len() < WINDOW {
                self.fingerprint.push(next.run);
            }
            self.current.push(next);
        }
        self.origin_found = true;
    }

    /// A subsequent index pulse: locate the repeatable cut, emit the
    /// runs that close the revolution, then roll the remainder over
    /// into the next one.
    fn cut_revolution(&mut self, sink: &mut dyn SpliceSink) -> bool {
        self.revolutions += 1;

        let mut cut = locate_cut(&self.fingerprint, &self.current, &self.future);
        while cut > 0 {
            let Some(out) = self.current.pop().or_else(|| self.future.pop()) else {
                break;
            };
            if !sink.push_run(out) {
                return false;
            }
            cut -= 1;
        }

        if self.revolutions >= self.max_revolutions {
            self.revolutions = 0;
            if !sink.end_revolution() {
                // The consumer is full. Rebuild the fingerprint from the
                // runs still queued (the start of the next revolution) so
                // the next stream re-aligns to the same boundary.
                if self.current.len() + self.future.len() >= WINDOW {
                    self.fingerprint.clear();
                    while let Some(run) = self.future.pop() {
                        self.current.push(run);
                    }
                    while self.fingerprint.len() < WINDOW {
                        let Some(run) = self.current.pop() else { break };
                        self.fingerprint.push(run.run);
                    }
                }
                return false;
            }
        }

        // Requeue the remainder; it re-enters processing as the start of
        // the next revolution. skip_index keeps the index flag that
        // triggered this cut from firing again on the second pass.
        while let Some(run) = self.future.pop() {
            self.current.push(run);
        }
        std::mem::swap(&mut self.current, &mut self.future);
        self.fingerprint.clear();
        self.skip_index = self.future.len() + 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastqueue_push_pop_wraps() {
        let mut q: FastQueue<u32> = FastQueue::default();
        for round in 0..5u32 {
            for i in 0..100 {
                q.push(round * 1000 + i);
            }
            for i in 0..100 {
                assert_eq!(q.pop(), Some(round * 1000 + i));
            }
        }
        assert!(q.is_empty());
    }

    #[test]
    fn fastqueue_bounded_push_evicts_oldest() {
        let mut q: FastQueue<u32> = FastQueue::default();
        for i in 0..80 {
            q.push_bounded(64, i);
        }
        assert_eq!(q.len(), 64);
        assert_eq!(q.pop(), Some(16));
    }

    fn run(code: u8) -> MfmRun {
        MfmRun {
            run: code,
            speed: 100,
            at_index: false,
        }
    }

    /// Deterministic pseudo-random run codes.
    fn pattern(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 13) as u8 & 3
            })
            .collect()
    }

    #[test]
    fn correlator_finds_exact_match() {
        let pat = pattern(QUEUE_SIZE);
        let mut head: FastQueue<MfmRun> = FastQueue::default();
        let mut tail: FastQueue<MfmRun> = FastQueue::default();
        for &c in &pat[..LOOKAHEAD] {
            head.push(run(c));
        }
        for &c in &pat[LOOKAHEAD..] {
            tail.push(run(c));
        }

        // Fingerprint taken 5 runs before the midpoint must be located there
        let mid = (pat.len() - WINDOW) / 2;
        let fp: Fingerprint = pat[mid - 5..mid - 5 + WINDOW].to_vec();
        assert_eq!(locate_cut(&fp, &head, &tail), mid - 5);

        let fp: Fingerprint = pat[mid + 3..mid + 3 + WINDOW].to_vec();
        assert_eq!(locate_cut(&fp, &head, &tail), mid + 3);
    }

    #[test]
    fn correlator_requires_full_queues() {
        let mut head: FastQueue<MfmRun> = FastQueue::default();
        let tail: FastQueue<MfmRun> = FastQueue::default();
        head.push(run(1));
        assert_eq!(locate_cut(&vec![0; WINDOW], &head, &tail), 0);
    }

    /// Collects spliced output per revolution.
    #[derive(Default)]
    struct CollectSink {
        revolutions: Vec<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl SpliceSink for CollectSink {
        fn push_run(&mut self, run: MfmRun) -> bool {
            self.pending.push(run.run);
            true
        }

        fn end_revolution(&mut self) -> bool {
            self.revolutions.push(std::mem::take(&mut self.pending));
            true
        }
    }

    /// Streams `revs` revolutions of a repeating pattern with jittered
    /// index pulses through a splicer.
    fn splice_with_jitter(pat: &[u8], revs: usize, jitter: &[i32], fp: Fingerprint) -> CollectSink {
        let n = pat.len() as i32;
        // Stream starts a third of a revolution after the index
        let phase = n / 3;
        let index_positions: Vec<i32> = (1..=revs as i32)
            .map(|k| k * n - phase + jitter[(k as usize - 1) % jitter.len()])
            .collect();

        let mut splicer = Splicer::new(fp, 1);
        let mut sink = CollectSink::default();

        let total = (revs as i32 + 2) * n;
        for pos in 0..total {
            let mut r = run(pat[((pos + phase).rem_euclid(n)) as usize]);
            r.at_index = index_positions.contains(&pos);
            if !splicer.push(r, &mut sink) {
                break;
            }
        }
        splicer.finish(&mut sink);
        sink
    }

    #[test]
    fn splicer_emits_stable_revolutions_despite_index_jitter() {
        let pat = pattern(400);
        let sink = splice_with_jitter(&pat, 8, &[0, 2, -3, 1, 3, -2, -1, 0], Fingerprint::new());

        assert!(sink.revolutions.len() >= 6);
        // Every revolution after the first has exactly the true length
        // and identical content
        for rev in &sink.revolutions[1..] {
            assert_eq!(rev.len(), pat.len());
            assert_eq!(rev, &sink.revolutions[1]);
        }
    }

    #[test]
    fn splicer_honors_prior_fingerprint_on_first_index() {
        let pat = pattern(400);
        // First pass, no prior knowledge: captures a fingerprint
        let mut splicer = Splicer::new(Fingerprint::new(), 1);
        let mut sink = CollectSink::default();
        let n = pat.len() as i32;
        for pos in 0..3 * n {
            let mut r = run(pat[(pos.rem_euclid(n)) as usize]);
            r.at_index = pos == n || pos == 2 * n;
            if !splicer.push(r, &mut sink) {
                break;
            }
        }
        let fp = splicer.into_fingerprint();
        assert_eq!(fp.len(), WINDOW);

        // Second pass with the fingerprint and a badly jittered first
        // index: output still cuts to the exact revolution length
        let sink = splice_with_jitter(&pat, 6, &[3, -3, 2, -2, 1, 0], fp);
        assert!(sink.revolutions.len() >= 4);
        for rev in &sink.revolutions[1..] {
            assert_eq!(rev.len(), pat.len());
        }
    }

    #[test]
    fn splicer_stops_when_sink_is_full() {
        struct OneShotSink {
            runs: usize,
            revolutions: usize,
        }
        impl SpliceSink for OneShotSink {
            fn push_run(&mut self, _run: MfmRun) -> bool {
                self.runs += 1;
                true
            }
            fn end_revolution(&mut self) -> bool {
                self.revolutions += 1;
                false
            }
        }

        let pat = pattern(300);
        let n = pat.len() as i32;
        let mut splicer = Splicer::new(Fingerprint::new(), 1);
        let mut sink = OneShotSink {
            runs: 0,
            revolutions: 0,
        };

        let mut aborted = false;
        for pos in 0..5 * n {
            let mut r = run(pat[(pos.rem_euclid(n)) as usize]);
            r.at_index = pos % n == 0 && pos > 0;
            if !splicer.push(r, &mut sink) {
                aborted = true;
                break;
            }
        }
        assert!(aborted);
        assert_eq!(sink.revolutions, 1);
        // The splicer left a fresh fingerprint behind for the next stream
        assert_eq!(splicer.into_fingerprint().len(), WINDOW);
    }
}
