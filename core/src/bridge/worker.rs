//! The background worker: sole owner of the controller.
//!
//! One loop iteration services at most one queued command; idle time
//! goes into keeping the track cache fresh, polling for disk changes
//! and finishing the simulated motor spin-up.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;

use fluxbridge_mfm::encode::PRECOMP_START_CYLINDER;
use fluxbridge_mfm::splice::SpliceSink;
use fluxbridge_mfm::MfmRun;

use crate::cache::SaveOutcome;
use crate::proto::{DiskSide, FloppyController, ProtocolError, SeekSpeed};

use super::comm::QueueCommand;
use super::{Shared, SPINUP_TIME};

/// Disk-change poll intervals: hardware with fast sense checks often,
/// anything else rarely because sensing disturbs the drive.
const DISK_CHECK_PRESENT_FAST: Duration = Duration::from_millis(500);
const DISK_CHECK_EMPTY_FAST: Duration = Duration::from_millis(2500);
const DISK_CHECK_SLOW: Duration = Duration::from_millis(3000);

pub(super) fn run(io: Box<dyn FloppyController>, shared: Arc<Shared>) {
    let fast_disk_check = io.info().fast_disk_check;
    let mut worker = Worker {
        io,
        shared,
        fast_disk_check,
        physical_cylinder: 0,
        physical_side: DiskSide::Lower,
        spinning_up: false,
        spin_started: Instant::now(),
        last_disk_check: Instant::now(),
        disk_was_present: false,
    };

    debug!("Bridge worker running");
    worker.main_loop();
    worker.io.shutdown();
    debug!("Bridge worker stopped");
}

struct Worker {
    io: Box<dyn FloppyController>,
    shared: Arc<Shared>,
    fast_disk_check: bool,

    /// Where the drive head actually is (the host's view may run ahead)
    physical_cylinder: u8,
    physical_side: DiskSide,

    spinning_up: bool,
    spin_started: Instant,
    last_disk_check: Instant,
    disk_was_present: bool,
}

impl Worker {
    fn main_loop(&mut self) {
        self.disk_was_present = self.shared.disk_present.load(Ordering::Relaxed);

        loop {
            let timeout = if self.shared.motor_ready.load(Ordering::Relaxed) {
                Duration::from_millis(1)
            } else {
                Duration::from_millis(250)
            };

            if self.shared.queue.wait(timeout) {
                match self.shared.queue.pop() {
                    Some(QueueCommand::Terminate) => return,
                    Some(cmd) => self.dispatch(cmd),
                    None => (),
                }
            } else {
                self.idle();
            }
        }
    }

    fn idle(&mut self) {
        if self.shared.motor_ready.load(Ordering::Relaxed) && !self.shared.streaming_paused() {
            self.background_read();
        }

        // Periodic disk-change poll, but never while commands wait
        let present = self.shared.disk_present.load(Ordering::Relaxed);
        let interval = match (self.fast_disk_check, present) {
            (true, true) => DISK_CHECK_PRESENT_FAST,
            (true, false) => DISK_CHECK_EMPTY_FAST,
            (false, _) => DISK_CHECK_SLOW,
        };
        if self.last_disk_check.elapsed() > interval && self.shared.queue.is_empty() {
            self.last_disk_check = Instant::now();
            match self.io.check_disk(true) {
                Ok(state) => {
                    self.shared
                        .disk_present
                        .store(state.present, Ordering::Relaxed);
                    self.shared
                        .write_protected
                        .store(state.write_protected, Ordering::Relaxed);
                }
                Err(e) => warn!("Disk sense failed: {}", e),
            }
        }

        if self.spinning_up && self.spin_started.elapsed() >= SPINUP_TIME {
            self.spinning_up = false;
            self.shared.motor_ready.store(true, Ordering::Relaxed);
            self.shared.stamp_step();
        }

        // React to the disk going away
        let present = self.shared.disk_present.load(Ordering::Relaxed);
        if self.disk_was_present != present {
            self.disk_was_present = present;
            if !present {
                info!("Disk removed; track cache flushed");
                self.shared.cache.invalidate_all();
                self.shared.buffer_available.reset();
            }
        }
    }

    fn dispatch(&mut self, cmd: QueueCommand) {
        trace!("Worker command: {}", cmd);
        match cmd {
            QueueCommand::Terminate => unreachable!("handled by the main loop"),

            QueueCommand::MotorOn => {
                // The controller-side wait is skipped; the bridge
                // simulates spin-up so the host is never blocked
                if let Err(e) = self.io.enable_motor(true, true) {
                    warn!("Motor on failed: {}", e);
                }
                self.spinning_up = true;
                self.spin_started = Instant::now();
            }

            QueueCommand::MotorOff => {
                if let Err(e) = self.io.enable_motor(false, false) {
                    warn!("Motor off failed: {}", e);
                }
                self.spinning_up = false;
                self.shared.motor_ready.store(false, Ordering::Relaxed);
            }

            QueueCommand::GotoCylinder(cylinder) => {
                self.shared.stamp_step();
                // While spinning up the drive cannot sense reliably
                let skip_check =
                    self.spinning_up && !self.shared.motor_ready.load(Ordering::Relaxed);

                match self
                    .io
                    .select_cylinder(cylinder, SeekSpeed::Normal, skip_check)
                {
                    Ok(report) => {
                        if let Some(present) = report.disk_present {
                            self.shared.disk_present.store(present, Ordering::Relaxed);
                        }
                        if let Some(wp) = report.write_protected {
                            self.shared.write_protected.store(wp, Ordering::Relaxed);
                        }
                    }
                    Err(e) => warn!("Seek to cylinder {} failed: {}", cylinder, e),
                }
                if !skip_check {
                    self.last_disk_check = Instant::now();
                }
                self.physical_cylinder = cylinder;
                self.shared.stamp_step();
            }

            QueueCommand::SelectSide(side) => {
                self.shared.stamp_step();
                if let Err(e) = self.io.select_side(side) {
                    warn!("Head select failed: {}", e);
                }
                self.physical_side = side;
            }

            QueueCommand::WriteTrack => self.write_pending_track(),
        }
    }

    fn write_pending_track(&mut self) {
        let Some(job) = self.shared.write_jobs.lock().unwrap().pop_front() else {
            return;
        };
        if job.bits == 0 {
            return;
        }

        if self.physical_cylinder != job.cylinder {
            if let Err(e) = self
                .io
                .select_cylinder(job.cylinder, SeekSpeed::Fast, false)
            {
                warn!("Seek for write failed: {}", e);
            }
            self.physical_cylinder = job.cylinder;
        }
        if self.physical_side != job.side {
            if let Err(e) = self.io.select_side(job.side) {
                warn!("Head select for write failed: {}", e);
            }
            self.physical_side = job.side;
        }

        let precomp = job.cylinder >= PRECOMP_START_CYLINDER;
        match self
            .io
            .write_track(&job.mfm, job.bits, job.align_to_index, precomp)
        {
            Ok(()) => debug!(
                "Wrote {} bits to cylinder {} {}",
                job.bits, job.cylinder, job.side
            ),
            Err(ProtocolError::WriteProtected) => {
                warn!("Write refused: disk is write protected");
                self.shared.write_protected.store(true, Ordering::Relaxed);
            }
            Err(e) => warn!("Track write failed: {}", e),
        }

        // Whatever was cached for this track no longer matches the disk
        self.shared.cache.invalidate_current(job.cylinder, job.side);
        self.shared.stamp_step();
        self.shared.clear_streaming_pause();
    }

    /// Keeps the addressed track's `next` buffer filled while idle.
    fn background_read(&mut self) {
        let (cylinder, side) = (self.physical_cylinder, self.physical_side);

        if self.shared.cache.next_ready(cylinder, side) {
            if !self.shared.cache.current_ready(cylinder, side) {
                // Promotion should have drained next before reads
                // stopped; something let both buffers fill
                error!("Track cache holds two ready buffers for cylinder {} {}", cylinder, side);
            }
            return;
        }

        self.shared.cancel.clear();
        if let Err(e) = self.io.select_side(side) {
            warn!("Head select before read failed: {}", e);
            return;
        }
        self.shared.cache.reset_next(cylinder, side);

        let mut fingerprint = self.shared.cache.take_fingerprint(cylinder, side);
        let mut sink = CacheSink {
            shared: &self.shared,
            cylinder,
            side,
        };

        let result = self
            .io
            .read_track_stream(1, &mut fingerprint, &mut sink);
        self.shared.cache.store_fingerprint(cylinder, side, fingerprint);
        // A partial revolution is worthless; only promise data we have
        self.shared.cache.abort_next(cylinder, side);

        match result {
            Ok(()) => (),
            Err(ProtocolError::NoDiskInDrive) => {
                self.shared.disk_present.store(false, Ordering::Relaxed);
            }
            Err(ProtocolError::Transport(e)) => debug!("Read stream ended: {}", e),
            Err(e) => warn!("Read stream failed: {}", e),
        }

        self.last_disk_check = Instant::now();
    }
}

/// Splice sink writing straight into the track cache, aborting as soon
/// as the host queues any command.
struct CacheSink<'a> {
    shared: &'a Shared,
    cylinder: u8,
    side: DiskSide,
}

impl SpliceSink for CacheSink<'_> {
    fn push_run(&mut self, run: MfmRun) -> bool {
        if self.shared.cancel.cancelled() || !self.shared.queue.is_empty() {
            return false;
        }
        self.shared.cache.write_run(self.cylinder, self.side, run)
    }

    fn end_revolution(&mut self) -> bool {
        match self.shared.cache.save_next(self.cylinder, self.side) {
            SaveOutcome::Promoted => {
                if self.shared.host_position() == (self.cylinder, self.side) {
                    self.shared.buffer_available.set();
                }
                true
            }
            // Keep streaming over an empty revolution; stop when the
            // host still owns the previous buffer
            SaveOutcome::Empty => true,
            SaveOutcome::Held => false,
        }
    }
}
