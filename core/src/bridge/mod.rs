//! The bridge controller: owns the hardware through a single background
//! worker and exposes the synchronous bit-level API the host emulator
//! calls.
//!
//! Everything host-visible here must return quickly; the worker does
//! all the serial I/O. The only sanctioned host-side wait is
//! `read_bit` blocking briefly for the first revolution of a freshly
//! seeked track.

pub mod comm;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};

use crate::cache::TrackCache;
use crate::proto::ascii::AsciiController;
use crate::proto::framed::FramedController;
use crate::proto::{DiskSide, FloppyController, ProtocolError};
use crate::serial::port_name;
use crate::types::{CancelToken, SignalEvent};
use crate::writebuf::{TrackWriteBuffer, WriteJob};

use comm::{CommandQueue, QueueCommand};

/// Cylinder count the bridge reports to the host.
pub const BRIDGE_CYLINDERS: u8 = 82;

/// Shortest revolution a DD disk can physically have (300rpm +3%
/// spindle tolerance), in bits. Reported while no real data exists yet.
pub const MIN_TRACK_BITS: u32 = 12134 * 8;

/// Simulated motor spin-up time.
const SPINUP_TIME: Duration = Duration::from_millis(750);

/// After a head step or side change, reads return nothing for this
/// long, simulating the head settling.
const STEP_GRACE_MS: u64 = 500;

/// How long `read_bit` may stall the host waiting for a revolution.
const READ_WAIT: Duration = Duration::from_millis(600);
const READ_WAIT_STEP: Duration = Duration::from_millis(5);

/// Host write activity pauses background streaming for this long.
const WRITE_PAUSE_MS: u64 = 100;

/// Which controller family to drive, and where to find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerSelect {
    /// ASCII-command microcontroller on a numbered serial port
    Ascii { port: u8 },
    /// Auto-detected flux controller; drive unit A or B
    Framed { use_drive_a: bool },
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub controller: ControllerSelect,
}

impl BridgeConfig {
    /// Maps a host device-settings word onto a configuration: the low
    /// nibble plus one selects the serial port (ASCII family) or the
    /// drive unit (flux family).
    pub fn from_device_settings(ascii: bool, settings: u32) -> Self {
        let nibble = (settings & 0x0F) as u8 + 1;
        let controller = if ascii {
            ControllerSelect::Ascii { port: nibble }
        } else {
            ControllerSelect::Framed {
                use_drive_a: nibble == 1,
            }
        };
        Self { controller }
    }
}

/// Drive geometry presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveTypeId {
    DoubleDensity35,
}

/// State shared between the host thread and the worker.
pub(crate) struct Shared {
    pub cache: TrackCache,
    pub queue: CommandQueue,
    pub write_jobs: Mutex<VecDeque<WriteJob>>,
    pub buffer_available: SignalEvent,
    pub cancel: CancelToken,

    epoch: Instant,
    pub disk_present: AtomicBool,
    pub write_protected: AtomicBool,
    pub motor_ready: AtomicBool,
    host_cylinder: AtomicU8,
    host_side_upper: AtomicBool,
    last_step_ms: AtomicU64,
    pause_until_ms: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            cache: TrackCache::default(),
            queue: CommandQueue::default(),
            write_jobs: Mutex::new(VecDeque::new()),
            buffer_available: SignalEvent::default(),
            cancel: CancelToken::default(),
            epoch: Instant::now(),
            disk_present: AtomicBool::new(false),
            write_protected: AtomicBool::new(true),
            motor_ready: AtomicBool::new(false),
            host_cylinder: AtomicU8::new(0),
            host_side_upper: AtomicBool::new(false),
            last_step_ms: AtomicU64::new(0),
            pause_until_ms: AtomicU64::new(0),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Stamps "the head just moved"; starts the read grace window.
    pub fn stamp_step(&self) {
        self.last_step_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn step_grace_active(&self) -> bool {
        self.now_ms() - self.last_step_ms.load(Ordering::Relaxed) < STEP_GRACE_MS
    }

    fn pause_streaming(&self) {
        self.pause_until_ms
            .store(self.now_ms() + WRITE_PAUSE_MS, Ordering::Relaxed);
    }

    pub fn clear_streaming_pause(&self) {
        self.pause_until_ms.store(0, Ordering::Relaxed);
    }

    pub fn streaming_paused(&self) -> bool {
        self.now_ms() < self.pause_until_ms.load(Ordering::Relaxed)
    }

    /// Track the host currently addresses.
    pub fn host_position(&self) -> (u8, DiskSide) {
        (
            self.host_cylinder.load(Ordering::Relaxed),
            DiskSide::from_upper(self.host_side_upper.load(Ordering::Relaxed)),
        )
    }
}

/// Builds a fresh controller connection; run once per `initialise`.
pub type ControllerFactory =
    Box<dyn FnMut() -> std::result::Result<Box<dyn FloppyController>, ProtocolError> + Send>;

/// A bit-level floppy drive bridge over a USB controller.
///
/// All methods are meant to be called from the host's drive-emulation
/// thread; the heavy lifting happens on the internal worker.
pub struct FluxBridge {
    factory: ControllerFactory,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    write_buffer: TrackWriteBuffer,
    motor_running: bool,
    last_error: String,
}

impl FluxBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let factory: ControllerFactory = Box::new(move || {
            Ok(match &config.controller {
                ControllerSelect::Ascii { port } => {
                    Box::new(AsciiController::open(&port_name(*port))?) as Box<dyn FloppyController>
                }
                ControllerSelect::Framed { use_drive_a } => {
                    Box::new(FramedController::open(*use_drive_a)?) as Box<dyn FloppyController>
                }
            })
        });
        Self::with_controller(factory)
    }

    /// Builds a bridge over a custom controller source; the factory is
    /// invoked on every `initialise`.
    pub fn with_controller(factory: ControllerFactory) -> Self {
        Self {
            factory,
            shared: Arc::new(Shared::new()),
            worker: None,
            write_buffer: TrackWriteBuffer::default(),
            motor_running: false,
            last_error: String::new(),
        }
    }

    /// Connects to the hardware and starts the worker. On failure the
    /// reason is available through [`Self::last_error`].
    pub fn initialise(&mut self) -> bool {
        if self.worker.is_some() {
            self.terminate();
        }

        // Fresh shared state: empty cache, clear queue, no stale flags
        self.shared = Arc::new(Shared::new());
        self.write_buffer.reset();
        self.motor_running = false;
        self.last_error.clear();

        match self.open_controller() {
            Ok(io) => {
                let shared = self.shared.clone();
                match thread::Builder::new()
                    .name("fluxbridge".into())
                    .spawn(move || worker::run(io, shared))
                {
                    Ok(handle) => {
                        self.worker = Some(handle);
                        true
                    }
                    Err(e) => {
                        self.last_error = format!("Cannot start the bridge worker: {}", e);
                        false
                    }
                }
            }
            Err(e) => {
                self.last_error = format!("{:#}", e);
                error!("Bridge initialisation failed: {:#}", e);
                false
            }
        }
    }

    fn open_controller(&mut self) -> Result<Box<dyn FloppyController>> {
        let mut io = (self.factory)().context("Cannot connect to the floppy controller")?;

        io.find_track0().context("Drive rewind failed")?;
        let state = io.check_disk(true).context("Disk sense failed")?;
        self.shared
            .disk_present
            .store(state.present, Ordering::Relaxed);
        self.shared
            .write_protected
            .store(state.write_protected, Ordering::Relaxed);
        io.select_side(DiskSide::Lower)
            .context("Head select failed")?;

        info!(
            "Bridge connected: firmware {}, disk {}",
            io.info().firmware,
            if state.present { "present" } else { "absent" }
        );
        Ok(io)
    }

    /// Stops the worker and releases the hardware.
    pub fn terminate(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.queue.push(QueueCommand::Terminate);
            self.shared.cancel.cancel();
            if handle.join().is_err() {
                warn!("Bridge worker panicked during shutdown");
            }
        }
        self.last_error.clear();
    }

    /// Back-to-powerup reset: pending writes dropped, motor off, cache
    /// forgotten.
    pub fn reset_drive(&mut self, _cylinder: u8) -> bool {
        self.shared.write_jobs.lock().unwrap().clear();
        let side = self.shared.host_position().1;
        self.set_motor(side.is_upper(), false);
        self.shared.cache.invalidate_all();
        self.shared.buffer_available.reset();
        true
    }

    fn enqueue(&self, cmd: QueueCommand) {
        self.shared.queue.push(cmd);
        // Knock the worker out of any in-flight read stream
        self.shared.cancel.cancel();
    }

    /// Applies a host-requested side change; resets the write buffer
    /// and the data-available signal as the addressed track changes.
    fn switch_side(&mut self, side: DiskSide) {
        let (cylinder, current) = self.shared.host_position();
        if current == side {
            return;
        }
        self.write_buffer.reset();
        self.shared
            .host_side_upper
            .store(side.is_upper(), Ordering::Relaxed);
        if !self.shared.cache.current_ready(cylinder, side) {
            self.shared.buffer_available.reset();
        }
        self.shared.stamp_step();
        self.enqueue(QueueCommand::SelectSide(side));
    }

    fn seek(&mut self, cylinder: u8, side: DiskSide) {
        self.switch_side(side);
        if self.shared.host_position().0 == cylinder {
            return;
        }
        self.write_buffer.reset();
        self.shared.host_cylinder.store(cylinder, Ordering::Relaxed);
        self.shared.stamp_step();
        if !self.shared.cache.current_ready(cylinder, side) {
            self.shared.buffer_available.reset();
        }
        self.shared.queue.push_seek(cylinder);
        self.shared.cancel.cancel();
    }

    /// Non-blocking seek; consecutive requests coalesce to the latest
    /// target.
    pub fn goto_cylinder(&mut self, cylinder: u8, side: bool) {
        self.seek(cylinder, DiskSide::from_upper(side));
    }

    pub fn is_at_cylinder0(&self) -> bool {
        self.worker.is_some() && self.shared.host_position().0 == 0
    }

    pub fn current_cylinder(&self) -> u8 {
        self.shared.host_position().0
    }

    pub fn max_cylinder(&self) -> u8 {
        BRIDGE_CYLINDERS
    }

    /// Switches the motor; the side is applied regardless so the head
    /// state stays coherent, the motor transition only when it changes.
    pub fn set_motor(&mut self, side: bool, on: bool) {
        self.switch_side(DiskSide::from_upper(side));
        if self.motor_running == on {
            return;
        }
        self.motor_running = on;
        self.shared.motor_ready.store(false, Ordering::Relaxed);
        self.enqueue(if on {
            QueueCommand::MotorOn
        } else {
            QueueCommand::MotorOff
        });
    }

    pub fn is_motor_running(&self) -> bool {
        self.motor_running
    }

    /// True once the simulated spin-up has completed.
    pub fn is_ready(&self) -> bool {
        self.shared.motor_ready.load(Ordering::Relaxed)
    }

    pub fn is_disk_in_drive(&self) -> bool {
        self.shared.disk_present.load(Ordering::Relaxed)
    }

    pub fn has_disk_changed(&self) -> bool {
        !self.is_disk_in_drive()
    }

    pub fn is_write_protected(&self) -> bool {
        self.shared.write_protected.load(Ordering::Relaxed)
    }

    pub fn drive_type_id(&self) -> DriveTypeId {
        DriveTypeId::DoubleDensity35
    }

    /// Nominal bit cell time in microseconds.
    pub fn bitcell_us(&self) -> u8 {
        2
    }

    /// The last initialisation or command failure, human readable.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Current track length in bits. Until a revolution is buffered
    /// this reports the physical minimum so the host's position
    /// arithmetic keeps moving.
    pub fn max_mfm_bit_position(&self) -> u32 {
        let (cylinder, side) = self.shared.host_position();
        if let Some(bits) = self.shared.cache.current_bits(cylinder, side) {
            return bits;
        }
        MIN_TRACK_BITS.max(self.shared.cache.next_bits(cylinder, side))
    }

    /// The buffer start doubles as the index mark; with a live buffer
    /// its end position is the same physical place.
    pub fn is_mfm_position_at_index(&self, position: u32) -> bool {
        let (cylinder, side) = self.shared.host_position();
        match self.shared.cache.current_bits(cylinder, side) {
            Some(bits) => position == 0 || position == bits,
            None => position == 0,
        }
    }

    /// Reads one MFM bit at `position`. May wait briefly for the first
    /// revolution after a seek; returns 0 when no data can be produced
    /// in time.
    pub fn read_bit(&self, position: u32) -> bool {
        if !self.is_disk_in_drive() || !self.is_ready() {
            return false;
        }
        let (cylinder, side) = self.shared.host_position();

        if let Some(bit) = self.shared.cache.read_bit_current(cylinder, side, position) {
            return bit;
        }

        // Head settling after a step: feed the host silence
        if self.shared.step_grace_active() {
            return false;
        }

        // An index-aligned revolution takes up to two disk turns to
        // assemble; poll-wait, falling back to partial data
        let rounds = READ_WAIT.as_millis() / READ_WAIT_STEP.as_millis();
        for _ in 0..rounds {
            if let Some(bit) = self.shared.cache.read_bit_any(cylinder, side, position) {
                return bit;
            }
            self.shared.buffer_available.wait_timeout(READ_WAIT_STEP);
        }
        false
    }

    /// Local read speed at `position`, per mille of nominal, clamped to
    /// 700..3000. 1000 when no measurement exists.
    pub fn read_speed(&self, position: u32) -> u16 {
        if !self.is_disk_in_drive() || !self.is_ready() {
            return 1000;
        }
        let (cylinder, side) = self.shared.host_position();

        if self.shared.cache.current_ready(cylinder, side) {
            if let Some(raw) = self.shared.cache.read_speed_any(cylinder, side, position) {
                return scale_speed(raw);
            }
            return 1000;
        }
        if self.shared.step_grace_active() {
            return 1000;
        }
        match self.shared.cache.read_speed_any(cylinder, side, position) {
            Some(raw) => scale_speed(raw),
            None => 1000,
        }
    }

    /// Host signal that it consumed a full revolution: rotate in the
    /// freshly read copy of this track, if one is waiting.
    pub fn switch_buffer(&mut self, side: bool) {
        self.switch_side(DiskSide::from_upper(side));
        let (cylinder, side) = self.shared.host_position();
        self.shared.cache.switch_buffer(cylinder, side);
    }

    /// Accepts one MFM word from the host's write DMA emulation.
    pub fn write_word(&mut self, side: bool, cylinder: u8, word: u16, bit_position: u32) {
        let side = DiskSide::from_upper(side);
        self.seek(cylinder, side);

        // Keep the controller off the bus while the host is writing
        self.shared.pause_streaming();
        self.shared.cancel.cancel();

        self.write_buffer.push_word(cylinder, side, word, bit_position);
    }

    /// Flushes the write buffer to the physical disk via the worker.
    /// Returns the (possibly padded) new track length in bits.
    pub fn commit_write(&mut self, side: bool, cylinder: u8) -> u32 {
        let side = DiskSide::from_upper(side);
        self.seek(cylinder, side);
        self.shared.pause_streaming();
        self.shared.cancel.cancel();

        let track_bits = self.max_mfm_bit_position();
        if let Some(job) = self.write_buffer.commit(cylinder, side, track_bits) {
            self.shared.write_jobs.lock().unwrap().push_back(job);
            self.enqueue(QueueCommand::WriteTrack);
            // The data under the head is stale the moment the write lands
            self.shared.cache.invalidate(cylinder, side);
        }

        self.max_mfm_bit_position()
    }
}

fn scale_speed(raw: u16) -> u16 {
    (u32::from(raw) * 10 / 8).clamp(700, 3000) as u16
}

impl Drop for FluxBridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ControllerInfo, DiskState, SeekReport, SeekSpeed};
    use fluxbridge_mfm::splice::SpliceSink;
    use fluxbridge_mfm::{Fingerprint, MfmRun};
    use std::sync::atomic::AtomicUsize;

    /// A scripted controller standing in for real hardware.
    struct MockState {
        disk_present: AtomicBool,
        stream_no_disk: AtomicBool,
        seeks: Mutex<Vec<u8>>,
        sides: Mutex<Vec<DiskSide>>,
        motor: Mutex<Vec<(bool, bool)>>,
        writes: Mutex<Vec<(u8, DiskSide, Vec<u8>, u32, bool, bool)>>,
        streams: AtomicUsize,
        /// Revolution length served by read streams, in bits
        revolution_bits: u32,
    }

    impl MockState {
        fn new(disk_present: bool, revolution_bits: u32) -> Arc<Self> {
            Arc::new(Self {
                disk_present: AtomicBool::new(disk_present),
                stream_no_disk: AtomicBool::new(false),
                seeks: Mutex::new(Vec::new()),
                sides: Mutex::new(Vec::new()),
                motor: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                streams: AtomicUsize::new(0),
                revolution_bits,
            })
        }

        fn factory(self: &Arc<Self>) -> ControllerFactory {
            let state = self.clone();
            Box::new(move || {
                Ok(Box::new(MockController {
                    info: ControllerInfo {
                        firmware: "mock".into(),
                        fast_disk_check: true,
                    },
                    state: state.clone(),
                    physical_side: DiskSide::Lower,
                }) as Box<dyn FloppyController>)
            })
        }
    }

    struct MockController {
        info: ControllerInfo,
        state: Arc<MockState>,
        physical_side: DiskSide,
    }

    /// The bit at `pos` of the mock's deterministic revolution:
    /// endless 01 cells.
    fn expected_bit(pos: u32) -> bool {
        pos % 2 == 1
    }

    impl FloppyController for MockController {
        fn info(&self) -> &ControllerInfo {
            &self.info
        }

        fn enable_motor(&mut self, enable: bool, dont_wait: bool) -> Result<(), ProtocolError> {
            self.state.motor.lock().unwrap().push((enable, dont_wait));
            Ok(())
        }

        fn find_track0(&mut self) -> Result<(), ProtocolError> {
            Ok(())
        }

        fn select_cylinder(
            &mut self,
            cylinder: u8,
            _speed: SeekSpeed,
            _skip_disk_check: bool,
        ) -> Result<SeekReport, ProtocolError> {
            self.state.seeks.lock().unwrap().push(cylinder);
            Ok(SeekReport {
                disk_present: Some(self.state.disk_present.load(Ordering::Relaxed)),
                write_protected: Some(false),
            })
        }

        fn select_side(&mut self, side: DiskSide) -> Result<(), ProtocolError> {
            self.state.sides.lock().unwrap().push(side);
            self.physical_side = side;
            Ok(())
        }

        fn check_disk(&mut self, _force: bool) -> Result<DiskState, ProtocolError> {
            Ok(DiskState {
                present: self.state.disk_present.load(Ordering::Relaxed),
                write_protected: false,
            })
        }

        fn read_track_stream(
            &mut self,
            _max_revolutions: u32,
            _fingerprint: &mut Fingerprint,
            sink: &mut dyn SpliceSink,
        ) -> Result<(), ProtocolError> {
            self.state.streams.fetch_add(1, Ordering::Relaxed);
            if self.state.stream_no_disk.load(Ordering::Relaxed) {
                return Err(ProtocolError::NoDiskInDrive);
            }
            // One revolution of 01 cells
            for _ in 0..self.state.revolution_bits / 2 {
                let run = MfmRun {
                    run: 0,
                    speed: 100,
                    at_index: false,
                };
                if !sink.push_run(run) {
                    return Ok(());
                }
            }
            sink.end_revolution();
            Ok(())
        }

        fn write_track(
            &mut self,
            mfm: &[u8],
            bit_count: u32,
            align_index: bool,
            precomp: bool,
        ) -> Result<(), ProtocolError> {
            self.state.writes.lock().unwrap().push((
                0,
                self.physical_side,
                mfm.to_vec(),
                bit_count,
                align_index,
                precomp,
            ));
            Ok(())
        }

        fn shutdown(&mut self) {
            self.state.motor.lock().unwrap().push((false, false));
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn ready_bridge(state: &Arc<MockState>) -> FluxBridge {
        let mut bridge = FluxBridge::with_controller(state.factory());
        assert!(bridge.initialise());
        bridge.set_motor(false, true);
        assert!(
            wait_for(|| bridge.is_ready(), Duration::from_secs(2)),
            "motor never became ready"
        );
        bridge
    }

    #[test]
    fn cold_start_without_disk() {
        let state = MockState::new(false, 100_000);
        let mut bridge = FluxBridge::with_controller(state.factory());
        assert!(bridge.initialise());
        assert!(bridge.last_error().is_empty());

        assert!(!bridge.is_disk_in_drive());
        assert!(bridge.has_disk_changed());
        assert!(!bridge.read_bit(0));
        assert_eq!(bridge.max_mfm_bit_position(), 97_072);
        assert_eq!(bridge.read_speed(0), 1000);
        assert!(bridge.is_at_cylinder0());
        assert_eq!(bridge.max_cylinder(), 82);
        assert_eq!(bridge.bitcell_us(), 2);
    }

    #[test]
    fn motor_spinup_takes_effect_after_the_simulated_delay() {
        let state = MockState::new(true, 100_000);
        let mut bridge = FluxBridge::with_controller(state.factory());
        assert!(bridge.initialise());

        bridge.set_motor(false, true);
        assert!(bridge.is_motor_running());
        assert!(!bridge.is_ready());
        assert!(wait_for(|| bridge.is_ready(), Duration::from_secs(2)));

        // The worker asked for the non-blocking spin-up
        assert!(state.motor.lock().unwrap().contains(&(true, true)));

        bridge.set_motor(false, false);
        assert!(wait_for(|| !bridge.is_ready(), Duration::from_secs(1)));
        assert!(!bridge.is_motor_running());
    }

    #[test]
    fn seek_and_read_serves_the_streamed_revolution() {
        let state = MockState::new(true, 100_000);
        let mut bridge = ready_bridge(&state);

        bridge.goto_cylinder(10, false);
        assert!(wait_for(
            || state.seeks.lock().unwrap().contains(&10),
            Duration::from_secs(1)
        ));

        // First read may stall while the revolution assembles
        assert!(wait_for(
            || bridge.max_mfm_bit_position() == 100_000,
            Duration::from_millis(1500)
        ));
        assert!(state.streams.load(Ordering::Relaxed) > 0);

        for pos in [0u32, 1, 2, 4489, 50_000, 99_998, 99_999] {
            assert_eq!(bridge.read_bit(pos), expected_bit(pos), "bit {}", pos);
        }
        assert!(bridge.is_mfm_position_at_index(0));
        assert!(bridge.is_mfm_position_at_index(100_000));
        assert!(!bridge.is_mfm_position_at_index(50_000));
        // Nominal cells read at nominal speed
        assert_eq!(bridge.read_speed(1234), 1000);
        assert_eq!(bridge.current_cylinder(), 10);
        assert!(!bridge.is_at_cylinder0());
    }

    #[test]
    fn write_commit_reaches_the_controller_with_precomp_by_cylinder() {
        let state = MockState::new(true, 100_000);
        let mut bridge = ready_bridge(&state);

        // Below the precomp threshold
        for i in 0..100u32 {
            bridge.write_word(false, 20, 0x4489, i * 16);
        }
        let len = bridge.commit_write(false, 20);
        assert!(len >= MIN_TRACK_BITS);

        assert!(wait_for(
            || !state.writes.lock().unwrap().is_empty(),
            Duration::from_secs(1)
        ));
        {
            let writes = state.writes.lock().unwrap();
            let (_, _, mfm, bits, align, precomp) = &writes[0];
            assert_eq!(*bits, 1600);
            assert_eq!(mfm.len(), 200);
            assert_eq!(&mfm[..2], &[0x44, 0x89]);
            assert!(*align, "write starting at bit 0 must be index aligned");
            assert!(!*precomp, "cylinder 20 writes without precomp");
        }

        // And above it
        for i in 0..4u32 {
            bridge.write_word(false, 44, 0xAAAA, 5000 + i * 16);
        }
        bridge.commit_write(false, 44);
        assert!(wait_for(
            || state.writes.lock().unwrap().len() >= 2,
            Duration::from_secs(1)
        ));
        let writes = state.writes.lock().unwrap();
        let (_, _, _, _, align, precomp) = &writes[1];
        assert!(!*align);
        assert!(*precomp, "cylinder 44 writes with precomp");
    }

    #[test]
    fn commit_write_invalidates_the_cached_track() {
        let state = MockState::new(true, 100_000);
        let mut bridge = ready_bridge(&state);
        bridge.goto_cylinder(15, false);
        assert!(wait_for(
            || bridge.shared.cache.current_ready(15, DiskSide::Lower),
            Duration::from_millis(1500)
        ));

        // Park the motor so the worker cannot re-read behind our back
        bridge.set_motor(false, false);
        assert!(wait_for(|| !bridge.is_ready(), Duration::from_secs(1)));

        bridge.write_word(false, 15, 0x4489, 50);
        bridge.commit_write(false, 15);
        // Invariant: nothing stale is readable after the commit
        assert!(!bridge.shared.cache.current_ready(15, DiskSide::Lower));
    }

    #[test]
    fn disk_removal_mid_stream_flips_state_and_empties_the_cache() {
        let state = MockState::new(true, 100_000);
        let mut bridge = ready_bridge(&state);
        bridge.goto_cylinder(3, false);
        assert!(wait_for(
            || bridge.max_mfm_bit_position() == 100_000,
            Duration::from_millis(1500)
        ));

        state.stream_no_disk.store(true, Ordering::Relaxed);
        state.disk_present.store(false, Ordering::Relaxed);

        assert!(wait_for(
            || !bridge.is_disk_in_drive(),
            Duration::from_secs(2)
        ));
        assert!(bridge.has_disk_changed());
        assert!(wait_for(
            || bridge.max_mfm_bit_position() == MIN_TRACK_BITS,
            Duration::from_secs(1)
        ));
        assert!(!bridge.read_bit(0));

        bridge.terminate();
    }

    #[test]
    fn terminate_shuts_the_drive_down() {
        let state = MockState::new(true, 100_000);
        let mut bridge = FluxBridge::with_controller(state.factory());
        assert!(bridge.initialise());
        bridge.terminate();
        // Worker is gone and the drive was powered down
        assert!(bridge.worker.is_none());
        assert!(state.motor.lock().unwrap().contains(&(false, false)));
    }

    #[test]
    fn reset_drive_drops_pending_writes() {
        let state = MockState::new(true, 100_000);
        let mut bridge = ready_bridge(&state);
        bridge.write_word(false, 8, 0x4489, 0);
        assert!(bridge.reset_drive(0));
        assert!(!bridge.is_motor_running());
        assert_eq!(bridge.max_mfm_bit_position(), MIN_TRACK_BITS);
    }

    #[test]
    fn device_settings_map_to_configs() {
        let cfg = BridgeConfig::from_device_settings(true, 0x42);
        assert_eq!(cfg.controller, ControllerSelect::Ascii { port: 3 });

        let cfg = BridgeConfig::from_device_settings(false, 0x00);
        assert_eq!(
            cfg.controller,
            ControllerSelect::Framed { use_drive_a: true }
        );
        let cfg = BridgeConfig::from_device_settings(false, 0x01);
        assert_eq!(
            cfg.controller,
            ControllerSelect::Framed { use_drive_a: false }
        );
    }
}
