//! ASCII-command microcontroller reader/writer.
//!
//! Single-byte commands with ASCII parameters and single-character
//! responses (`'1'` ok, `'0'` error). The device streams half-cell
//! samples as packed bytes and accepts writes as precomp-annotated
//! nibble pairs. A DTR pulse on open resets the board into a known
//! state.

use std::thread;
use std::time::Duration;

use log::*;

use fluxbridge_mfm::encode::{Precomp, RunWalker};
use fluxbridge_mfm::splice::{SpliceSink, Splicer};
use fluxbridge_mfm::{Fingerprint, MfmRun};

use crate::serial::{SerialDevice, SerialIo, TimeoutMode, TransportError};

use super::{
    ControllerInfo, DiskSide, DiskState, FloppyController, ProtocolError, SeekReport, SeekSpeed,
    MAX_CYLINDER,
};

const CMD_VERSION: u8 = b'?';
const CMD_REWIND: u8 = b'.';
const CMD_HEAD0: u8 = b'[';
const CMD_HEAD1: u8 = b']';
const CMD_READ_TRACK: u8 = b'<';
const CMD_ENABLE: u8 = b'+';
const CMD_DISABLE: u8 = b'-';
const CMD_WRITE_TRACK: u8 = b'>';
const CMD_ENABLE_WRITE: u8 = b'~';
const CMD_DD_MODE: u8 = b'D';
const CMD_HD_MODE: u8 = b'H';
const CMD_READ_STREAM: u8 = b'{';
const CMD_WRITE_PRECOMP: u8 = b'}';
const CMD_CHECK_DISK: u8 = b'^';
const CMD_WRITE_PROTECTED: u8 = b'$';
const CMD_ENABLE_NOWAIT: u8 = b'*';
const CMD_GOTO_REPORT: u8 = b'=';
const CMD_ABORT_STREAM: u8 = b'x';

/// Whole-track snapshot size for the non-streaming read: a generous
/// revolution and a half at DD data rates.
pub const RAW_TRACK_BYTES: usize = 0x1900 * 2 + 0x440;

const BAUD: u32 = 2_000_000;

/// Nibble precomp flags understood by the firmware (±125 ns).
const NIBBLE_PRECOMP_EARLY: u8 = 0x04;
const NIBBLE_PRECOMP_LATE: u8 = 0x08;

/// Parsed `V<major>.<minor>` probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsciiFirmware {
    pub major: u8,
    pub minor: u8,
    /// Board has the control mod: fast disk sense without head movement
    pub full_control: bool,
}

impl AsciiFirmware {
    fn supports_streaming(self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 8)
    }
}

/// Driver for the ASCII-command controller family.
#[derive(Debug)]
pub struct AsciiController<S: SerialIo = SerialDevice> {
    io: S,
    version: AsciiFirmware,
    info: ControllerInfo,
    disk_present: bool,
    write_protected: bool,
}

impl AsciiController<SerialDevice> {
    /// Opens the controller on the named port at 2 Mbaud.
    pub fn open(port: &str) -> Result<Self, ProtocolError> {
        let io = SerialDevice::open_with_baud_probe(port, BAUD)?;
        Self::open_on(io, Duration::from_millis(150))
    }
}

impl<S: SerialIo> AsciiController<S> {
    /// Performs the open handshake on an already-connected link.
    /// `reset_delay` paces the DTR reset pulse.
    pub fn open_on(mut io: S, reset_delay: Duration) -> Result<Self, ProtocolError> {
        // Pulse DTR to reset the board into command mode
        io.set_dtr(true)?;
        thread::sleep(reset_delay);
        io.set_dtr(false)?;
        thread::sleep(reset_delay);

        // Knock it out of streaming mode if a previous session crashed,
        // and discard whatever it was still sending
        io.write_all(&[CMD_ABORT_STREAM])?;
        io.purge_rx()?;

        io.write_all(&[CMD_VERSION])?;
        let mut reply = [0u8; 5];
        io.read_exact(&mut reply)
            .map_err(|_| ProtocolError::MalformedVersion)?;
        if reply[0] != b'1' {
            return Err(ProtocolError::MalformedVersion);
        }

        // Version is `V<major>.<minor>`; a comma instead of the dot
        // marks the control-mod hardware
        let full_control = reply[3] == b',';
        if reply[1] != b'V' || (reply[3] != b'.' && !full_control) {
            return Err(ProtocolError::MalformedVersion);
        }
        let version = AsciiFirmware {
            major: reply[2].wrapping_sub(b'0'),
            minor: reply[4].wrapping_sub(b'0'),
            full_control,
        };
        let firmware = format!("V{}.{}", version.major, version.minor);
        info!(
            "ASCII controller firmware {}{}",
            firmware,
            if full_control { " (control mod)" } else { "" }
        );

        if !version.supports_streaming() {
            return Err(ProtocolError::OldFirmware(firmware));
        }

        Ok(Self {
            io,
            version,
            info: ControllerInfo {
                firmware,
                fast_disk_check: full_control,
            },
            disk_present: false,
            write_protected: false,
        })
    }

    pub fn firmware(&self) -> AsciiFirmware {
        self.version
    }

    /// Sends a command byte and returns the raw one-character response.
    fn command_raw(&mut self, cmd: u8, param: Option<u8>) -> Result<u8, ProtocolError> {
        self.io.write_all(&[cmd])?;
        if let Some(p) = param {
            self.io.write_all(&[p])?;
        }
        let mut reply = [0u8; 1];
        self.io.read_exact(&mut reply)?;
        Ok(reply[0])
    }

    /// Sends a command byte and expects the `'1'` success response.
    fn command(&mut self, cmd: u8) -> Result<(), ProtocolError> {
        match self.command_raw(cmd, None)? {
            b'1' => Ok(()),
            b'0' => Err(ProtocolError::BadCommand),
            other => Err(ProtocolError::StatusError(other)),
        }
    }

    /// Arms the write head. Errors with [`ProtocolError::WriteProtected`]
    /// when the inserted disk cannot be written.
    pub fn enable_write(&mut self, enable: bool) -> Result<(), ProtocolError> {
        if enable {
            match self.command(CMD_ENABLE_WRITE) {
                Err(ProtocolError::BadCommand) => Err(ProtocolError::WriteProtected),
                other => other,
            }
        } else {
            self.command(CMD_DISABLE)
        }
    }

    /// Switches the drive between DD and HD cell timing.
    pub fn set_density(&mut self, high_density: bool) -> Result<(), ProtocolError> {
        self.command(if high_density { CMD_HD_MODE } else { CMD_DD_MODE })
    }

    /// Reads the cached write-protect state, refreshing it from the
    /// hardware when `force` is set.
    pub fn is_write_protected(&mut self, force: bool) -> Result<bool, ProtocolError> {
        if force {
            match self.command_raw(CMD_WRITE_PROTECTED, None)? {
                b'1' => self.write_protected = true,
                b'0' => self.write_protected = false,
                other => return Err(ProtocolError::StatusError(other)),
            }
        }
        Ok(self.write_protected)
    }

    /// Non-streaming whole-track snapshot: the device unloads one
    /// buffered track as packed 2-bit cell codes, expanded here into a
    /// raw MFM bit buffer. Useful for diagnostics and blank checking.
    pub fn read_track(&mut self, from_index: bool) -> Result<Vec<u8>, ProtocolError> {
        if self.command(CMD_READ_TRACK).is_err() {
            self.io.purge_rx()?;
            self.command(CMD_READ_TRACK)?;
        }
        self.io.write_all(&[u8::from(from_index)])?;

        let mut packed = Vec::with_capacity(RAW_TRACK_BYTES);
        let mut failures = 0;
        loop {
            let mut byte = [0u8; 1];
            match self.io.read_upto(&mut byte)? {
                0 => {
                    failures += 1;
                    if failures > 4 {
                        return Err(TransportError::Timeout.into());
                    }
                }
                _ => {
                    if byte[0] == 0 {
                        break;
                    }
                    if packed.len() < RAW_TRACK_BYTES {
                        packed.push(byte[0]);
                    }
                }
            }
        }

        Ok(unpack_cell_codes(&packed))
    }
}

fn push_track_bit(out: &mut [u8], pos: &mut usize, bit: &mut u8, value: u8) {
    if *pos >= out.len() {
        return;
    }
    out[*pos] = (out[*pos] << 1) | value;
    *bit += 1;
    if *bit >= 8 {
        *bit = 0;
        *pos += 1;
    }
}

/// Expands packed 2-bit cell codes (four per byte, MSB pair first) into
/// an MFM bit buffer of [`RAW_TRACK_BYTES`].
fn unpack_cell_codes(packed: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; RAW_TRACK_BYTES];
    let mut pos = 0;
    let mut bit = 0;

    for &byte in packed {
        for shift in [6u8, 4, 2, 0] {
            let code = (byte >> shift) & 3;
            // Code 0 is invalid on the wire; account 4 empty cells
            let zeros = if code == 0 { 4 } else { code };
            for _ in 0..zeros {
                push_track_bit(&mut out, &mut pos, &mut bit, 0);
            }
            if code != 0 {
                push_track_bit(&mut out, &mut pos, &mut bit, 1);
            }
        }
        if pos >= out.len() {
            break;
        }
    }
    out
}

/// Returns false when a track snapshot is blank or unformatted: 20 or
/// more identical `0x00`/`0xFF` bytes in a row.
pub fn track_contains_data(track: &[u8]) -> bool {
    let mut zeros = 0;
    let mut ones = 0;
    let mut last = track.first().copied().unwrap_or(0);
    for &byte in track.iter().skip(1) {
        if byte == last {
            match byte {
                0xFF => {
                    ones += 1;
                    zeros = 0;
                }
                0x00 => {
                    zeros += 1;
                    ones = 0;
                }
                _ => {
                    zeros = 0;
                    ones = 0;
                }
            }
        } else {
            last = byte;
            zeros = 0;
            ones = 0;
        }
        if zeros >= 20 || ones >= 20 {
            return false;
        }
    }
    true
}

/// Decodes one stream byte into its two half-cell runs. Bit 7 flags an
/// index pulse on the first half, bits 5-6 and 3-4 carry the run codes
/// and bits 0-2 a coarse per-byte read speed.
fn half_runs(byte: u8) -> [MfmRun; 2] {
    let speed_raw = u32::from(byte & 0x07) * 16;
    let ns_extra = (64 + speed_raw * 2000) / 128;

    let make = |code: u8, at_index: bool| {
        let run = if code == 0 { 2 } else { code - 1 };
        let ns = 3000 + u32::from(run) * 2000 + ns_extra;
        let speed = ns * 100 / ((u32::from(run) + 2) * 2000);
        MfmRun {
            run,
            speed: speed as u16,
            at_index,
        }
    };

    [
        make((byte >> 5) & 3, byte & 0x80 != 0),
        make((byte >> 3) & 3, false),
    ]
}

/// Packs the rewritten runs into firmware nibbles: `ppyy` with `yy` the
/// cell count minus 2 and `pp` the precomp direction. The count lags
/// the precomp by one run; the firmware pairs them back up on its side
/// of the delay line.
fn encode_precomp_nibbles(mfm: &[u8], precomp: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(mfm.len() * 4 + 16);
    let mut runs = RunWalker::new(mfm, 8, precomp);
    let mut last_cells = 2u8;

    loop {
        let mut byte = 0u8;
        let mut any = false;
        for half in 0..2 {
            let Some(run) = runs.next() else { break };
            any = true;
            let p = match run.precomp {
                Precomp::None => 0,
                Precomp::Early => NIBBLE_PRECOMP_EARLY,
                Precomp::Late => NIBBLE_PRECOMP_LATE,
            };
            byte |= ((last_cells - 2) | p) << (half * 4);
            last_cells = run.cells;
        }
        if !any {
            break;
        }
        out.push(byte);
    }
    out
}

impl<S: SerialIo> AsciiController<S> {
    fn stream_loop(
        &mut self,
        splicer: &mut Splicer,
        sink: &mut dyn SpliceSink,
    ) -> Result<(), ProtocolError> {
        let mut abort_pending = false;
        let mut trailer = 0;
        let mut failures = 0;
        let mut buf = [0u8; 64];

        loop {
            let want = if abort_pending { 1 } else { buf.len() };
            let n = self.io.read_upto(&mut buf[..want])?;
            if n == 0 {
                failures += 1;
                if failures > 20 {
                    if !abort_pending {
                        let _ = self.io.write_all(&[CMD_ABORT_STREAM]);
                    }
                    return Err(TransportError::Timeout.into());
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            failures = 0;

            for &byte in &buf[..n] {
                if abort_pending {
                    // The firmware closes the stream with an X Y Z x 1
                    // trailer once the abort byte lands
                    trailer = match (trailer, byte) {
                        (0, b'X') | (1, b'Y') | (2, b'Z') => trailer + 1,
                        (3, CMD_ABORT_STREAM) => 4,
                        (4, b'1') => return Ok(()),
                        _ => 0,
                    };
                } else {
                    for run in half_runs(byte) {
                        if !splicer.push(run, sink) {
                            self.io.write_all(&[CMD_ABORT_STREAM])?;
                            abort_pending = true;
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<S: SerialIo> FloppyController for AsciiController<S> {
    fn info(&self) -> &ControllerInfo {
        &self.info
    }

    fn enable_motor(&mut self, enable: bool, dont_wait: bool) -> Result<(), ProtocolError> {
        if enable {
            self.command(if dont_wait { CMD_ENABLE_NOWAIT } else { CMD_ENABLE })
        } else {
            self.command(CMD_DISABLE)
        }
    }

    fn find_track0(&mut self) -> Result<(), ProtocolError> {
        match self.command_raw(CMD_REWIND, None)? {
            b'1' => Ok(()),
            b'#' => Err(ProtocolError::Track0NotFound),
            b'0' => Err(ProtocolError::BadCommand),
            other => Err(ProtocolError::StatusError(other)),
        }
    }

    fn select_cylinder(
        &mut self,
        cylinder: u8,
        speed: SeekSpeed,
        skip_disk_check: bool,
    ) -> Result<SeekReport, ProtocolError> {
        if cylinder > MAX_CYLINDER {
            return Err(ProtocolError::TrackRange(cylinder));
        }

        let mut flags = match speed {
            SeekSpeed::Slow | SeekSpeed::Normal => 1,
            SeekSpeed::Fast => 2,
            SeekSpeed::VeryFast => 3,
        };
        if !skip_disk_check {
            flags |= 4;
        }
        let request = [
            CMD_GOTO_REPORT,
            b'0' + cylinder / 10,
            b'0' + cylinder % 10,
            flags,
        ];
        self.io.write_all(&request)?;

        let mut reply = [0u8; 1];
        self.io.read_exact(&mut reply)?;
        match reply[0] {
            // Head already on this cylinder
            b'2' => Ok(SeekReport::default()),
            b'1' => {
                let mut status = [0u8; 2];
                self.io.read_exact(&mut status)?;
                let mut report = SeekReport::default();
                // 'x' means the firmware skipped the disk check
                if status[0] != b'x' {
                    self.disk_present = status[0] == b'1';
                    report.disk_present = Some(self.disk_present);
                }
                self.write_protected = status[1] == b'1';
                report.write_protected = Some(self.write_protected);
                Ok(report)
            }
            b'0' => Err(ProtocolError::SelectTrackError),
            other => Err(ProtocolError::StatusError(other)),
        }
    }

    fn select_side(&mut self, side: DiskSide) -> Result<(), ProtocolError> {
        self.command(if side.is_upper() { CMD_HEAD0 } else { CMD_HEAD1 })
    }

    fn check_disk(&mut self, force: bool) -> Result<DiskState, ProtocolError> {
        if force {
            match self.command_raw(CMD_CHECK_DISK, None)? {
                b'1' => self.disk_present = true,
                b'#' => self.disk_present = false,
                other => return Err(ProtocolError::StatusError(other)),
            }
            // The write-protect state rides along
            let mut wp = [0u8; 1];
            self.io.read_exact(&mut wp)?;
            self.write_protected = wp[0] == b'1';
        }
        Ok(DiskState {
            present: self.disk_present,
            write_protected: self.write_protected,
        })
    }

    fn read_track_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Fingerprint,
        sink: &mut dyn SpliceSink,
    ) -> Result<(), ProtocolError> {
        if self.command(CMD_READ_STREAM).is_err() {
            self.io.purge_rx()?;
            self.command(CMD_READ_STREAM)?;
        }
        self.io.set_timeout_mode(TimeoutMode::Short)?;

        let mut splicer = Splicer::new(std::mem::take(fingerprint), max_revolutions);
        let result = self.stream_loop(&mut splicer, sink);
        *fingerprint = splicer.into_fingerprint();

        let _ = self.io.purge_rx();
        self.io.set_timeout_mode(TimeoutMode::Long)?;
        result
    }

    fn write_track(
        &mut self,
        mfm: &[u8],
        bit_count: u32,
        align_index: bool,
        precomp: bool,
    ) -> Result<(), ProtocolError> {
        let byte_count = bit_count.div_ceil(8) as usize;
        if byte_count > mfm.len() || byte_count == 0 {
            return Err(ProtocolError::BadParameter);
        }
        let mfm = &mfm[..byte_count];

        let payload;
        let cmd = if precomp {
            payload = encode_precomp_nibbles(mfm, true);
            CMD_WRITE_PRECOMP
        } else {
            payload = mfm.to_vec();
            CMD_WRITE_TRACK
        };
        if payload.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::BadParameter);
        }

        self.io.write_all(&[cmd])?;
        let mut gate = [0u8; 1];
        self.io.read_exact(&mut gate)?;
        match gate[0] {
            b'Y' => (),
            b'N' => return Err(ProtocolError::WriteProtected),
            other => return Err(ProtocolError::StatusError(other)),
        }

        let len = payload.len() as u16;
        self.io.write_all(&len.to_be_bytes())?;
        self.io.write_all(&[u8::from(align_index)])?;

        let mut go = [0u8; 1];
        self.io.read_exact(&mut go)?;
        if go[0] != b'!' {
            return Err(ProtocolError::StatusError(go[0]));
        }

        self.io.write_all(&payload)?;

        let mut result = [0u8; 1];
        self.io.read_exact(&mut result)?;
        match result[0] {
            b'1' => Ok(()),
            b'X' => Err(ProtocolError::WriteTimeout),
            b'Y' => Err(ProtocolError::FramingError),
            b'Z' => Err(ProtocolError::SerialOverrun),
            other => Err(ProtocolError::StatusError(other)),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.command(CMD_DISABLE);
        // Leave the board reset for the next session
        let _ = self.io.set_dtr(true);
        thread::sleep(Duration::from_millis(10));
        let _ = self.io.set_dtr(false);
    }
}
