//! Binary length-framed flux controller.
//!
//! Every request is `[cmd, total_length, payload…]`, every response
//! `[echoed_cmd, ack]` plus any payload the caller declared. Reads and
//! writes move raw flux timing; the MFM interpretation happens on this
//! side of the wire through the PLL and the splicer.

use std::thread;
use std::time::Duration;

use binrw::io::Cursor;
use binrw::{binrw, BinRead, BinWrite};
use log::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;

use fluxbridge_mfm::encode::{Precomp, RunWalker, PRECOMP_NS};
use fluxbridge_mfm::pll::Pll;
use fluxbridge_mfm::splice::{FastQueue, SpliceSink, Splicer};
use fluxbridge_mfm::{ns_to_ticks, Fingerprint, MfmRun};

use crate::serial::{SerialDevice, SerialIo, TimeoutMode, TransportError};

use super::{
    ControllerInfo, DiskSide, DiskState, FloppyController, ProtocolError, SeekReport, SeekSpeed,
    MAX_CYLINDER,
};

/// Command bytes.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
enum Cmd {
    GetInfo = 0,
    Update = 1,
    Seek = 2,
    Head = 3,
    SetParams = 4,
    GetParams = 5,
    Motor = 6,
    ReadFlux = 7,
    WriteFlux = 8,
    GetFluxStatus = 9,
    GetIndexTimes = 10,
    SwitchFwMode = 11,
    Select = 12,
    Deselect = 13,
    SetBusType = 14,
    SetPin = 15,
    Reset = 16,
    EraseFlux = 17,
    SourceBytes = 18,
    SinkBytes = 19,
}

/// Acknowledge codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive)]
#[repr(u8)]
enum Ack {
    Okay = 0,
    BadCommand = 1,
    NoIndex = 2,
    NoTrk0 = 3,
    FluxOverflow = 4,
    FluxUnderflow = 5,
    Wrprot = 6,
    NoUnit = 7,
    NoBus = 8,
    BadUnit = 9,
    BadPin = 10,
    BadCylinder = 11,
}

/// GetInfo sub-command: firmware details.
const GETINFO_FIRMWARE: u8 = 0;
/// Get/SetParams index: drive delay table.
const PARAMS_DELAYS: u8 = 0;
/// SetBusType value for PC-wired drives.
const BUS_TYPE_IBMPC: u8 = 1;

/// Flux stream escape opcodes (preceded by an 0xFF byte).
const FLUXOP_INDEX: u8 = 1;
const FLUXOP_SPACE: u8 = 2;

/// Firmware info block returned by GetInfo.
#[derive(BinRead, Debug, Clone, Copy)]
#[br(little)]
pub struct FirmwareInfo {
    pub major: u8,
    pub minor: u8,
    pub is_main_firmware: u8,
    pub max_cmd: u8,
    /// Flux sampling clock in Hz
    pub sample_freq: u32,
    pub hw_model: u8,
    pub hw_submodel: u8,
    #[br(pad_after = 21)]
    pub usb_speed: u8,
}

/// Wire size of [`FirmwareInfo`].
const FIRMWARE_INFO_LEN: usize = 32;

/// Drive timing table, Get/SetParams index 0.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveDelays {
    pub select_delay_us: u16,
    pub step_delay_us: u16,
    pub seek_settle_ms: u16,
    pub motor_delay_ms: u16,
    pub watchdog_delay_ms: u16,
}

const DRIVE_DELAYS_LEN: usize = 10;

/// ReadFlux request body.
#[derive(BinWrite, Debug, Clone, Copy)]
#[bw(little)]
struct ReadFluxParams {
    /// Maximum ticks to read for, 0 for no limit
    ticks: u32,
    /// Maximum index pulses to read, 0 for no limit
    max_index: u16,
    /// Ticks to linger after the final index pulse
    max_index_linger: u32,
}

/// How long to keep reading after the closing index pulse: a full extra
/// revolution at 300rpm, so the splicer always has lookahead to cut in.
const INDEX_LINGER_NS: i64 = 210_000_000;

/// Driver for the length-framed flux controller family.
pub struct FramedController<S: SerialIo = SerialDevice> {
    io: S,
    version: FirmwareInfo,
    delays: DriveDelays,
    info: ControllerInfo,
    drive_unit: u8,
    motor_on: bool,
    disk_present: bool,
    write_protected: bool,
}

/// Scores an enumerated USB serial port for how likely it is to be the
/// flux controller. Highest score wins.
pub fn score_usb_port(vid: u16, pid: u16, product: Option<&str>, serial: Option<&str>) -> i32 {
    let mut score = 0;
    match (vid, pid) {
        // Properly assigned VID/PID: guaranteed to be the device
        (0x1209, 0x4d69) => score += 20,
        // Old shared test PID, not guaranteed
        (0x1209, 0x0001) => score += 10,
        _ => (),
    }
    if product == Some("Greaseweazle") {
        score += 10;
    }
    if serial.is_some_and(|s| s.contains("GW")) {
        score += 10;
    }
    score
}

/// Enumerates system serial ports and returns the best-scoring device.
pub fn find_device_port() -> Option<String> {
    let ports = serialport::available_ports().ok()?;
    let mut best: Option<(i32, String)> = None;
    for port in ports {
        let serialport::SerialPortType::UsbPort(usb) = &port.port_type else {
            continue;
        };
        let score = score_usb_port(
            usb.vid,
            usb.pid,
            usb.product.as_deref(),
            usb.serial_number.as_deref(),
        );
        if score > best.as_ref().map_or(0, |(s, _)| *s) {
            best = Some((score, port.port_name.clone()));
        }
    }
    best.map(|(_, name)| name)
}

impl FramedController<SerialDevice> {
    /// Locates the device among the system serial ports and opens it.
    /// `use_drive_a` selects the first of the two drive units.
    pub fn open(use_drive_a: bool) -> Result<Self, ProtocolError> {
        let name = find_device_port().ok_or(TransportError::PortNotFound)?;
        // The link is USB CDC; the configured rate is immaterial
        let io = SerialDevice::open(&name, 9600)?;
        Self::open_on(io, use_drive_a)
    }
}

impl<S: SerialIo> FramedController<S> {
    /// Runs the open handshake on an already-connected link.
    pub fn open_on(mut io: S, use_drive_a: bool) -> Result<Self, ProtocolError> {
        io.purge_rx()?;

        // Firmware probe, with one retry against a confused device
        if raw_command(&mut io, Cmd::GetInfo, &[GETINFO_FIRMWARE], 0).is_err() {
            io.purge_rx()?;
            raw_command(&mut io, Cmd::GetInfo, &[GETINFO_FIRMWARE], 0)
                .map_err(|_| ProtocolError::MalformedVersion)?;
        }
        let mut raw = [0u8; FIRMWARE_INFO_LEN];
        io.read_exact(&mut raw)
            .map_err(|_| ProtocolError::MalformedVersion)?;
        let version = FirmwareInfo::read(&mut Cursor::new(&raw[..]))
            .map_err(|_| ProtocolError::MalformedVersion)?;

        let firmware = format!("{}.{}", version.major, version.minor);
        if version.major == 0 && version.minor < 25 {
            return Err(ProtocolError::OldFirmware(firmware));
        }
        if version.is_main_firmware == 0 {
            return Err(ProtocolError::InUpdateMode);
        }
        info!(
            "Flux controller firmware {}, sampling at {} Hz",
            firmware, version.sample_freq
        );

        raw_command(&mut io, Cmd::Reset, &[], 0)?;

        // Drive delay table, needed as the baseline for seek/motor tuning
        raw_command(&mut io, Cmd::GetParams, &[PARAMS_DELAYS], DRIVE_DELAYS_LEN as u8)?;
        let mut raw = [0u8; DRIVE_DELAYS_LEN];
        io.read_exact(&mut raw)?;
        let delays = DriveDelays::read(&mut Cursor::new(&raw[..]))
            .map_err(|_| ProtocolError::MalformedVersion)?;

        raw_command(&mut io, Cmd::SetBusType, &[BUS_TYPE_IBMPC], 0)?;

        Ok(Self {
            io,
            version,
            delays,
            info: ControllerInfo {
                firmware,
                // Disk sense needs a spin-up and index detection
                fast_disk_check: false,
            },
            drive_unit: u8::from(!use_drive_a),
            motor_on: false,
            disk_present: false,
            write_protected: false,
        })
    }

    pub fn firmware(&self) -> &FirmwareInfo {
        &self.version
    }

    pub fn delays(&self) -> &DriveDelays {
        &self.delays
    }

    fn command(&mut self, cmd: Cmd, params: &[u8], reply_len: u8) -> Result<Ack, ProtocolError> {
        let ack = raw_command(&mut self.io, cmd, params, reply_len)?;
        Ack::from_u8(ack).ok_or(ProtocolError::StatusError(ack))
    }

    fn command_ok(&mut self, cmd: Cmd, params: &[u8]) -> Result<(), ProtocolError> {
        match self.command(cmd, params, 0)? {
            Ack::Okay => Ok(()),
            other => {
                warn!("{} failed: {}", cmd, other);
                Err(map_ack(other))
            }
        }
    }

    fn select_drive(&mut self, select: bool) -> Result<(), ProtocolError> {
        if select {
            self.command_ok(Cmd::Select, &[self.drive_unit])
        } else {
            self.command_ok(Cmd::Deselect, &[])
        }
    }

    fn push_delays(&mut self) -> Result<(), ProtocolError> {
        let mut params = vec![PARAMS_DELAYS];
        let mut cur = Cursor::new(Vec::new());
        self.delays
            .write(&mut cur)
            .map_err(|_| ProtocolError::BadParameter)?;
        params.extend_from_slice(&cur.into_inner());
        self.command_ok(Cmd::SetParams, &params)
    }

    /// Encodes an MFM buffer as a precomp-adjusted flux tick stream,
    /// terminator included.
    fn encode_flux(&self, mfm: &[u8], precomp: bool) -> Vec<u8> {
        let freq = self.version.sample_freq;
        let mut out = Vec::with_capacity(mfm.len() * 4 + 16);
        let mut carry = 0i64;

        for run in RunWalker::new(mfm, 1, precomp) {
            let mut ns = carry + i64::from(run.cells) * 2000;
            match run.precomp {
                Precomp::Early => {
                    ns -= PRECOMP_NS;
                    carry = PRECOMP_NS;
                }
                Precomp::Late => {
                    ns += PRECOMP_NS;
                    carry = -PRECOMP_NS;
                }
                Precomp::None => carry = 0,
            }

            let ticks = ns_to_ticks(ns, freq);
            if ticks <= 0 {
                continue;
            }
            encode_ticks(ticks as u32, &mut out);
        }

        out.push(0);
        out
    }

    fn stream_loop(
        &mut self,
        splicer: &mut Splicer,
        sink: &mut dyn SpliceSink,
    ) -> Result<(), ProtocolError> {
        let mut queue: FastQueue<u8> = FastQueue::default();
        let mut pll = Pll::new(self.version.sample_freq);
        let mut aborted = false;
        let mut failures = 0;

        // Single-byte reads: anything past the stream terminator belongs
        // to the following command exchange and must stay in the driver
        loop {
            let mut byte = [0u8; 1];
            if self.io.read_upto(&mut byte)? == 0 {
                failures += 1;
                if failures > 500 {
                    return Err(TransportError::Timeout.into());
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            failures = 0;

            if byte[0] == 0 {
                // Stream terminator; flush whatever is decodable
                while let StreamStep::Run(run) = decode_step(&mut queue, &mut pll) {
                    if !aborted && !splicer.push(run, sink) {
                        aborted = true;
                    }
                }
                if !aborted {
                    splicer.finish(sink);
                }
                return Ok(());
            }
            queue.push(byte[0]);

            loop {
                match decode_step(&mut queue, &mut pll) {
                    StreamStep::NeedMore => break,
                    StreamStep::Nothing => (),
                    StreamStep::Run(run) => {
                        if !aborted && !splicer.push(run, sink) {
                            // No in-band abort on this family; drain
                            // until the device stops on its own
                            aborted = true;
                        }
                    }
                }
            }
        }
    }
}

/// Sends one framed command and returns the raw ack byte.
fn raw_command<S: SerialIo>(
    io: &mut S,
    cmd: Cmd,
    params: &[u8],
    reply_len: u8,
) -> Result<u8, ProtocolError> {
    let mut msg = Vec::with_capacity(params.len() + 3);
    msg.push(cmd as u8);
    msg.push((2 + params.len() + usize::from(reply_len > 0)) as u8);
    msg.extend_from_slice(params);
    if reply_len > 0 {
        msg.push(reply_len);
    }
    io.write_all(&msg)?;

    let mut reply = [0u8; 2];
    io.read_exact(&mut reply)?;
    if reply[0] != cmd as u8 {
        return Err(ProtocolError::FramingError);
    }
    Ok(reply[1])
}

fn map_ack(ack: Ack) -> ProtocolError {
    match ack {
        Ack::Okay => ProtocolError::StatusError(0),
        Ack::BadCommand => ProtocolError::BadCommand,
        Ack::NoIndex => ProtocolError::NoDiskInDrive,
        Ack::NoTrk0 => ProtocolError::Track0NotFound,
        Ack::FluxOverflow => ProtocolError::SerialOverrun,
        Ack::FluxUnderflow => ProtocolError::SerialUnderflow,
        Ack::Wrprot => ProtocolError::WriteProtected,
        Ack::BadCylinder => ProtocolError::SelectTrackError,
        other => ProtocolError::StatusError(other as u8),
    }
}

/// Appends one tick count in the stream encoding.
fn encode_ticks(ticks: u32, out: &mut Vec<u8>) {
    if ticks < 250 {
        out.push(ticks as u8);
        return;
    }
    let high = (ticks - 250) / 255;
    if high < 5 {
        out.push((250 + high) as u8);
        out.push((1 + (ticks - 250) % 255) as u8);
    } else {
        // Too long even for the two-byte form: an explicit space plus a
        // short closing flux
        out.push(255);
        out.push(FLUXOP_SPACE);
        write_28bit(ticks - 249, out);
        out.push(249);
    }
}

/// Writes a 28-bit value as four bytes, LSB set on each.
fn write_28bit(value: u32, out: &mut Vec<u8>) {
    out.push((1 | (value << 1)) as u8);
    out.push((1 | (value >> 6)) as u8);
    out.push((1 | (value >> 13)) as u8);
    out.push((1 | (value >> 20)) as u8);
}

/// Reads a 28-bit value from four stream bytes.
fn read_28bit(queue: &mut FastQueue<u8>) -> u32 {
    let mut bytes = [0u8; 4];
    for b in &mut bytes {
        *b = queue.pop().unwrap_or(1);
    }
    (u32::from(bytes[0]) >> 1)
        | (u32::from(bytes[1] & 0xFE) << 6)
        | (u32::from(bytes[2] & 0xFE) << 13)
        | (u32::from(bytes[3] & 0xFE) << 20)
}

enum StreamStep {
    /// An opcode is split across reads; wait for more bytes
    NeedMore,
    /// Consumed an opcode without completing a run
    Nothing,
    Run(MfmRun),
}

/// Consumes at most one opcode from the queue.
fn decode_step(queue: &mut FastQueue<u8>, pll: &mut Pll) -> StreamStep {
    let Some(&first) = queue.iter().next() else {
        return StreamStep::NeedMore;
    };

    if first == 255 {
        // Escape opcode: 255, op, 28-bit payload
        if queue.len() < 6 {
            return StreamStep::NeedMore;
        }
        queue.pop();
        match queue.pop() {
            Some(FLUXOP_INDEX) => {
                let _ = read_28bit(queue);
                pll.mark_index();
            }
            Some(FLUXOP_SPACE) => {
                pll.add_space(read_28bit(queue));
            }
            _ => {
                // Not a legal opcode; skip it
            }
        }
        StreamStep::Nothing
    } else {
        let ticks = if first < 250 {
            queue.pop();
            u32::from(first)
        } else {
            if queue.len() < 2 {
                return StreamStep::NeedMore;
            }
            queue.pop();
            let second = queue.pop().unwrap_or(1);
            250 + (u32::from(first) - 250) * 255 + (u32::from(second) - 1)
        };

        match pll.push_flux(ticks) {
            Some(run) => StreamStep::Run(run),
            None => StreamStep::Nothing,
        }
    }
}

impl<S: SerialIo> FloppyController for FramedController<S> {
    fn info(&self) -> &ControllerInfo {
        &self.info
    }

    fn enable_motor(&mut self, enable: bool, dont_wait: bool) -> Result<(), ProtocolError> {
        let delay = if dont_wait { 10 } else { 750 };
        if self.delays.motor_delay_ms != delay {
            self.delays.motor_delay_ms = delay;
            self.push_delays()?;
        }

        self.command_ok(Cmd::Motor, &[self.drive_unit, u8::from(enable)])?;
        self.motor_on = enable;
        Ok(())
    }

    fn find_track0(&mut self) -> Result<(), ProtocolError> {
        self.select_cylinder(0, SeekSpeed::Fast, true).map(|_| ())
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

        let step_delay = match speed {
            SeekSpeed::Slow => 8000,
            SeekSpeed::Normal => 7000,
            SeekSpeed::Fast => 6000,
            SeekSpeed::VeryFast => 5000,
        };
        if self.delays.step_delay_us != step_delay {
            self.delays.step_delay_us = step_delay;
            self.push_delays()?;
        }

        self.select_drive(true)?;
        let ack = self.command(Cmd::Seek, &[cylinder], 0)?;
        self.select_drive(false)?;

        let mut report = SeekReport::default();
        if !skip_disk_check {
            let state = self.check_disk(true)?;
            report.disk_present = Some(state.present);
        }

        match ack {
            Ack::Okay => Ok(report),
            Ack::NoTrk0 => Err(ProtocolError::Track0NotFound),
            _ => Err(ProtocolError::SelectTrackError),
        }
    }

    fn select_side(&mut self, side: DiskSide) -> Result<(), ProtocolError> {
        self.command_ok(Cmd::Head, &[u8::from(side.is_upper())])
    }

    fn check_disk(&mut self, force: bool) -> Result<DiskState, ProtocolError> {
        if force {
            // Index pulses are the only disk sense this family has, so
            // the disk has to spin to be seen
            let spun_up_here = !self.motor_on;
            if spun_up_here {
                self.enable_motor(true, false)?;
            }
            self.select_drive(true)?;

            let params = ReadFluxParams {
                ticks: 0,
                max_index: 2,
                max_index_linger: 0,
            };
            let ack = self.command(Cmd::ReadFlux, &encode_params(&params)?, 0)?;
            if ack == Ack::Okay {
                // Drain the flux stream to its terminator
                let mut byte = [0u8; 1];
                let mut failures = 0;
                loop {
                    match self.io.read_upto(&mut byte)? {
                        0 => {
                            failures += 1;
                            if failures > 500 {
                                break;
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                        _ if byte[0] == 0 => break,
                        _ => failures = 0,
                    }
                }
            }

            let status = self.command(Cmd::GetFluxStatus, &[], 0)?;
            self.select_drive(false)?;
            if spun_up_here {
                self.enable_motor(false, false)?;
            }

            self.disk_present = status != Ack::NoIndex;
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
        let params = ReadFluxParams {
            ticks: 0,
            max_index: max_revolutions as u16,
            max_index_linger: ns_to_ticks(INDEX_LINGER_NS, self.version.sample_freq) as u32,
        };

        self.select_drive(true)?;
        match self.command(Cmd::ReadFlux, &encode_params(&params)?, 0)? {
            Ack::Okay => (),
            other => {
                self.select_drive(false)?;
                return Err(map_ack(other));
            }
        }
        self.io.set_timeout_mode(TimeoutMode::Short)?;

        let mut splicer = Splicer::new(std::mem::take(fingerprint), max_revolutions);
        let result = self.stream_loop(&mut splicer, sink);
        *fingerprint = splicer.into_fingerprint();

        self.io.set_timeout_mode(TimeoutMode::Long)?;
        let status = self.command(Cmd::GetFluxStatus, &[], 0)?;
        self.select_drive(false)?;
        self.disk_present = status != Ack::NoIndex;

        result?;
        match status {
            Ack::Okay => Ok(()),
            Ack::NoIndex => Err(ProtocolError::NoDiskInDrive),
            Ack::FluxOverflow => Err(ProtocolError::SerialOverrun),
            other => Err(map_ack(other)),
        }
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
        let stream = self.encode_flux(&mfm[..byte_count], precomp);

        self.select_drive(true)?;
        let header = [u8::from(align_index), 0];
        match self.command(Cmd::WriteFlux, &header, 0)? {
            Ack::Okay => (),
            Ack::Wrprot => {
                self.write_protected = true;
                self.select_drive(false)?;
                return Err(ProtocolError::WriteProtected);
            }
            other => {
                self.select_drive(false)?;
                return Err(map_ack(other));
            }
        }

        self.io.write_all(&stream)?;

        // One sync byte signals the flux buffer drained
        let mut sync = [0u8; 1];
        self.io.read_exact(&mut sync)?;

        let status = self.command(Cmd::GetFluxStatus, &[], 0)?;
        self.select_drive(false)?;
        match status {
            Ack::Okay => Ok(()),
            Ack::FluxUnderflow => Err(ProtocolError::SerialUnderflow),
            Ack::Wrprot => {
                self.write_protected = true;
                Err(ProtocolError::WriteProtected)
            }
            other => Err(map_ack(other)),
        }
    }

    fn shutdown(&mut self) {
        let _ = self.enable_motor(false, false);
    }
}

fn encode_params(params: &ReadFluxParams) -> Result<Vec<u8>, ProtocolError> {
    let mut cur = Cursor::new(Vec::new());
    params
        .write(&mut cur)
        .map_err(|_| ProtocolError::BadParameter)?;
    Ok(cur.into_inner())
}
