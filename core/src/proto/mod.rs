//! Controller protocols.
//!
//! Two hardware families speak to the same upper layer: an
//! ASCII-command microcontroller reader/writer ([`ascii`]) and a binary
//! length-framed flux controller ([`framed`]). The bridge picks one at
//! construction time and drives it through [`FloppyController`].

pub mod ascii;
pub mod framed;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use fluxbridge_mfm::splice::SpliceSink;
use fluxbridge_mfm::Fingerprint;

use crate::serial::TransportError;

/// Protocol- and drive-level failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected version response from the controller")]
    MalformedVersion,
    #[error("controller firmware {0} is too old for streaming operation")]
    OldFirmware(String),
    #[error("controller is in firmware-update mode")]
    InUpdateMode,
    #[error("controller rejected the command")]
    BadCommand,
    #[error("unexpected status {0:#04x} from the controller")]
    StatusError(u8),
    #[error("controller reported a framing error on the link")]
    FramingError,
    #[error("controller could not keep up with the incoming data")]
    SerialOverrun,
    #[error("host could not feed the controller fast enough")]
    SerialUnderflow,
    #[error("track 0 was not found during rewind")]
    Track0NotFound,
    #[error("cylinder {0} is out of range")]
    TrackRange(u8),
    #[error("controller failed to seek to the requested cylinder")]
    SelectTrackError,
    #[error("no disk in drive")]
    NoDiskInDrive,
    #[error("disk is write protected")]
    WriteProtected,
    #[error("controller timed out while writing the track")]
    WriteTimeout,
    #[error("invalid parameter")]
    BadParameter,
}

/// Which physical disk surface the head reads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Default,
)]
pub enum DiskSide {
    #[default]
    Lower,
    Upper,
}

impl DiskSide {
    /// Host emulators address sides as a bool; true is the upper side.
    pub fn from_upper(upper: bool) -> Self {
        if upper {
            Self::Upper
        } else {
            Self::Lower
        }
    }

    pub fn is_upper(self) -> bool {
        self == Self::Upper
    }
}

/// Head seek speed class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SeekSpeed {
    Slow,
    Normal,
    Fast,
    VeryFast,
}

/// Disk presence and write-protect state as last sensed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskState {
    pub present: bool,
    pub write_protected: bool,
}

/// Optional status piggy-backed on a seek response.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekReport {
    pub disk_present: Option<bool>,
    pub write_protected: Option<bool>,
}

/// Static facts about an opened controller.
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    /// Human-readable firmware version
    pub firmware: String,
    /// The hardware can sense disk presence without disturbing the head
    pub fast_disk_check: bool,
}

/// Highest cylinder number the protocols accept.
pub const MAX_CYLINDER: u8 = 81;

/// The capability set both controller families implement. All calls run
/// on the bridge worker; streaming hands decoded, index-aligned runs to
/// the sink.
pub trait FloppyController: Send {
    fn info(&self) -> &ControllerInfo;

    /// Spins the drive motor up or down. `dont_wait` skips the
    /// controller-side spin-up wait; the bridge simulates it instead.
    fn enable_motor(&mut self, enable: bool, dont_wait: bool) -> Result<(), ProtocolError>;

    /// Rewinds the head to track 0.
    fn find_track0(&mut self) -> Result<(), ProtocolError>;

    /// Seeks to a cylinder. May piggy-back disk status on the response.
    fn select_cylinder(
        &mut self,
        cylinder: u8,
        speed: SeekSpeed,
        skip_disk_check: bool,
    ) -> Result<SeekReport, ProtocolError>;

    fn select_side(&mut self, side: DiskSide) -> Result<(), ProtocolError>;

    /// Senses disk presence and write protection. `force` moves the
    /// hardware; otherwise the cached state is returned.
    fn check_disk(&mut self, force: bool) -> Result<DiskState, ProtocolError>;

    /// Streams the current track through the decoder and splicer into
    /// `sink`, cutting byte-aligned revolutions. `fingerprint` carries
    /// the revolution alignment over from previous streams of the same
    /// track and is updated in place.
    fn read_track_stream(
        &mut self,
        max_revolutions: u32,
        fingerprint: &mut Fingerprint,
        sink: &mut dyn SpliceSink,
    ) -> Result<(), ProtocolError>;

    /// Writes an MFM bit buffer to the current track.
    fn write_track(
        &mut self,
        mfm: &[u8],
        bit_count: u32,
        align_index: bool,
        precomp: bool,
    ) -> Result<(), ProtocolError>;

    /// Shuts the drive down and releases the port.
    fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_maps_host_bool() {
        assert_eq!(DiskSide::from_upper(true), DiskSide::Upper);
        assert_eq!(DiskSide::from_upper(false), DiskSide::Lower);
        assert!(DiskSide::Upper.is_upper());
    }

    #[test]
    fn protocol_errors_format() {
        let e = ProtocolError::OldFirmware("1.4".into());
        assert!(e.to_string().contains("1.4"));
        let e = ProtocolError::Transport(TransportError::PortNotFound);
        assert!(e.to_string().contains("not found"));
    }
}
