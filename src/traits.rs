//! Core traits and types shared by the sensor module.

use std::fmt;

use thiserror::Error;

use crate::catalog::{Configuration, SensorTimings};
use crate::controls::{Control, ControlId, ControlState, Flip};
use crate::device::DeviceState;
use crate::transport::{RegEntry, RegWidth};

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// 10-bit Bayer BGGR raw format.
    pub const SBGGR10: Self = Self::new(b"BG10");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Sensor output format: frame size plus pixel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format code.
    pub code: FourCC,
}

impl FrameFormat {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, code: FourCC) -> Self {
        Self {
            width,
            height,
            code,
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.code)
    }
}

/// Power or streaming step that failed during a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Switching the supply rails on.
    PowerUp,
    /// Releasing the power-down pin.
    PinRelease,
    /// Sensor-specific common initialization.
    DeviceInit,
    /// Initialization of the focus sub-device.
    SubDeviceInit,
    /// Writing the active configuration's register script.
    ConfigWrite,
    /// Starting the sensor output.
    StartStreaming,
    /// Pushing a recomputed vertical timing value.
    TimingUpdate,
    /// Stopping the sensor output.
    StopStreaming,
    /// Reading back sensor timings after stopping.
    TimingQuery,
    /// Asserting the power-down pin.
    PinAssert,
    /// Switching the supply rails off.
    PowerDown,
    /// Probing the sensor id during attach.
    IdentityCheck,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PowerUp => "power up",
            Self::PinRelease => "power-down pin release",
            Self::DeviceInit => "device init",
            Self::SubDeviceInit => "sub-device init",
            Self::ConfigWrite => "config write",
            Self::StartStreaming => "stream start",
            Self::TimingUpdate => "timing update",
            Self::StopStreaming => "stream stop",
            Self::TimingQuery => "timing query",
            Self::PinAssert => "power-down pin assert",
            Self::PowerDown => "power down",
            Self::IdentityCheck => "identity check",
        };
        f.write_str(name)
    }
}

/// Error type for sensor module operations.
#[derive(Debug, Error)]
pub enum SensorError {
    /// Bus I/O failed (after retries where the operation retries).
    #[error("bus transfer failed: {0}")]
    Transport(String),
    /// Malformed caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No matching configuration, rate too high, or unknown control/ioctl.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Operation not allowed in the current device state.
    #[error("not allowed in state {state:?}: {reason}")]
    InvalidState {
        /// State the device was in.
        state: DeviceState,
        /// What was attempted.
        reason: &'static str,
    },
    /// Register script entry carries an unknown flag.
    #[error("malformed register script entry {index}: flag {flag:#04x}")]
    MalformedScript {
        /// Position of the entry in the script.
        index: usize,
        /// The unrecognized flag.
        flag: u8,
    },
    /// Transfer buffer could not be allocated.
    #[error("transport buffer allocation failed")]
    AllocationFailure,
    /// Requested value is not available right now.
    #[error("unavailable: {0}")]
    Unavailable(&'static str),
    /// A transition step failed; the device is parked in `state`.
    #[error("{stage} failed, sensor left in state {state:?}")]
    Stage {
        /// The failing step.
        stage: Stage,
        /// State the device was left in.
        state: DeviceState,
        /// Underlying error.
        #[source]
        source: Box<SensorError>,
    },
}

impl SensorError {
    /// Wrap `self` as the failure of `stage`, leaving the device in `state`.
    #[must_use]
    pub fn at(self, stage: Stage, state: DeviceState) -> Self {
        Self::Stage {
            stage,
            state,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping stage context.
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type for sensor module operations.
pub type Result<T> = std::result::Result<T, SensorError>;

/// Register-oriented serial bus carrying sensor traffic.
///
/// Each message is a complete write or read addressed to a 7-bit device
/// address. `write_batch` issues every frame as its own message inside one
/// bus transaction.
pub trait RegisterBus {
    /// Bus-specific error type.
    type Error: fmt::Debug;

    /// Write `bytes` to the device at `address`.
    fn write(&mut self, address: u8, bytes: &[u8]) -> std::result::Result<(), Self::Error>;

    /// Write several 3-byte register frames in one transaction.
    fn write_batch(
        &mut self,
        address: u8,
        frames: &[[u8; 3]],
    ) -> std::result::Result<(), Self::Error>;

    /// Read `buffer.len()` bytes from the device at `address`.
    fn read(&mut self, address: u8, buffer: &mut [u8]) -> std::result::Result<(), Self::Error>;
}

/// Register access handed to sensor callbacks.
pub trait RegisterAccess {
    /// Write one 8-bit register, retrying on failure.
    fn write_reg(&mut self, reg: u16, value: u8) -> Result<()>;

    /// Read a 1, 2 or 4 byte register value.
    fn read_reg(&mut self, width: RegWidth, reg: u16) -> Result<u32>;

    /// Write a register script.
    fn write_reglist(&mut self, entries: &[RegEntry]) -> Result<()>;

    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}

/// Sensor-specific callbacks injected at construction.
///
/// The four required methods are mandatory for every sensor; the rest
/// default to "not provided".
pub trait SensorOps {
    /// Start pixel output.
    fn start_streaming(&mut self, regs: &mut dyn RegisterAccess) -> Result<()>;

    /// Stop pixel output.
    fn stop_streaming(&mut self, regs: &mut dyn RegisterAccess) -> Result<()>;

    /// Write a batch of control values to the hardware.
    fn write_controls(
        &mut self,
        regs: &mut dyn RegisterAccess,
        controls: &[Control],
    ) -> Result<()>;

    /// Refresh `state` from hardware before control `id` is read.
    fn refresh_control(
        &mut self,
        regs: &mut dyn RegisterAccess,
        id: ControlId,
        state: &mut ControlState,
    ) -> Result<()>;

    /// Common register setup run each time the sensor reaches software standby.
    fn init_common(&mut self, _regs: &mut dyn RegisterAccess) -> Result<()> {
        Ok(())
    }

    /// Verify the chip id during attach.
    fn check_camera_id(&mut self, _regs: &mut dyn RegisterAccess) -> Result<()> {
        Ok(())
    }

    /// Whether [`SensorOps::set_vts`] is implemented.
    fn supports_vts(&self) -> bool {
        false
    }

    /// Program the frame length in lines.
    fn set_vts(&mut self, _regs: &mut dyn RegisterAccess, _vts: u32) -> Result<()> {
        Err(SensorError::Unsupported("vertical timing update".to_owned()))
    }

    /// Current sensor timings. Defaults to the configuration's static timings.
    fn timings(
        &mut self,
        _regs: &mut dyn RegisterAccess,
        config: &Configuration,
    ) -> Result<SensorTimings> {
        Ok(SensorTimings::from_mode(config.timings()))
    }

    /// Patch the auxiliary script for the current flip state.
    fn set_flip(&mut self, _flip: Flip, _sub_script: &mut [RegEntry]) {}

    /// Drive the flash LED. The mode is committed only on success.
    fn set_flash(&mut self, _mode: i32) -> Result<()> {
        Ok(())
    }

    /// Frames until a new exposure / gain takes effect.
    fn exposure_valid_frame(&self) -> [u32; 2] {
        [0, 0]
    }
}
