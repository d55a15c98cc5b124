//! Cam-Module-Core: control core for register-programmed camera sensors
//!
//! This library drives a camera sensor over a register bus: power
//! sequencing, mode selection from a catalog of register scripts, frame
//! interval negotiation and image controls. Bus, platform and sensor
//! specifics are injected through traits, so the same core runs against
//! real hardware or the mocks in [`mock`].

pub mod catalog;
pub mod config;
pub mod controls;
pub mod device;
pub mod interval;
pub mod mock;
pub mod negotiation;
pub mod platform;
pub mod traits;
pub mod transport;
pub mod validation;

pub use catalog::{Catalog, Configuration, InterfaceConfig, ModeTimings, SensorTimings};
pub use config::TimingConfig;
pub use controls::{Control, ControlId, ControlState, CtrlUpdate};
pub use device::{DeviceState, Ioctl, IoctlReply, SensorModeData, SensorModule};
pub use interval::FrameInterval;
pub use negotiation::FrameIntervalEntry;
pub use platform::{GpioPlatform, Pin, PinState, Platform, SubDevice};
pub use traits::{FourCC, FrameFormat, RegisterAccess, RegisterBus, SensorError, SensorOps};
pub use transport::{BusChannel, HalBus, RegEntry, RegWidth, StdDelay, Transport};
