//! Platform collaborator: power rails, control pins and auxiliary sub-devices.

use embedded_hal::digital::OutputPin;

use crate::interval::FrameInterval;
use crate::traits::{FrameFormat, Result, SensorError};

/// Sensor control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
    /// Power-down (standby) line.
    PowerDown,
    /// Hardware reset line.
    Reset,
}

/// Logical pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// Line asserted.
    Active,
    /// Line released.
    Inactive,
}

/// Auxiliary sub-device (focus motor, IR-cut filter) reached through the platform.
pub trait SubDevice {
    /// Bring the sub-device up after the sensor leaves hardware standby.
    fn init(&mut self) -> Result<()>;

    /// Read control `id`.
    fn get_control(&mut self, id: u32) -> Result<i32>;

    /// Write control `id`.
    fn set_control(&mut self, id: u32, value: i32) -> Result<()>;
}

/// Platform services the sensor module depends on.
pub trait Platform {
    /// Acquire platform resources at attach.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release platform resources.
    fn release(&mut self) {}

    /// Switch sensor supplies and clock on or off.
    fn set_power(&mut self, on: bool) -> Result<()>;

    /// Drive a control line.
    fn set_pin(&mut self, pin: Pin, state: PinState) -> Result<()>;

    /// Focus sub-device, if one is attached.
    fn focus_subdevice(&mut self) -> Option<&mut dyn SubDevice> {
        None
    }

    /// IR-cut filter sub-device, if one is attached.
    fn ircut_subdevice(&mut self) -> Option<&mut dyn SubDevice> {
        None
    }

    /// Report the format and interval actually programmed.
    fn patch_format(
        &mut self,
        _format: Option<&FrameFormat>,
        _interval: Option<FrameInterval>,
    ) -> Result<()> {
        Ok(())
    }

    /// Platform-specific command not handled by the sensor module.
    fn ioctl(&mut self, cmd: u32) -> Result<()> {
        Err(SensorError::Unsupported(format!("ioctl {cmd:#x}")))
    }
}

/// [`Platform`] driving power, power-down and reset lines as GPIOs.
///
/// All three lines are active high.
pub struct GpioPlatform<PWR, PD, RST> {
    power: PWR,
    powerdown: PD,
    reset: RST,
}

impl<PWR, PD, RST> GpioPlatform<PWR, PD, RST>
where
    PWR: OutputPin,
    PD: OutputPin,
    RST: OutputPin,
{
    /// Wrap the three control lines.
    pub const fn new(power: PWR, powerdown: PD, reset: RST) -> Self {
        Self {
            power,
            powerdown,
            reset,
        }
    }
}

fn drive<P: OutputPin>(pin: &mut P, high: bool) -> Result<()> {
    let result = if high { pin.set_high() } else { pin.set_low() };
    result.map_err(|err| SensorError::Transport(format!("gpio: {err:?}")))
}

impl<PWR, PD, RST> Platform for GpioPlatform<PWR, PD, RST>
where
    PWR: OutputPin,
    PD: OutputPin,
    RST: OutputPin,
{
    fn set_power(&mut self, on: bool) -> Result<()> {
        drive(&mut self.power, on)
    }

    fn set_pin(&mut self, pin: Pin, state: PinState) -> Result<()> {
        let high = state == PinState::Active;
        match pin {
            Pin::PowerDown => drive(&mut self.powerdown, high),
            Pin::Reset => drive(&mut self.reset, high),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Default)]
    struct FakePin {
        high: bool,
    }

    impl embedded_hal::digital::ErrorType for FakePin {
        type Error = Infallible;
    }

    impl OutputPin for FakePin {
        fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
            self.high = false;
            Ok(())
        }

        fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
            self.high = true;
            Ok(())
        }
    }

    #[test]
    fn test_gpio_platform_drives_lines() {
        let mut platform =
            GpioPlatform::new(FakePin::default(), FakePin::default(), FakePin::default());
        platform.set_power(true).expect("power on");
        platform
            .set_pin(Pin::PowerDown, PinState::Active)
            .expect("assert power-down");
        platform
            .set_pin(Pin::Reset, PinState::Inactive)
            .expect("release reset");
        assert!(platform.power.high);
        assert!(platform.powerdown.high);
        assert!(!platform.reset.high);
    }

    #[test]
    fn test_default_ioctl_unsupported() {
        let mut platform =
            GpioPlatform::new(FakePin::default(), FakePin::default(), FakePin::default());
        assert!(matches!(
            platform.ioctl(0x1234),
            Err(SensorError::Unsupported(_))
        ));
        assert!(platform.focus_subdevice().is_none());
    }
}
