//! Control plane: exposure, white balance, focus, flip and flash controls.
//!
//! Controls are addressed by their V4L2 control id. While the sensor is
//! awake a `set_controls` batch is written through to the sensor callbacks
//! once the whole batch has been applied to memory; while it is off the
//! change is only flagged and replayed at the next configuration write.

use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use log::{debug, warn};

use crate::device::SensorModule;
use crate::platform::Platform;
use crate::traits::{RegisterBus, Result, SensorError, SensorOps};

const V4L2_CID_USER_BASE: u32 = 0x0098_0900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;
const V4L2_CID_FLASH_CLASS_BASE: u32 = 0x009c_0900;
const PRIVATE_CID_BASE: u32 = 0x0800_0000;

/// Controls understood by the sensor module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    /// Analog gain.
    Gain,
    /// Gain as a percentage of the sensor's range.
    GainPercent,
    /// Exposure time.
    Exposure,
    /// Auto gain on/off.
    AutoGain,
    /// Auto exposure mode.
    ExposureAuto,
    /// Auto white balance on/off.
    AutoWhiteBalance,
    /// White balance color temperature.
    WhiteBalanceTemperature,
    /// White balance preset.
    AutoNPresetWhiteBalance,
    /// Absolute focus position.
    FocusAbsolute,
    /// IR-cut filter.
    BandStopFilter,
    /// Horizontal mirror.
    HFlip,
    /// Vertical flip.
    VFlip,
    /// Flash LED mode.
    FlashLedMode,
    /// Automatic frame rate adjustment.
    AutoFps,
    /// Vertical blanking time of the active mode, read only.
    VBlanking,
}

impl ControlId {
    const ALL: [Self; 15] = [
        Self::Gain,
        Self::GainPercent,
        Self::Exposure,
        Self::AutoGain,
        Self::ExposureAuto,
        Self::AutoWhiteBalance,
        Self::WhiteBalanceTemperature,
        Self::AutoNPresetWhiteBalance,
        Self::FocusAbsolute,
        Self::BandStopFilter,
        Self::HFlip,
        Self::VFlip,
        Self::FlashLedMode,
        Self::AutoFps,
        Self::VBlanking,
    ];

    /// Numeric control id.
    pub const fn cid(self) -> u32 {
        match self {
            Self::AutoWhiteBalance => V4L2_CID_USER_BASE + 12,
            Self::Exposure => V4L2_CID_USER_BASE + 17,
            Self::AutoGain => V4L2_CID_USER_BASE + 18,
            Self::Gain => V4L2_CID_USER_BASE + 19,
            Self::HFlip => V4L2_CID_USER_BASE + 20,
            Self::VFlip => V4L2_CID_USER_BASE + 21,
            Self::WhiteBalanceTemperature => V4L2_CID_USER_BASE + 26,
            Self::BandStopFilter => V4L2_CID_USER_BASE + 33,
            Self::ExposureAuto => V4L2_CID_CAMERA_CLASS_BASE + 1,
            Self::FocusAbsolute => V4L2_CID_CAMERA_CLASS_BASE + 10,
            Self::AutoNPresetWhiteBalance => V4L2_CID_CAMERA_CLASS_BASE + 20,
            Self::FlashLedMode => V4L2_CID_FLASH_CLASS_BASE + 1,
            Self::VBlanking => PRIVATE_CID_BASE + 1,
            Self::GainPercent => PRIVATE_CID_BASE + 2,
            Self::AutoFps => PRIVATE_CID_BASE + 3,
        }
    }

    /// Control for a numeric id, if known.
    pub fn from_cid(cid: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.cid() == cid)
    }

    const fn update_flag(self) -> CtrlUpdate {
        match self {
            Self::Gain | Self::GainPercent => CtrlUpdate::GAIN,
            Self::Exposure => CtrlUpdate::EXP_TIME,
            Self::WhiteBalanceTemperature => CtrlUpdate::WB_TEMPERATURE,
            Self::AutoNPresetWhiteBalance => CtrlUpdate::PRESET_WB,
            Self::AutoGain => CtrlUpdate::AUTO_GAIN,
            Self::ExposureAuto => CtrlUpdate::AUTO_EXP,
            Self::AutoWhiteBalance => CtrlUpdate::AUTO_WB,
            Self::FocusAbsolute => CtrlUpdate::FOCUS_ABSOLUTE,
            Self::BandStopFilter
            | Self::HFlip
            | Self::VFlip
            | Self::FlashLedMode
            | Self::AutoFps
            | Self::VBlanking => CtrlUpdate::empty(),
        }
    }
}

/// A control id and value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// Numeric control id.
    pub id: u32,
    /// Value.
    pub value: i32,
}

impl Control {
    /// Control `id` set to `value`.
    pub const fn new(id: ControlId, value: i32) -> Self {
        Self {
            id: id.cid(),
            value,
        }
    }
}

bitflags! {
    /// Controls changed while the sensor was off.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CtrlUpdate: u32 {
        /// Gain.
        const GAIN = 1 << 0;
        /// Exposure time.
        const EXP_TIME = 1 << 1;
        /// White balance temperature.
        const WB_TEMPERATURE = 1 << 2;
        /// White balance preset.
        const PRESET_WB = 1 << 3;
        /// Auto gain.
        const AUTO_GAIN = 1 << 4;
        /// Auto exposure.
        const AUTO_EXP = 1 << 5;
        /// Auto white balance.
        const AUTO_WB = 1 << 6;
        /// Focus position.
        const FOCUS_ABSOLUTE = 1 << 7;
    }
}

/// Exposure and gain settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExposureConfig {
    /// Auto exposure enabled.
    pub auto_exp: bool,
    /// Auto gain enabled.
    pub auto_gain: bool,
    /// Exposure time.
    pub exp_time: i32,
    /// Gain.
    pub gain: i32,
    /// Gain in percent.
    pub gain_percent: i32,
    /// Flash LED mode.
    pub flash_mode: i32,
}

/// White balance settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhiteBalanceConfig {
    /// Auto white balance enabled.
    pub auto_wb: bool,
    /// Color temperature.
    pub temperature: i32,
    /// Preset id.
    pub preset_id: i32,
}

/// Focus settings kept when no focus sub-device is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusConfig {
    /// Absolute lens position.
    pub abs_pos: i32,
}

/// Mirror and flip state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flip {
    /// Horizontal mirror.
    pub hflip: bool,
    /// Vertical flip.
    pub vflip: bool,
}

/// In-memory control values plus controls awaiting a hardware write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// Exposure and gain.
    pub exposure: ExposureConfig,
    /// White balance.
    pub white_balance: WhiteBalanceConfig,
    /// Focus.
    pub focus: FocusConfig,
    /// Mirror and flip.
    pub flip: Flip,
    /// Frame rate follows exposure until an interval is set explicitly.
    pub auto_adjust_fps: bool,
    /// Controls to replay at the next configuration write.
    pub pending: CtrlUpdate,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            exposure: ExposureConfig::default(),
            white_balance: WhiteBalanceConfig::default(),
            focus: FocusConfig::default(),
            flip: Flip::default(),
            auto_adjust_fps: true,
            pending: CtrlUpdate::empty(),
        }
    }
}

impl ControlState {
    /// Current values of every control flagged in `pending`.
    pub fn pending_controls(&self) -> Vec<Control> {
        let exposure = &self.exposure;
        let wb = &self.white_balance;
        [
            (CtrlUpdate::GAIN, ControlId::Gain, exposure.gain),
            (CtrlUpdate::EXP_TIME, ControlId::Exposure, exposure.exp_time),
            (
                CtrlUpdate::WB_TEMPERATURE,
                ControlId::WhiteBalanceTemperature,
                wb.temperature,
            ),
            (
                CtrlUpdate::PRESET_WB,
                ControlId::AutoNPresetWhiteBalance,
                wb.preset_id,
            ),
            (
                CtrlUpdate::AUTO_GAIN,
                ControlId::AutoGain,
                i32::from(exposure.auto_gain),
            ),
            (
                CtrlUpdate::AUTO_EXP,
                ControlId::ExposureAuto,
                i32::from(exposure.auto_exp),
            ),
            (
                CtrlUpdate::AUTO_WB,
                ControlId::AutoWhiteBalance,
                i32::from(wb.auto_wb),
            ),
            (
                CtrlUpdate::FOCUS_ABSOLUTE,
                ControlId::FocusAbsolute,
                self.focus.abs_pos,
            ),
        ]
        .into_iter()
        .filter(|(flag, _, _)| self.pending.contains(*flag))
        .map(|(_, id, value)| Control::new(id, value))
        .collect()
    }

    fn value(&self, id: ControlId) -> Option<i32> {
        let value = match id {
            ControlId::Gain => self.exposure.gain,
            ControlId::GainPercent => self.exposure.gain_percent,
            ControlId::Exposure => self.exposure.exp_time,
            ControlId::AutoGain => i32::from(self.exposure.auto_gain),
            ControlId::ExposureAuto => i32::from(self.exposure.auto_exp),
            ControlId::AutoWhiteBalance => i32::from(self.white_balance.auto_wb),
            ControlId::WhiteBalanceTemperature => self.white_balance.temperature,
            ControlId::AutoNPresetWhiteBalance => self.white_balance.preset_id,
            ControlId::FocusAbsolute => self.focus.abs_pos,
            ControlId::BandStopFilter
            | ControlId::HFlip
            | ControlId::VFlip
            | ControlId::FlashLedMode
            | ControlId::AutoFps
            | ControlId::VBlanking => return None,
        };
        Some(value)
    }

    /// Store `value` for a locally buffered control.
    fn store(&mut self, id: ControlId, value: i32) {
        match id {
            ControlId::Gain => self.exposure.gain = value,
            ControlId::GainPercent => self.exposure.gain_percent = value,
            ControlId::Exposure => self.exposure.exp_time = value,
            ControlId::AutoGain => self.exposure.auto_gain = value != 0,
            ControlId::ExposureAuto => self.exposure.auto_exp = value != 0,
            ControlId::AutoWhiteBalance => self.white_balance.auto_wb = value != 0,
            ControlId::WhiteBalanceTemperature => self.white_balance.temperature = value,
            ControlId::AutoNPresetWhiteBalance => self.white_balance.preset_id = value,
            ControlId::FocusAbsolute => self.focus.abs_pos = value,
            ControlId::HFlip => self.flip.hflip = value != 0,
            ControlId::VFlip => self.flip.vflip = value != 0,
            ControlId::AutoFps => self.auto_adjust_fps = value != 0,
            ControlId::FlashLedMode => self.exposure.flash_mode = value,
            ControlId::BandStopFilter | ControlId::VBlanking => {}
        }
    }
}

impl<B, D, P, S> SensorModule<B, D, P, S>
where
    B: RegisterBus,
    D: DelayNs,
    P: Platform,
    S: SensorOps,
{
    /// Read control `cid`.
    ///
    /// Flash mode is always readable and vertical blanking needs only an
    /// active configuration. Everything else needs the sensor awake and is
    /// refreshed from hardware first. Focus and IR-cut reads go to their
    /// sub-device when one is attached.
    pub fn get_control(&mut self, cid: u32) -> Result<i32> {
        let id = ControlId::from_cid(cid);
        if id == Some(ControlId::FlashLedMode) {
            return Ok(self.controls.exposure.flash_mode);
        }

        let Some(config) = self.active_config() else {
            return Err(SensorError::InvalidState {
                state: self.state,
                reason: "no active sensor configuration",
            });
        };
        if id == Some(ControlId::VBlanking) {
            return Ok(i32::try_from(config.v_blanking_time_us()).unwrap_or(i32::MAX));
        }

        if !self.state.is_awake() {
            return Err(SensorError::InvalidState {
                state: self.state,
                reason: "cannot get controls when camera is off",
            });
        }

        let Some(id) = id else {
            return Err(SensorError::Unsupported(format!("control {cid:#x}")));
        };
        match id {
            ControlId::FocusAbsolute => {
                if let Some(focus) = self.platform.focus_subdevice() {
                    return focus.get_control(cid);
                }
            }
            ControlId::BandStopFilter => {
                if let Some(ircut) = self.platform.ircut_subdevice() {
                    return ircut.get_control(cid);
                }
            }
            _ => {}
        }

        if self.controls.value(id).is_none() {
            return Err(SensorError::Unsupported(format!("control {id:?}")));
        }
        self.ops
            .refresh_control(&mut self.transport, id, &mut self.controls)?;
        let value = self.controls.value(id).unwrap_or_default();
        debug!("get {id:?} = {value}");
        Ok(value)
    }

    /// Apply a batch of controls.
    ///
    /// Unknown ids are skipped. A failing flash hook leaves the flash mode
    /// unchanged and is reported after the rest of the batch. Partial
    /// write-through failures do not roll back the stored values.
    pub fn set_controls(&mut self, controls: &[Control]) -> Result<()> {
        if controls.is_empty() {
            return Err(SensorError::InvalidArgument("empty control batch".to_owned()));
        }

        let awake = self.state.is_awake();
        let mut staged: Vec<Control> = Vec::new();
        staged
            .try_reserve_exact(controls.len())
            .map_err(|_| SensorError::AllocationFailure)?;
        let mut outcome = Ok(());

        for control in controls {
            let Some(id) = ControlId::from_cid(control.id) else {
                warn!("ignoring unknown ctrl {:#x}", control.id);
                continue;
            };
            debug!("set {id:?} = {}", control.value);

            match id {
                ControlId::FocusAbsolute => {
                    if let Some(focus) = self.platform.focus_subdevice() {
                        return focus.set_control(control.id, control.value);
                    }
                }
                ControlId::BandStopFilter => {
                    if let Some(ircut) = self.platform.ircut_subdevice() {
                        return ircut.set_control(control.id, control.value);
                    }
                    warn!("no IR-cut filter attached, ignoring {:#x}", control.id);
                    continue;
                }
                ControlId::FlashLedMode => {
                    if let Err(err) = self.ops.set_flash(control.value) {
                        warn!("flash mode {} rejected: {err}", control.value);
                        if outcome.is_ok() {
                            outcome = Err(err);
                        }
                        continue;
                    }
                }
                ControlId::VBlanking => {
                    warn!("ignoring read-only ctrl {:#x}", control.id);
                    continue;
                }
                _ => {}
            }

            self.controls.store(id, control.value);
            let flag = id.update_flag();
            if flag.is_empty() {
                continue;
            }
            if awake {
                staged.push(*control);
            } else {
                self.controls.pending |= flag;
            }
        }

        if !staged.is_empty() {
            self.ops
                .write_controls(&mut self.transport, &staged)
                .inspect_err(|err| warn!("control write-through failed: {err}"))?;
        }
        outcome
    }

    /// Apply a single control.
    pub fn set_control(&mut self, control: Control) -> Result<()> {
        self.set_controls(std::slice::from_ref(&control))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_lookup_roundtrip() {
        for id in ControlId::ALL {
            assert_eq!(ControlId::from_cid(id.cid()), Some(id));
        }
        assert_eq!(ControlId::Gain.cid(), 0x0098_0913);
        assert_eq!(ControlId::from_cid(0xdead_beef), None);
    }

    #[test]
    fn test_control_state_defaults() {
        let state = ControlState::default();
        assert!(state.auto_adjust_fps);
        assert!(state.pending.is_empty());
        assert!(state.pending_controls().is_empty());
    }

    #[test]
    fn test_pending_controls_follow_flags() {
        let mut state = ControlState::default();
        state.store(ControlId::Gain, 8);
        state.store(ControlId::AutoWhiteBalance, 1);
        state.pending = CtrlUpdate::GAIN | CtrlUpdate::AUTO_WB;
        assert_eq!(
            state.pending_controls(),
            vec![
                Control::new(ControlId::Gain, 8),
                Control::new(ControlId::AutoWhiteBalance, 1),
            ]
        );
    }

    #[test]
    fn test_gain_percent_shares_gain_flag() {
        assert_eq!(ControlId::GainPercent.update_flag(), CtrlUpdate::GAIN);
        assert!(ControlId::HFlip.update_flag().is_empty());
    }
}
