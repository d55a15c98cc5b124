//! Sensor module state machine: power sequencing, streaming and config writes.

use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::catalog::{Catalog, Configuration, InterfaceConfig, ModeTimings};
use crate::controls::{ControlState, CtrlUpdate};
use crate::interval::{proportional_vts, FrameInterval};
use crate::platform::{Pin, PinState, Platform};
use crate::traits::{FrameFormat, RegisterBus, Result, SensorError, SensorOps, Stage};
use crate::transport::{BusChannel, RegEntry, RegWidth, Transport, REG_TYPE_TIMEOUT};

/// Power and streaming state of the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceState {
    /// Supplies off.
    #[default]
    PowerOff,
    /// Supplies on, power-down pin asserted.
    HwStandby,
    /// Sensor up and programmable, not streaming.
    SwStandby,
    /// Sensor outputting frames.
    Streaming,
}

impl DeviceState {
    /// True when registers can be written: software standby or streaming.
    pub const fn is_awake(self) -> bool {
        matches!(self, Self::SwStandby | Self::Streaming)
    }
}

/// Supplemental sensor timing data for the ISP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorModeData {
    /// Current mode timings.
    pub timings: ModeTimings,
    /// Frames until new exposure / gain take effect.
    pub exposure_valid_frame: [u32; 2],
    /// Exposure time; the last value set wins over the sensor readback.
    pub exp_time: u32,
    /// Gain; the last value set wins over the sensor readback.
    pub gain: u32,
}

/// Device-specific command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Read supplemental sensor timing data.
    SensorModeData,
    /// Get the bus interface configuration.
    InterfaceConfig,
    /// Anything else, forwarded to the platform.
    Platform(u32),
}

/// Result of an [`Ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    /// Timing data.
    SensorModeData(SensorModeData),
    /// Interface configuration.
    InterfaceConfig(InterfaceConfig),
    /// Platform handled the command.
    Done,
}

/// One camera sensor module.
///
/// Owns the register transport, the platform handle and the sensor
/// callbacks. Not internally synchronized: callers sharing a module between
/// threads must hold one lock across every call.
pub struct SensorModule<B, D, P, S> {
    pub(crate) transport: Transport<B, D>,
    pub(crate) platform: P,
    pub(crate) ops: S,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) aux_addresses: Vec<u8>,
    pub(crate) state: DeviceState,
    pub(crate) state_before_suspend: DeviceState,
    pub(crate) active: Option<usize>,
    pub(crate) format: Option<FrameFormat>,
    pub(crate) interval: Option<FrameInterval>,
    pub(crate) inited: bool,
    pub(crate) update_config: bool,
    pub(crate) vts: Option<u32>,
    pub(crate) controls: ControlState,
}

impl<B, D, P, S> SensorModule<B, D, P, S>
where
    B: RegisterBus,
    D: DelayNs,
    P: Platform,
    S: SensorOps,
{
    /// Create a powered-off module serving the modes in `catalog`.
    pub fn new(transport: Transport<B, D>, platform: P, ops: S, catalog: Arc<Catalog>) -> Self {
        Self {
            transport,
            platform,
            ops,
            catalog,
            aux_addresses: Vec::new(),
            state: DeviceState::PowerOff,
            state_before_suspend: DeviceState::PowerOff,
            active: None,
            format: None,
            interval: None,
            inited: false,
            update_config: true,
            vts: None,
            controls: ControlState::default(),
        }
    }

    /// Bus addresses of the auxiliary devices behind the bypass.
    #[must_use]
    pub fn with_aux_addresses(mut self, addresses: Vec<u8>) -> Self {
        self.aux_addresses = addresses;
        self
    }

    /// Current state.
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Last stable state, restored after resume.
    pub const fn state_before_suspend(&self) -> DeviceState {
        self.state_before_suspend
    }

    /// Active configuration, if any.
    pub fn active_config(&self) -> Option<&Configuration> {
        self.active.and_then(|index| self.catalog.get(index))
    }

    /// Index of the active configuration in the catalog.
    pub const fn active_index(&self) -> Option<usize> {
        self.active
    }

    /// Mode catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Control values and pending updates.
    pub const fn controls(&self) -> &ControlState {
        &self.controls
    }

    /// Stretched frame length in lines, if a non-native rate was requested.
    pub const fn vts(&self) -> Option<u32> {
        self.vts
    }

    /// True once a register script has been written since power up.
    pub const fn is_initialized(&self) -> bool {
        self.inited
    }

    /// True while the active configuration still has to be written.
    pub const fn update_pending(&self) -> bool {
        self.update_config
    }

    /// Register transport.
    pub const fn transport(&self) -> &Transport<B, D> {
        &self.transport
    }

    /// Register transport, mutably.
    pub fn transport_mut(&mut self) -> &mut Transport<B, D> {
        &mut self.transport
    }

    /// Platform handle.
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Platform handle, mutably.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Sensor callbacks.
    pub const fn ops(&self) -> &S {
        &self.ops
    }

    /// Sensor callbacks, mutably.
    pub fn ops_mut(&mut self) -> &mut S {
        &mut self.ops
    }

    fn reset(&mut self) {
        debug!("reset sensor module state");
        self.inited = false;
        self.active = None;
        self.update_config = true;
        self.format = None;
        self.interval = None;
        self.vts = None;
        self.controls = ControlState::default();
        self.state = DeviceState::PowerOff;
        self.state_before_suspend = DeviceState::PowerOff;
    }

    fn invalid_state(&self, reason: &'static str) -> SensorError {
        SensorError::InvalidState {
            state: self.state,
            reason,
        }
    }

    pub(crate) fn set_active_config(&mut self, index: usize) {
        let Some(config) = self.catalog.get(index) else {
            debug!("no active config");
            self.active = None;
            return;
        };

        self.controls.pending &= CtrlUpdate::AUTO_EXP | CtrlUpdate::AUTO_GAIN | CtrlUpdate::AUTO_WB;
        let exposure = &mut self.controls.exposure;
        if config.auto_exposure() != exposure.auto_exp {
            self.controls.pending |= CtrlUpdate::AUTO_EXP;
            exposure.auto_exp = config.auto_exposure();
        }
        if config.auto_gain() != exposure.auto_gain {
            self.controls.pending |= CtrlUpdate::AUTO_GAIN;
            exposure.auto_gain = config.auto_gain();
        }
        if config.auto_white_balance() != self.controls.white_balance.auto_wb {
            self.controls.pending |= CtrlUpdate::AUTO_WB;
            self.controls.white_balance.auto_wb = config.auto_white_balance();
        }

        if self.active != Some(index) {
            debug!("activating config '{}'", config.name());
            self.update_config = true;
            self.active = Some(index);
        }
    }

    /// Write the active configuration's script: full on first write or
    /// without a diff script, diff otherwise.
    fn write_config(&mut self) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        let Some(config) = self.active.and_then(|index| catalog.get(index)) else {
            error!("no active sensor configuration");
            return Err(self.invalid_state("no active sensor configuration"));
        };

        let script = match config.diff_script() {
            Some(diff) if self.inited => {
                config.set_soft_reset(false);
                debug!("write diff config {}", config.name());
                diff
            }
            _ => {
                config.set_soft_reset(true);
                debug!("write config {}", config.name());
                config.script()
            }
        };
        self.transport.write_script(script)?;

        if let Some(sub) = config.sub_script() {
            if !self.aux_addresses.is_empty() {
                let mut sub = sub.to_vec();
                self.ops.set_flip(self.controls.flip, &mut sub);
                self.write_aux_script(&sub)?;
            }
        }
        self.inited = true;

        self.platform.patch_format(self.format.as_ref(), self.interval)?;

        if !self.controls.pending.is_empty() {
            let pending = self.controls.pending_controls();
            debug!("applying {} pending controls", pending.len());
            self.ops.write_controls(&mut self.transport, &pending)?;
            self.controls.pending = CtrlUpdate::empty();
        }
        Ok(())
    }

    fn write_aux_script(&mut self, script: &[RegEntry]) -> Result<()> {
        self.transport.bus_select(BusChannel::All)?;
        let mut written = Ok(());
        for &address in &self.aux_addresses {
            written = self.transport.write_script_to(address, script);
            if written.is_err() {
                break;
            }
        }
        let restored = self.transport.bus_select(BusChannel::BypassOff);
        written.and(restored)
    }

    /// Bring the sensor from power off to software standby.
    ///
    /// Each step runs only if the previous one left the sensor in its
    /// precondition state; on failure the sensor stays where it got to and
    /// the error names the failing stage. A pending configuration is written
    /// once software standby is reached.
    pub fn power_on(&mut self) -> Result<()> {
        debug!("power on from {:?}", self.state);
        let result = self.power_on_steps();
        self.state_before_suspend = self.state;
        match &result {
            Ok(()) => info!("camera powered on"),
            Err(err) => error!("power on failed, camera left in state {:?}: {err}", self.state),
        }
        result
    }

    fn power_on_steps(&mut self) -> Result<()> {
        let delays = self.transport.timing().power_up_delays_ms;

        if self.state == DeviceState::PowerOff {
            self.platform
                .set_power(true)
                .map_err(|err| err.at(Stage::PowerUp, self.state))?;
            self.transport.sleep_ms(delays[0]);
            self.state = DeviceState::HwStandby;
        }

        if self.state == DeviceState::HwStandby {
            self.platform
                .set_pin(Pin::PowerDown, PinState::Inactive)
                .map_err(|err| err.at(Stage::PinRelease, self.state))?;
            self.transport.sleep_ms(delays[1]);
            self.state = DeviceState::SwStandby;

            self.ops
                .init_common(&mut self.transport)
                .map_err(|err| err.at(Stage::DeviceInit, self.state))?;
            let settle = self.transport.timing().init_settle_ms;
            self.transport.sleep_ms(settle);

            if let Some(focus) = self.platform.focus_subdevice() {
                focus
                    .init()
                    .map_err(|err| err.at(Stage::SubDeviceInit, DeviceState::SwStandby))?;
            }
        }

        if self.update_config && self.state == DeviceState::SwStandby && self.active.is_some() {
            self.write_config()
                .map_err(|err| err.at(Stage::ConfigWrite, self.state))?;
            self.update_config = false;
        }
        Ok(())
    }

    /// Bring the sensor down to power off, stopping the stream first.
    ///
    /// Reaching power off resets every control and negotiation field.
    pub fn power_off(&mut self) -> Result<()> {
        debug!("power off from {:?}", self.state);
        let result = self.power_off_steps();
        self.state_before_suspend = self.state;
        match &result {
            Ok(()) => info!("camera powered off"),
            Err(err) => error!("power off failed, camera left in state {:?}: {err}", self.state),
        }
        result
    }

    fn power_off_steps(&mut self) -> Result<()> {
        if self.state == DeviceState::Streaming {
            self.stream_off()?;
        }

        if self.state == DeviceState::SwStandby {
            self.platform
                .set_pin(Pin::PowerDown, PinState::Active)
                .map_err(|err| err.at(Stage::PinAssert, self.state))?;
            self.state = DeviceState::HwStandby;
        }

        if self.state == DeviceState::HwStandby {
            self.platform
                .set_power(false)
                .map_err(|err| err.at(Stage::PowerDown, self.state))?;
            self.reset();
        }
        Ok(())
    }

    /// Start streaming from software standby.
    ///
    /// Writes the pending configuration first; a failed write aborts before
    /// the stream is started. A requested rate slower than the mode's native
    /// rate is applied through the vertical timing callback once streaming.
    pub fn stream_on(&mut self) -> Result<()> {
        let Some(index) = self.active else {
            error!("no active sensor configuration, cannot start streaming");
            return Err(self.invalid_state("no active sensor configuration"));
        };
        if self.state != DeviceState::SwStandby {
            error!(
                "sensor is not powered on (in state {:?}), cannot start streaming",
                self.state
            );
            return Err(self.invalid_state("stream on requires software standby"));
        }

        if self.update_config {
            self.write_config()
                .map_err(|err| err.at(Stage::ConfigWrite, self.state))?;
        }

        self.ops
            .start_streaming(&mut self.transport)
            .map_err(|err| err.at(Stage::StartStreaming, self.state))?;

        let timing = self.apply_requested_interval(index);

        self.update_config = false;
        self.controls.pending = CtrlUpdate::empty();
        let settle = self.transport.timing().power_up_delays_ms[2];
        self.transport.sleep_ms(settle);
        self.state = DeviceState::Streaming;
        self.state_before_suspend = self.state;
        info!("streaming started");

        timing.map_err(|err| err.at(Stage::TimingUpdate, self.state))
    }

    fn apply_requested_interval(&mut self, index: usize) -> Result<()> {
        let Some(requested) = self.interval else {
            return Ok(());
        };
        let Some(config) = self.catalog.get(index) else {
            return Ok(());
        };
        let nominal = config.interval();
        if requested == nominal.normalized() {
            return Ok(());
        }
        if requested.is_faster_than(nominal) {
            warn!(
                "sensor does not support stream {}x{}@{}fps, using {}fps",
                config.format().width,
                config.format().height,
                requested.fps(),
                nominal.fps()
            );
            return Ok(());
        }
        if !self.ops.supports_vts() {
            warn!("no vertical timing callback, streaming at {}fps", nominal.fps());
            return Ok(());
        }

        let vts = proportional_vts(config.timings().frame_length_lines, nominal, requested);
        debug!("stretching frame to {vts} lines for {requested}");
        self.vts = Some(vts);
        self.ops.set_vts(&mut self.transport, vts)
    }

    /// Stop streaming and wait one frame time for the sensor to flush.
    ///
    /// If the timing query fails the sensor is still left in software
    /// standby and the query error is returned.
    pub fn stream_off(&mut self) -> Result<()> {
        if self.state != DeviceState::Streaming {
            return Err(self.invalid_state("stream off requires streaming"));
        }

        self.ops
            .stop_streaming(&mut self.transport)
            .map_err(|err| err.at(Stage::StopStreaming, self.state))?;

        let mode = self.sensor_mode_data();
        self.state = DeviceState::SwStandby;
        self.state_before_suspend = self.state;
        let mode = mode.map_err(|err| err.at(Stage::TimingQuery, self.state))?;

        match mode.timings.frame_time_ms() {
            Some(wait_ms) => self.transport.sleep_ms(wait_ms.saturating_add(1)),
            None => warn!("sensor reports no pixel clock, not waiting for flush"),
        }
        info!("streaming stopped");
        Ok(())
    }

    /// Supplemental timing data for the ISP.
    pub fn sensor_mode_data(&mut self) -> Result<SensorModeData> {
        let catalog = Arc::clone(&self.catalog);
        let Some(config) = self.active.and_then(|index| catalog.get(index)) else {
            return Err(self.invalid_state("no active sensor configuration"));
        };
        let sensor = self.ops.timings(&mut self.transport, config)?;

        let exposure = &self.controls.exposure;
        let stored = |value: i32| u32::try_from(value).ok().filter(|&v| v != 0);
        Ok(SensorModeData {
            timings: sensor.mode,
            exposure_valid_frame: self.ops.exposure_valid_frame(),
            exp_time: stored(exposure.exp_time).unwrap_or(sensor.exp_time),
            gain: stored(exposure.gain).unwrap_or(sensor.gain),
        })
    }

    /// Interface configuration of the active mode, or the first mode if none.
    pub fn interface_config(&self) -> Result<InterfaceConfig> {
        let config = self
            .active_config()
            .or_else(|| self.catalog.get(0))
            .ok_or_else(|| SensorError::InvalidArgument("empty mode catalog".to_owned()))?;
        Ok(*config.interface())
    }

    /// Device-specific command dispatch.
    pub fn ioctl(&mut self, cmd: Ioctl) -> Result<IoctlReply> {
        debug!("ioctl {cmd:?}");
        match cmd {
            Ioctl::SensorModeData => self.sensor_mode_data().map(IoctlReply::SensorModeData),
            Ioctl::InterfaceConfig => self.interface_config().map(IoctlReply::InterfaceConfig),
            Ioctl::Platform(code) => self.platform.ioctl(code).map(|()| IoctlReply::Done),
        }
    }

    /// Read a register, answering from the active script when the bus is not needed.
    ///
    /// While streaming the sensor is always read. Otherwise the last write
    /// to `reg` in the active full script is returned, falling back to a bus
    /// read in software standby.
    pub fn read_register_cached(&mut self, reg: u16) -> Result<u32> {
        if self.state == DeviceState::Streaming {
            return self.transport.read(RegWidth::Byte, reg);
        }

        let cached = self.active_config().and_then(|config| {
            config
                .script()
                .iter()
                .rev()
                .find(|entry| entry.reg == reg && entry.flag != REG_TYPE_TIMEOUT)
                .map(|entry| entry.val)
        });
        if let Some(value) = cached {
            return Ok(value);
        }

        if self.state == DeviceState::SwStandby {
            return self.transport.read(RegWidth::Byte, reg);
        }
        Err(self.invalid_state("register not cached and sensor is off"))
    }

    /// Reset state, acquire the platform and probe the sensor.
    ///
    /// The sensor is power cycled around the id check. On failure the
    /// platform is released again.
    pub fn attach(&mut self) -> Result<()> {
        self.reset();
        let result = self.attach_steps();
        if let Err(err) = &result {
            error!("attach failed: {err}");
            self.release();
        }
        result
    }

    fn attach_steps(&mut self) -> Result<()> {
        self.platform.init()?;
        self.platform.set_pin(Pin::PowerDown, PinState::Active)?;
        self.platform.set_pin(Pin::Reset, PinState::Active)?;

        self.power_on()?;
        let identity = self
            .ops
            .check_camera_id(&mut self.transport)
            .map_err(|err| err.at(Stage::IdentityCheck, self.state));
        let powered_off = self.power_off();
        identity.and(powered_off)
    }

    /// Drop the active configuration and release the platform.
    pub fn release(&mut self) {
        debug!("release");
        self.active = None;
        self.platform.release();
    }
}
