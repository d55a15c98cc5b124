//! Mock bus, delay, platform and sensor for testing without hardware.

use std::collections::HashMap;

use embedded_hal::delay::DelayNs;

use crate::catalog::{Configuration, SensorTimings};
use crate::controls::{Control, ControlId, ControlState, Flip};
use crate::interval::FrameInterval;
use crate::platform::{Pin, PinState, Platform, SubDevice};
use crate::traits::{FrameFormat, RegisterAccess, RegisterBus, Result, SensorError, SensorOps};
use crate::transport::{RegEntry, RegWidth};

/// Error returned by [`MockBus`] when a failure is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockBusError;

/// Bus transaction recorded by [`MockBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// Single message write.
    Write {
        /// Device address.
        address: u8,
        /// Bytes on the wire.
        bytes: Vec<u8>,
    },
    /// Bulk register write.
    Batch {
        /// Device address.
        address: u8,
        /// Register frames.
        frames: Vec<[u8; 3]>,
    },
    /// Read of `len` bytes.
    Read {
        /// Device address.
        address: u8,
        /// Bytes read.
        len: usize,
    },
}

/// In-memory register bus.
///
/// Written registers are remembered and read back big-endian; the last
/// 2-byte write selects the register a following read returns. Only
/// successful transactions are recorded.
#[derive(Debug, Default)]
pub struct MockBus {
    registers: HashMap<u16, u32>,
    ops: Vec<BusOp>,
    pointer: u16,
    failing_writes: u32,
    failing_reads: bool,
    ops_before_failure: Option<usize>,
    write_attempts: usize,
    read_attempts: usize,
}

impl MockBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload register `reg`.
    #[must_use]
    pub fn with_register(mut self, reg: u16, value: u32) -> Self {
        self.registers.insert(reg, value);
        self
    }

    /// Fail the next `count` write or batch attempts.
    pub fn fail_next_writes(&mut self, count: u32) {
        self.failing_writes = count;
    }

    /// Fail every read while `fail` is set.
    pub fn fail_reads(&mut self, fail: bool) {
        self.failing_reads = fail;
    }

    /// Let `count` more transactions succeed, then fail everything.
    pub fn fail_after(&mut self, count: usize) {
        self.ops_before_failure = Some(count);
    }

    /// Clear every injected failure.
    pub fn heal(&mut self) {
        self.failing_writes = 0;
        self.failing_reads = false;
        self.ops_before_failure = None;
    }

    /// Successful transactions in order.
    pub fn ops(&self) -> &[BusOp] {
        &self.ops
    }

    /// Forget recorded transactions.
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Write and batch attempts, failed ones included.
    pub const fn write_attempts(&self) -> usize {
        self.write_attempts
    }

    /// Read attempts, failed ones included.
    pub const fn read_attempts(&self) -> usize {
        self.read_attempts
    }

    /// Frame count of every successful batch.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                BusOp::Batch { frames, .. } => Some(frames.len()),
                _ => None,
            })
            .collect()
    }

    /// Every register write in bus order, single and batched.
    pub fn written_registers(&self) -> Vec<(u16, u8)> {
        self.ops
            .iter()
            .flat_map(|op| -> Vec<(u16, u8)> {
                match op {
                    BusOp::Write { bytes, .. } => decode_frame(bytes).into_iter().collect(),
                    BusOp::Batch { frames, .. } => {
                        frames.iter().filter_map(|frame| decode_frame(frame)).collect()
                    }
                    BusOp::Read { .. } => Vec::new(),
                }
            })
            .collect()
    }

    /// Current value of register `reg`.
    pub fn register(&self, reg: u16) -> Option<u32> {
        self.registers.get(&reg).copied()
    }

    fn admit(&mut self) -> std::result::Result<(), MockBusError> {
        match self.ops_before_failure {
            Some(0) => Err(MockBusError),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn admit_write(&mut self) -> std::result::Result<(), MockBusError> {
        self.write_attempts += 1;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(MockBusError);
        }
        self.admit()
    }

    fn store(&mut self, frame: &[u8]) {
        if let Some((reg, value)) = decode_frame(frame) {
            self.registers.insert(reg, u32::from(value));
        }
    }
}

fn decode_frame(bytes: &[u8]) -> Option<(u16, u8)> {
    match *bytes {
        [hi, lo, value] => Some((u16::from_be_bytes([hi, lo]), value)),
        _ => None,
    }
}

impl RegisterBus for MockBus {
    type Error = MockBusError;

    fn write(&mut self, address: u8, bytes: &[u8]) -> std::result::Result<(), Self::Error> {
        self.admit_write()?;
        if let [hi, lo] = *bytes {
            self.pointer = u16::from_be_bytes([hi, lo]);
        }
        self.store(bytes);
        self.ops.push(BusOp::Write {
            address,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn write_batch(
        &mut self,
        address: u8,
        frames: &[[u8; 3]],
    ) -> std::result::Result<(), Self::Error> {
        self.admit_write()?;
        for frame in frames {
            self.store(frame);
        }
        self.ops.push(BusOp::Batch {
            address,
            frames: frames.to_vec(),
        });
        Ok(())
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> std::result::Result<(), Self::Error> {
        self.read_attempts += 1;
        if self.failing_reads {
            return Err(MockBusError);
        }
        self.admit()?;
        let value = self.register(self.pointer).unwrap_or(0).to_be_bytes();
        let source = 4usize
            .checked_sub(buffer.len())
            .and_then(|start| value.get(start..))
            .ok_or(MockBusError)?;
        buffer.copy_from_slice(source);
        self.ops.push(BusOp::Read {
            address,
            len: buffer.len(),
        });
        Ok(())
    }
}

/// Delay that records requested waits in ms instead of sleeping.
#[derive(Debug, Default)]
pub struct MockDelay {
    delays: Vec<u32>,
}

impl MockDelay {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded waits in ms.
    pub fn delays(&self) -> &[u32] {
        &self.delays
    }

    /// Sum of recorded waits in ms.
    pub fn total_ms(&self) -> u32 {
        self.delays.iter().sum()
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.delays.push(ns.div_ceil(1_000_000));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }
}

/// Sub-device storing control values in memory.
#[derive(Debug, Default)]
pub struct MockSubDevice {
    values: HashMap<u32, i32>,
    init_calls: usize,
    fail_init: bool,
}

impl MockSubDevice {
    /// Create a sub-device with every control at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload control `id`.
    #[must_use]
    pub fn with_value(mut self, id: u32, value: i32) -> Self {
        self.values.insert(id, value);
        self
    }

    /// Make `init` fail.
    #[must_use]
    pub const fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Value of control `id`.
    pub fn value(&self, id: u32) -> Option<i32> {
        self.values.get(&id).copied()
    }

    /// Number of `init` calls.
    pub const fn init_calls(&self) -> usize {
        self.init_calls
    }
}

impl SubDevice for MockSubDevice {
    fn init(&mut self) -> Result<()> {
        self.init_calls += 1;
        if self.fail_init {
            return Err(SensorError::Transport("sub-device init".to_owned()));
        }
        Ok(())
    }

    fn get_control(&mut self, id: u32) -> Result<i32> {
        Ok(self.value(id).unwrap_or_default())
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<()> {
        self.values.insert(id, value);
        Ok(())
    }
}

/// Platform call recorded by [`MockPlatform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCall {
    /// `init`.
    Init,
    /// `release`.
    Release,
    /// `set_power`.
    Power(bool),
    /// `set_pin`.
    Pin(Pin, PinState),
    /// `patch_format`.
    PatchFormat(Option<FrameFormat>, Option<FrameInterval>),
    /// `ioctl`.
    Ioctl(u32),
}

/// Platform recording every call, with optional sub-devices and failure injection.
#[derive(Debug, Default)]
pub struct MockPlatform {
    calls: Vec<PlatformCall>,
    focus: Option<MockSubDevice>,
    ircut: Option<MockSubDevice>,
    fail_init: bool,
    fail_power: bool,
    fail_pin: bool,
}

impl MockPlatform {
    /// Create a platform without sub-devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a focus sub-device.
    #[must_use]
    pub fn with_focus(mut self, focus: MockSubDevice) -> Self {
        self.focus = Some(focus);
        self
    }

    /// Attach an IR-cut sub-device.
    #[must_use]
    pub fn with_ircut(mut self, ircut: MockSubDevice) -> Self {
        self.ircut = Some(ircut);
        self
    }

    /// Calls in order, failed ones excluded.
    pub fn calls(&self) -> &[PlatformCall] {
        &self.calls
    }

    /// Forget recorded calls.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Focus sub-device, if attached.
    pub const fn focus(&self) -> Option<&MockSubDevice> {
        self.focus.as_ref()
    }

    /// IR-cut sub-device, if attached.
    pub const fn ircut(&self) -> Option<&MockSubDevice> {
        self.ircut.as_ref()
    }

    /// Make `init` fail while `fail` is set.
    pub fn fail_init(&mut self, fail: bool) {
        self.fail_init = fail;
    }

    /// Make `set_power` fail while `fail` is set.
    pub fn fail_power(&mut self, fail: bool) {
        self.fail_power = fail;
    }

    /// Make `set_pin` fail while `fail` is set.
    pub fn fail_pin(&mut self, fail: bool) {
        self.fail_pin = fail;
    }
}

impl Platform for MockPlatform {
    fn init(&mut self) -> Result<()> {
        if self.fail_init {
            return Err(SensorError::Transport("platform init".to_owned()));
        }
        self.calls.push(PlatformCall::Init);
        Ok(())
    }

    fn release(&mut self) {
        self.calls.push(PlatformCall::Release);
    }

    fn set_power(&mut self, on: bool) -> Result<()> {
        if self.fail_power {
            return Err(SensorError::Transport("regulator".to_owned()));
        }
        self.calls.push(PlatformCall::Power(on));
        Ok(())
    }

    fn set_pin(&mut self, pin: Pin, state: PinState) -> Result<()> {
        if self.fail_pin {
            return Err(SensorError::Transport(format!("gpio {pin:?}")));
        }
        self.calls.push(PlatformCall::Pin(pin, state));
        Ok(())
    }

    fn focus_subdevice(&mut self) -> Option<&mut dyn SubDevice> {
        self.focus.as_mut().map(|focus| focus as &mut dyn SubDevice)
    }

    fn ircut_subdevice(&mut self) -> Option<&mut dyn SubDevice> {
        self.ircut.as_mut().map(|ircut| ircut as &mut dyn SubDevice)
    }

    fn patch_format(
        &mut self,
        format: Option<&FrameFormat>,
        interval: Option<FrameInterval>,
    ) -> Result<()> {
        self.calls
            .push(PlatformCall::PatchFormat(format.copied(), interval));
        Ok(())
    }

    fn ioctl(&mut self, cmd: u32) -> Result<()> {
        self.calls.push(PlatformCall::Ioctl(cmd));
        Ok(())
    }
}

/// Sensor callback that [`MockSensor`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `init_common`.
    Init,
    /// `check_camera_id`.
    CameraId,
    /// `start_streaming`.
    Start,
    /// `stop_streaming`.
    Stop,
    /// `write_controls`.
    Controls,
    /// `timings`.
    Timings,
    /// `set_vts`.
    Vts,
    /// `set_flash`.
    Flash,
}

/// Register holding the streaming bit.
pub const MOCK_STREAM_REG: u16 = 0x0100;
/// High byte of the frame length register.
pub const MOCK_VTS_REG: u16 = 0x0340;
/// Register patched by `set_flip` in auxiliary scripts.
pub const MOCK_FLIP_REG: u16 = 0x0101;

/// Sensor callbacks recording every call.
///
/// Streaming toggles [`MOCK_STREAM_REG`]; the frame length goes to
/// [`MOCK_VTS_REG`] as two bytes.
#[derive(Debug, Default)]
pub struct MockSensor {
    supports_vts: bool,
    failing: Vec<Hook>,
    readback: (u32, u32),
    init_calls: usize,
    id_checks: usize,
    start_calls: usize,
    stop_calls: usize,
    control_writes: Vec<Vec<Control>>,
    refreshed: Vec<ControlId>,
    vts_writes: Vec<u32>,
    flash_modes: Vec<i32>,
}

impl MockSensor {
    /// Create a sensor without a vertical timing callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the vertical timing callback.
    #[must_use]
    pub const fn with_vts_support(mut self) -> Self {
        self.supports_vts = true;
        self
    }

    /// Fail `hook` until [`MockSensor::recover`] is called.
    #[must_use]
    pub fn failing(mut self, hook: Hook) -> Self {
        self.fail(hook);
        self
    }

    /// Start failing `hook`.
    pub fn fail(&mut self, hook: Hook) {
        self.failing.push(hook);
    }

    /// Stop failing `hook`.
    pub fn recover(&mut self, hook: Hook) {
        self.failing.retain(|failing| *failing != hook);
    }

    /// Exposure and gain reported by `timings`.
    pub fn set_readback(&mut self, exp_time: u32, gain: u32) {
        self.readback = (exp_time, gain);
    }

    /// Number of `init_common` calls.
    pub const fn init_calls(&self) -> usize {
        self.init_calls
    }

    /// Number of `check_camera_id` calls.
    pub const fn id_checks(&self) -> usize {
        self.id_checks
    }

    /// Number of `start_streaming` calls.
    pub const fn start_calls(&self) -> usize {
        self.start_calls
    }

    /// Number of `stop_streaming` calls.
    pub const fn stop_calls(&self) -> usize {
        self.stop_calls
    }

    /// Every batch passed to `write_controls`.
    pub fn control_writes(&self) -> &[Vec<Control>] {
        &self.control_writes
    }

    /// Controls refreshed before a read.
    pub fn refreshed(&self) -> &[ControlId] {
        &self.refreshed
    }

    /// Every frame length pushed.
    pub fn vts_writes(&self) -> &[u32] {
        &self.vts_writes
    }

    /// Every flash mode accepted.
    pub fn flash_modes(&self) -> &[i32] {
        &self.flash_modes
    }

    fn check(&self, hook: Hook) -> Result<()> {
        if self.failing.contains(&hook) {
            return Err(SensorError::Transport(format!("mock {hook:?} failure")));
        }
        Ok(())
    }
}

impl SensorOps for MockSensor {
    fn start_streaming(&mut self, regs: &mut dyn RegisterAccess) -> Result<()> {
        self.check(Hook::Start)?;
        self.start_calls += 1;
        regs.write_reg(MOCK_STREAM_REG, 0x01)
    }

    fn stop_streaming(&mut self, regs: &mut dyn RegisterAccess) -> Result<()> {
        self.check(Hook::Stop)?;
        self.stop_calls += 1;
        regs.write_reg(MOCK_STREAM_REG, 0x00)
    }

    fn write_controls(
        &mut self,
        _regs: &mut dyn RegisterAccess,
        controls: &[Control],
    ) -> Result<()> {
        self.check(Hook::Controls)?;
        self.control_writes.push(controls.to_vec());
        Ok(())
    }

    fn refresh_control(
        &mut self,
        _regs: &mut dyn RegisterAccess,
        id: ControlId,
        _state: &mut ControlState,
    ) -> Result<()> {
        self.refreshed.push(id);
        Ok(())
    }

    fn init_common(&mut self, _regs: &mut dyn RegisterAccess) -> Result<()> {
        self.check(Hook::Init)?;
        self.init_calls += 1;
        Ok(())
    }

    fn check_camera_id(&mut self, regs: &mut dyn RegisterAccess) -> Result<()> {
        self.check(Hook::CameraId)?;
        self.id_checks += 1;
        regs.read_reg(RegWidth::Word, 0x300a).map(|_| ())
    }

    fn supports_vts(&self) -> bool {
        self.supports_vts
    }

    fn set_vts(&mut self, regs: &mut dyn RegisterAccess, vts: u32) -> Result<()> {
        if !self.supports_vts {
            return Err(SensorError::Unsupported("vertical timing update".to_owned()));
        }
        self.check(Hook::Vts)?;
        let [.., hi, lo] = vts.to_be_bytes();
        regs.write_reg(MOCK_VTS_REG, hi)?;
        regs.write_reg(MOCK_VTS_REG + 1, lo)?;
        self.vts_writes.push(vts);
        Ok(())
    }

    fn timings(
        &mut self,
        _regs: &mut dyn RegisterAccess,
        config: &Configuration,
    ) -> Result<SensorTimings> {
        self.check(Hook::Timings)?;
        let (exp_time, gain) = self.readback;
        Ok(SensorTimings {
            mode: *config.timings(),
            exp_time,
            gain,
        })
    }

    fn set_flip(&mut self, flip: Flip, sub_script: &mut [RegEntry]) {
        let value = u32::from(flip.hflip) | (u32::from(flip.vflip) << 1);
        for entry in sub_script.iter_mut().filter(|e| e.reg == MOCK_FLIP_REG) {
            entry.val = value;
        }
    }

    fn set_flash(&mut self, mode: i32) -> Result<()> {
        self.check(Hook::Flash)?;
        self.flash_modes.push(mode);
        Ok(())
    }

    fn exposure_valid_frame(&self) -> [u32; 2] {
        [2, 2]
    }
}
