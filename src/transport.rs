//! Register transport: retried single writes, reads and chunked script writes.

use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use log::{debug, error};

use crate::config::TimingConfig;
use crate::traits::{RegisterAccess, RegisterBus, Result, SensorError};

/// Flag of a batched register write.
pub const REG_TYPE_DATA: u8 = 0x00;
/// Flag of a register write sent on its own, ahead of any pending batch.
pub const REG_TYPE_DATA_SINGLE: u8 = 0x01;
/// Flag of a delay directive; the value is in milliseconds.
pub const REG_TYPE_TIMEOUT: u8 = 0x02;

/// Raw register script entry: `(flag, register, value)`.
///
/// Scripts are consumed verbatim, so the flag is kept as a byte and only
/// decoded when the entry is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegEntry {
    /// One of the `REG_TYPE_*` flags.
    pub flag: u8,
    /// 16-bit register address.
    pub reg: u16,
    /// Register value, or delay in ms for timeouts.
    pub val: u32,
}

/// Decoded register script operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    /// Batched write.
    Data {
        /// Register address.
        reg: u16,
        /// Value written.
        val: u8,
    },
    /// Standalone write.
    Single {
        /// Register address.
        reg: u16,
        /// Value written.
        val: u8,
    },
    /// Delay in milliseconds.
    Delay(u32),
}

impl RegEntry {
    /// Batched register write.
    #[must_use]
    pub const fn data(reg: u16, val: u8) -> Self {
        Self::raw(REG_TYPE_DATA, reg, val as u32)
    }

    /// Register write sent immediately on its own.
    #[must_use]
    pub const fn single(reg: u16, val: u8) -> Self {
        Self::raw(REG_TYPE_DATA_SINGLE, reg, val as u32)
    }

    /// Delay directive.
    #[must_use]
    pub const fn delay(ms: u32) -> Self {
        Self::raw(REG_TYPE_TIMEOUT, 0, ms)
    }

    /// Entry with an arbitrary flag.
    #[must_use]
    pub const fn raw(flag: u8, reg: u16, val: u32) -> Self {
        Self { flag, reg, val }
    }

    /// Decode the entry found at `index` of its script.
    pub fn op(&self, index: usize) -> Result<RegOp> {
        // register values are 8 bits wide, only the low byte goes on the wire
        #[allow(clippy::cast_possible_truncation)]
        let byte = (self.val & 0xFF) as u8;
        match self.flag {
            REG_TYPE_DATA => Ok(RegOp::Data {
                reg: self.reg,
                val: byte,
            }),
            REG_TYPE_DATA_SINGLE => Ok(RegOp::Single {
                reg: self.reg,
                val: byte,
            }),
            REG_TYPE_TIMEOUT => Ok(RegOp::Delay(self.val)),
            flag => Err(SensorError::MalformedScript { index, flag }),
        }
    }
}

/// Width of a register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    /// One byte.
    Byte,
    /// Two bytes, big-endian.
    Word,
    /// Four bytes, big-endian.
    DWord,
}

impl RegWidth {
    /// Number of bytes read.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::DWord => 4,
        }
    }
}

impl TryFrom<u16> for RegWidth {
    type Error = SensorError;

    fn try_from(len: u16) -> Result<Self> {
        match len {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::DWord),
            other => Err(SensorError::InvalidArgument(format!(
                "register width {other} (expected 1, 2 or 4)"
            ))),
        }
    }
}

/// Downstream channel routed through the sensor's bus bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusChannel {
    /// No bypass: writes reach the sensor only.
    BypassOff = 0x00,
    /// First auxiliary device.
    Aux0 = 0x01,
    /// Second auxiliary device.
    Aux1 = 0x02,
    /// All auxiliary devices.
    All = 0x03,
}

const BYPASS_PAGE_REG: u16 = 0xfffd;
const BYPASS_PAGE_VAL: u8 = 0x80;
const BYPASS_BANK_REG: u16 = 0xfffe;
const BYPASS_BANK_VAL: u8 = 0x50;
const BYPASS_SELECT_REG: u16 = 0x004d;

fn frame(reg: u16, val: u8) -> [u8; 3] {
    let [hi, lo] = reg.to_be_bytes();
    [hi, lo, val]
}

fn bus_error<E: std::fmt::Debug>(address: u8, err: &E) -> SensorError {
    SensorError::Transport(format!("device {address:#04x}: {err:?}"))
}

/// Register transport bound to one sensor bus address.
pub struct Transport<B, D> {
    bus: B,
    delay: D,
    address: u8,
    timing: TimingConfig,
}

impl<B, D> Transport<B, D>
where
    B: RegisterBus,
    D: DelayNs,
{
    /// Create a transport for the device at `address`.
    pub const fn new(bus: B, delay: D, address: u8, timing: TimingConfig) -> Self {
        Self {
            bus,
            delay,
            address,
            timing,
        }
    }

    /// Sensor bus address.
    pub const fn address(&self) -> u8 {
        self.address
    }

    /// Underlying bus.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    /// Underlying bus, mutably.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Delay provider.
    pub const fn delay(&self) -> &D {
        &self.delay
    }

    /// Timing constants in use.
    pub const fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Sleep for `ms` milliseconds.
    pub fn sleep_ms(&mut self, ms: u32) {
        if ms > 0 {
            self.delay.delay_ms(ms);
        }
    }

    /// Write one register of the sensor, retrying with backoff.
    pub fn write_single(&mut self, reg: u16, val: u8) -> Result<()> {
        self.write_single_to(self.address, reg, val)
    }

    /// Write one register of the device at `address`, retrying with backoff.
    pub fn write_single_to(&mut self, address: u8, reg: u16, val: u8) -> Result<()> {
        let bytes = frame(reg, val);
        let attempts = self.timing.write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.bus.write(address, &bytes) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    debug!("i2c {address:#04x} reg {reg:#06x} attempt {attempt} failed: {err:?}");
                    self.sleep_ms(self.timing.retry_backoff_ms);
                    attempt += 1;
                }
                Err(err) => {
                    error!("i2c {address:#04x} reg {reg:#06x} val {val:#04x} failed");
                    return Err(bus_error(address, &err));
                }
            }
        }
    }

    /// Read a big-endian register value of the given width.
    ///
    /// Writes the register address, waits for the sensor to latch it, then
    /// reads the data phase. Neither phase is retried.
    pub fn read(&mut self, width: RegWidth, reg: u16) -> Result<u32> {
        let address = self.address;
        self.bus
            .write(address, &reg.to_be_bytes())
            .map_err(|err| bus_error(address, &err))?;
        self.sleep_ms(self.timing.read_settle_ms);

        let value = match width {
            RegWidth::Byte => {
                let mut buf = [0u8; 1];
                self.read_into(&mut buf)?;
                u32::from(u8::from_be_bytes(buf))
            }
            RegWidth::Word => {
                let mut buf = [0u8; 2];
                self.read_into(&mut buf)?;
                u32::from(u16::from_be_bytes(buf))
            }
            RegWidth::DWord => {
                let mut buf = [0u8; 4];
                self.read_into(&mut buf)?;
                u32::from_be_bytes(buf)
            }
        };
        debug!("i2c {address:#04x} read reg {reg:#06x} = {value:#x}");
        Ok(value)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let address = self.address;
        self.bus.read(address, buf).map_err(|err| {
            error!("i2c {address:#04x} read failed: {err:?}");
            bus_error(address, &err)
        })
    }

    /// Write a register script to the sensor.
    pub fn write_script(&mut self, entries: &[RegEntry]) -> Result<()> {
        self.write_script_to(self.address, entries)
    }

    /// Write a register script to the device at `address`.
    ///
    /// Consecutive data entries are grouped into bulk transactions of at
    /// most `max_batch` frames. Writes already issued are not undone when a
    /// later entry fails.
    pub fn write_script_to(&mut self, address: u8, entries: &[RegEntry]) -> Result<()> {
        let max_batch = self.timing.max_batch.max(1);
        let mut batch: Vec<[u8; 3]> = Vec::new();
        batch
            .try_reserve_exact(max_batch.min(entries.len()))
            .map_err(|_| SensorError::AllocationFailure)?;

        for (index, entry) in entries.iter().enumerate() {
            match entry.op(index)? {
                RegOp::Data { reg, val } => {
                    batch.push(frame(reg, val));
                    if batch.len() == max_batch {
                        self.flush(address, &mut batch)?;
                    }
                }
                RegOp::Single { reg, val } => {
                    self.bus
                        .write(address, &frame(reg, val))
                        .map_err(|err| bus_error(address, &err))?;
                }
                RegOp::Delay(ms) => {
                    self.flush(address, &mut batch)?;
                    self.sleep_ms(ms);
                }
            }
        }
        self.flush(address, &mut batch)
    }

    fn flush(&mut self, address: u8, batch: &mut Vec<[u8; 3]>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let result = self.bus.write_batch(address, batch);
        batch.clear();
        result.map_err(|err| {
            error!("i2c {address:#04x} bulk transfer failed: {err:?}");
            bus_error(address, &err)
        })
    }

    /// Route subsequent auxiliary writes to `channel`.
    pub fn bus_select(&mut self, channel: BusChannel) -> Result<()> {
        debug!("bus select {channel:?}");
        self.write_single(BYPASS_PAGE_REG, BYPASS_PAGE_VAL)?;
        self.write_single(BYPASS_BANK_REG, BYPASS_BANK_VAL)?;
        self.write_single(BYPASS_SELECT_REG, channel as u8 & 0x03)
    }
}

impl<B, D> RegisterAccess for Transport<B, D>
where
    B: RegisterBus,
    D: DelayNs,
{
    fn write_reg(&mut self, reg: u16, value: u8) -> Result<()> {
        self.write_single(reg, value)
    }

    fn read_reg(&mut self, width: RegWidth, reg: u16) -> Result<u32> {
        self.read(width, reg)
    }

    fn write_reglist(&mut self, entries: &[RegEntry]) -> Result<()> {
        self.write_script(entries)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.sleep_ms(ms);
    }
}

/// [`RegisterBus`] over any `embedded-hal` I2C bus.
///
/// Batches are issued as one write per frame so every frame keeps its own
/// start condition and address byte.
pub struct HalBus<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> HalBus<I2C> {
    /// Wrap an I2C bus.
    pub const fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    /// Release the wrapped bus.
    pub fn into_inner(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c> RegisterBus for HalBus<I2C> {
    type Error = I2C::Error;

    fn write(&mut self, address: u8, bytes: &[u8]) -> std::result::Result<(), Self::Error> {
        self.i2c.write(address, bytes)
    }

    fn write_batch(
        &mut self,
        address: u8,
        frames: &[[u8; 3]],
    ) -> std::result::Result<(), Self::Error> {
        frames
            .iter()
            .try_for_each(|bytes| self.i2c.write(address, bytes))
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> std::result::Result<(), Self::Error> {
        self.i2c.read(address, buffer)
    }
}

/// Blocking delay backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BusOp, MockBus, MockDelay};
    use embedded_hal::i2c::Operation;

    const ADDR: u8 = 0x1b;

    fn transport(bus: MockBus) -> Transport<MockBus, MockDelay> {
        Transport::new(bus, MockDelay::new(), ADDR, TimingConfig::default())
    }

    #[test]
    fn test_write_single_frame_layout() {
        let mut t = transport(MockBus::new());
        t.write_single(0x3012, 0xab).expect("write should succeed");
        assert_eq!(
            t.bus().ops(),
            &[BusOp::Write {
                address: ADDR,
                bytes: vec![0x30, 0x12, 0xab],
            }]
        );
    }

    #[test]
    fn test_write_single_retries_then_succeeds() {
        let mut bus = MockBus::new();
        bus.fail_next_writes(3);
        let mut t = transport(bus);
        t.write_single(0x0100, 0x01).expect("fourth attempt should succeed");
        assert_eq!(t.bus().write_attempts(), 4);
        assert_eq!(t.delay().delays(), &[20, 20, 20]);
    }

    #[test]
    fn test_write_single_gives_up_after_five_attempts() {
        let mut bus = MockBus::new();
        bus.fail_next_writes(10);
        let mut t = transport(bus);
        let result = t.write_single(0x0100, 0x01);
        assert!(matches!(result, Err(SensorError::Transport(_))));
        assert_eq!(t.bus().write_attempts(), 5);
        assert_eq!(t.delay().delays().len(), 4);
    }

    #[test]
    fn test_read_composes_big_endian() {
        let bus = MockBus::new().with_register(0x300a, 0x9080_1234);
        let mut t = transport(bus);
        assert_eq!(t.read(RegWidth::DWord, 0x300a).expect("read"), 0x9080_1234);
        assert_eq!(t.read(RegWidth::Word, 0x300a).expect("read"), 0x1234);
        assert_eq!(t.read(RegWidth::Byte, 0x300a).expect("read"), 0x34);
        assert_eq!(t.delay().delays(), &[3, 3, 3]);
    }

    #[test]
    fn test_read_does_not_retry() {
        let mut bus = MockBus::new();
        bus.fail_reads(true);
        let mut t = transport(bus);
        assert!(matches!(
            t.read(RegWidth::Byte, 0x0000),
            Err(SensorError::Transport(_))
        ));
        assert_eq!(t.bus().read_attempts(), 1);
    }

    #[test]
    fn test_reg_width_from_len() {
        assert_eq!(RegWidth::try_from(2).expect("valid width"), RegWidth::Word);
        assert!(matches!(
            RegWidth::try_from(3),
            Err(SensorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_script_chunks_at_max_batch() {
        let entries: Vec<RegEntry> = (0..310u16).map(|i| RegEntry::data(i, 0x11)).collect();
        let mut t = transport(MockBus::new());
        t.write_script(&entries).expect("script should succeed");
        assert_eq!(t.bus().batch_sizes(), vec![299, 11]);
        assert_eq!(t.bus().written_registers().len(), 310);
    }

    #[test]
    fn test_script_delay_flushes_pending_batch() {
        let entries = [
            RegEntry::data(0x0001, 0x01),
            RegEntry::data(0x0002, 0x02),
            RegEntry::delay(10),
            RegEntry::data(0x0003, 0x03),
        ];
        let mut t = transport(MockBus::new());
        t.write_script(&entries).expect("script should succeed");
        assert_eq!(t.bus().batch_sizes(), vec![2, 1]);
        assert_eq!(t.delay().delays(), &[10]);
    }

    #[test]
    fn test_script_single_goes_out_immediately() {
        let entries = [
            RegEntry::data(0x0001, 0x01),
            RegEntry::single(0x0103, 0x01),
            RegEntry::data(0x0002, 0x02),
        ];
        let mut t = transport(MockBus::new());
        t.write_script(&entries).expect("script should succeed");
        assert_eq!(
            t.bus().written_registers(),
            vec![(0x0103, 0x01), (0x0001, 0x01), (0x0002, 0x02)]
        );
    }

    #[test]
    fn test_script_malformed_entry_stops_writes() {
        let entries = [
            RegEntry::single(0x0100, 0x00),
            RegEntry::data(0x0001, 0x01),
            RegEntry::raw(0x7f, 0x0002, 0x02),
            RegEntry::data(0x0003, 0x03),
        ];
        let mut t = transport(MockBus::new());
        let result = t.write_script(&entries);
        assert!(matches!(
            result,
            Err(SensorError::MalformedScript {
                index: 2,
                flag: 0x7f
            })
        ));
        assert_eq!(t.bus().written_registers(), vec![(0x0100, 0x00)]);
    }

    #[test]
    fn test_script_transport_failure_aborts() {
        let entries: Vec<RegEntry> = (0..5u16)
            .flat_map(|i| [RegEntry::data(i, 0), RegEntry::delay(1)])
            .collect();
        let mut bus = MockBus::new();
        bus.fail_after(2);
        let mut t = transport(bus);
        assert!(matches!(
            t.write_script(&entries),
            Err(SensorError::Transport(_))
        ));
        assert_eq!(t.bus().batch_sizes(), vec![1, 1]);
    }

    #[derive(Default)]
    struct RecordingI2c {
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl embedded_hal::i2c::ErrorType for RecordingI2c {
        type Error = embedded_hal::i2c::ErrorKind;
    }

    impl I2c for RecordingI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> std::result::Result<(), Self::Error> {
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buffer) => buffer.fill(0x5a),
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_hal_bus_writes_each_frame() {
        let bus = HalBus::new(RecordingI2c::default());
        let mut t = Transport::new(bus, StdDelay, ADDR, TimingConfig::default());
        t.write_script(&[RegEntry::data(0x0001, 0x01), RegEntry::data(0x0002, 0x02)])
            .expect("script should succeed");
        assert_eq!(t.read(RegWidth::Word, 0x0003).expect("read"), 0x5a5a);
        assert_eq!(
            t.bus().i2c.writes,
            vec![
                (ADDR, vec![0x00, 0x01, 0x01]),
                (ADDR, vec![0x00, 0x02, 0x02]),
                (ADDR, vec![0x00, 0x03]),
            ]
        );
    }

    #[test]
    fn test_bus_select_sequence() {
        let mut t = transport(MockBus::new());
        t.bus_select(BusChannel::All).expect("select should succeed");
        assert_eq!(
            t.bus().written_registers(),
            vec![(0xfffd, 0x80), (0xfffe, 0x50), (0x004d, 0x03)]
        );
    }
}
