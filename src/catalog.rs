//! Supported sensor modes and lookup by format and frame interval.

use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::interval::FrameInterval;
use crate::traits::{FrameFormat, Result};
use crate::transport::RegEntry;
use crate::validation::validate_catalog;

/// Static timing parameters of one sensor mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeTimings {
    /// Width of the sensor output.
    pub sensor_output_width: u32,
    /// Height of the sensor output.
    pub sensor_output_height: u32,
    /// Crop window left edge.
    pub crop_horizontal_start: u32,
    /// Crop window top edge.
    pub crop_vertical_start: u32,
    /// Crop window right edge.
    pub crop_horizontal_end: u32,
    /// Crop window bottom edge.
    pub crop_vertical_end: u32,
    /// Line length in pixel clocks (HTS).
    pub line_length_pck: u32,
    /// Frame length in lines (VTS).
    pub frame_length_lines: u32,
    /// Video timing pixel clock.
    pub vt_pix_clk_freq_hz: u32,
    /// Horizontal binning.
    pub binning_factor_x: u32,
    /// Vertical binning.
    pub binning_factor_y: u32,
    /// Minimum coarse integration time in lines.
    pub coarse_integration_time_min: u32,
    /// Lines kept free between coarse integration time and frame length.
    pub coarse_integration_time_max_margin: u32,
    /// Minimum fine integration time in pixels.
    pub fine_integration_time_min: u32,
    /// Pixels kept free between fine integration time and line length.
    pub fine_integration_time_max_margin: u32,
}

impl ModeTimings {
    /// Time to flush one frame at these timings, in ms. `None` without a pixel clock.
    pub fn frame_time_ms(&self) -> Option<u32> {
        let pclk_khz = self.vt_pix_clk_freq_hz / 1000;
        if pclk_khz == 0 {
            return None;
        }
        let ms = u64::from(self.line_length_pck) * u64::from(self.frame_length_lines)
            / u64::from(pclk_khz);
        Some(u32::try_from(ms).unwrap_or(u32::MAX))
    }
}

/// Live timings reported by the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorTimings {
    /// Mode timings currently programmed.
    pub mode: ModeTimings,
    /// Exposure time read back from the sensor.
    pub exp_time: u32,
    /// Gain read back from the sensor.
    pub gain: u32,
}

impl SensorTimings {
    /// Timings of a mode with no exposure readback.
    pub const fn from_mode(mode: &ModeTimings) -> Self {
        Self {
            mode: *mode,
            exp_time: 0,
            gain: 0,
        }
    }
}

/// Physical data interface between sensor and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusInterface {
    /// MIPI CSI-2.
    Mipi {
        /// Data lanes in use.
        lanes: u8,
        /// Per-lane data rate.
        data_rate_mbps: u32,
        /// CSI-2 virtual channel.
        virtual_channel: u8,
    },
    /// Parallel (DVP) bus.
    Parallel {
        /// Data bus width in bits.
        bus_width: u8,
        /// HSYNC polarity.
        hsync_active_high: bool,
        /// VSYNC polarity.
        vsync_active_high: bool,
        /// Sample on the rising pixel clock edge.
        pclk_rising_edge: bool,
    },
}

/// Interface configuration reported to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Bus type and parameters.
    pub interface: BusInterface,
    /// Master clock supplied to the sensor.
    pub mclk_hz: u32,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            interface: BusInterface::Mipi {
                lanes: 2,
                data_rate_mbps: 0,
                virtual_channel: 0,
            },
            mclk_hz: 24_000_000,
        }
    }
}

/// One supported operating mode.
#[derive(Debug)]
pub struct Configuration {
    name: String,
    format: FrameFormat,
    interval: FrameInterval,
    script: Vec<RegEntry>,
    diff_script: Vec<RegEntry>,
    sub_script: Vec<RegEntry>,
    timings: ModeTimings,
    interface: InterfaceConfig,
    auto_exposure: bool,
    auto_gain: bool,
    auto_white_balance: bool,
    v_blanking_time_us: u32,
    soft_reset: AtomicBool,
}

impl Configuration {
    /// Mode `name` producing `format` at `interval` after writing `script`.
    pub fn new(
        name: &str,
        format: FrameFormat,
        interval: FrameInterval,
        script: Vec<RegEntry>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            format,
            interval,
            script,
            diff_script: Vec::new(),
            sub_script: Vec::new(),
            timings: ModeTimings::default(),
            interface: InterfaceConfig::default(),
            auto_exposure: false,
            auto_gain: false,
            auto_white_balance: false,
            v_blanking_time_us: 0,
            soft_reset: AtomicBool::new(false),
        }
    }

    /// Incremental script used when switching from an initialized sensor.
    #[must_use]
    pub fn with_diff_script(mut self, script: Vec<RegEntry>) -> Self {
        self.diff_script = script;
        self
    }

    /// Script written to every auxiliary device behind the bus bypass.
    #[must_use]
    pub fn with_sub_script(mut self, script: Vec<RegEntry>) -> Self {
        self.sub_script = script;
        self
    }

    /// Static timings of this mode.
    #[must_use]
    pub const fn with_timings(mut self, timings: ModeTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Receiver interface configuration.
    #[must_use]
    pub const fn with_interface(mut self, interface: InterfaceConfig) -> Self {
        self.interface = interface;
        self
    }

    /// Auto exposure, gain and white balance defaults applied on activation.
    #[must_use]
    pub const fn with_auto(mut self, exposure: bool, gain: bool, white_balance: bool) -> Self {
        self.auto_exposure = exposure;
        self.auto_gain = gain;
        self.auto_white_balance = white_balance;
        self
    }

    /// Vertical blanking time reported to the ISP.
    #[must_use]
    pub const fn with_v_blanking_us(mut self, us: u32) -> Self {
        self.v_blanking_time_us = us;
        self
    }

    /// Mode name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output format.
    pub const fn format(&self) -> &FrameFormat {
        &self.format
    }

    /// Nominal frame interval.
    pub const fn interval(&self) -> FrameInterval {
        self.interval
    }

    /// Full register script.
    pub fn script(&self) -> &[RegEntry] {
        &self.script
    }

    /// Incremental script, if any.
    pub fn diff_script(&self) -> Option<&[RegEntry]> {
        (!self.diff_script.is_empty()).then_some(self.diff_script.as_slice())
    }

    /// Auxiliary device script, if any.
    pub fn sub_script(&self) -> Option<&[RegEntry]> {
        (!self.sub_script.is_empty()).then_some(self.sub_script.as_slice())
    }

    /// Static timings.
    pub const fn timings(&self) -> &ModeTimings {
        &self.timings
    }

    /// Interface configuration.
    pub const fn interface(&self) -> &InterfaceConfig {
        &self.interface
    }

    /// Auto exposure default.
    pub const fn auto_exposure(&self) -> bool {
        self.auto_exposure
    }

    /// Auto gain default.
    pub const fn auto_gain(&self) -> bool {
        self.auto_gain
    }

    /// Auto white balance default.
    pub const fn auto_white_balance(&self) -> bool {
        self.auto_white_balance
    }

    /// Vertical blanking time in microseconds.
    pub const fn v_blanking_time_us(&self) -> u32 {
        self.v_blanking_time_us
    }

    /// Whether the full script was selected on the last write.
    pub fn soft_reset(&self) -> bool {
        self.soft_reset.load(Ordering::Relaxed)
    }

    pub(crate) fn set_soft_reset(&self, full: bool) {
        self.soft_reset.store(full, Ordering::Relaxed);
    }

    fn matches(&self, format: Option<&FrameFormat>, interval: Option<FrameInterval>) -> bool {
        if let Some(wanted) = interval {
            if self.interval.normalized() != wanted.normalized() {
                return false;
            }
        }
        format.map_or(true, |wanted| self.format == *wanted)
    }
}

/// Ordered, read-only list of supported modes.
#[derive(Debug, Default)]
pub struct Catalog {
    configs: Vec<Configuration>,
}

impl Catalog {
    /// Register `configs` in lookup order after validating them.
    pub fn new(configs: Vec<Configuration>) -> Result<Self> {
        validate_catalog(&configs)?;
        Ok(Self { configs })
    }

    /// Index of the first mode matching every filter given.
    ///
    /// Intervals are compared in lowest terms; formats compare width, height
    /// and code. With no filters the first mode matches.
    pub fn find(
        &self,
        format: Option<&FrameFormat>,
        interval: Option<FrameInterval>,
    ) -> Option<usize> {
        let found = self
            .configs
            .iter()
            .position(|config| config.matches(format, interval));
        match found.and_then(|index| self.configs.get(index)) {
            Some(config) => debug!("found matching config {}", config.name()),
            None => debug!("no matching config for {format:?} @ {interval:?}"),
        }
        found
    }

    /// Mode at `index`.
    pub fn get(&self, index: usize) -> Option<&Configuration> {
        self.configs.get(index)
    }

    /// Number of modes.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// True when no mode is registered.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Modes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Configuration> {
        self.configs.iter()
    }
}
