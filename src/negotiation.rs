//! Format and frame interval negotiation against the mode catalog.

use embedded_hal::delay::DelayNs;
use log::{debug, error};

use crate::device::{DeviceState, SensorModule};
use crate::interval::{proportional_vts, FrameInterval};
use crate::platform::Platform;
use crate::traits::{FrameFormat, RegisterBus, Result, SensorError, SensorOps};

/// One discrete frame interval offered by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIntervalEntry {
    /// Catalog position.
    pub index: usize,
    /// Output format of the mode.
    pub format: FrameFormat,
    /// Nominal interval of the mode.
    pub interval: FrameInterval,
}

impl<B, D, P, S> SensorModule<B, D, P, S>
where
    B: RegisterBus,
    D: DelayNs,
    P: Platform,
    S: SensorOps,
{
    /// True if some mode produces `format`.
    pub fn try_format(&self, format: &FrameFormat) -> bool {
        self.catalog.find(Some(format), None).is_some()
    }

    /// Select the mode for `format`, honoring a previously set interval when possible.
    pub fn set_format(&mut self, format: &FrameFormat) -> Result<()> {
        debug!("set format {format}");
        let Some(by_format) = self.catalog.find(Some(format), None) else {
            error!("format {format} is not supported");
            return Err(SensorError::Unsupported(format!("format {format}")));
        };

        let index = self
            .interval
            .and_then(|interval| self.catalog.find(Some(format), Some(interval)))
            .unwrap_or(by_format);
        self.format = Some(*format);
        self.set_active_config(index);
        Ok(())
    }

    /// Format of the active mode.
    pub fn get_format(&self) -> Result<FrameFormat> {
        self.active_config()
            .map(|config| *config.format())
            .ok_or(SensorError::Unavailable("no active sensor configuration"))
    }

    /// Request a frame interval.
    ///
    /// Before a format is set the interval is only stored. Afterwards an
    /// exact catalog match switches modes while not streaming; otherwise a
    /// slower rate is reached by stretching the frame length, pushed now if
    /// streaming and at the next stream start if not. Any accepted request
    /// disables automatic frame rate adjustment.
    pub fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<()> {
        let requested = FrameInterval::parse(interval.numerator, interval.denominator)
            .inspect_err(|err| error!("{err}"))?;
        debug!("set frame interval {requested} ({} fps)", requested.fps());

        if self.format.is_some() {
            self.negotiate_interval(requested)?;
        }
        self.interval = Some(requested);
        self.controls.auto_adjust_fps = false;
        Ok(())
    }

    fn negotiate_interval(&mut self, requested: FrameInterval) -> Result<()> {
        let Some((active, format, nominal, nominal_vts)) = self.active.and_then(|index| {
            self.catalog.get(index).map(|config| {
                (
                    index,
                    *config.format(),
                    config.interval(),
                    config.timings().frame_length_lines,
                )
            })
        }) else {
            return Err(SensorError::InvalidState {
                state: self.state,
                reason: "no active sensor configuration",
            });
        };
        let streaming = self.state == DeviceState::Streaming;

        if let Some(index) = self.catalog.find(Some(&format), Some(requested)) {
            if index != active && !streaming {
                self.set_active_config(index);
                self.vts = None;
                return Ok(());
            }
        }

        if requested == nominal.normalized() {
            self.vts = None;
            if streaming && self.ops.supports_vts() {
                self.ops.set_vts(&mut self.transport, nominal_vts)?;
            }
            return Ok(());
        }

        if requested.is_faster_than(nominal) {
            error!(
                "{}x{}@{}fps is not supported, the mode runs at most {}fps",
                format.width,
                format.height,
                requested.fps(),
                nominal.fps()
            );
            return Err(SensorError::Unsupported(format!(
                "{format} at {} fps",
                requested.fps()
            )));
        }
        if !self.ops.supports_vts() {
            error!("sensor cannot stretch frames to {} fps", requested.fps());
            return Err(SensorError::Unsupported(
                "vertical timing update".to_owned(),
            ));
        }

        let vts = proportional_vts(nominal_vts, nominal, requested);
        debug!("frame length {nominal_vts} -> {vts} lines");
        self.vts = Some(vts);
        if streaming {
            self.ops.set_vts(&mut self.transport, vts)?;
        }
        Ok(())
    }

    /// Interval in effect. Only known while streaming.
    pub fn get_frame_interval(&self) -> Result<FrameInterval> {
        if self.state != DeviceState::Streaming {
            return Err(SensorError::Unavailable(
                "frame interval is only known while streaming",
            ));
        }
        self.interval
            .or_else(|| self.active_config().map(|config| config.interval()))
            .ok_or(SensorError::Unavailable("no active sensor configuration"))
    }

    /// The `index`-th mode's format and interval, `None` past the end.
    pub fn enum_frame_intervals(&self, index: usize) -> Option<FrameIntervalEntry> {
        self.catalog.get(index).map(|config| FrameIntervalEntry {
            index,
            format: *config.format(),
            interval: config.interval(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{Catalog, Configuration, ModeTimings};
    use crate::config::TimingConfig;
    use crate::mock::{MockBus, MockDelay, MockPlatform, MockSensor};
    use crate::traits::FourCC;
    use crate::transport::Transport;

    const VGA: FrameFormat = FrameFormat::new(640, 480, FourCC::UYVY);
    const HD: FrameFormat = FrameFormat::new(1280, 720, FourCC::UYVY);

    fn build(sensor: MockSensor) -> SensorModule<MockBus, MockDelay, MockPlatform, MockSensor> {
        let timings = ModeTimings {
            frame_length_lines: 1000,
            ..ModeTimings::default()
        };
        let catalog = Catalog::new(vec![
            Configuration::new("vga_30", VGA, FrameInterval::from_fps(30), vec![])
                .with_timings(timings),
            Configuration::new("vga_15", VGA, FrameInterval::from_fps(15), vec![])
                .with_timings(timings),
            Configuration::new("hd_30", HD, FrameInterval::from_fps(30), vec![]),
        ])
        .expect("catalog");
        let transport = Transport::new(
            MockBus::new(),
            MockDelay::new(),
            0x1b,
            TimingConfig::default(),
        );
        SensorModule::new(transport, MockPlatform::new(), sensor, Arc::new(catalog))
    }

    #[test]
    fn test_try_format() {
        let module = build(MockSensor::new());
        assert!(module.try_format(&HD));
        assert!(!module.try_format(&FrameFormat::new(320, 240, FourCC::UYVY)));
    }

    #[test]
    fn test_set_format_unknown_is_unsupported() {
        let mut module = build(MockSensor::new());
        let result = module.set_format(&FrameFormat::new(320, 240, FourCC::UYVY));
        assert!(matches!(result, Err(SensorError::Unsupported(_))));
        assert!(module.get_format().is_err());
    }

    #[test]
    fn test_deferred_interval_resolves_on_set_format() {
        let mut module = build(MockSensor::new());
        module
            .set_frame_interval(FrameInterval::new(2, 30))
            .expect("interval is stored");
        assert!(module.active_config().is_none());
        module.set_format(&VGA).expect("format");
        assert_eq!(module.active_config().map(Configuration::name), Some("vga_15"));
        assert!(!module.controls().auto_adjust_fps);
    }

    #[test]
    fn test_set_frame_interval_rejects_zero() {
        let mut module = build(MockSensor::new());
        assert!(matches!(
            module.set_frame_interval(FrameInterval::new(1, 0)),
            Err(SensorError::InvalidArgument(_))
        ));
        assert!(module.controls().auto_adjust_fps);
    }

    #[test]
    fn test_switches_config_when_not_streaming() {
        let mut module = build(MockSensor::new());
        module.set_format(&VGA).expect("format");
        module
            .set_frame_interval(FrameInterval::from_fps(15))
            .expect("exact match");
        assert_eq!(module.active_index(), Some(1));
        assert_eq!(module.vts(), None);
    }

    #[test]
    fn test_faster_than_nominal_is_unsupported() {
        let mut module = build(MockSensor::new().with_vts_support());
        module.set_format(&HD).expect("format");
        assert!(matches!(
            module.set_frame_interval(FrameInterval::from_fps(60)),
            Err(SensorError::Unsupported(_))
        ));
    }

    #[test]
    fn test_slower_rate_needs_vts_support() {
        let mut module = build(MockSensor::new());
        module.set_format(&HD).expect("format");
        assert!(matches!(
            module.set_frame_interval(FrameInterval::from_fps(10)),
            Err(SensorError::Unsupported(_))
        ));

        let mut module = build(MockSensor::new().with_vts_support());
        module.set_format(&VGA).expect("format");
        module
            .set_frame_interval(FrameInterval::from_fps(20))
            .expect("stretched");
        assert_eq!(module.vts(), Some(1500));
        assert!(module.ops().vts_writes().is_empty());
    }

    #[test]
    fn test_get_frame_interval_only_while_streaming() {
        let module = build(MockSensor::new());
        assert!(matches!(
            module.get_frame_interval(),
            Err(SensorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_enum_frame_intervals() {
        let module = build(MockSensor::new());
        let entry = module.enum_frame_intervals(1).expect("second mode");
        assert_eq!(entry.format, VGA);
        assert_eq!(entry.interval, FrameInterval::from_fps(15));
        assert!(module.enum_frame_intervals(3).is_none());
    }
}
