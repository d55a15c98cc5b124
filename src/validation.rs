//! Validation of register scripts and mode catalogs at registration time.
//!
//! The transport decodes entries lazily and stops at the first bad one, by
//! which point earlier entries are already on the bus. Checking scripts when
//! the catalog is built catches malformed tables before any hardware is
//! touched.

use crate::catalog::Configuration;
use crate::traits::{Result, SensorError};
use crate::transport::RegEntry;

/// Check that every entry of `entries` carries a known flag.
///
/// # Errors
///
/// Returns `MalformedScript` naming the first bad entry.
pub fn validate_script(entries: &[RegEntry]) -> Result<()> {
    entries
        .iter()
        .enumerate()
        .try_for_each(|(index, entry)| entry.op(index).map(|_| ()))
}

/// Check a single mode: non-empty frame size, valid interval, decodable scripts.
pub fn validate_configuration(config: &Configuration) -> Result<()> {
    let format = config.format();
    if format.width == 0 || format.height == 0 {
        return Err(SensorError::InvalidArgument(format!(
            "config '{}': empty frame size {format}",
            config.name()
        )));
    }
    if !config.interval().is_valid() {
        return Err(SensorError::InvalidArgument(format!(
            "config '{}': frame interval {}",
            config.name(),
            config.interval()
        )));
    }

    validate_script(config.script())?;
    if let Some(diff) = config.diff_script() {
        validate_script(diff)?;
    }
    if let Some(sub) = config.sub_script() {
        validate_script(sub)?;
    }
    Ok(())
}

/// Check every mode of a catalog.
pub fn validate_catalog(configs: &[Configuration]) -> Result<()> {
    configs.iter().try_for_each(validate_configuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::interval::FrameInterval;
    use crate::traits::{FourCC, FrameFormat};

    const VGA: FrameFormat = FrameFormat::new(640, 480, FourCC::UYVY);

    #[test]
    fn test_validate_script_success() {
        let script = [
            RegEntry::data(0x0103, 0x01),
            RegEntry::delay(5),
            RegEntry::single(0x0100, 0x01),
        ];
        assert!(validate_script(&script).is_ok());
    }

    #[test]
    fn test_validate_script_reports_first_bad_entry() {
        let script = [
            RegEntry::data(0x0103, 0x01),
            RegEntry::raw(0x09, 0x0100, 0x01),
            RegEntry::raw(0x0a, 0x0100, 0x01),
        ];
        assert!(matches!(
            validate_script(&script),
            Err(SensorError::MalformedScript { index: 1, flag: 0x09 })
        ));
    }

    #[test]
    fn test_catalog_rejects_zero_interval() {
        let result = Catalog::new(vec![Configuration::new(
            "broken",
            VGA,
            FrameInterval::new(1, 0),
            vec![],
        )]);
        assert!(matches!(result, Err(SensorError::InvalidArgument(_))));
    }

    #[test]
    fn test_catalog_rejects_bad_diff_script() {
        let config = Configuration::new("m", VGA, FrameInterval::from_fps(30), vec![])
            .with_diff_script(vec![RegEntry::raw(0xff, 0, 0)]);
        assert!(matches!(
            Catalog::new(vec![config]),
            Err(SensorError::MalformedScript { .. })
        ));
    }

    #[test]
    fn test_catalog_rejects_empty_frame() {
        let config = Configuration::new(
            "m",
            FrameFormat::new(0, 480, FourCC::UYVY),
            FrameInterval::from_fps(30),
            vec![],
        );
        assert!(matches!(
            validate_configuration(&config),
            Err(SensorError::InvalidArgument(_))
        ));
    }
}
