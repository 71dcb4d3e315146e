//! Compile-time io backend registry.

use std::sync::Arc;

use serde::Deserialize;
use wiggle_config::AppConfig;

use crate::{IoBackend, Result, VirtualIoBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoBackendKind {
    Virtual,
    Gpio,
}

impl std::str::FromStr for IoBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "virtual" => Ok(IoBackendKind::Virtual),
            "gpio" => Ok(IoBackendKind::Gpio),
            other => Err(format!("unknown io backend: {other}")),
        }
    }
}

/// Construct the selected backend from its typed config section. The
/// backend is not started.
pub fn create_io_backend(kind: IoBackendKind, config: &AppConfig) -> Result<Arc<dyn IoBackend>> {
    match kind {
        IoBackendKind::Virtual => Ok(Arc::new(VirtualIoBackend::new(
            config.backend_virtual_io.clone(),
        ))),
        #[cfg(target_os = "linux")]
        IoBackendKind::Gpio => Ok(Arc::new(crate::gpio::GpioIoBackend::new(
            config.backend_gpio.clone(),
        ))),
        #[cfg(not(target_os = "linux"))]
        IoBackendKind::Gpio => Err(crate::Error::HardwareUnavailable {
            msg: "gpio backend is only available on linux".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_cli_names() {
        assert_eq!(
            "virtual".parse::<IoBackendKind>().unwrap(),
            IoBackendKind::Virtual
        );
        assert_eq!("gpio".parse::<IoBackendKind>().unwrap(), IoBackendKind::Gpio);
        assert!("pynng".parse::<IoBackendKind>().is_err());
    }

    #[test]
    fn virtual_backend_constructs_unstarted() {
        let config = AppConfig::default();
        let io = create_io_backend(IoBackendKind::Virtual, &config).unwrap();
        assert!(!io.clock_signal_valid());
    }
}
