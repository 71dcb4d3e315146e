//! Typed node configuration, loaded from defaults layered with process
//! environment variables.
//!
//! Groups are flat at the top level and nest with the `__` delimiter, so
//! `BACKEND_GPIO__FPS_NOMINAL=9` overrides
//! [`GpioBackendConfig::fps_nominal`]. A `.env` file in the working directory
//! is read first, lowest priority.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: config::ConfigError,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default tracing filter directive, overridable with `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AcquisitionConfig {
    /// Wire the trigger-in event directly to a local capture instead of the
    /// job processor. Exactly one of the two consumers is ever active.
    pub standalone_mode: bool,
    /// Whether this node drives the shared clock and trigger lines.
    pub primary: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            standalone_mode: false,
            primary: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    /// Listen address of the per-node control surface.
    pub listen: std::net::SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".parse().unwrap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MediaConfig {
    /// Root directory for persisted captures (`original/`, `standalone/`).
    pub data_dir: std::path::PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            data_dir: std::path::PathBuf::from("./media"),
        }
    }
}

/// Raspberry Pi GPIO/PWM io backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GpioBackendConfig {
    /// BCM pin numbers for the three wires.
    pub clock_in_pin: u8,
    pub trigger_in_pin: u8,
    pub trigger_out_pin: u8,
    /// Drive the shared clock line with hardware PWM (primary node only).
    pub enable_clock: bool,
    /// Frequency of the generated clock. Must sit below the camera's maximum
    /// framerate to leave control reserve.
    pub fps_nominal: u32,
    /// Hardware PWM channel driving the clock line.
    pub pwm_channel: u8,
}

impl Default for GpioBackendConfig {
    fn default() -> Self {
        Self {
            clock_in_pin: 14,
            trigger_in_pin: 15,
            trigger_out_pin: 17,
            enable_clock: false,
            fps_nominal: 9,
            pwm_channel: 0,
        }
    }
}

/// In-process io backend synthesizing clock and trigger edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VirtualIoConfig {
    pub fps_nominal: u32,
    /// Start with the synthetic clock running. Can be toggled at runtime to
    /// exercise clock-loss recovery.
    pub enable_clock: bool,
}

impl Default for VirtualIoConfig {
    fn default() -> Self {
        Self {
            fps_nominal: 10,
            enable_clock: true,
        }
    }
}

/// Synthetic camera producing generated JPEG frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VirtualCameraConfig {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    /// Advertised framerate limits of the simulated sensor.
    pub min_fps: u32,
    pub max_fps: u32,
    /// Constant offset applied to the simulated sensor timestamp, for
    /// exercising the phase controller.
    pub phase_bias_us: i64,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            jpeg_quality: 80,
            min_fps: 2,
            max_fps: 60,
            phase_bias_us: 0,
        }
    }
}

/// V4L2 camera backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PicamConfig {
    pub device_index: usize,
    pub capture_width: u32,
    pub capture_height: u32,
    pub liveview_width: u32,
    pub liveview_height: u32,
    pub jpeg_quality: u8,
}

impl Default for PicamConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            capture_width: 4608,
            capture_height: 2592,
            liveview_width: 768,
            liveview_height: 432,
            jpeg_quality: 90,
        }
    }
}

/// Root configuration, one instance per process.
///
/// Unknown top-level keys are ignored: the process environment carries far
/// more variables than configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub acquisition: AcquisitionConfig,
    pub http: HttpConfig,
    pub media: MediaConfig,
    pub backend_gpio: GpioBackendConfig,
    pub backend_virtual_io: VirtualIoConfig,
    pub backend_virtual_camera: VirtualCameraConfig,
    pub backend_picam: PicamConfig,
}

impl AppConfig {
    /// Defaults, then `.env`, then process environment.
    pub fn load() -> Result<AppConfig> {
        if dotenv::dotenv().is_ok() {
            tracing::debug!("loaded .env file");
        }

        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_expectations() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.http.listen.port(), 8000);
        assert_eq!(cfg.backend_gpio.fps_nominal, 9);
        assert!(!cfg.acquisition.standalone_mode);
    }

    #[test]
    fn nested_delimiter_reaches_group_fields() {
        // Build from an explicit source rather than the process environment
        // so the test cannot race other tests mutating env vars.
        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .source(Some(
                        [(
                            "BACKEND_GPIO__FPS_NOMINAL".to_string(),
                            "24".to_string(),
                        )]
                        .into_iter()
                        .collect(),
                    ))
                    .try_parsing(true),
            )
            .build()
            .unwrap();
        let cfg: AppConfig = cfg.try_deserialize().unwrap();
        assert_eq!(cfg.backend_gpio.fps_nominal, 24);
    }
}
