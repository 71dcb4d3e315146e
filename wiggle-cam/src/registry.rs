//! Compile-time camera backend registry.

use std::sync::Arc;

use serde::Deserialize;
use wiggle_config::AppConfig;

use crate::{CameraBackend, Result, VirtualCameraBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    Virtual,
    Picam,
}

impl std::str::FromStr for CameraBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "virtual" => Ok(CameraBackendKind::Virtual),
            "picam" => Ok(CameraBackendKind::Picam),
            other => Err(format!("unknown camera backend: {other}")),
        }
    }
}

/// Construct the selected backend from its typed config section. The
/// backend is not started; the engine supervisor starts it once a clock is
/// present.
pub fn create_camera_backend(
    kind: CameraBackendKind,
    config: &AppConfig,
) -> Result<Arc<dyn CameraBackend>> {
    match kind {
        CameraBackendKind::Virtual => Ok(Arc::new(VirtualCameraBackend::new(
            config.backend_virtual_camera.clone(),
        ))),
        #[cfg(all(feature = "picam", target_os = "linux"))]
        CameraBackendKind::Picam => Ok(Arc::new(crate::picam::PicamBackend::new(
            config.backend_picam.clone(),
        ))),
        #[cfg(not(all(feature = "picam", target_os = "linux")))]
        CameraBackendKind::Picam => Err(crate::Error::Internal {
            msg: "picam backend support is not compiled in (enable the `picam` feature)"
                .to_string(),
        }),
    }
}
