//! Backend and output configuration
//!
//! The flip engine never persists configuration, it only applies what it is handed.

use drm::control::{connector, crtc, plane, Mode};
use tracing::info;

use super::framebuffer::BufferLifetime;

/// Environment variable forcing the legacy mode-setting path
pub const USE_LEGACY_ENV: &str = "SCANOUT_USE_LEGACY";
/// Environment variable selecting [`BufferLifetime::DeleteAfterFlip`]
pub const DELETE_AFTER_FLIP_ENV: &str = "SCANOUT_DELETE_AFTER_FLIP";

/// Device wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    /// Never use atomic mode-setting, even if the driver supports it
    pub force_legacy: bool,
    /// Turn off every crtc when the device is opened
    pub disable_connectors: bool,
    /// What happens to buffers once they stop being scanned out
    pub buffer_lifetime: BufferLifetime,
    /// Color of the blanking buffer, in XRGB8888 byte order
    pub blank_color: [u8; 4],
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            force_legacy: false,
            disable_connectors: true,
            buffer_lifetime: BufferLifetime::External,
            blank_color: [0, 0, 0, 0xff],
        }
    }
}

impl BackendConfig {
    /// Default configuration, adjusted by `SCANOUT_USE_LEGACY` and `SCANOUT_DELETE_AFTER_FLIP`
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = |name: &str| {
            lookup(name)
                .map(|x| {
                    x == "1" || x.to_lowercase() == "true" || x.to_lowercase() == "yes" || x.to_lowercase() == "y"
                })
                .unwrap_or(false)
        };

        let mut config = BackendConfig::default();
        if enabled(USE_LEGACY_ENV) {
            info!("{} is set. Forcing legacy mode-setting.", USE_LEGACY_ENV);
            config.force_legacy = true;
        }
        if enabled(DELETE_AFTER_FLIP_ENV) {
            info!("{} is set. Framebuffers are removed after use.", DELETE_AFTER_FLIP_ENV);
            config.buffer_lifetime = BufferLifetime::DeleteAfterFlip;
        }
        config
    }
}

/// Topology and mode of one output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Crtc driving the output
    pub crtc: crtc::Handle,
    /// Primary plane of `crtc`
    pub primary_plane: plane::Handle,
    /// Connector the display is attached to
    pub connector: connector::Handle,
    /// Desired mode
    pub mode: Mode,
    /// Overlay planes owned by the output, disabled on every mode-set
    pub planes: Vec<plane::Handle>,
}
