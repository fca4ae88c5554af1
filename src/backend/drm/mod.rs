//! Drm/Kms types and the page-flip engine
//!
//! This module drives display outputs of a drm device: it keeps track of the
//! kernel properties of crtcs, planes and connectors, turns requested frames into
//! atomic (or legacy) commits and serializes page-flips per output.
//!
//! ## How to use it
//!
//! ### Initialization
//!
//! To initialize a [`DrmDevice`] you need an open file descriptor of your drm node,
//! wrapped into a [`DrmDeviceFd`]. [`DrmDevice::from_fd`] enables atomic
//! mode-setting if possible (unless disabled through [`BackendConfig`]), disables
//! all previously active outputs and returns a [`DrmDeviceNotifier`] alongside the device.
//!
//! Outputs are created from a crtc, its primary plane and a connector via
//! [`DrmDevice::create_pipeline`]. Every crtc can only be used by one [`OutputPipeline`] at a time.
//!
//! ### Page Flips
//!
//! The [`FlipScheduler`] owns the pipelines. Frames are handed to
//! [`FlipScheduler::request_frame`] as [`FramebufferHandle`]s. A pipeline has at most one
//! flip in flight; a frame requested while a flip is pending is queued and replaces any
//! frame queued before it.
//!
//! Insert the [`DrmDeviceNotifier`] into your [`calloop`] event loop and forward
//! its events to [`FlipScheduler::dispatch`]. Your [`OutputHandler`] is notified whenever a
//! frame hits the screen, a frame gets rejected by the kernel or an output has to be shut down.
//!
//! Setting the `SCANOUT_USE_LEGACY` environment variable forces the legacy
//! (non-atomic) code path, see [`BackendConfig::from_env`].

pub mod commit;
pub mod config;
pub mod crtc;
pub(crate) mod device;
mod error;
pub mod framebuffer;
pub mod kms;
pub mod object;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_utils;

pub use self::commit::{AtomicCommitBuilder, CommitFlags, CommitMode};
pub use self::config::{BackendConfig, OutputConfig};
pub use self::crtc::{Crtc, CrtcState, FlipToken};
pub use self::device::{
    DestroyError, DevPath, DrmDevice, DrmDeviceFd, DrmDeviceNotifier, DrmEvent, EventMetadata, Time,
};
pub use self::error::{AccessError, Error, ErrorKind};
pub use self::framebuffer::{BufferLifetime, FramebufferHandle};
pub use self::kms::{KmsDevice, ObjectHandle, ObjectKind};
pub use self::pipeline::{FlipOutcome, FrameStatus, OutputPipeline, PipelineId};
pub use self::scheduler::{FlipScheduler, OutputHandler};
