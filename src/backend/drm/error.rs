use std::io;
use std::path::PathBuf;

use drm::control::{crtc, RawResourceHandle};

use super::commit::StagedProperty;
use super::pipeline::PipelineId;

/// Errors thrown by the [`DrmDevice`](super::DrmDevice), its [`Crtc`](super::Crtc)s
/// and [`OutputPipeline`](super::OutputPipeline)s.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Enumerating the properties of a hardware object failed
    #[error("Failed to query properties of object `{object:?}`")]
    PropertyQuery {
        /// Object whose properties could not be read
        object: RawResourceHandle,
        /// Underlying access error
        #[source]
        source: AccessError,
    },
    /// A required property is not exposed by the hardware object
    #[error("The DrmDevice is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Object handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// A flip is already in flight on this crtc
    #[error("Crtc `{0:?}` already has a flip in flight")]
    FlipBusy(crtc::Handle),
    /// The kernel refused an atomic commit, nothing was applied
    #[error("Atomic commit was rejected: {reason}")]
    AtomicRejected {
        /// Rejection reported by the kernel
        reason: AccessError,
    },
    /// The legacy replay applied some, but not all, of the staged changes
    #[error("Legacy commit only partially applied ({} applied, {} failed)", .applied.len(), .failed.len())]
    LegacyPartialFailure {
        /// Entries that were written successfully
        applied: Vec<StagedProperty>,
        /// Entries that could not be written
        failed: Vec<StagedProperty>,
        /// First error that was encountered
        #[source]
        source: AccessError,
    },
    /// The legacy replay failed before applying anything
    #[error("Legacy commit was rejected: {0}")]
    LegacyRejected(#[source] AccessError),
    /// Allocating, mapping or showing the blanking buffer failed
    #[error("Failed to blank crtc `{crtc:?}`")]
    BlankFailed {
        /// Crtc that should have been blanked
        crtc: crtc::Handle,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
    /// The crtc was used before `init` succeeded
    #[error("Crtc `{0:?}` is not initialized")]
    CrtcNotInitialized(crtc::Handle),
    /// The crtc failed to initialize and can not be used anymore
    #[error("Crtc `{0:?}` failed to initialize and is unusable")]
    CrtcFailed(crtc::Handle),
    /// A flip completion did not match the flip in flight
    #[error("Unexpected flip completion on crtc `{crtc:?}` (sequence {sequence})")]
    UnexpectedFlip {
        /// Crtc that reported the completion
        crtc: crtc::Handle,
        /// Sequence number of the completion
        sequence: u64,
    },
    /// The given crtc is already in use by another pipeline
    #[error("Crtc `{0:?}` is already in use by another pipeline")]
    CrtcAlreadyInUse(crtc::Handle),
    /// The pipeline has been disabled and accepts no further operations
    #[error("Pipeline {0:?} is disabled")]
    PipelineDisabled(PipelineId),
    /// The pipeline is not known to the scheduler
    #[error("Unknown pipeline {0:?}")]
    UnknownPipeline(PipelineId),
    /// The device has been removed or is otherwise unusable
    #[error("Device is inactive, operation rejected")]
    DeviceInactive,
}

/// Error reported by a single ioctl on the drm device
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Returns if the underlying error means the device is gone or no longer ours
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.source.raw_os_error(),
            Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EBADF) | Some(libc::EACCES)
        )
    }
}

/// Coarse classification of an [`Error`], deciding how a caller should react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Safe to retry, no state was changed
    Transient,
    /// The requested change was not applied, prior state is intact
    Rejected,
    /// Some changes were applied, the caller should re-read current properties
    PartialFailure,
    /// The device or output is gone and has to be torn down
    Fatal,
}

impl Error {
    /// Classifies this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Access(err) | Error::AtomicRejected { reason: err } | Error::LegacyRejected(err)
                if err.is_fatal() =>
            {
                ErrorKind::Fatal
            }
            Error::PropertyQuery { source, .. } if source.is_fatal() => ErrorKind::Fatal,
            Error::LegacyPartialFailure { source, .. } if source.is_fatal() => ErrorKind::Fatal,
            Error::BlankFailed { source, .. } => match source.kind() {
                ErrorKind::Fatal => ErrorKind::Fatal,
                _ => ErrorKind::Rejected,
            },
            Error::PropertyQuery { .. } | Error::FlipBusy(_) => ErrorKind::Transient,
            Error::Access(_)
            | Error::AtomicRejected { .. }
            | Error::LegacyRejected(_)
            | Error::UnexpectedFlip { .. }
            | Error::CrtcAlreadyInUse(_)
            | Error::CrtcNotInitialized(_)
            | Error::UnknownPipeline(_) => ErrorKind::Rejected,
            Error::LegacyPartialFailure { .. } => ErrorKind::PartialFailure,
            Error::UnknownProperty { .. }
            | Error::CrtcFailed(_)
            | Error::PipelineDisabled(_)
            | Error::DeviceInactive => ErrorKind::Fatal,
        }
    }
}
