//! Kernel mode-setting interface
//!
//! Everything the flip engine asks of the kernel goes through [`KmsDevice`].
//! [`DrmDeviceFd`](super::DrmDeviceFd) implements it on top of an open drm node,
//! other implementations may wrap leased devices or record calls for testing.

use std::fmt;

use drm::control::{connector, crtc, framebuffer, plane, property, Mode, RawResourceHandle};

use super::commit::{AtomicTransaction, CommitFlags};
use super::error::AccessError;

/// Kind of a hardware object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Scan-out engine
    Crtc,
    /// Hardware compositing layer
    Plane,
    /// Physical output port
    Connector,
}

/// Handle of a hardware object, tagged by its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    /// A [`crtc`](drm::control::crtc)
    Crtc(crtc::Handle),
    /// A [`plane`](drm::control::plane)
    Plane(plane::Handle),
    /// A [`connector`](drm::control::connector)
    Connector(connector::Handle),
}

impl ObjectHandle {
    /// Kind of the referenced object
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectHandle::Crtc(_) => ObjectKind::Crtc,
            ObjectHandle::Plane(_) => ObjectKind::Plane,
            ObjectHandle::Connector(_) => ObjectKind::Connector,
        }
    }

    /// Untyped kernel id of the referenced object
    pub fn raw(&self) -> RawResourceHandle {
        match *self {
            ObjectHandle::Crtc(handle) => handle.into(),
            ObjectHandle::Plane(handle) => handle.into(),
            ObjectHandle::Connector(handle) => handle.into(),
        }
    }
}

impl From<crtc::Handle> for ObjectHandle {
    fn from(handle: crtc::Handle) -> Self {
        ObjectHandle::Crtc(handle)
    }
}

impl From<plane::Handle> for ObjectHandle {
    fn from(handle: plane::Handle) -> Self {
        ObjectHandle::Plane(handle)
    }
}

impl From<connector::Handle> for ObjectHandle {
    fn from(handle: connector::Handle) -> Self {
        ObjectHandle::Connector(handle)
    }
}

/// Mode-setting resources exposed by a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayResources {
    /// Available crtcs
    pub crtcs: Vec<crtc::Handle>,
    /// Available connectors
    pub connectors: Vec<connector::Handle>,
    /// Available planes
    pub planes: Vec<plane::Handle>,
}

/// Legacy mode-set request, rebuilt from staged state when atomic commits are unavailable
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyModeset {
    /// Crtc to configure
    pub crtc: crtc::Handle,
    /// Framebuffer to scan out, `None` disables the crtc
    pub fb: Option<framebuffer::Handle>,
    /// Connectors driven by the crtc
    pub connectors: Vec<connector::Handle>,
    /// Mode to set, `None` disables the crtc
    pub mode: Option<Mode>,
}

/// Kernel mode-setting operations used by this crate
///
/// All mutating calls are issued from the thread owning the device.
/// Calls are synchronous *requests*: they are accepted or rejected immediately,
/// page-flip completion is always reported asynchronously through the device's event channel.
pub trait KmsDevice: fmt::Debug {
    /// Tries to enable atomic mode-setting, returns if it is available
    fn enable_atomic(&self) -> bool;

    /// Lists the crtcs, connectors and planes of the device
    fn resources(&self) -> Result<DisplayResources, AccessError>;

    /// Lists all properties currently attached to `object` together with their values
    fn object_properties(
        &self,
        object: ObjectHandle,
    ) -> Result<Vec<(property::Handle, property::RawValue)>, AccessError>;

    /// Returns the name of a property
    fn property_name(&self, property: property::Handle) -> Result<String, AccessError>;

    /// Submits a batch of property changes as one kernel transaction
    fn submit_atomic(&self, flags: CommitFlags, transaction: &AtomicTransaction) -> Result<(), AccessError>;

    /// Writes a single property outside of any transaction
    fn write_property(
        &self,
        object: ObjectHandle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), AccessError>;

    /// Issues a legacy mode-set
    fn legacy_modeset(&self, modeset: &LegacyModeset) -> Result<(), AccessError>;

    /// Queues a legacy page flip, generating a completion event
    fn legacy_page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> Result<(), AccessError>;

    /// Creates a property blob holding `mode`
    fn create_mode_blob(&self, mode: &Mode) -> Result<property::RawValue, AccessError>;

    /// Destroys a blob created by [`KmsDevice::create_mode_blob`]
    fn destroy_mode_blob(&self, blob: property::RawValue) -> Result<(), AccessError>;

    /// Allocates a scan-out buffer of `size` filled with `color` (XRGB8888 byte order)
    fn create_blanking_framebuffer(
        &self,
        size: (u16, u16),
        color: [u8; 4],
    ) -> Result<framebuffer::Handle, AccessError>;

    /// Frees a buffer created by [`KmsDevice::create_blanking_framebuffer`]
    fn destroy_blanking_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError>;

    /// Removes a content framebuffer from the device
    fn release_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError>;
}
