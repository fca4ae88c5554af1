use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use drm::buffer::Buffer as _;
use drm::control::{
    atomic::AtomicModeReq, crtc, dumbbuffer::DumbBuffer, framebuffer, property,
    AtomicCommitFlags, Device as ControlDevice, Mode, PageFlipFlags,
};
use drm::{ClientCapability, Device as BasicDevice};
use drm_fourcc::DrmFourcc;
use tracing::{error, info, trace, warn};

use crate::backend::drm::commit::{AtomicTransaction, CommitFlags};
use crate::backend::drm::error::AccessError;
use crate::backend::drm::kms::{DisplayResources, KmsDevice, LegacyModeset, ObjectHandle};

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
    // blanking buffers, keyed by the framebuffer created for them
    dumb_buffers: Mutex<HashMap<framebuffer::Handle, DumbBuffer>>,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        let buffers = match self.dumb_buffers.get_mut() {
            Ok(buffers) => std::mem::take(buffers),
            Err(_) => HashMap::new(),
        };
        for (fb, buffer) in buffers {
            let _ = self.destroy_framebuffer(fb);
            let _ = self.destroy_dumb_buffer(buffer);
        }
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// file descriptor, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
            dumb_buffers: Mutex::new(HashMap::new()),
        };

        // Newer kernels grant mode-setting permissions to the first process opening the node,
        // so failing to become master is not an error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns if this process is drm master of the device
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> rustix::io::Result<libc::dev_t> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev as libc::dev_t)
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> AccessError + '_ {
        move |source| AccessError {
            errmsg,
            dev: self.dev_path(),
            source,
        }
    }

    fn fill(&self, buffer: &mut DumbBuffer, color: [u8; 4]) -> io::Result<()> {
        let (width, height) = buffer.size();
        let pitch = buffer.pitch() as usize;
        let mut mapping = self.map_dumb_buffer(buffer)?;
        let pixels: &mut [u8] = mapping.as_mut();
        for row in pixels.chunks_exact_mut(pitch).take(height as usize) {
            for pixel in row.chunks_exact_mut(4).take(width as usize) {
                pixel.copy_from_slice(&color);
            }
        }
        Ok(())
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl KmsDevice for DrmDeviceFd {
    fn enable_atomic(&self) -> bool {
        if self
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_err()
        {
            warn!("Unable to request universal planes, some planes may not work");
        }
        self.set_client_capability(ClientCapability::Atomic, true).is_ok()
    }

    fn resources(&self) -> Result<DisplayResources, AccessError> {
        let handles = self
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        let planes = self
            .plane_handles()
            .map_err(self.access("Error loading drm plane resources"))?;
        Ok(DisplayResources {
            crtcs: handles.crtcs().to_vec(),
            connectors: handles.connectors().to_vec(),
            planes,
        })
    }

    fn object_properties(
        &self,
        object: ObjectHandle,
    ) -> Result<Vec<(property::Handle, property::RawValue)>, AccessError> {
        let props = match object {
            ObjectHandle::Crtc(handle) => self.get_properties(handle),
            ObjectHandle::Plane(handle) => self.get_properties(handle),
            ObjectHandle::Connector(handle) => self.get_properties(handle),
        }
        .map_err(self.access("Error reading properties"))?;
        let (handles, values) = props.as_props_and_values();
        Ok(handles.iter().copied().zip(values.iter().copied()).collect())
    }

    fn property_name(&self, property: property::Handle) -> Result<String, AccessError> {
        let info = self
            .get_property(property)
            .map_err(self.access("Error reading property info"))?;
        Ok(info.name().to_string_lossy().into_owned())
    }

    fn submit_atomic(&self, flags: CommitFlags, transaction: &AtomicTransaction) -> Result<(), AccessError> {
        let mut req = AtomicModeReq::new();
        for entry in transaction.entries() {
            req.add_raw_property(entry.object.raw(), entry.property, entry.value);
        }

        let mut kernel_flags = AtomicCommitFlags::empty();
        if flags.contains(CommitFlags::TEST_ONLY) {
            kernel_flags |= AtomicCommitFlags::TEST_ONLY;
        }
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            kernel_flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            kernel_flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            kernel_flags |= AtomicCommitFlags::NONBLOCK;
        }

        self.atomic_commit(kernel_flags, req)
            .map_err(self.access("Error committing atomic state"))
    }

    fn write_property(
        &self,
        object: ObjectHandle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), AccessError> {
        match object {
            ObjectHandle::Crtc(handle) => self.set_property(handle, property, value),
            ObjectHandle::Plane(handle) => self.set_property(handle, property, value),
            ObjectHandle::Connector(handle) => self.set_property(handle, property, value),
        }
        .map_err(self.access("Failed to set property"))
    }

    fn legacy_modeset(&self, modeset: &LegacyModeset) -> Result<(), AccessError> {
        self.set_crtc(modeset.crtc, modeset.fb, (0, 0), &modeset.connectors, modeset.mode)
            .map_err(self.access("Error setting crtc"))
    }

    fn legacy_page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> Result<(), AccessError> {
        trace!(?crtc, ?fb, "Queueing page flip");
        self.page_flip(crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(self.access("Failed to queue page flip"))
    }

    fn create_mode_blob(&self, mode: &Mode) -> Result<property::RawValue, AccessError> {
        let blob = self
            .create_property_blob(mode)
            .map_err(self.access("Failed to create Property Blob for mode"))?;
        Ok(blob.into())
    }

    fn destroy_mode_blob(&self, blob: property::RawValue) -> Result<(), AccessError> {
        self.destroy_property_blob(blob)
            .map_err(self.access("Failed to destroy Property Blob"))
    }

    fn create_blanking_framebuffer(
        &self,
        size: (u16, u16),
        color: [u8; 4],
    ) -> Result<framebuffer::Handle, AccessError> {
        let (w, h) = size;
        let mut db = self
            .create_dumb_buffer((w as u32, h as u32), DrmFourcc::Xrgb8888, 32)
            .map_err(self.access("Failed to create dumb buffer"))?;

        let result = self
            .fill(&mut db, color)
            .map_err(self.access("Failed to map dumb buffer"))
            .and_then(|_| {
                self.add_framebuffer(&db, 24, 32)
                    .map_err(self.access("Failed to create framebuffer"))
            });
        match result {
            Ok(fb) => {
                if let Ok(mut buffers) = self.0.dumb_buffers.lock() {
                    buffers.insert(fb, db);
                }
                Ok(fb)
            }
            Err(err) => {
                let _ = self.destroy_dumb_buffer(db);
                Err(err)
            }
        }
    }

    fn destroy_blanking_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError> {
        let buffer = self
            .0
            .dumb_buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.remove(&fb));
        self.destroy_framebuffer(fb)
            .map_err(self.access("Failed to destroy framebuffer"))?;
        if let Some(buffer) = buffer {
            self.destroy_dumb_buffer(buffer)
                .map_err(self.access("Failed to destroy dumb buffer"))?;
        }
        Ok(())
    }

    fn release_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError> {
        self.destroy_framebuffer(fb)
            .map_err(self.access("Failed to destroy framebuffer"))
    }
}
