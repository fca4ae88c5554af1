//! Ownership of buffers shown on a crtc

use std::rc::Rc;

use drm::control::framebuffer;
use tracing::{trace, warn};

use super::error::AccessError;
use super::kms::KmsDevice;

/// What happens to a buffer once it stops being scanned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferLifetime {
    /// The framebuffer is removed from the device, if nobody else holds a reference to it
    DeleteAfterFlip,
    /// The buffer is handed back, an external buffer manager reclaims it
    #[default]
    External,
}

#[derive(Debug)]
struct FramebufferInner {
    fb: framebuffer::Handle,
    size: (u16, u16),
}

/// Reference-counted framebuffer usable for scan-out
///
/// Clones refer to the same buffer, a framebuffer is only ever removed from the
/// device once the last reference is released after a flip.
#[derive(Debug, Clone)]
pub struct FramebufferHandle(Rc<FramebufferInner>);

impl FramebufferHandle {
    /// Wraps an already imported framebuffer of `size` pixels
    pub fn new(fb: framebuffer::Handle, size: (u16, u16)) -> Self {
        FramebufferHandle(Rc::new(FramebufferInner { fb, size }))
    }

    /// The kernel framebuffer
    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.0.fb
    }

    /// Size in pixels
    pub fn size(&self) -> (u16, u16) {
        self.0.size
    }

    /// Returns if any other reference to this buffer exists
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.0) > 1
    }

    // Called once the buffer left the screen or never made it there.
    pub(super) fn release(self, kms: &dyn KmsDevice, lifetime: BufferLifetime) -> Option<FramebufferHandle> {
        match lifetime {
            BufferLifetime::External => Some(self),
            BufferLifetime::DeleteAfterFlip => match Rc::try_unwrap(self.0) {
                Ok(inner) => {
                    trace!(fb = ?inner.fb, "destroying framebuffer");
                    if let Err(err) = kms.release_framebuffer(inner.fb) {
                        warn!(fb = ?inner.fb, ?err, "failed to destroy framebuffer");
                    }
                    None
                }
                Err(shared) => Some(FramebufferHandle(shared)),
            },
        }
    }
}

impl PartialEq for FramebufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FramebufferHandle {}

impl AsRef<framebuffer::Handle> for FramebufferHandle {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.0.fb
    }
}

/// Solid color buffer shown while no content is available
#[derive(Debug)]
pub struct BlankingBuffer {
    fb: framebuffer::Handle,
    size: (u16, u16),
    kms: Rc<dyn KmsDevice>,
}

impl BlankingBuffer {
    /// Allocates a buffer of `size` filled with `color`
    pub fn allocate(kms: Rc<dyn KmsDevice>, size: (u16, u16), color: [u8; 4]) -> Result<Self, AccessError> {
        let fb = kms.create_blanking_framebuffer(size, color)?;
        trace!(?fb, ?size, "allocated blanking buffer");
        Ok(BlankingBuffer { fb, size, kms })
    }

    /// The kernel framebuffer
    pub fn framebuffer(&self) -> framebuffer::Handle {
        self.fb
    }

    /// Size in pixels
    pub fn size(&self) -> (u16, u16) {
        self.size
    }
}

impl Drop for BlankingBuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying blanking buffer");
        if let Err(err) = self.kms.destroy_blanking_framebuffer(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy blanking buffer");
        }
    }
}
