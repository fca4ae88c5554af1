//! Backend helpers
//!
//! Currently this only contains the [`drm`] backend, driving display outputs
//! through the kernel's mode-setting interface.

pub mod drm;
