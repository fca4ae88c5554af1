#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Scanout: atomic display outputs and buffer flips
//!
//! This crate drives display hardware through the kernel's mode-setting (drm/kms) interface.
//! It programs crtcs, planes and connectors with atomic commits (falling back to the legacy
//! interface on older drivers), puts client framebuffers on screen and serializes page-flips,
//! so that every output has at most one flip in flight at any time.
//!
//! Everything lives in [`backend::drm`], see its documentation for an overview.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! Completion of page-flips is signaled by the kernel through the drm file descriptor.
//! The crate is built around [`calloop`]: the [`DrmDeviceNotifier`](backend::drm::DrmDeviceNotifier)
//! is an event source you insert into your event loop, its events are then handed to the
//! [`FlipScheduler`](backend::drm::FlipScheduler). All state is owned by a single thread,
//! none of the types are meant to be shared across threads.
//!
//! ### Logging
//!
//! Scanout makes extensive use of [`tracing`] for its internal logging.
//! Every crtc and output carries its own span, so messages can be attributed to the
//! hardware object they concern.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! If you do not want to use [`tracing`], refer to [`log compatibility`](tracing#log-compatibility)
//! for how to forward scanout's debug output to other `log` compatible frameworks.

pub mod backend;
