//! Batching of property changes into kernel transactions
//!
//! Changes of any number of [`DisplayObject`]s are collected in an [`AtomicCommitBuilder`]
//! and submitted with a single call to [`AtomicCommitBuilder::commit`].
//!
//! Devices without atomic mode-setting get the same interface: the staged entries are replayed
//! one by one through legacy calls. That path can not guarantee all-or-nothing semantics,
//! a failure after some writes went through is reported as
//! [`Error::LegacyPartialFailure`](super::Error::LegacyPartialFailure).

use std::io;
use std::rc::Rc;

use drm::control::{crtc, framebuffer, property};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::error::{AccessError, Error};
use super::kms::{KmsDevice, LegacyModeset, ObjectHandle};
use super::object::DisplayObject;

bitflags::bitflags! {
    /// Flags of a commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Only validate the configuration, do not apply it
        const TEST_ONLY = 1;
        /// Allow changes that require a full mode-set
        const ALLOW_MODESET = 1 << 1;
        /// Generate a page-flip event once the commit is visible
        const PAGE_FLIP_EVENT = 1 << 2;
        /// Do not block until the commit is applied
        const NONBLOCK = 1 << 3;
    }
}

/// How staged changes reach the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitMode {
    /// One atomic transaction per commit
    Atomic,
    /// Sequential legacy calls
    Legacy,
}

// Properties the legacy path expresses through `set_crtc`/`page_flip` instead of single writes.
const LEGACY_MODESET_PROPERTIES: &[&str] = &[
    "MODE_ID", "ACTIVE", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y",
    "CRTC_W", "CRTC_H",
];

/// A single staged property change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedProperty {
    /// Object the property belongs to
    pub object: ObjectHandle,
    /// Name of the property
    pub name: &'static str,
    /// Kernel id of the property
    pub property: property::Handle,
    /// New value
    pub value: property::RawValue,
}

impl StagedProperty {
    fn is_modeset_property(&self) -> bool {
        LEGACY_MODESET_PROPERTIES.contains(&self.name)
    }
}

/// A batch of staged changes, submitted at most once
#[derive(Debug, Default)]
pub struct AtomicTransaction {
    entries: SmallVec<[StagedProperty; 16]>,
    modeset: Option<LegacyModeset>,
    flip: Option<(crtc::Handle, framebuffer::Handle)>,
}

impl AtomicTransaction {
    /// Appends an entry
    pub fn push(&mut self, entry: StagedProperty) {
        trace!(object = ?entry.object, name = entry.name, value = entry.value, "Staging property");
        self.entries.push(entry);
    }

    /// Staged property entries, in staging order
    pub fn entries(&self) -> &[StagedProperty] {
        &self.entries
    }

    /// Number of staged property entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns if nothing at all is staged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.modeset.is_none() && self.flip.is_none()
    }

    /// Mode-set used by the legacy replay
    pub fn legacy_modeset(&self) -> Option<&LegacyModeset> {
        self.modeset.as_ref()
    }

    /// Page flip used by the legacy replay
    pub fn legacy_flip(&self) -> Option<(crtc::Handle, framebuffer::Handle)> {
        self.flip
    }
}

/// Accumulates property changes across objects and submits them together
#[derive(Debug)]
pub struct AtomicCommitBuilder {
    kms: Rc<dyn KmsDevice>,
    mode: CommitMode,
    transaction: AtomicTransaction,
}

impl AtomicCommitBuilder {
    /// Creates an empty builder
    pub fn new(kms: Rc<dyn KmsDevice>, mode: CommitMode) -> Self {
        AtomicCommitBuilder {
            kms,
            mode,
            transaction: AtomicTransaction::default(),
        }
    }

    /// The path commits of this builder take
    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Stages a change of `name` on `object`
    pub fn stage(
        &mut self,
        object: &DisplayObject,
        name: &'static str,
        value: property::RawValue,
    ) -> Result<(), Error> {
        object.stage_value(name, value, &mut self.transaction)
    }

    /// Stages a change of `name` on `object`, if the object exposes it
    pub fn stage_optional(
        &mut self,
        object: &DisplayObject,
        name: &'static str,
        value: property::RawValue,
    ) -> Result<bool, Error> {
        if object.has_property(name) {
            self.stage(object, name, value)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Records the mode-set the legacy path issues for this commit
    pub fn stage_legacy_modeset(&mut self, modeset: LegacyModeset) {
        self.transaction.modeset = Some(modeset);
    }

    /// Records the page flip the legacy path issues for this commit
    pub fn stage_legacy_flip(&mut self, crtc: crtc::Handle, fb: framebuffer::Handle) {
        self.transaction.flip = Some((crtc, fb));
    }

    /// The currently staged transaction
    pub fn transaction(&self) -> &AtomicTransaction {
        &self.transaction
    }

    /// Returns if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.transaction.is_empty()
    }

    /// Drops everything staged so far
    pub fn clear(&mut self) {
        self.transaction = AtomicTransaction::default();
    }

    /// Submits everything staged so far and clears the builder.
    ///
    /// Returns the entries that were applied, which is nothing for
    /// [`CommitFlags::TEST_ONLY`]. The builder is empty afterwards, regardless of the result.
    #[profiling::function]
    pub fn commit(&mut self, flags: CommitFlags) -> Result<Vec<StagedProperty>, Error> {
        let transaction = std::mem::take(&mut self.transaction);
        match self.mode {
            CommitMode::Atomic => self.commit_atomic(flags, transaction),
            CommitMode::Legacy => self.replay_legacy(flags, transaction),
        }
    }

    fn commit_atomic(
        &self,
        flags: CommitFlags,
        transaction: AtomicTransaction,
    ) -> Result<Vec<StagedProperty>, Error> {
        if transaction.entries.is_empty() {
            trace!(?flags, "Skipping empty atomic commit");
            return Ok(Vec::new());
        }

        debug!(?flags, entries = transaction.len(), "Submitting atomic commit");
        if let Err(reason) = self.kms.submit_atomic(flags, &transaction) {
            warn!(?flags, "Atomic commit rejected: {}", reason);
            return Err(Error::AtomicRejected { reason });
        }

        if flags.contains(CommitFlags::TEST_ONLY) {
            Ok(Vec::new())
        } else {
            Ok(transaction.entries.into_vec())
        }
    }

    fn replay_legacy(
        &self,
        flags: CommitFlags,
        transaction: AtomicTransaction,
    ) -> Result<Vec<StagedProperty>, Error> {
        if flags.contains(CommitFlags::TEST_ONLY) {
            // the legacy api has no way to validate a configuration without applying it
            debug!("Legacy device can not test commits, assuming success");
            return Ok(Vec::new());
        }

        let AtomicTransaction {
            entries,
            modeset,
            flip,
        } = transaction;
        let (structural, writes): (Vec<StagedProperty>, Vec<StagedProperty>) =
            entries.into_iter().partition(StagedProperty::is_modeset_property);

        let mut applied = Vec::with_capacity(structural.len() + writes.len());
        let mut failed = Vec::new();
        let mut first_error: Option<AccessError> = None;
        let mut structural = Some(structural);

        if let Some(modeset) = modeset {
            if !flags.contains(CommitFlags::ALLOW_MODESET) {
                return Err(Error::LegacyRejected(AccessError {
                    errmsg: "Mode-set required, but not allowed",
                    dev: None,
                    source: io::Error::from_raw_os_error(libc::EINVAL),
                }));
            }
            debug!(crtc = ?modeset.crtc, fb = ?modeset.fb, "Replaying legacy mode-set");
            self.kms.legacy_modeset(&modeset).map_err(Error::LegacyRejected)?;
            applied.extend(structural.take().into_iter().flatten());
        }

        for entry in writes {
            match self.kms.write_property(entry.object, entry.property, entry.value) {
                Ok(()) => applied.push(entry),
                Err(err) => {
                    warn!(object = ?entry.object, name = entry.name, "Failed to write property: {}", err);
                    failed.push(entry);
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some((crtc, fb)) = flip {
            if flags.contains(CommitFlags::PAGE_FLIP_EVENT) || structural.is_some() {
                trace!(?crtc, ?fb, "Queueing legacy page flip");
                match self.kms.legacy_page_flip(crtc, fb) {
                    Ok(()) => applied.extend(structural.take().into_iter().flatten()),
                    Err(err) => {
                        warn!(?crtc, "Failed to queue page flip: {}", err);
                        failed.extend(structural.take().into_iter().flatten());
                        first_error.get_or_insert(err);
                    }
                }
            }
        }

        // structural entries without a mode-set or flip to carry them are written one by one
        for entry in structural.into_iter().flatten() {
            match self.kms.write_property(entry.object, entry.property, entry.value) {
                Ok(()) => applied.push(entry),
                Err(err) => {
                    failed.push(entry);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            None => Ok(applied),
            Some(source) if applied.is_empty() => Err(Error::LegacyRejected(source)),
            Some(source) => Err(Error::LegacyPartialFailure {
                applied,
                failed,
                source,
            }),
        }
    }
}
