//! Scan-out state machine of a single crtc

use std::rc::Rc;

use drm::control::{connector, crtc, framebuffer, plane, property, Mode};
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use super::commit::{AtomicCommitBuilder, CommitFlags, CommitMode};
use super::config::BackendConfig;
use super::error::Error;
use super::framebuffer::{BlankingBuffer, BufferLifetime, FramebufferHandle};
use super::kms::{KmsDevice, LegacyModeset, ObjectHandle, ObjectKind};
use super::object::DisplayObject;

/// State of a [`Crtc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrtcState {
    /// Properties have not been resolved yet
    Uninitialized,
    /// No flip in flight
    Idle,
    /// A flip was submitted and its completion has not been reported yet
    FlipPending,
    /// Initialization failed, the crtc can not be used
    Failed,
}

/// Identifies a submitted flip, handed back on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlipToken {
    /// Crtc the flip was submitted on
    pub crtc: crtc::Handle,
    /// Per-crtc submission counter
    pub sequence: u64,
}

#[derive(Debug)]
struct PendingFlip {
    buffer: FramebufferHandle,
    sequence: u64,
}

/// A scan-out pipeline stage together with its primary plane
///
/// The crtc owns the buffer currently shown, the buffer of the flip in flight
/// and a lazily allocated blanking buffer. A shown buffer is only released once
/// the completion of the flip replacing it has been reported.
#[derive(Debug)]
pub struct Crtc {
    kms: Rc<dyn KmsDevice>,
    handle: crtc::Handle,
    primary_handle: plane::Handle,
    object: DisplayObject,
    primary: DisplayObject,
    commit_mode: CommitMode,
    lifetime: BufferLifetime,
    blank_color: [u8; 4],
    state: CrtcState,
    mode: Mode,
    mode_blob: Option<property::RawValue>,
    needs_modeset: bool,
    current: Option<FramebufferHandle>,
    pending: Option<PendingFlip>,
    blanking: Option<BlankingBuffer>,
    abandoned: Option<u64>,
    next_sequence: u64,
    span: tracing::Span,
}

impl Crtc {
    /// Creates a new, uninitialized crtc driving `mode` through `primary`
    pub fn new(
        kms: Rc<dyn KmsDevice>,
        handle: crtc::Handle,
        primary: plane::Handle,
        mode: Mode,
        commit_mode: CommitMode,
        config: &BackendConfig,
    ) -> Self {
        Crtc {
            object: DisplayObject::new(kms.clone(), handle),
            primary: DisplayObject::new(kms.clone(), primary),
            kms,
            handle,
            primary_handle: primary,
            commit_mode,
            lifetime: config.buffer_lifetime,
            blank_color: config.blank_color,
            state: CrtcState::Uninitialized,
            mode,
            mode_blob: None,
            needs_modeset: true,
            current: None,
            pending: None,
            blanking: None,
            abandoned: None,
            next_sequence: 0,
            span: info_span!("drm_crtc", crtc = ?handle),
        }
    }

    /// Resolves the properties of the crtc and its primary plane
    #[instrument(parent = &self.span, skip(self))]
    pub fn init(&mut self) -> Result<(), Error> {
        match self.state {
            CrtcState::Uninitialized => {}
            CrtcState::Failed => return Err(Error::CrtcFailed(self.handle)),
            CrtcState::Idle | CrtcState::FlipPending => return Ok(()),
        }

        info!(plane = ?self.primary.handle(), mode = ?self.mode.name(), "Initializing crtc");
        let require_all = self.commit_mode == CommitMode::Atomic;
        let result = self
            .object
            .init(require_all)
            .and_then(|_| self.primary.init(require_all));

        match result {
            Ok(()) => {
                self.state = CrtcState::Idle;
                Ok(())
            }
            Err(err) => {
                error!("Failed to initialize crtc: {}", err);
                self.state = CrtcState::Failed;
                Err(err)
            }
        }
    }

    /// Submits `buffer` for scan-out.
    ///
    /// `attached` are the objects of the output this crtc drives. Connectors get routed to
    /// this crtc and overlay planes are disabled whenever the commit needs a mode-set.
    ///
    /// Fails with [`Error::FlipBusy`] while another flip is in flight. On failure the buffer
    /// is not adopted and the crtc stays idle.
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer, attached, builder))]
    #[profiling::function]
    pub fn request_flip(
        &mut self,
        buffer: FramebufferHandle,
        attached: &mut [DisplayObject],
        builder: &mut AtomicCommitBuilder,
    ) -> Result<FlipToken, Error> {
        if let Err(err) = self.check_usable() {
            builder.clear();
            return Err(err);
        }
        if self.state == CrtcState::FlipPending {
            trace!("Flip already in flight");
            builder.clear();
            return Err(Error::FlipBusy(self.handle));
        }

        let modeset = self.needs_modeset;
        if let Err(err) = self.stage_scanout(builder, buffer.framebuffer(), buffer.size(), attached, modeset, true)
        {
            builder.clear();
            return Err(err);
        }

        let flags = if modeset {
            info!(mode = ?self.mode.name(), "Setting mode");
            CommitFlags::PAGE_FLIP_EVENT | CommitFlags::ALLOW_MODESET
        } else {
            CommitFlags::PAGE_FLIP_EVENT | CommitFlags::NONBLOCK
        };

        let applied = builder.commit(flags)?;
        self.object.sync_applied(&applied);
        self.primary.sync_applied(&applied);
        for object in attached.iter_mut() {
            object.sync_applied(&applied);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(sequence, fb = ?buffer.framebuffer(), "Flip submitted");
        self.needs_modeset = false;
        self.pending = Some(PendingFlip { buffer, sequence });
        self.state = CrtcState::FlipPending;

        Ok(FlipToken {
            crtc: self.handle,
            sequence,
        })
    }

    /// Handles the completion of the flip identified by `token`.
    ///
    /// Promotes the pending buffer to current and releases the previously shown buffer
    /// according to the [`BufferLifetime`] policy. Returns the retired buffer, unless it
    /// was removed from the device or is still on screen.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn complete_flip(&mut self, token: FlipToken) -> Result<Option<FramebufferHandle>, Error> {
        let pending = match self.pending.take() {
            Some(pending) if token.crtc == self.handle && pending.sequence == token.sequence => pending,
            other => {
                self.pending = other;
                if token.crtc == self.handle && self.abandoned == Some(token.sequence) {
                    debug!(sequence = token.sequence, "Ignoring completion of an abandoned flip");
                    self.abandoned = None;
                    return Ok(None);
                }
                warn!(?token, "Unexpected flip completion");
                return Err(Error::UnexpectedFlip {
                    crtc: token.crtc,
                    sequence: token.sequence,
                });
            }
        };

        trace!(sequence = pending.sequence, "Flip completed");
        let retired = match self.current.replace(pending.buffer) {
            Some(old) if Some(&old) == self.current.as_ref() => None,
            Some(old) => old.release(&*self.kms, self.lifetime),
            None => None,
        };
        self.blanking = None;
        self.state = CrtcState::Idle;

        Ok(retired)
    }

    /// Shows a solid color buffer instead of any content.
    ///
    /// The blanking buffer is allocated on first use. Anything already staged on `builder`
    /// is committed together with the mode-set. On success the current and pending
    /// buffers are released and the crtc is idle. On failure nothing changes.
    #[instrument(parent = &self.span, skip(self, attached, builder))]
    pub fn blank(
        &mut self,
        attached: &mut [DisplayObject],
        builder: &mut AtomicCommitBuilder,
    ) -> Result<(), Error> {
        if let Err(err) = self.check_usable() {
            builder.clear();
            return Err(err);
        }
        let crtc = self.handle;
        let blank_failed = |err: Error| Error::BlankFailed {
            crtc,
            source: Box::new(err),
        };

        let size = self.mode.size();
        let (fb, allocated) = if let Some(buffer) = &self.blanking {
            (buffer.framebuffer(), false)
        } else {
            let buffer = match BlankingBuffer::allocate(self.kms.clone(), size, self.blank_color) {
                Ok(buffer) => buffer,
                Err(err) => {
                    builder.clear();
                    return Err(blank_failed(err.into()));
                }
            };
            let fb = buffer.framebuffer();
            self.blanking = Some(buffer);
            (fb, true)
        };

        let result = self
            .stage_scanout(builder, fb, size, attached, true, false)
            .and_then(|_| builder.commit(CommitFlags::ALLOW_MODESET));
        let applied = match result {
            Ok(applied) => applied,
            Err(err) => {
                builder.clear();
                if allocated {
                    self.blanking = None;
                }
                return Err(blank_failed(err));
            }
        };
        self.object.sync_applied(&applied);
        self.primary.sync_applied(&applied);
        for object in attached.iter_mut() {
            object.sync_applied(&applied);
        }

        if let Some(pending) = self.pending.take() {
            // the kernel will still report this flip, it must not promote anything
            self.abandoned = Some(pending.sequence);
            pending.buffer.release(&*self.kms, self.lifetime);
        }
        if let Some(current) = self.current.take() {
            current.release(&*self.kms, self.lifetime);
        }
        self.needs_modeset = false;
        self.state = CrtcState::Idle;
        debug!("Crtc blanked");

        Ok(())
    }

    /// Turns the crtc off and detaches it from `attached`.
    ///
    /// Anything already staged on `builder` is committed along. Must not be called with
    /// a flip in flight.
    #[instrument(parent = &self.span, skip(self, attached, builder))]
    pub fn disable(
        &mut self,
        attached: &mut [DisplayObject],
        builder: &mut AtomicCommitBuilder,
    ) -> Result<(), Error> {
        if let Err(err) = self.check_usable() {
            builder.clear();
            return Err(err);
        }
        if self.state == CrtcState::FlipPending {
            builder.clear();
            return Err(Error::FlipBusy(self.handle));
        }

        if let Err(err) = self.stage_off(builder, attached) {
            builder.clear();
            return Err(err);
        }
        builder.stage_legacy_modeset(LegacyModeset {
            crtc: self.handle,
            fb: None,
            connectors: Vec::new(),
            mode: None,
        });

        let applied = builder.commit(CommitFlags::ALLOW_MODESET)?;
        self.object.sync_applied(&applied);
        self.primary.sync_applied(&applied);
        for object in attached.iter_mut() {
            object.sync_applied(&applied);
        }

        if let Some(current) = self.current.take() {
            current.release(&*self.kms, self.lifetime);
        }
        self.blanking = None;
        self.needs_modeset = true;
        info!("Crtc disabled");
        Ok(())
    }

    fn stage_off(&self, builder: &mut AtomicCommitBuilder, attached: &[DisplayObject]) -> Result<(), Error> {
        builder.stage_optional(&self.object, "ACTIVE", 0)?;
        builder.stage_optional(&self.object, "MODE_ID", 0)?;
        builder.stage_optional(&self.primary, "FB_ID", 0)?;
        builder.stage_optional(&self.primary, "CRTC_ID", 0)?;
        for object in attached {
            match object.kind() {
                ObjectKind::Connector => {
                    builder.stage_optional(object, "CRTC_ID", 0)?;
                }
                ObjectKind::Plane => {
                    builder.stage_optional(object, "FB_ID", 0)?;
                    builder.stage_optional(object, "CRTC_ID", 0)?;
                }
                ObjectKind::Crtc => {}
            }
        }
        Ok(())
    }

    /// Turns the crtc on or off without detaching it.
    ///
    /// Turning it off happens immediately, the next flip turns it on again.
    #[instrument(parent = &self.span, skip(self, attached))]
    pub fn set_active(&mut self, active: bool, attached: &mut [DisplayObject]) -> Result<(), Error> {
        self.check_usable()?;
        if self.state == CrtcState::FlipPending {
            return Err(Error::FlipBusy(self.handle));
        }
        if active {
            self.needs_modeset = true;
            return Ok(());
        }

        let mut builder = AtomicCommitBuilder::new(self.kms.clone(), self.commit_mode);
        match self.commit_mode {
            CommitMode::Atomic => {
                builder.stage(&self.object, "ACTIVE", 0)?;
            }
            CommitMode::Legacy => {
                // DRM_MODE_DPMS_OFF
                for object in attached.iter().filter(|o| o.kind() == ObjectKind::Connector) {
                    builder.stage_optional(object, "DPMS", 3)?;
                }
            }
        }
        let applied = builder.commit(CommitFlags::ALLOW_MODESET)?;
        self.object.sync_applied(&applied);
        for object in attached.iter_mut() {
            object.sync_applied(&applied);
        }
        self.needs_modeset = true;
        Ok(())
    }

    /// Changes the mode used by the next flip, which then performs a mode-set
    #[instrument(parent = &self.span, skip(self))]
    pub fn use_mode(&mut self, mode: Mode) -> Result<(), Error> {
        if self.state == CrtcState::FlipPending {
            return Err(Error::FlipBusy(self.handle));
        }
        if mode == self.mode {
            return Ok(());
        }

        if let Some(blob) = self.mode_blob.take() {
            if let Err(err) = self.kms.destroy_mode_blob(blob) {
                warn!("Failed to destroy old mode property blob: {}", err);
            }
        }
        if self.blanking.as_ref().map(BlankingBuffer::size) != Some(mode.size()) {
            self.blanking = None;
        }
        self.mode = mode;
        self.needs_modeset = true;
        Ok(())
    }

    /// Forces the next flip to perform a full mode-set
    pub fn reset_state(&mut self) {
        self.needs_modeset = true;
    }

    /// Handle of this crtc
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Handle of the primary plane
    pub fn primary_plane(&self) -> plane::Handle {
        self.primary_handle
    }

    /// Current state
    pub fn state(&self) -> CrtcState {
        self.state
    }

    /// Mode used for scan-out
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns if the next flip performs a mode-set
    pub fn needs_modeset(&self) -> bool {
        self.needs_modeset
    }

    /// The buffer currently on screen
    pub fn current_buffer(&self) -> Option<&FramebufferHandle> {
        self.current.as_ref()
    }

    /// The buffer of the flip in flight
    pub fn pending_buffer(&self) -> Option<&FramebufferHandle> {
        self.pending.as_ref().map(|pending| &pending.buffer)
    }

    /// Returns if the blanking buffer is shown
    pub fn is_blanked(&self) -> bool {
        self.blanking.is_some() && self.current.is_none()
    }

    /// The crtc object and its property cache
    pub fn object(&self) -> &DisplayObject {
        &self.object
    }

    /// The primary plane object and its property cache
    pub fn primary(&self) -> &DisplayObject {
        &self.primary
    }

    fn check_usable(&self) -> Result<(), Error> {
        match self.state {
            CrtcState::Uninitialized => Err(Error::CrtcNotInitialized(self.handle)),
            CrtcState::Failed => Err(Error::CrtcFailed(self.handle)),
            CrtcState::Idle | CrtcState::FlipPending => Ok(()),
        }
    }

    fn mode_blob(&mut self) -> Result<property::RawValue, Error> {
        if let Some(blob) = self.mode_blob {
            return Ok(blob);
        }
        let blob = self.kms.create_mode_blob(&self.mode)?;
        self.mode_blob = Some(blob);
        Ok(blob)
    }

    fn stage_scanout(
        &mut self,
        builder: &mut AtomicCommitBuilder,
        fb: framebuffer::Handle,
        size: (u16, u16),
        attached: &[DisplayObject],
        modeset: bool,
        flip: bool,
    ) -> Result<(), Error> {
        let crtc_id = u32::from(self.handle) as u64;
        let (mode_w, mode_h) = self.mode.size();

        if self.object.has_property("MODE_ID") {
            let blob = self.mode_blob()?;
            builder.stage(&self.object, "MODE_ID", blob)?;
        }
        builder.stage_optional(&self.object, "ACTIVE", 1)?;

        // src coordinates are 16.16 fixed point
        let primary = &self.primary;
        builder.stage_optional(primary, "FB_ID", u32::from(fb) as u64)?;
        builder.stage_optional(primary, "CRTC_ID", crtc_id)?;
        builder.stage_optional(primary, "SRC_X", 0)?;
        builder.stage_optional(primary, "SRC_Y", 0)?;
        builder.stage_optional(primary, "SRC_W", (size.0 as u64) << 16)?;
        builder.stage_optional(primary, "SRC_H", (size.1 as u64) << 16)?;
        builder.stage_optional(primary, "CRTC_X", 0)?;
        builder.stage_optional(primary, "CRTC_Y", 0)?;
        builder.stage_optional(primary, "CRTC_W", mode_w as u64)?;
        builder.stage_optional(primary, "CRTC_H", mode_h as u64)?;

        if modeset {
            let mut connectors: Vec<connector::Handle> = Vec::new();
            for object in attached {
                match object.handle() {
                    ObjectHandle::Connector(conn) => {
                        builder.stage_optional(object, "CRTC_ID", crtc_id)?;
                        connectors.push(conn);
                    }
                    ObjectHandle::Plane(_) => {
                        builder.stage_optional(object, "FB_ID", 0)?;
                        builder.stage_optional(object, "CRTC_ID", 0)?;
                    }
                    ObjectHandle::Crtc(_) => {}
                }
            }
            builder.stage_legacy_modeset(LegacyModeset {
                crtc: self.handle,
                fb: Some(fb),
                connectors,
                mode: Some(self.mode),
            });
        }
        if flip {
            // set_crtc does not generate an event, the legacy path follows it with a flip
            builder.stage_legacy_flip(self.handle, fb);
        }
        Ok(())
    }
}

impl Drop for Crtc {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        if let Some(blob) = self.mode_blob.take() {
            if let Err(err) = self.kms.destroy_mode_blob(blob) {
                warn!("Failed to destroy mode property blob: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::{Crtc, CrtcState, FlipToken};
    use crate::backend::drm::{
        commit::{AtomicCommitBuilder, CommitMode},
        config::BackendConfig,
        error::Error,
        framebuffer::{BufferLifetime, FramebufferHandle},
        object::DisplayObject,
        test_utils::{
            connector_handle, crtc_handle, fb_handle, plane_handle, test_mode, MockKms, TEST_CONNECTOR,
            TEST_CRTC, TEST_PLANE,
        },
    };

    struct Fixture {
        kms: Rc<MockKms>,
        crtc: Crtc,
        attached: Vec<DisplayObject>,
        mode: CommitMode,
    }

    impl Fixture {
        fn new(kms: MockKms, config: BackendConfig) -> Self {
            let kms = Rc::new(kms);
            let mode = if kms.is_atomic() {
                CommitMode::Atomic
            } else {
                CommitMode::Legacy
            };
            let crtc = Crtc::new(
                kms.clone(),
                crtc_handle(TEST_CRTC),
                plane_handle(TEST_PLANE),
                test_mode(1920, 1080),
                mode,
                &config,
            );
            let mut connector = DisplayObject::new(kms.clone(), connector_handle(TEST_CONNECTOR));
            connector.init(mode == CommitMode::Atomic).unwrap();
            Fixture {
                kms,
                crtc,
                attached: vec![connector],
                mode,
            }
        }

        fn atomic() -> Self {
            let mut fixture = Fixture::new(MockKms::atomic(), BackendConfig::default());
            fixture.crtc.init().unwrap();
            fixture
        }

        fn builder(&self) -> AtomicCommitBuilder {
            AtomicCommitBuilder::new(self.kms.clone(), self.mode)
        }

        fn flip(&mut self, buffer: &FramebufferHandle) -> Result<FlipToken, Error> {
            let mut builder = self.builder();
            self.crtc.request_flip(buffer.clone(), &mut self.attached, &mut builder)
        }

        fn blank(&mut self) -> Result<(), Error> {
            let mut builder = self.builder();
            self.crtc.blank(&mut self.attached, &mut builder)
        }
    }

    fn buffer(id: u32) -> FramebufferHandle {
        FramebufferHandle::new(fb_handle(id), (1920, 1080))
    }

    #[test]
    fn init_resolves_properties() {
        let mut fixture = Fixture::new(MockKms::atomic(), BackendConfig::default());
        assert_eq!(fixture.crtc.state(), CrtcState::Uninitialized);
        assert!(matches!(
            fixture.flip(&buffer(1)),
            Err(Error::CrtcNotInitialized(_))
        ));
        fixture.crtc.init().unwrap();
        assert_eq!(fixture.crtc.state(), CrtcState::Idle);
    }

    #[test]
    fn failed_init_is_terminal() {
        let mut fixture = Fixture::new(MockKms::atomic(), BackendConfig::default());
        fixture.kms.fail_enumerations(1);

        assert!(matches!(fixture.crtc.init(), Err(Error::PropertyQuery { .. })));
        assert_eq!(fixture.crtc.state(), CrtcState::Failed);
        assert!(matches!(fixture.crtc.init(), Err(Error::CrtcFailed(_))));
        assert!(matches!(fixture.flip(&buffer(1)), Err(Error::CrtcFailed(_))));
    }

    #[test]
    fn flip_and_completion() {
        let mut fixture = Fixture::atomic();
        let a = buffer(1);

        let token = fixture.flip(&a).unwrap();
        assert_eq!(fixture.crtc.state(), CrtcState::FlipPending);
        assert!(fixture.crtc.current_buffer().is_none());
        assert_eq!(fixture.kms.value(TEST_PLANE, "FB_ID"), Some(1));
        assert_eq!(fixture.kms.value(TEST_CRTC, "ACTIVE"), Some(1));
        assert_eq!(fixture.kms.value(TEST_CONNECTOR, "CRTC_ID"), Some(TEST_CRTC as u64));

        assert!(fixture.crtc.complete_flip(token).unwrap().is_none());
        assert_eq!(fixture.crtc.state(), CrtcState::Idle);
        assert_eq!(fixture.crtc.current_buffer(), Some(&a));
    }

    #[test]
    fn second_flip_is_busy() {
        let mut fixture = Fixture::atomic();
        let (a, b) = (buffer(1), buffer(2));

        let token = fixture.flip(&a).unwrap();
        assert!(matches!(fixture.flip(&b), Err(Error::FlipBusy(_))));
        assert_eq!(fixture.kms.stats().commits, 1);
        assert_eq!(fixture.crtc.pending_buffer(), Some(&a));

        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&b).unwrap();
        // only the first flip needs a mode-set
        assert_eq!(fixture.kms.stats().modeset_commits, 1);
        let retired = fixture.crtc.complete_flip(token).unwrap();
        assert_eq!(retired, Some(a));
        assert_eq!(fixture.crtc.current_buffer(), Some(&b));
    }

    #[test]
    fn rejected_flip_is_not_adopted() {
        let mut fixture = Fixture::atomic();
        fixture.kms.reject_commits(1);

        let err = fixture.flip(&buffer(1)).unwrap_err();
        assert!(matches!(err, Error::AtomicRejected { .. }));
        assert_eq!(fixture.crtc.state(), CrtcState::Idle);
        assert!(fixture.crtc.pending_buffer().is_none());
        assert!(fixture.crtc.needs_modeset());
    }

    #[test]
    fn current_changes_only_on_completion() {
        let mut fixture = Fixture::atomic();
        let (a, b) = (buffer(1), buffer(2));

        let token = fixture.flip(&a).unwrap();
        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&b).unwrap();
        assert_eq!(fixture.crtc.current_buffer(), Some(&a));
        assert!(fixture.kms.released().is_empty());
        fixture.crtc.complete_flip(token).unwrap();
        assert_eq!(fixture.crtc.current_buffer(), Some(&b));
    }

    #[test]
    fn delete_after_flip_frees_unshared_buffers() {
        let config = BackendConfig {
            buffer_lifetime: BufferLifetime::DeleteAfterFlip,
            ..BackendConfig::default()
        };
        let mut fixture = Fixture::new(MockKms::atomic(), config);
        fixture.crtc.init().unwrap();

        let token = fixture.flip(&buffer(1)).unwrap();
        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&buffer(2)).unwrap();
        assert!(fixture.kms.released().is_empty());
        assert!(fixture.crtc.complete_flip(token).unwrap().is_none());
        assert_eq!(fixture.kms.released(), vec![fb_handle(1)]);

        // a buffer still referenced elsewhere survives
        let shared = buffer(3);
        let token = fixture.flip(&shared).unwrap();
        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&buffer(4)).unwrap();
        assert_eq!(fixture.crtc.complete_flip(token).unwrap(), Some(shared));
        assert_eq!(fixture.kms.released(), vec![fb_handle(1), fb_handle(2)]);
    }

    #[test]
    fn same_buffer_twice_is_not_retired() {
        let config = BackendConfig {
            buffer_lifetime: BufferLifetime::DeleteAfterFlip,
            ..BackendConfig::default()
        };
        let mut fixture = Fixture::new(MockKms::atomic(), config);
        fixture.crtc.init().unwrap();
        let a = buffer(1);

        let token = fixture.flip(&a).unwrap();
        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&a).unwrap();
        assert!(fixture.crtc.complete_flip(token).unwrap().is_none());
        assert!(fixture.kms.released().is_empty());
        assert_eq!(fixture.crtc.current_buffer(), Some(&a));
    }

    #[test]
    fn unexpected_completion_is_rejected() {
        let mut fixture = Fixture::atomic();
        let token = fixture.flip(&buffer(1)).unwrap();

        let bogus = FlipToken {
            sequence: token.sequence + 1,
            ..token
        };
        assert!(matches!(
            fixture.crtc.complete_flip(bogus),
            Err(Error::UnexpectedFlip { .. })
        ));
        assert_eq!(fixture.crtc.state(), CrtcState::FlipPending);

        fixture.crtc.complete_flip(token).unwrap();
        // duplicate
        assert!(matches!(
            fixture.crtc.complete_flip(token),
            Err(Error::UnexpectedFlip { .. })
        ));
    }

    #[test]
    fn blank_has_no_lingering_effect() {
        let a = buffer(1);

        let mut direct = Fixture::atomic();
        let token = direct.flip(&a).unwrap();
        direct.crtc.complete_flip(token).unwrap();

        let mut blanked = Fixture::atomic();
        blanked.blank().unwrap();
        assert!(blanked.crtc.is_blanked());
        assert_eq!(blanked.kms.blanking_buffers(), 1);
        let token = blanked.flip(&a).unwrap();
        blanked.crtc.complete_flip(token).unwrap();

        assert_eq!(blanked.crtc.state(), direct.crtc.state());
        assert_eq!(blanked.crtc.current_buffer(), direct.crtc.current_buffer());
        assert!(!blanked.crtc.is_blanked());
        assert!(blanked.crtc.pending_buffer().is_none());
        // blanking buffer is gone again
        assert_eq!(blanked.kms.blanking_buffers(), 0);
    }

    #[test]
    fn blank_releases_content() {
        let config = BackendConfig {
            buffer_lifetime: BufferLifetime::DeleteAfterFlip,
            ..BackendConfig::default()
        };
        let mut fixture = Fixture::new(MockKms::atomic(), config);
        fixture.crtc.init().unwrap();

        let token = fixture.flip(&buffer(1)).unwrap();
        fixture.crtc.complete_flip(token).unwrap();
        let token = fixture.flip(&buffer(2)).unwrap();

        fixture.blank().unwrap();
        assert_eq!(fixture.crtc.state(), CrtcState::Idle);
        assert!(fixture.crtc.current_buffer().is_none());
        assert!(fixture.crtc.pending_buffer().is_none());
        assert_eq!(fixture.kms.released(), vec![fb_handle(2), fb_handle(1)]);

        // the abandoned flip still completes, but changes nothing
        assert!(fixture.crtc.complete_flip(token).unwrap().is_none());
        assert!(fixture.crtc.is_blanked());
    }

    #[test]
    fn failed_blank_keeps_state() {
        let mut fixture = Fixture::atomic();
        let a = buffer(1);
        let token = fixture.flip(&a).unwrap();
        fixture.crtc.complete_flip(token).unwrap();

        fixture.kms.fail_blanking_allocation(true);
        assert!(matches!(fixture.blank(), Err(Error::BlankFailed { .. })));
        assert_eq!(fixture.crtc.current_buffer(), Some(&a));

        fixture.kms.fail_blanking_allocation(false);
        fixture.kms.reject_commits(1);
        assert!(matches!(fixture.blank(), Err(Error::BlankFailed { .. })));
        assert_eq!(fixture.crtc.current_buffer(), Some(&a));
        assert_eq!(fixture.kms.blanking_buffers(), 0);
    }

    #[test]
    fn legacy_flip_uses_modeset_then_page_flip() {
        let mut fixture = Fixture::new(MockKms::legacy(), BackendConfig::default());
        fixture.crtc.init().unwrap();

        let token = fixture.flip(&buffer(1)).unwrap();
        assert_eq!(fixture.kms.stats().modesets, 1);
        assert_eq!(fixture.kms.stats().flips, 1);
        fixture.crtc.complete_flip(token).unwrap();

        fixture.flip(&buffer(2)).unwrap();
        assert_eq!(fixture.kms.stats().modesets, 1);
        assert_eq!(fixture.kms.stats().flips, 2);
    }

    #[test]
    fn legacy_power_off_writes_dpms() {
        let mut fixture = Fixture::new(MockKms::legacy(), BackendConfig::default());
        fixture.crtc.init().unwrap();

        fixture.crtc.set_active(false, &mut fixture.attached).unwrap();
        assert_eq!(fixture.kms.value(TEST_CONNECTOR, "DPMS"), Some(3));
        assert_eq!(fixture.kms.stats().writes, 1);
        assert_eq!(fixture.kms.stats().commits, 0);
        assert_eq!(fixture.kms.stats().modesets, 0);
        assert!(fixture.crtc.needs_modeset());
    }

    #[test]
    fn legacy_blank_is_a_modeset_without_flip() {
        let mut fixture = Fixture::new(MockKms::legacy(), BackendConfig::default());
        fixture.crtc.init().unwrap();

        fixture.blank().unwrap();
        assert_eq!(fixture.kms.stats().modesets, 1);
        assert_eq!(fixture.kms.stats().flips, 0);
        assert_eq!(fixture.kms.stats().commits, 0);
        assert!(fixture.crtc.is_blanked());
        assert_eq!(fixture.crtc.state(), CrtcState::Idle);
        assert!(!fixture.crtc.needs_modeset());
    }

    #[test]
    fn mode_change_requires_modeset() {
        let mut fixture = Fixture::atomic();
        let token = fixture.flip(&buffer(1)).unwrap();
        assert!(matches!(
            fixture.crtc.use_mode(crate::backend::drm::test_utils::test_mode(1280, 720)),
            Err(Error::FlipBusy(_))
        ));
        fixture.crtc.complete_flip(token).unwrap();

        fixture
            .crtc
            .use_mode(crate::backend::drm::test_utils::test_mode(1280, 720))
            .unwrap();
        assert!(fixture.crtc.needs_modeset());
        assert_eq!(fixture.kms.destroyed_blobs(), 1);
        fixture.flip(&buffer(2)).unwrap();
        assert_eq!(fixture.kms.stats().modeset_commits, 2);
        assert_eq!(fixture.kms.value(TEST_PLANE, "CRTC_W"), Some(1280));
    }
}
