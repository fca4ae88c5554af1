//! Logical display outputs
//!
//! An [`OutputPipeline`] binds one connector and one [`Crtc`], plus optional overlay planes,
//! into the unit the rest of a compositor addresses. Frames handed to a pipeline are either
//! flipped right away or parked in its [`FlipQueue`] until the flip in flight completes.

use std::fmt;
use std::rc::Rc;

use drm::control::{connector, crtc, plane, Mode};
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::commit::{AtomicCommitBuilder, CommitMode};
use super::config::{BackendConfig, OutputConfig};
use super::crtc::{Crtc, FlipToken};
use super::error::{Error, ErrorKind};
use super::framebuffer::{BufferLifetime, FramebufferHandle};
use super::kms::{KmsDevice, ObjectHandle};
use super::object::DisplayObject;
use super::scheduler::FlipQueue;

/// Identifier of an [`OutputPipeline`], unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub(super) u32);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output-{}", self.0)
    }
}

/// What happened to a frame handed to [`OutputPipeline::request_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    /// The flip was submitted to the kernel
    Accepted,
    /// A flip is in flight, the frame is shown once it completes, unless a newer one supersedes it
    Queued,
}

/// Result of a flip completion
#[derive(Debug, PartialEq, Eq)]
pub enum FlipOutcome {
    /// The submitted frame is now on screen
    Presented {
        /// Buffer that left the screen, unless it was removed from the device
        retired: Option<FramebufferHandle>,
    },
    /// The flip was superseded by blanking the output before it completed
    Abandoned,
}

/// A logical display output
#[derive(Debug)]
pub struct OutputPipeline {
    id: PipelineId,
    kms: Rc<dyn KmsDevice>,
    commit_mode: CommitMode,
    lifetime: BufferLifetime,
    crtc: Crtc,
    connector: connector::Handle,
    // connector first, overlay planes after it
    attached: Vec<DisplayObject>,
    // connectors routed away from this crtc, detached with the next mode-set
    detached: Vec<DisplayObject>,
    queue: FlipQueue,
    enabled: bool,
    active: bool,
    rejections: u32,
    span: tracing::Span,
}

impl OutputPipeline {
    pub(super) fn new(
        id: PipelineId,
        kms: Rc<dyn KmsDevice>,
        commit_mode: CommitMode,
        output: &OutputConfig,
        config: &BackendConfig,
    ) -> Self {
        let crtc = Crtc::new(
            kms.clone(),
            output.crtc,
            output.primary_plane,
            output.mode,
            commit_mode,
            config,
        );
        let mut attached = Vec::with_capacity(1 + output.planes.len());
        attached.push(DisplayObject::new(kms.clone(), output.connector));
        attached.extend(
            output
                .planes
                .iter()
                .map(|plane| DisplayObject::new(kms.clone(), *plane)),
        );

        OutputPipeline {
            id,
            kms,
            commit_mode,
            lifetime: config.buffer_lifetime,
            crtc,
            connector: output.connector,
            attached,
            detached: Vec::new(),
            queue: FlipQueue::default(),
            enabled: true,
            active: true,
            rejections: 0,
            span: info_span!("drm_output", id = %id, crtc = ?output.crtc, connector = ?output.connector),
        }
    }

    /// Resolves the properties of every object of this output
    #[instrument(parent = &self.span, skip(self))]
    pub fn init(&mut self) -> Result<(), Error> {
        let require_all = self.commit_mode == CommitMode::Atomic;
        self.crtc.init()?;
        for object in self.attached.iter_mut() {
            object.init(require_all)?;
        }
        info!("Output initialized");
        Ok(())
    }

    /// Shows `buffer` as the next frame.
    ///
    /// While a flip is in flight the frame replaces any frame queued before it,
    /// the superseded buffer is released without ever being shown. A frame the kernel
    /// refuses is released as well.
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer))]
    #[profiling::function]
    pub fn request_frame(&mut self, buffer: FramebufferHandle) -> Result<FrameStatus, Error> {
        if !self.enabled {
            return Err(Error::PipelineDisabled(self.id));
        }

        if self.queue.is_busy() {
            if let Some(superseded) = self.queue.push(buffer) {
                trace!(fb = ?superseded.framebuffer(), "Dropping superseded frame");
                superseded.release(&*self.kms, self.lifetime);
            }
            return Ok(FrameStatus::Queued);
        }

        self.submit(buffer)?;
        Ok(FrameStatus::Accepted)
    }

    /// Shows the blanking buffer instead of any content.
    ///
    /// Queued frames are dropped. With a flip in flight blanking happens once it completes.
    #[instrument(parent = &self.span, skip(self))]
    pub fn blank(&mut self) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::PipelineDisabled(self.id));
        }
        self.drop_queued();
        if self.queue.is_busy() {
            debug!("Deferring blank until the flip in flight completes");
            self.queue.defer_blank();
            return Ok(());
        }
        self.blank_crtc()
    }

    /// Stops accepting frames and turns the crtc off.
    ///
    /// The flip in flight can not be cancelled, the crtc is turned off once it completes.
    /// A pipeline that is already disabled, or was failed, gets its crtc turned off again.
    #[instrument(parent = &self.span, skip(self))]
    pub fn disable(&mut self) -> Result<(), Error> {
        self.enabled = false;
        self.drop_queued();
        if self.queue.is_busy() {
            debug!("Deferring disable until the flip in flight completes");
            self.queue.take_blank();
            self.queue.defer_disable();
            return Ok(());
        }
        self.disable_crtc()
    }

    /// Accepts frames again after [`OutputPipeline::disable`], the next frame performs a mode-set
    pub fn enable(&mut self) {
        if !self.enabled {
            info!("Enabling output");
            self.enabled = true;
            self.rejections = 0;
            self.crtc.reset_state();
        }
    }

    /// Changes the mode, applied by the next frame
    #[instrument(parent = &self.span, skip(self))]
    pub fn use_mode(&mut self, mode: Mode) -> Result<(), Error> {
        self.check_idle()?;
        self.crtc.use_mode(mode)
    }

    /// Routes this output to another connector, applied by the next frame
    #[instrument(parent = &self.span, skip(self))]
    pub fn set_connector(&mut self, connector: connector::Handle) -> Result<(), Error> {
        self.check_idle()?;
        if self.connector() == connector {
            return Ok(());
        }

        let mut object = DisplayObject::new(self.kms.clone(), connector);
        object.init(self.commit_mode == CommitMode::Atomic)?;
        let old = std::mem::replace(&mut self.attached[0], object);
        self.detached.push(old);
        self.connector = connector;
        self.crtc.reset_state();
        info!(?connector, "Connector re-routed");
        Ok(())
    }

    /// Turns the output on or off, without detaching it
    #[instrument(parent = &self.span, skip(self))]
    pub fn set_active(&mut self, active: bool) -> Result<(), Error> {
        self.check_idle()?;
        if active == self.active {
            return Ok(());
        }
        self.crtc.set_active(active, &mut self.attached)?;
        self.active = active;
        Ok(())
    }

    /// Handles the completion of the flip in flight.
    ///
    /// Returns `None` if no flip was in flight.
    #[profiling::function]
    pub fn complete_flip(&mut self) -> Result<Option<FlipOutcome>, Error> {
        let token = match self.queue.finish() {
            Some(token) => token,
            None => return Ok(None),
        };
        let _guard = self.span.enter();

        let abandoned = self.crtc.pending_buffer().is_none();
        let retired = self.crtc.complete_flip(token)?;
        if abandoned {
            Ok(Some(FlipOutcome::Abandoned))
        } else {
            Ok(Some(FlipOutcome::Presented { retired }))
        }
    }

    /// Runs whatever waited for the flip in flight to complete: a deferred disable or blank,
    /// otherwise the queued frame.
    ///
    /// Returns if a queued frame was submitted.
    pub fn dispatch_deferred(&mut self) -> Result<bool, Error> {
        if self.queue.is_busy() {
            return Ok(false);
        }
        let span = self.span.clone();
        let _guard = span.enter();

        if self.queue.take_disable() {
            self.drop_queued();
            self.queue.take_blank();
            self.disable_crtc()?;
            return Ok(false);
        }
        if self.queue.take_blank() {
            self.blank_crtc()?;
        }
        match self.queue.take_queued() {
            Some(buffer) => {
                trace!(fb = ?buffer.framebuffer(), "Submitting queued frame");
                self.submit(buffer)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Blanks and disables the output after an unrecoverable error
    #[instrument(parent = &self.span, skip(self))]
    pub fn fail(&mut self) {
        warn!("Output failed, disabling it");
        self.enabled = false;
        self.drop_queued();
        self.queue.take_blank();
        self.queue.take_disable();
        if let Err(err) = self.blank_crtc() {
            warn!("Failed to blank output: {}", err);
        }
    }

    fn blank_crtc(&mut self) -> Result<(), Error> {
        let mut builder = self.detach_builder()?;
        self.crtc.blank(&mut self.attached, &mut builder)?;
        self.detached.clear();
        // the blanking mode-set always turns the crtc on
        self.active = true;
        Ok(())
    }

    fn disable_crtc(&mut self) -> Result<(), Error> {
        let mut builder = self.detach_builder()?;
        self.crtc.disable(&mut self.attached, &mut builder)?;
        self.detached.clear();
        self.active = false;
        Ok(())
    }

    // a builder with every connector routed away from this crtc already detached
    fn detach_builder(&self) -> Result<AtomicCommitBuilder, Error> {
        let mut builder = AtomicCommitBuilder::new(self.kms.clone(), self.commit_mode);
        for connector in &self.detached {
            builder.stage_optional(connector, "CRTC_ID", 0)?;
        }
        Ok(builder)
    }

    fn submit(&mut self, buffer: FramebufferHandle) -> Result<FlipToken, Error> {
        let mut builder = if self.crtc.needs_modeset() {
            match self.detach_builder() {
                Ok(builder) => builder,
                Err(err) => {
                    buffer.release(&*self.kms, self.lifetime);
                    return Err(err);
                }
            }
        } else {
            AtomicCommitBuilder::new(self.kms.clone(), self.commit_mode)
        };

        match self.crtc.request_flip(buffer.clone(), &mut self.attached, &mut builder) {
            Ok(token) => {
                self.queue.start(token);
                self.detached.clear();
                self.rejections = 0;
                self.active = true;
                Ok(token)
            }
            Err(err) => {
                if matches!(err.kind(), ErrorKind::Rejected | ErrorKind::PartialFailure) {
                    self.rejections += 1;
                }
                buffer.release(&*self.kms, self.lifetime);
                Err(err)
            }
        }
    }

    fn check_idle(&self) -> Result<(), Error> {
        if self.queue.is_busy() {
            Err(Error::FlipBusy(self.crtc.handle()))
        } else {
            Ok(())
        }
    }

    fn drop_queued(&mut self) {
        if let Some(buffer) = self.queue.take_queued() {
            buffer.release(&*self.kms, self.lifetime);
        }
    }

    /// Identifier of this output
    pub fn id(&self) -> PipelineId {
        self.id
    }

    /// The crtc driving this output
    pub fn crtc(&self) -> &Crtc {
        &self.crtc
    }

    /// Handle of the crtc driving this output
    pub fn crtc_handle(&self) -> crtc::Handle {
        self.crtc.handle()
    }

    /// Connector of this output
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Overlay planes owned by this output
    pub fn planes(&self) -> impl Iterator<Item = plane::Handle> + '_ {
        self.attached.iter().filter_map(|object| match object.handle() {
            ObjectHandle::Plane(plane) => Some(plane),
            _ => None,
        })
    }

    /// Current mode
    pub fn mode(&self) -> Mode {
        self.crtc.mode()
    }

    /// Size of the output in pixels
    pub fn pixel_size(&self) -> (u16, u16) {
        self.crtc.mode().size()
    }

    /// Refresh rate in mHz
    pub fn refresh_rate(&self) -> u32 {
        refresh_rate(&self.crtc.mode())
    }

    /// Returns if frames are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns if the output is powered on
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Token of the flip in flight
    pub fn in_flight(&self) -> Option<FlipToken> {
        self.queue.in_flight()
    }

    /// Frame waiting for the flip in flight to complete
    pub fn queued_frame(&self) -> Option<&FramebufferHandle> {
        self.queue.queued()
    }

    /// Number of rejected submissions since the last successful one
    pub fn consecutive_rejections(&self) -> u32 {
        self.rejections
    }
}

fn refresh_rate(mode: &Mode) -> u32 {
    let clock = mode.clock() as u64;
    let htotal = mode.hsync().2 as u64;
    let vtotal = mode.vsync().2 as u64;
    if htotal == 0 || vtotal == 0 {
        return mode.vrefresh() * 1000;
    }
    ((clock * 1_000_000 / htotal + vtotal / 2) / vtotal) as u32
}
