//! Serialization of flips and dispatch of their completions
//!
//! Every [`OutputPipeline`] has at most one flip in flight and a single slot for the next
//! frame. The [`FlipScheduler`] owns the pipelines of a device, routes the kernel's
//! page-flip events to them and reports results to an [`OutputHandler`].
//!
//! ```no_run
//! use scanout::backend::drm::{DrmDeviceNotifier, FlipScheduler, OutputHandler};
//!
//! fn run<H: OutputHandler + 'static>(notifier: DrmDeviceNotifier, handler: H) -> Result<(), calloop::Error> {
//!     let mut event_loop = calloop::EventLoop::<(FlipScheduler, H)>::try_new()?;
//!     event_loop
//!         .handle()
//!         .insert_source(notifier, |event, metadata, (scheduler, handler)| {
//!             scheduler.dispatch(event, metadata.as_ref(), handler);
//!         })
//!         .map_err(|err| err.error)?;
//!
//!     let mut data = (FlipScheduler::new(), handler);
//!     event_loop.run(None, &mut data, |_| {})
//! }
//! # fn main() {}
//! ```

use indexmap::IndexMap;
use tracing::{debug, error, info_span, instrument, trace, warn};

use super::crtc::FlipToken;
use super::device::{DrmEvent, EventMetadata};
use super::error::{Error, ErrorKind};
use super::framebuffer::FramebufferHandle;
use super::pipeline::{FlipOutcome, FrameStatus, OutputPipeline, PipelineId};

/// Rejected submissions in a row after which an output is considered broken
pub const MAX_CONSECUTIVE_REJECTIONS: u32 = 3;

/// In-flight flip and single-slot queue of one output
#[derive(Debug, Default)]
pub struct FlipQueue {
    in_flight: Option<FlipToken>,
    queued: Option<FramebufferHandle>,
    pending_disable: bool,
    pending_blank: bool,
}

impl FlipQueue {
    /// Returns if a flip is in flight
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Token of the flip in flight
    pub fn in_flight(&self) -> Option<FlipToken> {
        self.in_flight
    }

    /// The frame waiting for the flip in flight
    pub fn queued(&self) -> Option<&FramebufferHandle> {
        self.queued.as_ref()
    }

    /// Queues `buffer`, returning the frame it supersedes
    pub fn push(&mut self, buffer: FramebufferHandle) -> Option<FramebufferHandle> {
        self.queued.replace(buffer)
    }

    /// Removes the queued frame
    pub fn take_queued(&mut self) -> Option<FramebufferHandle> {
        self.queued.take()
    }

    /// Marks `token` as in flight
    pub fn start(&mut self, token: FlipToken) {
        debug_assert!(self.in_flight.is_none());
        self.in_flight = Some(token);
    }

    /// Clears the flip in flight, returning its token
    pub fn finish(&mut self) -> Option<FlipToken> {
        self.in_flight.take()
    }

    /// Blanks the output once the flip in flight completes
    pub fn defer_blank(&mut self) {
        self.pending_blank = true;
    }

    /// Disables the output once the flip in flight completes
    pub fn defer_disable(&mut self) {
        self.pending_disable = true;
    }

    /// Returns and clears a deferred blank
    pub fn take_blank(&mut self) -> bool {
        std::mem::take(&mut self.pending_blank)
    }

    /// Returns and clears a deferred disable
    pub fn take_disable(&mut self) -> bool {
        std::mem::take(&mut self.pending_disable)
    }
}

/// Receiver of output state changes
pub trait OutputHandler {
    /// A frame is on screen. `retired` is the buffer it replaced, unless that buffer was
    /// removed from the device.
    fn frame_presented(
        &mut self,
        pipeline: PipelineId,
        metadata: Option<&EventMetadata>,
        retired: Option<FramebufferHandle>,
    );

    /// A queued frame or deferred operation failed after its request had already returned
    fn frame_rejected(&mut self, pipeline: PipelineId, error: Error);

    /// The output hit an unrecoverable error and was blanked and disabled
    fn output_fault(&mut self, pipeline: PipelineId, error: &Error);
}

/// Owner of all outputs of a device
#[derive(Debug)]
pub struct FlipScheduler {
    pipelines: IndexMap<PipelineId, OutputPipeline>,
    span: tracing::Span,
}

impl Default for FlipScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FlipScheduler {
    /// Creates a scheduler without any outputs
    pub fn new() -> Self {
        FlipScheduler {
            pipelines: IndexMap::new(),
            span: info_span!("drm_scheduler"),
        }
    }

    /// Adds an output
    pub fn add(&mut self, pipeline: OutputPipeline) -> PipelineId {
        let id = pipeline.id();
        self.pipelines.insert(id, pipeline);
        id
    }

    /// Removes an output
    pub fn remove(&mut self, id: PipelineId) -> Option<OutputPipeline> {
        self.pipelines.shift_remove(&id)
    }

    /// Returns an output
    pub fn get(&self, id: PipelineId) -> Option<&OutputPipeline> {
        self.pipelines.get(&id)
    }

    /// Returns an output
    pub fn get_mut(&mut self, id: PipelineId) -> Option<&mut OutputPipeline> {
        self.pipelines.get_mut(&id)
    }

    /// Iterates over all outputs in insertion order
    pub fn pipelines(&self) -> impl Iterator<Item = &OutputPipeline> {
        self.pipelines.values()
    }

    /// See [`OutputPipeline::request_frame`].
    ///
    /// Errors are returned to the caller. Fatal errors and persistent rejections
    /// additionally fail the output and are reported through [`OutputHandler::output_fault`].
    #[instrument(level = "trace", parent = &self.span, skip(self, buffer, handler))]
    #[profiling::function]
    pub fn request_frame(
        &mut self,
        id: PipelineId,
        buffer: FramebufferHandle,
        handler: &mut impl OutputHandler,
    ) -> Result<FrameStatus, Error> {
        let pipeline = self.pipelines.get_mut(&id).ok_or(Error::UnknownPipeline(id))?;
        pipeline.request_frame(buffer).map_err(|err| {
            escalate(pipeline, &err, handler);
            err
        })
    }

    /// See [`OutputPipeline::blank`]
    #[instrument(parent = &self.span, skip(self, handler))]
    pub fn blank(&mut self, id: PipelineId, handler: &mut impl OutputHandler) -> Result<(), Error> {
        let pipeline = self.pipelines.get_mut(&id).ok_or(Error::UnknownPipeline(id))?;
        pipeline.blank().map_err(|err| {
            escalate(pipeline, &err, handler);
            err
        })
    }

    /// See [`OutputPipeline::disable`]
    #[instrument(parent = &self.span, skip(self))]
    pub fn disable(&mut self, id: PipelineId) -> Result<(), Error> {
        self.pipelines
            .get_mut(&id)
            .ok_or(Error::UnknownPipeline(id))?
            .disable()
    }

    /// Handles an event of the device the outputs belong to
    #[profiling::function]
    pub fn dispatch(&mut self, event: DrmEvent, metadata: Option<&EventMetadata>, handler: &mut impl OutputHandler) {
        let _guard = self.span.enter();
        match event {
            DrmEvent::VBlank(crtc) => {
                let pipeline = match self.pipelines.values_mut().find(|p| p.crtc_handle() == crtc) {
                    Some(pipeline) => pipeline,
                    None => {
                        trace!(?crtc, "Page flip event for a crtc without output");
                        return;
                    }
                };
                let id = pipeline.id();

                match pipeline.complete_flip() {
                    Ok(Some(FlipOutcome::Presented { retired })) => {
                        trace!(%id, "Frame presented");
                        handler.frame_presented(id, metadata, retired);
                    }
                    Ok(Some(FlipOutcome::Abandoned)) => {
                        debug!(%id, "Completion of an abandoned flip");
                    }
                    Ok(None) => {
                        warn!(%id, ?crtc, "Spurious page flip event");
                        return;
                    }
                    Err(err) => {
                        report(pipeline, err, handler);
                        return;
                    }
                }

                if let Err(err) = pipeline.dispatch_deferred() {
                    report(pipeline, err, handler);
                }
            }
            DrmEvent::Error(err) => {
                if err.kind() != ErrorKind::Fatal {
                    warn!("Device error: {}", err);
                    return;
                }
                error!("Device failed: {}", err);
                for pipeline in self.pipelines.values_mut().filter(|p| p.is_enabled()) {
                    pipeline.fail();
                    handler.output_fault(pipeline.id(), &err);
                }
            }
        }
    }
}

fn escalate(pipeline: &mut OutputPipeline, err: &Error, handler: &mut impl OutputHandler) -> bool {
    if !pipeline.is_enabled() {
        return false;
    }
    let persistent = pipeline.consecutive_rejections() >= MAX_CONSECUTIVE_REJECTIONS;
    if err.kind() == ErrorKind::Fatal || persistent {
        error!(id = %pipeline.id(), "Output failed: {}", err);
        pipeline.fail();
        handler.output_fault(pipeline.id(), err);
        true
    } else {
        false
    }
}

fn report(pipeline: &mut OutputPipeline, err: Error, handler: &mut impl OutputHandler) {
    if !escalate(pipeline, &err, handler) {
        warn!(id = %pipeline.id(), "Deferred operation failed: {}", err);
        handler.frame_rejected(pipeline.id(), err);
    }
}
