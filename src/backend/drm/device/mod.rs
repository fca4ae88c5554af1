use std::collections::HashSet;
use std::io;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use calloop::{
    generic::Generic, EventSource, Interest, Mode as TriggerMode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use drm::control::{crtc, Device as ControlDevice, Event};
use drm::{Device as BasicDevice, DriverCapability};
use tracing::{debug, info, info_span, instrument, trace, warn};

pub(super) mod fd;
pub use self::fd::{DevPath, DrmDeviceFd};

use super::commit::{AtomicCommitBuilder, CommitFlags, CommitMode};
use super::config::{BackendConfig, OutputConfig};
use super::error::{AccessError, Error};
use super::kms::{DisplayResources, KmsDevice, LegacyModeset};
use super::object::DisplayObject;
use super::pipeline::{OutputPipeline, PipelineId};

/// An open drm device
///
/// Selects the commit path on creation and hands out [`OutputPipeline`]s,
/// making sure no crtc drives two of them.
#[derive(Debug)]
pub struct DrmDevice {
    kms: Rc<dyn KmsDevice>,
    commit_mode: CommitMode,
    config: BackendConfig,
    claimed: HashSet<crtc::Handle>,
    next_id: u32,
    active: bool,
    span: tracing::Span,
}

impl DrmDevice {
    /// Opens a drm device node.
    ///
    /// Returns the device together with a [`DrmDeviceNotifier`] that has to be inserted into
    /// an event loop to receive page-flip events.
    pub fn from_fd(fd: DrmDeviceFd, config: BackendConfig) -> Result<(Self, DrmDeviceNotifier), Error> {
        let notifier = DrmDeviceNotifier::new(fd.clone());
        let device = DrmDevice::new(Rc::new(fd), config)?;
        Ok((device, notifier))
    }

    /// Creates a device on top of any [`KmsDevice`]
    pub fn new(kms: Rc<dyn KmsDevice>, config: BackendConfig) -> Result<Self, Error> {
        let span = info_span!("drm_device");
        let guard = span.enter();

        let atomic = if config.force_legacy {
            info!("Legacy mode-setting forced by configuration");
            false
        } else {
            kms.enable_atomic()
        };
        let commit_mode = if atomic {
            CommitMode::Atomic
        } else {
            info!("Falling back to legacy mode-setting");
            CommitMode::Legacy
        };

        drop(guard);
        let mut device = DrmDevice {
            kms,
            commit_mode,
            config,
            claimed: HashSet::new(),
            next_id: 0,
            active: true,
            span,
        };
        if config.disable_connectors {
            device.reset_state()?;
        }
        Ok(device)
    }

    /// Returns if atomic mode-setting is used
    pub fn is_atomic(&self) -> bool {
        self.commit_mode == CommitMode::Atomic
    }

    /// The commit path used by this device
    pub fn commit_mode(&self) -> CommitMode {
        self.commit_mode
    }

    /// Configuration this device was created with
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Lists the crtcs, connectors and planes of the device
    pub fn resources(&self) -> Result<DisplayResources, Error> {
        Ok(self.kms.resources()?)
    }

    /// Turns off every crtc and detaches every connector and plane
    #[instrument(parent = &self.span, skip(self))]
    pub fn reset_state(&mut self) -> Result<(), Error> {
        let resources = self.kms.resources()?;
        debug!(
            crtcs = resources.crtcs.len(),
            connectors = resources.connectors.len(),
            planes = resources.planes.len(),
            "Disabling all outputs"
        );

        match self.commit_mode {
            CommitMode::Atomic => {
                let mut builder = AtomicCommitBuilder::new(self.kms.clone(), self.commit_mode);
                for conn in &resources.connectors {
                    let mut object = DisplayObject::new(self.kms.clone(), *conn);
                    object.init(false)?;
                    builder.stage_optional(&object, "CRTC_ID", 0)?;
                }
                for plane in &resources.planes {
                    let mut object = DisplayObject::new(self.kms.clone(), *plane);
                    object.init(false)?;
                    builder.stage_optional(&object, "CRTC_ID", 0)?;
                    builder.stage_optional(&object, "FB_ID", 0)?;
                }
                // a crtc without a connector must not keep its mode
                for crtc in &resources.crtcs {
                    let mut object = DisplayObject::new(self.kms.clone(), *crtc);
                    object.init(false)?;
                    builder.stage_optional(&object, "ACTIVE", 0)?;
                    builder.stage_optional(&object, "MODE_ID", 0)?;
                }
                builder.commit(CommitFlags::ALLOW_MODESET)?;
            }
            CommitMode::Legacy => {
                for crtc in &resources.crtcs {
                    let mut builder = AtomicCommitBuilder::new(self.kms.clone(), self.commit_mode);
                    builder.stage_legacy_modeset(LegacyModeset {
                        crtc: *crtc,
                        fb: None,
                        connectors: Vec::new(),
                        mode: None,
                    });
                    builder.commit(CommitFlags::ALLOW_MODESET)?;
                }
            }
        }
        Ok(())
    }

    /// Creates an output driving `output.connector` through `output.crtc`.
    ///
    /// Fails with [`Error::CrtcAlreadyInUse`] if another output uses the crtc.
    #[instrument(parent = &self.span, skip(self))]
    pub fn create_pipeline(&mut self, output: &OutputConfig) -> Result<OutputPipeline, Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        if !self.claimed.insert(output.crtc) {
            return Err(Error::CrtcAlreadyInUse(output.crtc));
        }

        let id = PipelineId(self.next_id);
        self.next_id += 1;
        let mut pipeline = OutputPipeline::new(id, self.kms.clone(), self.commit_mode, output, &self.config);
        if let Err(err) = pipeline.init() {
            self.claimed.remove(&output.crtc);
            return Err(err);
        }
        info!(%id, crtc = ?output.crtc, connector = ?output.connector, "Output created");
        Ok(pipeline)
    }

    /// Disables an output and releases its crtc.
    ///
    /// An output with a flip in flight can not be destroyed, neither can one the kernel
    /// refuses to turn off. It is handed back in [`DestroyError`] and its crtc stays claimed.
    #[instrument(parent = &self.span, skip(self, pipeline), fields(id = %pipeline.id()))]
    pub fn destroy_pipeline(&mut self, mut pipeline: OutputPipeline) -> Result<(), DestroyError> {
        let crtc = pipeline.crtc_handle();
        if pipeline.in_flight().is_some() {
            debug!("Refusing to destroy output with a flip in flight");
            return Err(DestroyError {
                pipeline,
                error: Error::FlipBusy(crtc),
            });
        }
        if self.active {
            if let Err(error) = pipeline.disable() {
                return Err(DestroyError { pipeline, error });
            }
        }
        self.claimed.remove(&crtc);
        info!("Output destroyed");
        Ok(())
    }

    /// Returns if `crtc` drives an output
    pub fn is_claimed(&self, crtc: crtc::Handle) -> bool {
        self.claimed.contains(&crtc)
    }

    /// Stops handing out outputs, e.g. while another session owns the device
    pub fn pause(&mut self) {
        info!(parent: &self.span, "Pausing device");
        self.active = false;
    }

    /// Resumes after [`DrmDevice::pause`]
    pub fn activate(&mut self) -> Result<(), Error> {
        info!(parent: &self.span, "Activating device");
        self.active = true;
        if self.config.disable_connectors && self.claimed.is_empty() {
            self.reset_state()?;
        }
        Ok(())
    }

    /// Returns if the device is active
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Error of [`DrmDevice::destroy_pipeline`], handing the output back
#[derive(Debug, thiserror::Error)]
#[error("Output {} can not be destroyed: {error}", .pipeline.id())]
pub struct DestroyError {
    /// The output that is still alive
    pub pipeline: OutputPipeline,
    /// Why it could not be destroyed
    #[source]
    pub error: Error,
}

/// Events that can be generated by a [`DrmDeviceNotifier`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A page flip on the provided crtc completed
    VBlank(crtc::Handle),
    /// An error happened while processing events
    Error(Error),
}

/// Timing metadata for page-flip events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// The time the frame flip happened
    pub time: Time,
    /// The sequence number of the frame
    pub sequence: u32,
}

/// Either a realtime or monotonic timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Time {
    /// Monotonic time stamp, relative to the system's monotonic clock
    Monotonic(Duration),
    /// Realtime time stamp
    Realtime(SystemTime),
}

/// Event source of a drm device, to be inserted into a [`calloop::EventLoop`]
#[derive(Debug)]
pub struct DrmDeviceNotifier {
    fd: Generic<DrmDeviceFd>,
    has_monotonic_timestamps: bool,
}

impl DrmDeviceNotifier {
    /// Creates an event source for the device behind `fd`
    pub fn new(fd: DrmDeviceFd) -> Self {
        let has_monotonic_timestamps = fd
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1;
        DrmDeviceNotifier {
            fd: Generic::new(fd, Interest::READ, TriggerMode::Level),
            has_monotonic_timestamps,
        }
    }
}

impl EventSource for DrmDeviceNotifier {
    type Event = DrmEvent;
    type Metadata = Option<EventMetadata>;
    type Ret = ();
    type Error = io::Error;

    #[profiling::function]
    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let monotonic = self.has_monotonic_timestamps;
        self.fd.process_events(readiness, token, |_, fd| {
            let fd: &DrmDeviceFd = fd;
            match fd.receive_events() {
                Ok(events) => {
                    for event in events {
                        if let Event::PageFlip(event) = event {
                            trace!(crtc = ?event.crtc, frame = event.frame, "Got a page-flip event");
                            let metadata = EventMetadata {
                                time: if monotonic {
                                    Time::Monotonic(event.duration)
                                } else {
                                    Time::Realtime(SystemTime::UNIX_EPOCH + event.duration)
                                },
                                sequence: event.frame,
                            };
                            callback(DrmEvent::VBlank(event.crtc), &mut Some(metadata));
                        } else {
                            trace!("Got a non-page-flip event of device '{:?}'.", fd.dev_path());
                        }
                    }
                }
                Err(source) => {
                    warn!("Error processing drm events: {}", source);
                    callback(
                        DrmEvent::Error(Error::Access(AccessError {
                            errmsg: "Error processing drm events",
                            dev: fd.dev_path(),
                            source,
                        })),
                        &mut None,
                    );
                }
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.fd.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.fd.unregister(poll)
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::{DestroyError, DrmDevice};
    use crate::backend::drm::{
        config::{BackendConfig, OutputConfig},
        error::Error,
        framebuffer::FramebufferHandle,
        test_utils::{
            connector_handle, crtc_handle, fb_handle, plane_handle, test_mode, MockKms, TEST_CONNECTOR,
            TEST_CRTC, TEST_CRTC_2, TEST_PLANE,
        },
    };

    fn output(crtc: u32) -> OutputConfig {
        OutputConfig {
            crtc: crtc_handle(crtc),
            primary_plane: plane_handle(TEST_PLANE),
            connector: connector_handle(TEST_CONNECTOR),
            mode: test_mode(1920, 1080),
            planes: Vec::new(),
        }
    }

    #[test]
    fn atomic_is_preferred() {
        let device = DrmDevice::new(Rc::new(MockKms::atomic()), BackendConfig::default()).unwrap();
        assert!(device.is_atomic());

        let config = BackendConfig {
            force_legacy: true,
            ..BackendConfig::default()
        };
        let device = DrmDevice::new(Rc::new(MockKms::atomic()), config).unwrap();
        assert!(!device.is_atomic());

        let device = DrmDevice::new(Rc::new(MockKms::legacy()), BackendConfig::default()).unwrap();
        assert!(!device.is_atomic());
    }

    #[test]
    fn startup_disables_outputs() {
        let kms = Rc::new(MockKms::atomic());
        kms.set_value(TEST_CRTC, "ACTIVE", 1);
        kms.set_value(TEST_CONNECTOR, "CRTC_ID", TEST_CRTC as u64);

        DrmDevice::new(kms.clone(), BackendConfig::default()).unwrap();
        assert_eq!(kms.stats().commits, 1);
        assert_eq!(kms.value(TEST_CRTC, "ACTIVE"), Some(0));
        assert_eq!(kms.value(TEST_CONNECTOR, "CRTC_ID"), Some(0));

        let kms = Rc::new(MockKms::legacy());
        DrmDevice::new(kms.clone(), BackendConfig::default()).unwrap();
        assert_eq!(kms.stats().modesets, kms.crtc_count());

        let kms = Rc::new(MockKms::atomic());
        let config = BackendConfig {
            disable_connectors: false,
            ..BackendConfig::default()
        };
        DrmDevice::new(kms.clone(), config).unwrap();
        assert_eq!(kms.stats().commits, 0);
    }

    #[test]
    fn crtcs_are_claimed_once() {
        let kms = Rc::new(MockKms::atomic());
        let mut device = DrmDevice::new(kms, BackendConfig::default()).unwrap();

        let first = device.create_pipeline(&output(TEST_CRTC)).unwrap();
        assert!(device.is_claimed(crtc_handle(TEST_CRTC)));
        assert!(matches!(
            device.create_pipeline(&output(TEST_CRTC)),
            Err(Error::CrtcAlreadyInUse(_))
        ));
        let second = device.create_pipeline(&output(TEST_CRTC_2)).unwrap();
        assert_ne!(first.id(), second.id());

        device.destroy_pipeline(first).unwrap();
        assert!(!device.is_claimed(crtc_handle(TEST_CRTC)));
        device.create_pipeline(&output(TEST_CRTC)).unwrap();
    }

    #[test]
    fn busy_output_is_not_destroyed() {
        let kms = Rc::new(MockKms::atomic());
        let mut device = DrmDevice::new(kms.clone(), BackendConfig::default()).unwrap();
        let mut pipeline = device.create_pipeline(&output(TEST_CRTC)).unwrap();
        pipeline
            .request_frame(FramebufferHandle::new(fb_handle(1), (1920, 1080)))
            .unwrap();

        let DestroyError { mut pipeline, error } = device.destroy_pipeline(pipeline).unwrap_err();
        assert!(matches!(error, Error::FlipBusy(_)));
        assert!(device.is_claimed(crtc_handle(TEST_CRTC)));
        assert!(matches!(
            device.create_pipeline(&output(TEST_CRTC)),
            Err(Error::CrtcAlreadyInUse(_))
        ));
        assert_eq!(kms.value(TEST_CRTC, "ACTIVE"), Some(1));

        pipeline.complete_flip().unwrap();
        device.destroy_pipeline(pipeline).unwrap();
        assert!(!device.is_claimed(crtc_handle(TEST_CRTC)));
        assert_eq!(kms.value(TEST_CRTC, "ACTIVE"), Some(0));
        assert_eq!(kms.value(TEST_CONNECTOR, "CRTC_ID"), Some(0));
    }

    #[test]
    fn failed_output_is_turned_off_on_destroy() {
        let kms = Rc::new(MockKms::atomic());
        let mut device = DrmDevice::new(kms.clone(), BackendConfig::default()).unwrap();
        let mut pipeline = device.create_pipeline(&output(TEST_CRTC)).unwrap();
        pipeline
            .request_frame(FramebufferHandle::new(fb_handle(1), (1920, 1080)))
            .unwrap();
        pipeline.complete_flip().unwrap();
        pipeline.fail();
        assert_eq!(kms.value(TEST_CRTC, "ACTIVE"), Some(1));

        device.destroy_pipeline(pipeline).unwrap();
        assert_eq!(kms.value(TEST_CRTC, "ACTIVE"), Some(0));
    }

    #[test]
    fn failed_init_releases_claim() {
        let kms = Rc::new(MockKms::atomic());
        let mut device = DrmDevice::new(kms.clone(), BackendConfig::default()).unwrap();
        kms.remove_property(TEST_CRTC, "MODE_ID");

        assert!(matches!(
            device.create_pipeline(&output(TEST_CRTC)),
            Err(Error::UnknownProperty { .. })
        ));
        assert!(!device.is_claimed(crtc_handle(TEST_CRTC)));
    }

    #[test]
    fn paused_device_refuses_outputs() {
        let kms = Rc::new(MockKms::atomic());
        let mut device = DrmDevice::new(kms, BackendConfig::default()).unwrap();
        device.pause();
        assert!(matches!(
            device.create_pipeline(&output(TEST_CRTC)),
            Err(Error::DeviceInactive)
        ));
        device.activate().unwrap();
        device.create_pipeline(&output(TEST_CRTC)).unwrap();
    }
}
