//! In-memory [`KmsDevice`] for unit tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;

use drm::control::{connector, crtc, framebuffer, plane, property, Mode, ResourceHandle};

use super::commit::{AtomicTransaction, CommitFlags};
use super::error::AccessError;
use super::kms::{DisplayResources, KmsDevice, LegacyModeset, ObjectHandle};
use super::object::{CONNECTOR_PROPERTIES, CRTC_PROPERTIES, PLANE_PROPERTIES};

pub const TEST_CRTC: u32 = 31;
pub const TEST_CRTC_2: u32 = 32;
pub const TEST_PLANE: u32 = 41;
pub const TEST_PLANE_2: u32 = 42;
pub const TEST_OVERLAY: u32 = 43;
pub const TEST_CONNECTOR: u32 = 51;
pub const TEST_CONNECTOR_2: u32 = 52;

const CRTCS: &[u32] = &[TEST_CRTC, TEST_CRTC_2];
const PLANES: &[u32] = &[TEST_PLANE, TEST_PLANE_2, TEST_OVERLAY];
const CONNECTORS: &[u32] = &[TEST_CONNECTOR, TEST_CONNECTOR_2];

fn handle<T: ResourceHandle>(id: u32) -> T {
    drm::control::from_u32(id).unwrap()
}

pub fn crtc_handle(id: u32) -> crtc::Handle {
    handle(id)
}

pub fn plane_handle(id: u32) -> plane::Handle {
    handle(id)
}

pub fn connector_handle(id: u32) -> connector::Handle {
    handle(id)
}

pub fn fb_handle(id: u32) -> framebuffer::Handle {
    handle(id)
}

/// Routes log output of a test through the test harness, filtered by `RUST_LOG`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A 60Hz mode with CVT-like blanking
pub fn test_mode(width: u16, height: u16) -> Mode {
    let mut info: drm_ffi::drm_mode_modeinfo = unsafe { std::mem::zeroed() };
    info.hdisplay = width;
    info.hsync_start = width + 88;
    info.hsync_end = width + 132;
    info.htotal = width + 280;
    info.vdisplay = height;
    info.vsync_start = height + 4;
    info.vsync_end = height + 9;
    info.vtotal = height + 45;
    info.vrefresh = 60;
    info.clock = (info.htotal as u32 * info.vtotal as u32 * 60) / 1000;
    Mode::from(info)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub enumerations: usize,
    pub commits: usize,
    pub modeset_commits: usize,
    pub writes: usize,
    pub modesets: usize,
    pub flips: usize,
}

#[derive(Debug)]
struct MockProperty {
    handle: u32,
    name: String,
    value: u64,
}

#[derive(Debug, Default)]
struct MockState {
    objects: HashMap<u32, Vec<MockProperty>>,
    next_property: u32,
    next_blob: u64,
    next_fb: u32,
    stats: MockStats,
    failing_enumerations: usize,
    rejected_commits: usize,
    failing_writes: HashSet<(u32, String)>,
    fail_blanking: bool,
    removed: bool,
    live_blanking: HashSet<framebuffer::Handle>,
    destroyed_blobs: usize,
    released: Vec<framebuffer::Handle>,
}

impl MockState {
    fn property(&self, object: u32, name: &str) -> Option<&MockProperty> {
        self.objects.get(&object)?.iter().find(|prop| prop.name == name)
    }

    fn add(&mut self, object: u32, name: &str, value: u64) {
        self.next_property += 1;
        let handle = self.next_property;
        self.objects.entry(object).or_default().push(MockProperty {
            handle,
            name: name.to_string(),
            value,
        });
    }

    fn set(&mut self, object: u32, property: u32, value: u64) {
        if let Some(prop) = self
            .objects
            .get_mut(&object)
            .and_then(|props| props.iter_mut().find(|prop| prop.handle == property))
        {
            prop.value = value;
        }
    }

    fn check_present(&self) -> Result<(), AccessError> {
        if self.removed {
            Err(error(libc::ENODEV))
        } else {
            Ok(())
        }
    }

    fn check_rejected(&mut self) -> Result<(), AccessError> {
        self.check_present()?;
        if self.rejected_commits > 0 {
            self.rejected_commits -= 1;
            Err(error(libc::EINVAL))
        } else {
            Ok(())
        }
    }
}

fn error(errno: i32) -> AccessError {
    AccessError {
        errmsg: "mock error",
        dev: None,
        source: io::Error::from_raw_os_error(errno),
    }
}

fn raw(object: ObjectHandle) -> u32 {
    object.raw().get()
}

/// Records every call and keeps property values in memory
#[derive(Debug)]
pub struct MockKms {
    atomic: bool,
    state: RefCell<MockState>,
}

impl MockKms {
    pub fn atomic() -> Self {
        Self::with_atomic(true)
    }

    pub fn legacy() -> Self {
        Self::with_atomic(false)
    }

    fn with_atomic(atomic: bool) -> Self {
        let mut state = MockState {
            next_property: 1000,
            next_blob: 500,
            next_fb: 900,
            ..MockState::default()
        };
        for (objects, definitions) in [
            (CRTCS, CRTC_PROPERTIES),
            (PLANES, PLANE_PROPERTIES),
            (CONNECTORS, CONNECTOR_PROPERTIES),
        ] {
            for object in objects {
                for def in definitions {
                    state.add(*object, def.name, 0);
                }
            }
        }
        MockKms {
            atomic,
            state: RefCell::new(state),
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn add_property(&self, object: u32, name: &str, value: u64) {
        self.state.borrow_mut().add(object, name, value);
    }

    pub fn remove_property(&self, object: u32, name: &str) {
        if let Some(props) = self.state.borrow_mut().objects.get_mut(&object) {
            props.retain(|prop| prop.name != name);
        }
    }

    pub fn set_value(&self, object: u32, name: &str, value: u64) {
        let mut state = self.state.borrow_mut();
        let handle = state.property(object, name).unwrap().handle;
        state.set(object, handle, value);
    }

    pub fn value(&self, object: u32, name: &str) -> Option<u64> {
        self.state.borrow().property(object, name).map(|prop| prop.value)
    }

    pub fn fail_enumerations(&self, count: usize) {
        self.state.borrow_mut().failing_enumerations = count;
    }

    pub fn reject_commits(&self, count: usize) {
        self.state.borrow_mut().rejected_commits = count;
    }

    pub fn fail_writes(&self, object: u32, name: &str) {
        self.state
            .borrow_mut()
            .failing_writes
            .insert((object, name.to_string()));
    }

    pub fn fail_blanking_allocation(&self, fail: bool) {
        self.state.borrow_mut().fail_blanking = fail;
    }

    /// Every further call fails like on an unplugged device
    pub fn remove_device(&self) {
        self.state.borrow_mut().removed = true;
    }

    pub fn stats(&self) -> MockStats {
        self.state.borrow().stats
    }

    /// Content framebuffers removed from the device, in order
    pub fn released(&self) -> Vec<framebuffer::Handle> {
        self.state.borrow().released.clone()
    }

    /// Number of blanking buffers currently allocated
    pub fn blanking_buffers(&self) -> usize {
        self.state.borrow().live_blanking.len()
    }

    pub fn destroyed_blobs(&self) -> usize {
        self.state.borrow().destroyed_blobs
    }

    pub fn crtc_count(&self) -> usize {
        CRTCS.len()
    }
}

impl KmsDevice for MockKms {
    fn enable_atomic(&self) -> bool {
        self.atomic
    }

    fn resources(&self) -> Result<DisplayResources, AccessError> {
        self.state.borrow().check_present()?;
        Ok(DisplayResources {
            crtcs: CRTCS.iter().map(|id| crtc_handle(*id)).collect(),
            connectors: CONNECTORS.iter().map(|id| connector_handle(*id)).collect(),
            planes: PLANES.iter().map(|id| plane_handle(*id)).collect(),
        })
    }

    fn object_properties(
        &self,
        object: ObjectHandle,
    ) -> Result<Vec<(property::Handle, property::RawValue)>, AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        if state.failing_enumerations > 0 {
            state.failing_enumerations -= 1;
            return Err(error(libc::EIO));
        }
        state.stats.enumerations += 1;
        Ok(state
            .objects
            .get(&raw(object))
            .map(|props| {
                props
                    .iter()
                    .map(|prop| (handle::<property::Handle>(prop.handle), prop.value))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn property_name(&self, property: property::Handle) -> Result<String, AccessError> {
        let id: u32 = property.into();
        self.state
            .borrow()
            .objects
            .values()
            .flatten()
            .find(|prop| prop.handle == id)
            .map(|prop| prop.name.clone())
            .ok_or_else(|| error(libc::ENOENT))
    }

    fn submit_atomic(&self, flags: CommitFlags, transaction: &AtomicTransaction) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        assert!(self.atomic, "atomic commit on a legacy device");
        state.check_rejected()?;
        if flags.contains(CommitFlags::TEST_ONLY) {
            return Ok(());
        }
        for entry in transaction.entries() {
            state.set(raw(entry.object), entry.property.into(), entry.value);
        }
        state.stats.commits += 1;
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            state.stats.modeset_commits += 1;
        }
        Ok(())
    }

    fn write_property(
        &self,
        object: ObjectHandle,
        property: property::Handle,
        value: property::RawValue,
    ) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        let id: u32 = property.into();
        let failing = state
            .objects
            .get(&raw(object))
            .and_then(|props| props.iter().find(|prop| prop.handle == id))
            .map(|prop| state.failing_writes.contains(&(raw(object), prop.name.clone())))
            .unwrap_or(false);
        if failing {
            return Err(error(libc::EINVAL));
        }
        state.set(raw(object), id, value);
        state.stats.writes += 1;
        Ok(())
    }

    fn legacy_modeset(&self, _modeset: &LegacyModeset) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_rejected()?;
        state.stats.modesets += 1;
        Ok(())
    }

    fn legacy_page_flip(&self, _crtc: crtc::Handle, _fb: framebuffer::Handle) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_rejected()?;
        state.stats.flips += 1;
        Ok(())
    }

    fn create_mode_blob(&self, _mode: &Mode) -> Result<property::RawValue, AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.next_blob += 1;
        Ok(state.next_blob)
    }

    fn destroy_mode_blob(&self, _blob: property::RawValue) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        state.destroyed_blobs += 1;
        Ok(())
    }

    fn create_blanking_framebuffer(
        &self,
        _size: (u16, u16),
        _color: [u8; 4],
    ) -> Result<framebuffer::Handle, AccessError> {
        let mut state = self.state.borrow_mut();
        state.check_present()?;
        if state.fail_blanking {
            return Err(error(libc::ENOMEM));
        }
        state.next_fb += 1;
        let fb = fb_handle(state.next_fb);
        state.live_blanking.insert(fb);
        Ok(fb)
    }

    fn destroy_blanking_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.live_blanking.remove(&fb);
        state.check_present()
    }

    fn release_framebuffer(&self, fb: framebuffer::Handle) -> Result<(), AccessError> {
        let mut state = self.state.borrow_mut();
        state.released.push(fb);
        state.check_present()
    }
}
