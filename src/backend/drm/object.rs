//! Hardware objects and their property caches

use std::collections::HashSet;
use std::rc::Rc;

use drm::control::{property, RawResourceHandle};
use tracing::{debug, trace, warn};

use super::commit::{AtomicTransaction, StagedProperty};
use super::error::Error;
use super::kms::{KmsDevice, ObjectHandle, ObjectKind};

/// A property name this crate knows how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyDefinition {
    /// Name as exposed by the kernel
    pub name: &'static str,
    /// Whether atomic initialization fails without it
    pub required: bool,
}

impl PropertyDefinition {
    /// A property that has to be present on atomic devices
    pub const fn required(name: &'static str) -> Self {
        PropertyDefinition { name, required: true }
    }

    /// A property that is used if present
    pub const fn optional(name: &'static str) -> Self {
        PropertyDefinition { name, required: false }
    }
}

/// Properties used on crtcs
pub const CRTC_PROPERTIES: &[PropertyDefinition] = &[
    PropertyDefinition::required("MODE_ID"),
    PropertyDefinition::required("ACTIVE"),
    PropertyDefinition::optional("VRR_ENABLED"),
];

/// Properties used on planes
pub const PLANE_PROPERTIES: &[PropertyDefinition] = &[
    PropertyDefinition::required("type"),
    PropertyDefinition::required("SRC_X"),
    PropertyDefinition::required("SRC_Y"),
    PropertyDefinition::required("SRC_W"),
    PropertyDefinition::required("SRC_H"),
    PropertyDefinition::required("CRTC_X"),
    PropertyDefinition::required("CRTC_Y"),
    PropertyDefinition::required("CRTC_W"),
    PropertyDefinition::required("CRTC_H"),
    PropertyDefinition::required("FB_ID"),
    PropertyDefinition::required("CRTC_ID"),
    PropertyDefinition::optional("rotation"),
];

/// Properties used on connectors
pub const CONNECTOR_PROPERTIES: &[PropertyDefinition] = &[
    PropertyDefinition::required("CRTC_ID"),
    PropertyDefinition::optional("DPMS"),
];

/// Cached property of a hardware object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyEntry {
    /// Name of the property
    pub name: &'static str,
    /// Kernel assigned id
    pub handle: property::Handle,
    /// Last known value
    pub value: property::RawValue,
}

/// Name to id/value cache for the properties of one hardware object
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    entries: Vec<PropertyEntry>,
    recognized: HashSet<&'static str>,
}

impl PropertySet {
    /// Queries the kernel for the properties of `object` and caches every recognized one.
    ///
    /// Properties the hardware exposes, but that are not part of `recognized`, are ignored.
    /// Once a name has been resolved it is never looked up again, calling this twice with
    /// the same set does not touch the device.
    pub fn resolve(
        &mut self,
        kms: &dyn KmsDevice,
        object: ObjectHandle,
        recognized: &[PropertyDefinition],
    ) -> Result<(), Error> {
        if recognized.iter().all(|def| self.recognized.contains(def.name)) {
            trace!(?object, "Properties already resolved");
            return Ok(());
        }

        let properties = kms
            .object_properties(object)
            .map_err(|source| Error::PropertyQuery {
                object: object.raw(),
                source,
            })?;

        for (handle, value) in properties {
            if self.entries.iter().any(|entry| entry.handle == handle) {
                continue;
            }
            let name = match kms.property_name(handle) {
                Ok(name) => name,
                Err(err) => {
                    debug!(?object, ?handle, "Skipping unreadable property: {}", err);
                    continue;
                }
            };
            if let Some(def) = recognized.iter().find(|def| def.name == name) {
                trace!(?object, name = def.name, ?handle, value, "Resolved property");
                self.entries.push(PropertyEntry {
                    name: def.name,
                    handle,
                    value,
                });
            }
        }

        self.recognized.extend(recognized.iter().map(|def| def.name));
        Ok(())
    }

    /// Returns the cached entry for `name`
    pub fn get(&self, name: &str) -> Option<&PropertyEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Returns the last cached value of `name`
    pub fn current_value(&self, name: &str) -> Option<property::RawValue> {
        self.get(name).map(|entry| entry.value)
    }

    /// Returns all cached entries
    pub fn entries(&self) -> &[PropertyEntry] {
        &self.entries
    }

    /// Appends a change of `name` to `transaction` without touching the hardware
    pub fn stage_value(
        &self,
        object: ObjectHandle,
        name: &'static str,
        value: property::RawValue,
        transaction: &mut AtomicTransaction,
    ) -> Result<(), Error> {
        let entry = self.get(name).ok_or(Error::UnknownProperty {
            handle: object.raw(),
            name,
        })?;
        transaction.push(StagedProperty {
            object,
            name: entry.name,
            property: entry.handle,
            value,
        });
        Ok(())
    }

    /// Re-reads the values of all resolved properties
    pub fn refresh(&mut self, kms: &dyn KmsDevice, object: ObjectHandle) -> Result<(), Error> {
        let properties = kms
            .object_properties(object)
            .map_err(|source| Error::PropertyQuery {
                object: object.raw(),
                source,
            })?;
        for (handle, value) in properties {
            if let Some(entry) = self.entries.iter_mut().find(|entry| entry.handle == handle) {
                entry.value = value;
            }
        }
        Ok(())
    }

    fn sync(&mut self, object: RawResourceHandle, applied: &[StagedProperty]) {
        for staged in applied.iter().filter(|staged| staged.object.raw() == object) {
            if let Some(entry) = self.entries.iter_mut().find(|entry| entry.handle == staged.property) {
                entry.value = staged.value;
            }
        }
    }
}

/// A crtc, plane or connector together with its property cache
#[derive(Debug)]
pub struct DisplayObject {
    handle: ObjectHandle,
    kms: Rc<dyn KmsDevice>,
    properties: PropertySet,
}

impl DisplayObject {
    /// Creates an object without resolving any properties yet
    pub fn new(kms: Rc<dyn KmsDevice>, handle: impl Into<ObjectHandle>) -> Self {
        DisplayObject {
            handle: handle.into(),
            kms,
            properties: PropertySet::default(),
        }
    }

    /// Tagged handle of this object
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    /// Kind of this object
    pub fn kind(&self) -> ObjectKind {
        self.handle.kind()
    }

    /// Properties this crate uses for objects of this kind
    pub fn definitions(&self) -> &'static [PropertyDefinition] {
        match self.kind() {
            ObjectKind::Crtc => CRTC_PROPERTIES,
            ObjectKind::Plane => PLANE_PROPERTIES,
            ObjectKind::Connector => CONNECTOR_PROPERTIES,
        }
    }

    /// Resolves the properties used for this kind of object.
    ///
    /// With `require_all` set a missing required property fails the initialization,
    /// which is what atomic commits depend on.
    pub fn init(&mut self, require_all: bool) -> Result<(), Error> {
        let definitions = self.definitions();
        self.resolve_properties(definitions)?;

        if require_all {
            if let Some(missing) = definitions
                .iter()
                .find(|def| def.required && self.properties.get(def.name).is_none())
            {
                warn!(object = ?self.handle, name = missing.name, "Missing required property");
                return Err(Error::UnknownProperty {
                    handle: self.handle.raw(),
                    name: missing.name,
                });
            }
        }
        Ok(())
    }

    /// See [`PropertySet::resolve`]
    pub fn resolve_properties(&mut self, recognized: &[PropertyDefinition]) -> Result<(), Error> {
        self.properties.resolve(&*self.kms, self.handle, recognized)
    }

    /// Returns the last cached value of `name`
    pub fn current_value(&self, name: &str) -> Option<property::RawValue> {
        self.properties.current_value(name)
    }

    /// Returns if the object exposes `name`
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.get(name).is_some()
    }

    /// Appends a change of `name` to `transaction`, nothing is written until it is committed
    pub fn stage_value(
        &self,
        name: &'static str,
        value: property::RawValue,
        transaction: &mut AtomicTransaction,
    ) -> Result<(), Error> {
        self.properties.stage_value(self.handle, name, value, transaction)
    }

    /// Re-reads all cached values from the hardware
    pub fn refresh(&mut self) -> Result<(), Error> {
        self.properties.refresh(&*self.kms, self.handle)
    }

    /// Updates the cache with entries the kernel accepted
    pub fn sync_applied(&mut self, applied: &[StagedProperty]) {
        self.properties.sync(self.handle.raw(), applied);
    }

    /// The property cache
    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }
}
