//! Scanned devices and their free-space accounting

use std::path::{Path, PathBuf};

/// Handle to a registered device
///
/// Ids are issued in registration order, which is also the order devices
/// occupy in the final mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) usize);

impl DeviceId {
    /// Position of the device in registration order
    pub fn index(self) -> usize {
        self.0
    }
}

/// One scanned storage device
#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    path: PathBuf,
    fstype: String,
    total_sectors: u64,

    /// Sectors in every run the scanner emitted, accepted or not
    free_sectors: u64,
    free_extent_count: u64,

    /// Sectors in runs currently held by the bounded buffer
    accepted_sectors: u64,
    accepted_extent_count: u64,
}

impl Device {
    pub(crate) fn new(id: DeviceId, path: PathBuf, fstype: String, total_sectors: u64) -> Self {
        Device {
            id,
            path,
            fstype,
            total_sectors,
            free_sectors: 0,
            free_extent_count: 0,
            accepted_sectors: 0,
            accepted_extent_count: 0,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fstype(&self) -> &str {
        &self.fstype
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn free_sectors(&self) -> u64 {
        self.free_sectors
    }

    pub fn free_extent_count(&self) -> u64 {
        self.free_extent_count
    }

    pub fn accepted_sectors(&self) -> u64 {
        self.accepted_sectors
    }

    pub fn accepted_extent_count(&self) -> u64 {
        self.accepted_extent_count
    }

    pub(crate) fn record_free(&mut self, length_sectors: u64) {
        self.free_sectors += length_sectors;
        self.free_extent_count += 1;
    }

    pub(crate) fn record_accepted(&mut self, length_sectors: u64) {
        self.accepted_sectors += length_sectors;
        self.accepted_extent_count += 1;
    }

    pub(crate) fn record_evicted(&mut self, length_sectors: u64) {
        self.accepted_sectors -= length_sectors;
        self.accepted_extent_count -= 1;
    }
}

/// Devices in registration order
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return its handle
    pub fn register(
        &mut self,
        path: impl Into<PathBuf>,
        fstype: impl Into<String>,
        total_sectors: u64,
    ) -> DeviceId {
        let id = DeviceId(self.devices.len());
        self.devices
            .push(Device::new(id, path.into(), fstype.into(), total_sectors));
        id
    }

    /// Look up a device
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different registry.
    pub fn get(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Sum of accepted sectors over all devices
    pub fn accepted_sectors(&self) -> u64 {
        self.devices.iter().map(|d| d.accepted_sectors).sum()
    }
}
