//! Free-space runs and extents
//!
//! A [`Run`] is what a scanner emits for one device. An [`Extent`] is a run
//! tagged with the device it came from, as held by the selector.

use crate::core::device::DeviceId;
use std::cmp::Ordering;

/// Size of the addressing unit used throughout the core
pub const SECTOR_SIZE: u64 = 512;

/// A contiguous range of free sectors on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Run {
    pub start_sector: u64,
    pub length_sectors: u64,
}

impl Run {
    pub fn new(start_sector: u64, length_sectors: u64) -> Self {
        Run {
            start_sector,
            length_sectors,
        }
    }

    /// Build a run from filesystem allocation units (blocks, clusters, pages)
    pub fn from_units(start: u64, length: u64, sectors_per_unit: u64) -> Self {
        Run::new(start * sectors_per_unit, length * sectors_per_unit)
    }

    /// First sector past the end of the run
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.length_sectors
    }
}

/// A candidate free region on a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub device: DeviceId,
    pub start_sector: u64,
    pub length_sectors: u64,
}

impl Extent {
    pub fn new(device: DeviceId, start_sector: u64, length_sectors: u64) -> Self {
        Extent {
            device,
            start_sector,
            length_sectors,
        }
    }

    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.length_sectors
    }

    /// Check if two extents on the same device share any sector
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.device == other.device
            && self.start_sector < other.end_sector()
            && other.start_sector < self.end_sector()
    }
}

/// Table order: device registration order, then start sector
impl Ord for Extent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.device
            .cmp(&other.device)
            .then(self.start_sector.cmp(&other.start_sector))
            .then(self.length_sectors.cmp(&other.length_sectors))
    }
}

impl PartialOrd for Extent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
