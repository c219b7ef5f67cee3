//! Per-filesystem free-space scanners
//!
//! Each supported filesystem turns its allocation metadata into a lazy,
//! ascending sequence of free [`Run`]s measured in 512-byte sectors. All
//! metadata is read while opening; iteration itself does no I/O, and the
//! device handle is closed before the first run is produced.

pub mod bitmap;
pub mod ext;
pub mod ntfs;
pub mod swap;

use crate::core::extent::Run;
use crate::error::ScanError;
use crate::io::DeviceReader;
use std::fmt;
use std::path::Path;

/// Free runs of one device, ascending and non-overlapping
pub type FreeRuns = Box<dyn Iterator<Item = Run>>;

/// Filesystems the gatherer knows how to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Ntfs,
    Swap,
}

impl FilesystemKind {
    /// Map a blkid-style type name to a scanner
    pub fn from_fstype(fstype: &str) -> Option<Self> {
        match fstype {
            "ext2" => Some(FilesystemKind::Ext2),
            "ext3" => Some(FilesystemKind::Ext3),
            "ext4" => Some(FilesystemKind::Ext4),
            "ntfs" => Some(FilesystemKind::Ntfs),
            "swap" => Some(FilesystemKind::Swap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemKind::Ext2 => "ext2",
            FilesystemKind::Ext3 => "ext3",
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Ntfs => "ntfs",
            FilesystemKind::Swap => "swap",
        }
    }

    /// Open `path` and prepare its free runs
    ///
    /// `total_sectors` is the device size, which bounds what the on-disk
    /// metadata may claim. A failure here rejects the device and yields no
    /// runs.
    pub fn scanner(&self, path: &Path, total_sectors: u64) -> Result<FreeRuns, ScanError> {
        match self {
            FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4 => {
                let reader = DeviceReader::open(path).map_err(|_| ScanError::ReadFilesystem)?;
                Ok(Box::new(ext::scan(&reader, total_sectors)?))
            }
            FilesystemKind::Ntfs => {
                let reader = DeviceReader::open(path).map_err(|_| ScanError::OpenNtfs)?;
                Ok(Box::new(ntfs::scan(&reader, total_sectors)?))
            }
            FilesystemKind::Swap => {
                let reader = DeviceReader::open(path).map_err(|_| ScanError::OpenDevice)?;
                let page_size = swap::system_page_size().ok_or(ScanError::ReadDevice)?;
                Ok(Box::new(swap::scan(&reader, page_size, total_sectors)?.into_iter()))
            }
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
