//! Pre-scan safety checks
//!
//! A device is only scanned when nothing could be allocating on it while we
//! read its bitmap: it must not be mounted read-write, must not be an active
//! swap area, and must not be held open exclusively by someone else.

use crate::core::extent::SECTOR_SIZE;
use crate::error::ScanError;
use crate::io::DeviceReader;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const MOUNTS: &str = "/proc/mounts";
const SWAPS: &str = "/proc/swaps";

/// Whether the process runs with root privileges
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// Device size in 512-byte sectors
pub fn query_size(path: &Path) -> Result<u64, ScanError> {
    let mut reader = DeviceReader::open(path).map_err(|_| ScanError::QuerySize)?;
    let bytes = reader.size_bytes().map_err(|_| ScanError::QuerySize)?;
    Ok(bytes / SECTOR_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    device: PathBuf,
    read_only: bool,
}

/// Snapshot of the kernel's mount and swap tables
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<MountEntry>,
    swaps: Vec<PathBuf>,
}

/// How a device is currently in use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageFlags {
    pub mounted: bool,
    pub read_only: bool,
    pub swap: bool,
    pub busy: bool,
}

impl UsageFlags {
    /// The reason this usage forbids scanning, if any
    pub fn rejection(&self) -> Option<ScanError> {
        if self.mounted && !self.read_only {
            Some(ScanError::InUse("mounted rw"))
        } else if self.swap {
            Some(ScanError::InUse("an active swap device"))
        } else if self.busy {
            Some(ScanError::InUse("busy"))
        } else {
            None
        }
    }
}

impl MountTable {
    /// Read `/proc/mounts` and `/proc/swaps`
    pub fn load() -> io::Result<Self> {
        let mounts = fs::read_to_string(MOUNTS)?;
        // Kernels built without swap support have no /proc/swaps
        let swaps = match fs::read_to_string(SWAPS) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        Ok(Self::parse(&mounts, &swaps))
    }

    pub fn parse(mounts: &str, swaps: &str) -> Self {
        let mounts = mounts
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let options = fields.nth(2)?;
                Some(MountEntry {
                    device: PathBuf::from(unescape(device)),
                    read_only: options.split(',').any(|opt| opt == "ro"),
                })
            })
            .collect();

        let swaps = swaps
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(|path| PathBuf::from(unescape(path)))
            .collect();

        MountTable { mounts, swaps }
    }

    /// Usage of `path` according to this table
    ///
    /// Only an unmounted block device is tested for exclusive holders.
    pub fn usage(&self, path: &Path) -> UsageFlags {
        let mut flags = UsageFlags::default();

        for entry in self.mounts.iter().filter(|e| same_device(&e.device, path)) {
            // A device mounted in several places is rw if any mount is
            flags.read_only = if flags.mounted {
                flags.read_only && entry.read_only
            } else {
                entry.read_only
            };
            flags.mounted = true;
        }
        flags.swap = self.swaps.iter().any(|swap| same_device(swap, path));
        if !flags.mounted && !flags.swap {
            flags.busy = is_busy(path);
        }
        flags
    }
}

/// Reject `path` if it is in use
pub fn check_usage(table: &MountTable, path: &Path) -> Result<(), ScanError> {
    match table.usage(path).rejection() {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

/// Compare by device number for block devices, by canonical path otherwise
fn same_device(a: &Path, b: &Path) -> bool {
    if let (Ok(ma), Ok(mb)) = (fs::metadata(a), fs::metadata(b)) {
        if ma.file_type().is_block_device() && mb.file_type().is_block_device() {
            return ma.rdev() == mb.rdev();
        }
        return ma.dev() == mb.dev() && ma.ino() == mb.ino();
    }
    a == b
}

/// Whether another holder has the block device open exclusively
fn is_busy(path: &Path) -> bool {
    let is_block = fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block {
        return false;
    }
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
    {
        Ok(_) => false,
        Err(e) => e.raw_os_error() == Some(libc::EBUSY),
    }
}

/// Undo the octal escapes the kernel applies to whitespace in paths
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let is_escape = bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if is_escape {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
