//! Device enumeration and filesystem identification
//!
//! Identification reads the first 64 KiB of a device (plus a little) and
//! looks for the on-disk signatures of the filesystems the scanners handle,
//! and of a few common ones they don't, so a rejection can name the type.

use crate::error::{GatherError, Result, ScanError};
use crate::io::DeviceReader;
use crate::scan::{ext, ntfs, swap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Enough to reach the btrfs superblock at 64 KiB
pub const PROBE_LEN: usize = 0x10100;

const PARTITIONS: &str = "/proc/partitions";

/// A device and the type its signature identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub fstype: String,
}

/// Name the filesystem in a probe buffer read from device offset 0
pub fn identify(probe: &[u8], page_size: usize) -> Option<String> {
    if let Some(kind) = ext::identify(probe) {
        return Some(kind.as_str().to_string());
    }
    if ntfs::identify(probe) {
        return Some("ntfs".to_string());
    }
    if swap::identify(probe, page_size) {
        return Some("swap".to_string());
    }

    let foreign: [(&str, usize, &[u8]); 3] = [
        ("xfs", 0, b"XFSB"),
        ("btrfs", 0x10040, b"_BHRfS_M"),
        ("LVM2_member", 0x218, b"LVM2 001"),
    ];
    foreign
        .iter()
        .find(|(_, offset, magic)| {
            probe
                .get(*offset..*offset + magic.len())
                .is_some_and(|found| found == *magic)
        })
        .map(|(name, _, _)| name.to_string())
}

/// Identify the filesystem on one device
pub fn probe_device(path: &Path) -> std::result::Result<String, ScanError> {
    let reader = DeviceReader::open(path).map_err(|_| ScanError::Probe)?;
    let mut buf = vec![0u8; PROBE_LEN];
    let len = reader.read_at_most(0, &mut buf).map_err(|_| ScanError::Probe)?;
    buf.truncate(len);

    let page_size = swap::system_page_size().unwrap_or(4096);
    identify(&buf, page_size).ok_or(ScanError::UnknownType)
}

/// Device names listed in `/proc/partitions` content
pub fn parse_partitions(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [major, _, _, name] if major.parse::<u32>().is_ok() => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Every block device with a recognisable signature
///
/// Devices that can't be read or carry no known signature are skipped
/// silently; only explicitly named devices are reported as rejected.
pub fn enumerate_devices() -> Result<Vec<Candidate>> {
    let text = fs::read_to_string(PARTITIONS)
        .map_err(|e| GatherError::Enumerate(format!("{}: {}", PARTITIONS, e)))?;
    Ok(enumerate_in(&text, Path::new("/dev")))
}

/// Probe the partitions named in `text` under `dev_dir`
pub fn enumerate_in(text: &str, dev_dir: &Path) -> Vec<Candidate> {
    parse_partitions(text)
        .into_iter()
        .filter_map(|name| {
            let path = dev_dir.join(&name);
            match probe_device(&path) {
                Ok(fstype) => Some(Candidate { path, fstype }),
                Err(e) => {
                    debug!("{}: {}", path.display(), e);
                    None
                }
            }
        })
        .collect()
}
