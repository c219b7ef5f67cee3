//! Linux swap area scanner
//!
//! An inactive swap area holds no data worth keeping, so everything after
//! the header page is free. The header is validated against the device size
//! so a stale signature on a resized partition is not trusted.

use crate::core::extent::{Run, SECTOR_SIZE};
use crate::error::ScanError;
use crate::io::DeviceReader;

pub const SIGNATURE: &[u8; 10] = b"SWAPSPACE2";
const SUPPORTED_VERSION: u32 = 1;

// Header fields follow the 1024-byte boot block, in host byte order
const VERSION_OFFSET: usize = 1024;
const LAST_PAGE_OFFSET: usize = 1028;
const NR_BADPAGES_OFFSET: usize = 1032;

/// The kernel page size, which is also the swap page size
pub fn system_page_size() -> Option<usize> {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0)
}

/// Whether a probe buffer starting at offset 0 carries a swap signature
pub fn identify(probe: &[u8], page_size: usize) -> bool {
    page_size >= SIGNATURE.len()
        && probe
            .get(page_size - SIGNATURE.len()..page_size)
            .is_some_and(|sig| sig == SIGNATURE)
}

fn ne_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Validate the swap header and return the single free run after it
pub fn scan(
    reader: &DeviceReader,
    page_size: usize,
    total_sectors: u64,
) -> Result<Option<Run>, ScanError> {
    if page_size < NR_BADPAGES_OFFSET + 4 {
        return Err(ScanError::ReadDevice);
    }
    let header = reader
        .read_vec(0, page_size)
        .map_err(|_| ScanError::ReadDevice)?;

    if &header[page_size - SIGNATURE.len()..] != SIGNATURE {
        return Err(ScanError::SwapSignature);
    }
    let version = ne_u32(&header, VERSION_OFFSET);
    if version != SUPPORTED_VERSION {
        return Err(ScanError::SwapVersion(version));
    }
    let bad_pages = ne_u32(&header, NR_BADPAGES_OFFSET);
    if bad_pages != 0 {
        return Err(ScanError::SwapBadPages(bad_pages));
    }

    let page_sectors = page_size as u64 / SECTOR_SIZE;
    let last_page = ne_u32(&header, LAST_PAGE_OFFSET) as u64;
    let expected = (total_sectors / page_sectors).checked_sub(1);
    if expected != Some(last_page) {
        return Err(ScanError::SwapLength);
    }

    Ok((last_page > 0).then(|| Run::new(page_sectors, last_page * page_sectors)))
}
