//! NTFS cluster-bitmap scanner
//!
//! Only the pieces of NTFS needed to find `$Bitmap` are understood: the boot
//! sector, MFT record fixups, attribute headers, data runlists, and enough
//! of the root directory index to find `hiberfil.sys`. The volume is never
//! written.
//!
//! `$Bitmap` is only trustworthy when Windows shut the volume down cleanly.
//! A volume with unreplayed `$LogFile` records or a hibernation image may
//! have live clusters marked free, so both are refused.

use super::bitmap::BitmapRuns;
use crate::core::extent::SECTOR_SIZE;
use crate::error::ScanError;
use crate::io::{le_u16, le_u32, le_u64, DeviceReader};
use tracing::debug;

pub const OEM_ID: &[u8; 8] = b"NTFS    ";
const BOOT_SECTOR_SIZE: usize = 512;

/// Fixup stride inside MFT records, independent of the sector size
const FIXUP_BLOCK: usize = 512;
const RECORD_MAGIC: &[u8; 4] = b"FILE";
const MAX_RECORD_SIZE: u64 = 64 * 1024;

const INDEX_MAGIC: &[u8; 4] = b"INDX";
const RESTART_MAGIC: &[u8; 4] = b"RSTR";

const MFT_RECORD_MFT: u64 = 0;
const MFT_RECORD_LOGFILE: u64 = 2;
const MFT_RECORD_VOLUME: u64 = 3;
const MFT_RECORD_ROOT: u64 = 5;
const MFT_RECORD_BITMAP: u64 = 6;
const MFT_REF_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const MFT_RECORD_IN_USE: u16 = 0x0001;

const ATTR_VOLUME_INFORMATION: u32 = 0x70;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_END: u32 = 0xFFFF_FFFF;

const VOLUME_IS_DIRTY: u16 = 0x0001;

const DIRECTORY_INDEX: &str = "$I30";
const HIBERFILE: &str = "hiberfil.sys";
const HIBERFILE_MAGICS: [&[u8; 4]; 2] = [b"hibr", b"HIBR"];
const INDEX_ENTRY_END: u16 = 0x0002;
const MAX_INDEX_ALLOCATION: u64 = 16 << 20;

// Restart pages are one system page each; 64 KiB covers both copies
const LOGFILE_HEAD: u64 = 64 * 1024;
const LOGFILE_NO_CLIENT: u16 = 0xFFFF;
const RESTART_VOLUME_IS_CLEAN: u16 = 0x0002;

/// Geometry from the boot sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u32,
    pub cluster_size: u64,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_record_size: usize,
}

impl BootSector {
    pub fn parse(bytes: &[u8]) -> Result<Self, ScanError> {
        if bytes.len() < BOOT_SECTOR_SIZE || &bytes[3..11] != OEM_ID {
            return Err(ScanError::OpenNtfs);
        }

        let bytes_per_sector = le_u16(bytes, 0x0B) as u32;
        if !(256..=4096).contains(&bytes_per_sector) || !bytes_per_sector.is_power_of_two() {
            return Err(ScanError::OpenNtfs);
        }

        let raw_spc = bytes[0x0D];
        let sectors_per_cluster: u64 = match raw_spc {
            0 => return Err(ScanError::OpenNtfs),
            1..=0x80 => raw_spc as u64,
            // Large clusters are stored as a negative shift
            _ => match 256 - raw_spc as u32 {
                shift @ 0..=31 => 1 << shift,
                _ => return Err(ScanError::OpenNtfs),
            },
        };
        if !sectors_per_cluster.is_power_of_two() {
            return Err(ScanError::OpenNtfs);
        }
        let cluster_size = sectors_per_cluster * bytes_per_sector as u64;
        if cluster_size < SECTOR_SIZE {
            return Err(ScanError::OpenNtfs);
        }

        let raw_record = bytes[0x40] as i8;
        let mft_record_size = if raw_record > 0 {
            raw_record as u64 * cluster_size
        } else {
            let shift = raw_record.unsigned_abs() as u32;
            if shift >= 32 {
                return Err(ScanError::OpenNtfs);
            }
            1u64 << shift
        };
        if !(FIXUP_BLOCK as u64..=MAX_RECORD_SIZE).contains(&mft_record_size)
            || mft_record_size % FIXUP_BLOCK as u64 != 0
        {
            return Err(ScanError::OpenNtfs);
        }

        Ok(BootSector {
            bytes_per_sector,
            cluster_size,
            total_sectors: le_u64(bytes, 0x28),
            mft_lcn: le_u64(bytes, 0x30),
            mft_record_size: mft_record_size as usize,
        })
    }

    pub fn sectors_per_cluster(&self) -> u64 {
        self.cluster_size / self.bytes_per_sector as u64
    }

    pub fn nr_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster()
    }
}

/// Whether a probe buffer starting at offset 0 carries an NTFS boot sector
pub fn identify(probe: &[u8]) -> bool {
    probe.get(3..11).is_some_and(|oem| oem == OEM_ID)
}

/// An MFT record with its update sequence fixups applied
struct MftRecord {
    data: Vec<u8>,
}

impl MftRecord {
    fn parse(mut data: Vec<u8>) -> Result<Self, ScanError> {
        apply_fixups(&mut data, RECORD_MAGIC)?;
        Ok(MftRecord { data })
    }

    fn in_use(&self) -> bool {
        le_u16(&self.data, 0x16) & MFT_RECORD_IN_USE != 0
    }

    /// Find the first unnamed attribute of `kind`
    fn attribute(&self, kind: u32) -> Result<Attribute<'_>, ScanError> {
        self.named_attribute(kind, "")
    }

    /// Find the first attribute of `kind` called `name`
    fn named_attribute(&self, kind: u32, name: &str) -> Result<Attribute<'_>, ScanError> {
        self.find_attribute(kind, name)?.ok_or(ScanError::OpenNtfs)
    }

    /// Like [`named_attribute`](Self::named_attribute), but absence is not an error
    fn find_attribute(&self, kind: u32, name: &str) -> Result<Option<Attribute<'_>>, ScanError> {
        let mut offset = le_u16(&self.data, 0x14) as usize;
        loop {
            if offset + 8 > self.data.len() {
                return Err(ScanError::OpenNtfs);
            }
            let attr_type = le_u32(&self.data, offset);
            if attr_type == ATTR_END {
                return Ok(None);
            }
            let length = le_u32(&self.data, offset + 4) as usize;
            if length < 0x18 || offset + length > self.data.len() {
                return Err(ScanError::OpenNtfs);
            }
            let bytes = &self.data[offset..offset + length];
            if attr_type == kind {
                let name_len = bytes[9] as usize * 2;
                let name_offset = le_u16(bytes, 0x0A) as usize;
                let attr_name = bytes
                    .get(name_offset..name_offset + name_len)
                    .ok_or(ScanError::OpenNtfs)?;
                if name_matches(attr_name, name) {
                    return Attribute::parse(bytes).map(Some);
                }
            }
            offset += length;
        }
    }
}

#[derive(Clone, Copy)]
enum Attribute<'a> {
    Resident(&'a [u8]),
    NonResident { runlist: &'a [u8], data_size: u64 },
}

impl<'a> Attribute<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, ScanError> {
        if bytes[8] == 0 {
            let len = le_u32(bytes, 0x10) as usize;
            let offset = le_u16(bytes, 0x14) as usize;
            let value = bytes.get(offset..offset + len).ok_or(ScanError::OpenNtfs)?;
            Ok(Attribute::Resident(value))
        } else {
            if bytes.len() < 0x40 {
                return Err(ScanError::OpenNtfs);
            }
            let runlist_offset = le_u16(bytes, 0x20) as usize;
            let runlist = bytes.get(runlist_offset..).ok_or(ScanError::OpenNtfs)?;
            Ok(Attribute::NonResident {
                runlist,
                data_size: le_u64(bytes, 0x30),
            })
        }
    }
}

/// Undo the update sequence protection of a multi-sector structure
///
/// The last two bytes of every 512-byte block were replaced on disk by the
/// sequence number; the originals live in the update sequence array.
fn apply_fixups(data: &mut [u8], magic: &[u8; 4]) -> Result<(), ScanError> {
    if data.len() < 0x18 || &data[0..4] != magic {
        return Err(ScanError::OpenNtfs);
    }

    let usa_ofs = le_u16(data, 4) as usize;
    let usa_count = le_u16(data, 6) as usize;
    if usa_count != data.len() / FIXUP_BLOCK + 1 || usa_ofs + usa_count * 2 > data.len() {
        return Err(ScanError::OpenNtfs);
    }

    let seq = [data[usa_ofs], data[usa_ofs + 1]];
    for i in 1..usa_count {
        let tail = i * FIXUP_BLOCK - 2;
        if data[tail..tail + 2] != seq {
            return Err(ScanError::OpenNtfs);
        }
        let entry = usa_ofs + i * 2;
        data[tail] = data[entry];
        data[tail + 1] = data[entry + 1];
    }
    Ok(())
}

/// Compare a UTF-16LE name against an ASCII one, ignoring ASCII case
fn name_matches(utf16: &[u8], name: &str) -> bool {
    utf16.len() == name.len() * 2
        && utf16
            .chunks_exact(2)
            .zip(name.bytes())
            .all(|(unit, b)| unit[1] == 0 && unit[0].eq_ignore_ascii_case(&b))
}

/// One decoded data run; `lcn` is `None` for sparse runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub clusters: u64,
}

/// Decode a mapping-pairs array
pub fn decode_runlist(mut bytes: &[u8]) -> Result<Vec<DataRun>, ScanError> {
    let mut runs = Vec::new();
    let mut lcn: i64 = 0;

    while let Some((&header, rest)) = bytes.split_first() {
        if header == 0 {
            return Ok(runs);
        }
        let len_size = (header & 0x0F) as usize;
        let off_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || off_size > 8 || rest.len() < len_size + off_size {
            return Err(ScanError::OpenNtfs);
        }

        let clusters = read_signed(&rest[..len_size]);
        if clusters <= 0 {
            return Err(ScanError::OpenNtfs);
        }
        let run_lcn = if off_size == 0 {
            None
        } else {
            lcn = lcn
                .checked_add(read_signed(&rest[len_size..len_size + off_size]))
                .filter(|&l| l >= 0)
                .ok_or(ScanError::OpenNtfs)?;
            Some(lcn as u64)
        };

        runs.push(DataRun {
            lcn: run_lcn,
            clusters: clusters as u64,
        });
        bytes = &rest[len_size + off_size..];
    }

    Err(ScanError::OpenNtfs)
}

/// Little-endian two's-complement integer of 1 to 8 bytes
fn read_signed(bytes: &[u8]) -> i64 {
    let mut buf = if bytes[bytes.len() - 1] & 0x80 != 0 {
        [0xFF; 8]
    } else {
        [0; 8]
    };
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn read_mft_record(
    reader: &DeviceReader,
    boot: &BootSector,
    record: u64,
) -> Result<MftRecord, ScanError> {
    let offset = boot
        .mft_lcn
        .checked_mul(boot.cluster_size)
        .and_then(|mft| mft.checked_add(record * boot.mft_record_size as u64))
        .ok_or(ScanError::OpenNtfs)?;
    let data = reader
        .read_vec(offset, boot.mft_record_size)
        .map_err(|_| ScanError::OpenNtfs)?;
    MftRecord::parse(data)
}

/// Whether this driver understands the on-disk format version
fn version_is_supported(major: u8, minor: u8) -> bool {
    major == 1 || (major == 3 && minor <= 1)
}

/// Read `len` bytes of non-resident attribute data
fn read_runs(
    reader: &DeviceReader,
    boot: &BootSector,
    runs: &[DataRun],
    len: u64,
) -> Result<Vec<u8>, ScanError> {
    let mut out = vec![0u8; len as usize];
    let mut filled = 0usize;

    for run in runs {
        if filled == out.len() {
            break;
        }
        let chunk = run
            .clusters
            .saturating_mul(boot.cluster_size)
            .min((out.len() - filled) as u64) as usize;
        if let Some(lcn) = run.lcn {
            let offset = lcn
                .checked_mul(boot.cluster_size)
                .ok_or(ScanError::ShortBitmapRead)?;
            reader
                .read_exact_at(offset, &mut out[filled..filled + chunk])
                .map_err(|_| ScanError::ShortBitmapRead)?;
        }
        filled += chunk;
    }

    if filled < out.len() {
        return Err(ScanError::ShortBitmapRead);
    }
    Ok(out)
}

/// Read up to `limit` bytes from the start of an attribute's value
fn read_prefix(
    reader: &DeviceReader,
    boot: &BootSector,
    attr: &Attribute<'_>,
    limit: u64,
) -> Result<Vec<u8>, ScanError> {
    match *attr {
        Attribute::Resident(value) => Ok(value[..value.len().min(limit as usize)].to_vec()),
        Attribute::NonResident { runlist, data_size } => {
            let runs = decode_runlist(runlist)?;
            read_runs(reader, boot, &runs, data_size.min(limit)).map_err(|_| ScanError::OpenNtfs)
        }
    }
}

/// Read MFT record `number` wherever the `$MFT` data runs place it
fn read_mapped_record(
    reader: &DeviceReader,
    boot: &BootSector,
    mft_runs: &[DataRun],
    number: u64,
) -> Result<MftRecord, ScanError> {
    let record_size = boot.mft_record_size as u64;
    let wanted = number.checked_mul(record_size).ok_or(ScanError::OpenNtfs)?;

    let mut run_start = 0u64;
    for run in mft_runs {
        let run_end = run_start.saturating_add(run.clusters.saturating_mul(boot.cluster_size));
        if wanted < run_end {
            // Records never straddle runs on a sane volume
            let lcn = run.lcn.ok_or(ScanError::OpenNtfs)?;
            if wanted + record_size > run_end {
                return Err(ScanError::OpenNtfs);
            }
            let offset = lcn
                .checked_mul(boot.cluster_size)
                .and_then(|base| base.checked_add(wanted - run_start))
                .ok_or(ScanError::OpenNtfs)?;
            let data = reader
                .read_vec(offset, boot.mft_record_size)
                .map_err(|_| ScanError::OpenNtfs)?;
            return MftRecord::parse(data);
        }
        run_start = run_end;
    }
    Err(ScanError::OpenNtfs)
}

/// Whether `$LogFile` holds no transactions that still need replaying
///
/// A log that is all `0xFF` was never used or was reset by chkdsk. Otherwise
/// both restart page copies must describe a volume with no active log
/// clients or one flagged clean.
fn logfile_is_clean(log: &[u8]) -> bool {
    if log.iter().all(|&b| b == 0xFF) {
        return true;
    }
    if log.len() < FIXUP_BLOCK || &log[0..4] != RESTART_MAGIC {
        return false;
    }

    let page_size = le_u32(log, 0x10) as usize;
    if !page_size.is_power_of_two() || page_size < FIXUP_BLOCK {
        return false;
    }
    log.chunks(page_size)
        .take(2)
        .filter(|page| page.len() >= FIXUP_BLOCK && &page[0..4] == RESTART_MAGIC)
        .all(restart_area_is_clean)
}

fn restart_area_is_clean(page: &[u8]) -> bool {
    let area = le_u16(page, 0x18) as usize;
    // Fields past the first fixup slot would need the update sequence applied
    if area + 0x10 > FIXUP_BLOCK - 2 {
        return false;
    }
    let client_in_use = le_u16(page, area + 0x0C);
    let flags = le_u16(page, area + 0x0E);
    client_in_use == LOGFILE_NO_CLIENT || flags & RESTART_VOLUME_IS_CLEAN != 0
}

/// Look `name` up among the entries of one index node
///
/// `node` starts at an index header. Returns the MFT record number of the
/// match, if any.
fn find_index_entry(node: &[u8], name: &str) -> Result<Option<u64>, ScanError> {
    if node.len() < 0x10 {
        return Err(ScanError::OpenNtfs);
    }
    let first = le_u32(node, 0) as usize;
    let used = le_u32(node, 4) as usize;
    let entries = node.get(first..used).ok_or(ScanError::OpenNtfs)?;

    let mut offset = 0;
    loop {
        if offset + 0x10 > entries.len() {
            return Err(ScanError::OpenNtfs);
        }
        let length = le_u16(entries, offset + 8) as usize;
        let key_length = le_u16(entries, offset + 0x0A) as usize;
        let flags = le_u16(entries, offset + 0x0C);
        if flags & INDEX_ENTRY_END != 0 {
            return Ok(None);
        }
        if length < 0x10 || offset + length > entries.len() || 0x10 + key_length > length {
            return Err(ScanError::OpenNtfs);
        }

        // The key is a $FILE_NAME value: name length at 0x40, name at 0x42
        let key = &entries[offset + 0x10..offset + 0x10 + key_length];
        let name_len = *key.get(0x40).ok_or(ScanError::OpenNtfs)? as usize * 2;
        let entry_name = key.get(0x42..0x42 + name_len).ok_or(ScanError::OpenNtfs)?;
        if name_matches(entry_name, name) {
            return Ok(Some(le_u64(entries, offset) & MFT_REF_MASK));
        }
        offset += length;
    }
}

/// Find `name` in the root directory, searching every index node
fn lookup_root(
    reader: &DeviceReader,
    boot: &BootSector,
    root: &MftRecord,
    name: &str,
) -> Result<Option<u64>, ScanError> {
    let index_root = match root.named_attribute(ATTR_INDEX_ROOT, DIRECTORY_INDEX)? {
        Attribute::Resident(value) if value.len() >= 0x20 => value,
        _ => return Err(ScanError::OpenNtfs),
    };
    if let Some(found) = find_index_entry(&index_root[0x10..], name)? {
        return Ok(Some(found));
    }

    let Some(allocation) = root.find_attribute(ATTR_INDEX_ALLOCATION, DIRECTORY_INDEX)? else {
        return Ok(None);
    };
    if let Attribute::NonResident { data_size, .. } = allocation {
        if data_size > MAX_INDEX_ALLOCATION {
            return Err(ScanError::OpenNtfs);
        }
    }
    let block_size = le_u32(index_root, 0x08) as usize;
    if !block_size.is_power_of_two()
        || !(FIXUP_BLOCK..=MAX_RECORD_SIZE as usize).contains(&block_size)
    {
        return Err(ScanError::OpenNtfs);
    }

    let mut blocks = read_prefix(reader, boot, &allocation, MAX_INDEX_ALLOCATION)?;
    for block in blocks.chunks_exact_mut(block_size) {
        apply_fixups(block, INDEX_MAGIC)?;
        if let Some(found) = find_index_entry(&block[0x18..], name)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// Whether the volume carries a Windows hibernation image
fn is_hibernated(reader: &DeviceReader, boot: &BootSector) -> Result<bool, ScanError> {
    let root = read_mft_record(reader, boot, MFT_RECORD_ROOT)?;
    let Some(number) = lookup_root(reader, boot, &root, HIBERFILE)? else {
        return Ok(false);
    };

    let mft = read_mft_record(reader, boot, MFT_RECORD_MFT)?;
    let mft_runs = match mft.attribute(ATTR_DATA)? {
        Attribute::NonResident { runlist, .. } => decode_runlist(runlist)?,
        Attribute::Resident(_) => return Err(ScanError::OpenNtfs),
    };
    let record = read_mapped_record(reader, boot, &mft_runs, number)?;
    if !record.in_use() {
        return Ok(false);
    }

    let header = read_prefix(reader, boot, &record.attribute(ATTR_DATA)?, 4)?;
    Ok(HIBERFILE_MAGICS.iter().any(|magic| header == magic.as_slice()))
}

/// Open an NTFS volume and return its free cluster runs in sectors
pub fn scan(reader: &DeviceReader, total_sectors: u64) -> Result<BitmapRuns, ScanError> {
    let boot_bytes = reader
        .read_vec(0, BOOT_SECTOR_SIZE)
        .map_err(|_| ScanError::OpenNtfs)?;
    let boot = BootSector::parse(&boot_bytes)?;
    let cluster_sectors = boot.cluster_size / SECTOR_SIZE;
    if boot.nr_clusters() > total_sectors / cluster_sectors {
        return Err(ScanError::OpenNtfs);
    }

    let volume = read_mft_record(reader, &boot, MFT_RECORD_VOLUME)?;
    let info = match volume.attribute(ATTR_VOLUME_INFORMATION)? {
        Attribute::Resident(value) if value.len() >= 12 => value,
        _ => return Err(ScanError::OpenNtfs),
    };
    let (major, minor) = (info[8], info[9]);

    let logfile = read_mft_record(reader, &boot, MFT_RECORD_LOGFILE)?;
    let log = read_prefix(reader, &boot, &logfile.attribute(ATTR_DATA)?, LOGFILE_HEAD)?;
    if !logfile_is_clean(&log) {
        debug!("{}: $LogFile needs replaying", reader.path().display());
        return Err(ScanError::OpenNtfs);
    }
    if is_hibernated(reader, &boot)? {
        debug!("{}: Windows is hibernated", reader.path().display());
        return Err(ScanError::OpenNtfs);
    }

    if !version_is_supported(major, minor) {
        return Err(ScanError::UnsupportedVersion);
    }
    if le_u16(info, 10) & VOLUME_IS_DIRTY != 0 {
        return Err(ScanError::NeedsChecking);
    }

    let nr_clusters = boot.nr_clusters();
    let bitmap_record = read_mft_record(reader, &boot, MFT_RECORD_BITMAP)?;
    let bitmap = match bitmap_record.attribute(ATTR_DATA)? {
        Attribute::Resident(value) => {
            if (value.len() as u64) * 8 < nr_clusters {
                return Err(ScanError::ShortBitmap);
            }
            value.to_vec()
        }
        Attribute::NonResident { runlist, data_size } => {
            if data_size.saturating_mul(8) < nr_clusters {
                return Err(ScanError::ShortBitmap);
            }
            // The bitmap is padded to whole clusters at most
            if data_size > nr_clusters.div_ceil(8) + boot.cluster_size {
                return Err(ScanError::OpenNtfs);
            }
            let runs = decode_runlist(runlist)?;
            read_runs(reader, &boot, &runs, data_size)?
        }
    };

    debug!(
        "{}: NTFS {}.{}, {} clusters of {} bytes",
        reader.path().display(),
        major,
        minor,
        nr_clusters,
        boot.cluster_size
    );

    Ok(BitmapRuns::new(bitmap, nr_clusters, 0, cluster_sectors))
}
