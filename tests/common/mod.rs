//! Synthetic filesystem images for integration tests
//!
//! Each builder writes just enough on-disk structure for the scanners to
//! accept the image, with a known set of allocated blocks.

#![allow(dead_code)]

use freespace_rs::scan::swap::system_page_size;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub fn write_at(file: &File, offset: u64, bytes: &[u8]) {
    file.write_all_at(bytes, offset).unwrap();
}

fn set_bit(bitmap: &mut [u8], bit: u64) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

// ---------------------------------------------------------------------------
// ext2

pub const EXT_BLOCK: u64 = 1024;
pub const EXT_BLOCKS: u64 = 16384;
pub const EXT_BLOCKS_PER_GROUP: u64 = 8192;

/// Knobs for [`ext_image`]
#[derive(Debug, Clone)]
pub struct ExtOptions {
    pub state: u16,
    pub compat: u32,
    pub incompat: u32,
    pub ro_compat: u32,
    /// Flag group 1 BLOCK_UNINIT and leave garbage where its bitmap would be
    pub uninit_group1: bool,
    /// Extra allocated block ranges `[start, end)` in group 0
    pub used: Vec<(u64, u64)>,
}

impl Default for ExtOptions {
    fn default() -> Self {
        ExtOptions {
            state: 0x0001,
            compat: 0,
            incompat: 0,
            ro_compat: 0,
            uninit_group1: false,
            used: vec![(1000, 1100)],
        }
    }
}

/// A two-group ext2 image with 1 KiB blocks
///
/// Group 0 spans blocks 1..=8192 with metadata in blocks 1..=20; group 1
/// spans 8193..=16383 with metadata in 8193..=8212.
pub fn ext_image(path: &Path, opts: &ExtOptions) {
    let file = File::create(path).unwrap();
    file.set_len(EXT_BLOCKS * EXT_BLOCK).unwrap();

    let mut sb = vec![0u8; 1024];
    sb[4..8].copy_from_slice(&(EXT_BLOCKS as u32).to_le_bytes());
    sb[20..24].copy_from_slice(&1u32.to_le_bytes());
    sb[32..36].copy_from_slice(&(EXT_BLOCKS_PER_GROUP as u32).to_le_bytes());
    sb[36..40].copy_from_slice(&(EXT_BLOCKS_PER_GROUP as u32).to_le_bytes());
    sb[40..44].copy_from_slice(&128u32.to_le_bytes());
    sb[56..58].copy_from_slice(&0xEF53u16.to_le_bytes());
    sb[58..60].copy_from_slice(&opts.state.to_le_bytes());
    sb[76..80].copy_from_slice(&1u32.to_le_bytes());
    sb[88..90].copy_from_slice(&128u16.to_le_bytes());
    sb[92..96].copy_from_slice(&opts.compat.to_le_bytes());
    sb[96..100].copy_from_slice(&opts.incompat.to_le_bytes());
    sb[100..104].copy_from_slice(&opts.ro_compat.to_le_bytes());
    write_at(&file, 1024, &sb);

    // Group descriptors in block 2
    let mut gdt = vec![0u8; 64];
    let group_meta = [(3u32, 4u32, 5u32), (8195, 8196, 8197)];
    for (i, (bb, ib, it)) in group_meta.iter().enumerate() {
        let desc = &mut gdt[i * 32..(i + 1) * 32];
        desc[0..4].copy_from_slice(&bb.to_le_bytes());
        desc[4..8].copy_from_slice(&ib.to_le_bytes());
        desc[8..12].copy_from_slice(&it.to_le_bytes());
    }
    if opts.uninit_group1 {
        gdt[32 + 18..32 + 20].copy_from_slice(&0x0002u16.to_le_bytes());
    }
    write_at(&file, 2 * EXT_BLOCK, &gdt);

    // Group 0: bit i is block 1 + i
    let mut bitmap0 = vec![0u8; EXT_BLOCK as usize];
    for bit in 0..20 {
        set_bit(&mut bitmap0, bit);
    }
    for &(start, end) in &opts.used {
        for block in start..end {
            set_bit(&mut bitmap0, block - 1);
        }
    }
    write_at(&file, 3 * EXT_BLOCK, &bitmap0);

    // Group 1: bit i is block 8193 + i; the tail past the last block is padding
    let mut bitmap1 = vec![0u8; EXT_BLOCK as usize];
    if opts.uninit_group1 {
        bitmap1.fill(0xFF);
    } else {
        for bit in (0..20).chain(8191..8192) {
            set_bit(&mut bitmap1, bit);
        }
    }
    write_at(&file, 8195 * EXT_BLOCK, &bitmap1);
}

// ---------------------------------------------------------------------------
// NTFS

pub const NTFS_CLUSTER: u64 = 4096;
pub const NTFS_CLUSTERS: u64 = 1024;
const NTFS_MFT_LCN: u64 = 4;
const NTFS_MFT_CLUSTERS: u64 = 8;
const NTFS_RECORD: usize = 1024;
const NTFS_BITMAP_LCN: u64 = 20;
const NTFS_LOGFILE_LCN: u64 = 24;
const NTFS_INDEX_LCN: u64 = 26;
const NTFS_HIBERFILE_RECORD: u64 = 24;

/// What the `$LogFile` restart pages say
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// All 0xFF, as after chkdsk
    Reset,
    Clean,
    /// A log client is active and the clean flag is unset
    Active,
}

#[derive(Debug, Clone)]
pub struct NtfsOptions {
    pub major: u8,
    pub minor: u8,
    pub volume_flags: u16,
    pub bitmap_bytes: u64,
    pub bitmap_lcn: u64,
    /// Allocated cluster ranges `[start, end)`
    pub used: Vec<(u64, u64)>,
    pub log: LogState,
    /// First bytes of `hiberfil.sys`; `None` leaves it out of the root
    pub hiberfile: Option<[u8; 4]>,
    /// List `hiberfil.sys` in an index block instead of the index root
    pub hiberfile_in_subnode: bool,
}

impl Default for NtfsOptions {
    fn default() -> Self {
        NtfsOptions {
            major: 3,
            minor: 1,
            volume_flags: 0,
            bitmap_bytes: NTFS_CLUSTERS / 8,
            bitmap_lcn: NTFS_BITMAP_LCN,
            used: vec![(0, 30), (100, 200)],
            log: LogState::Clean,
            hiberfile: None,
            hiberfile_in_subnode: false,
        }
    }
}

fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Hide the last two bytes of each 512-byte block behind an update sequence
fn protect(buf: &mut [u8], usa_ofs: usize) {
    let count = buf.len() / 512 + 1;
    buf[4..6].copy_from_slice(&(usa_ofs as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&(count as u16).to_le_bytes());

    let seq = [0x01, 0x00];
    buf[usa_ofs..usa_ofs + 2].copy_from_slice(&seq);
    for i in 1..count {
        let tail = i * 512 - 2;
        let saved = [buf[tail], buf[tail + 1]];
        buf[usa_ofs + i * 2..usa_ofs + i * 2 + 2].copy_from_slice(&saved);
        buf[tail..tail + 2].copy_from_slice(&seq);
    }
}

/// Wrap attribute bytes in an MFT record and apply update sequence fixups
fn mft_record(attributes: &[u8]) -> Vec<u8> {
    let mut rec = vec![0u8; NTFS_RECORD];
    rec[0..4].copy_from_slice(b"FILE");
    rec[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
    rec[0x16..0x18].copy_from_slice(&1u16.to_le_bytes());

    let end = 0x38 + attributes.len();
    rec[0x38..end].copy_from_slice(attributes);
    rec[end..end + 4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    protect(&mut rec, 0x30);
    rec
}

fn resident(kind: u32, name: &str, value: &[u8]) -> Vec<u8> {
    let name = utf16(name);
    let value_offset = align8(0x18 + name.len());
    let length = align8(value_offset + value.len());

    let mut attr = vec![0u8; length];
    attr[0..4].copy_from_slice(&kind.to_le_bytes());
    attr[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    attr[9] = (name.len() / 2) as u8;
    attr[0x0A..0x0C].copy_from_slice(&0x18u16.to_le_bytes());
    attr[0x10..0x14].copy_from_slice(&(value.len() as u32).to_le_bytes());
    attr[0x14..0x16].copy_from_slice(&(value_offset as u16).to_le_bytes());
    attr[0x18..0x18 + name.len()].copy_from_slice(&name);
    attr[value_offset..value_offset + value.len()].copy_from_slice(value);
    attr
}

/// A non-resident attribute stored in one run of `clusters` at `lcn`
fn non_resident(kind: u32, name: &str, lcn: u64, clusters: u64, size: u64) -> Vec<u8> {
    let name = utf16(name);
    let runlist_offset = align8(0x40 + name.len());
    let length = align8(runlist_offset + 5);

    let mut attr = vec![0u8; length];
    attr[0..4].copy_from_slice(&kind.to_le_bytes());
    attr[4..8].copy_from_slice(&(length as u32).to_le_bytes());
    attr[8] = 1;
    attr[9] = (name.len() / 2) as u8;
    attr[0x0A..0x0C].copy_from_slice(&0x40u16.to_le_bytes());
    attr[0x18..0x20].copy_from_slice(&(clusters - 1).to_le_bytes());
    attr[0x20..0x22].copy_from_slice(&(runlist_offset as u16).to_le_bytes());
    attr[0x28..0x30].copy_from_slice(&(clusters * NTFS_CLUSTER).to_le_bytes());
    attr[0x30..0x38].copy_from_slice(&size.to_le_bytes());
    attr[0x38..0x40].copy_from_slice(&size.to_le_bytes());
    attr[0x40..0x40 + name.len()].copy_from_slice(&name);
    let lcn = lcn.to_le_bytes();
    attr[runlist_offset..runlist_offset + 5].copy_from_slice(&[0x21, clusters as u8, lcn[0], lcn[1], 0]);
    attr
}

/// A directory index entry naming MFT record `record`
fn index_entry(record: u64, name: &str) -> Vec<u8> {
    let name16 = utf16(name);
    let key_length = 0x42 + name16.len();
    let length = align8(0x10 + key_length);

    let mut entry = vec![0u8; length];
    entry[0..8].copy_from_slice(&(record | 1 << 48).to_le_bytes());
    entry[8..10].copy_from_slice(&(length as u16).to_le_bytes());
    entry[10..12].copy_from_slice(&(key_length as u16).to_le_bytes());
    let key = &mut entry[0x10..];
    key[0..8].copy_from_slice(&5u64.to_le_bytes());
    key[0x40] = name.len() as u8;
    key[0x41] = 1;
    key[0x42..0x42 + name16.len()].copy_from_slice(&name16);
    entry
}

/// The closing entry of an index node, pointing at index block 0 if asked
fn end_entry(subnode: bool) -> Vec<u8> {
    let length = if subnode { 0x18 } else { 0x10 };
    let mut entry = vec![0u8; length];
    entry[8..10].copy_from_slice(&(length as u16).to_le_bytes());
    let flags: u16 = if subnode { 0x0003 } else { 0x0002 };
    entry[12..14].copy_from_slice(&flags.to_le_bytes());
    entry
}

/// Index header followed by `entries`, the header `header_gap` bytes before them
fn index_node(entries: &[u8], header_gap: usize, subnode: bool) -> Vec<u8> {
    let mut node = vec![0u8; header_gap];
    let used = (header_gap + entries.len()) as u32;
    node[0..4].copy_from_slice(&(header_gap as u32).to_le_bytes());
    node[4..8].copy_from_slice(&used.to_le_bytes());
    node[8..12].copy_from_slice(&used.to_le_bytes());
    node[12] = subnode as u8;
    node.extend_from_slice(entries);
    node
}

/// The root directory: `$INDEX_ROOT`, plus `$INDEX_ALLOCATION` when the
/// listing lives in an index block
fn root_directory(file: &File, opts: &NtfsOptions) -> Vec<u8> {
    let mut listing = index_entry(2, "$LogFile");
    if let Some(magic) = opts.hiberfile {
        listing.extend(index_entry(NTFS_HIBERFILE_RECORD, "hiberfil.sys"));

        let mut data = magic.to_vec();
        data.resize(16, 0);
        let record = mft_record(&resident(0x80, "", &data));
        write_at(file, ntfs_record_offset(NTFS_HIBERFILE_RECORD), &record);
    }
    listing.extend(end_entry(false));

    let mut root_value = vec![0u8; 0x10];
    root_value[0..4].copy_from_slice(&0x30u32.to_le_bytes());
    root_value[4..8].copy_from_slice(&1u32.to_le_bytes());
    root_value[8..12].copy_from_slice(&(NTFS_CLUSTER as u32).to_le_bytes());
    root_value[12] = 1;

    if !opts.hiberfile_in_subnode {
        root_value.extend(index_node(&listing, 0x10, false));
        return resident(0x90, "$I30", &root_value);
    }

    root_value.extend(index_node(&end_entry(true), 0x10, true));
    let mut block = vec![0u8; NTFS_CLUSTER as usize];
    block[0..4].copy_from_slice(b"INDX");
    let node = index_node(&listing, 0x28, false);
    block[0x18..0x18 + node.len()].copy_from_slice(&node);
    protect(&mut block, 0x28);
    write_at(file, NTFS_INDEX_LCN * NTFS_CLUSTER, &block);

    let mut attrs = resident(0x90, "$I30", &root_value);
    attrs.extend(non_resident(0xA0, "$I30", NTFS_INDEX_LCN, 1, NTFS_CLUSTER));
    attrs
}

fn logfile(state: LogState) -> Vec<u8> {
    let page = NTFS_CLUSTER as usize;
    if state == LogState::Reset {
        return vec![0xFF; page * 2];
    }

    let (in_use, flags): (u16, u16) = match state {
        LogState::Clean => (0, 0x0002),
        _ => (0, 0),
    };
    let mut log = vec![0u8; page * 2];
    for restart in log.chunks_exact_mut(page) {
        restart[0..4].copy_from_slice(b"RSTR");
        restart[0x10..0x14].copy_from_slice(&(page as u32).to_le_bytes());
        restart[0x14..0x18].copy_from_slice(&(page as u32).to_le_bytes());
        restart[0x18..0x1A].copy_from_slice(&0x30u16.to_le_bytes());
        restart[0x1A..0x1C].copy_from_slice(&1u16.to_le_bytes());
        restart[0x1C..0x1E].copy_from_slice(&1u16.to_le_bytes());
        restart[0x30 + 0x0C..0x30 + 0x0E].copy_from_slice(&in_use.to_le_bytes());
        restart[0x30 + 0x0E..0x30 + 0x10].copy_from_slice(&flags.to_le_bytes());
    }
    log
}

pub fn ntfs_record_offset(record: u64) -> u64 {
    NTFS_MFT_LCN * NTFS_CLUSTER + record * NTFS_RECORD as u64
}

/// A 4 MiB NTFS image with 4 KiB clusters
///
/// The MFT occupies clusters 4..12, `$Bitmap` 20, `$LogFile` 24..26, and
/// the root index block 26.
pub fn ntfs_image(path: &Path, opts: &NtfsOptions) {
    let file = File::create(path).unwrap();
    file.set_len(NTFS_CLUSTERS * NTFS_CLUSTER).unwrap();

    let mut boot = vec![0u8; 512];
    boot[3..11].copy_from_slice(b"NTFS    ");
    boot[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
    boot[0x0D] = (NTFS_CLUSTER / 512) as u8;
    boot[0x28..0x30].copy_from_slice(&(NTFS_CLUSTERS * NTFS_CLUSTER / 512).to_le_bytes());
    boot[0x30..0x38].copy_from_slice(&NTFS_MFT_LCN.to_le_bytes());
    boot[0x40] = (-10i8) as u8;
    boot[0x1FE..0x200].copy_from_slice(&[0x55, 0xAA]);
    write_at(&file, 0, &boot);

    let mft_bytes = NTFS_MFT_CLUSTERS * NTFS_CLUSTER;
    let mft = non_resident(0x80, "", NTFS_MFT_LCN, NTFS_MFT_CLUSTERS, mft_bytes);
    write_at(&file, ntfs_record_offset(0), &mft_record(&mft));

    let log = logfile(opts.log);
    let log_clusters = log.len() as u64 / NTFS_CLUSTER;
    let log_attr = non_resident(0x80, "", NTFS_LOGFILE_LCN, log_clusters, log.len() as u64);
    write_at(&file, ntfs_record_offset(2), &mft_record(&log_attr));
    write_at(&file, NTFS_LOGFILE_LCN * NTFS_CLUSTER, &log);

    let mut info = vec![0u8; 12];
    info[8] = opts.major;
    info[9] = opts.minor;
    info[10..12].copy_from_slice(&opts.volume_flags.to_le_bytes());
    write_at(&file, ntfs_record_offset(3), &mft_record(&resident(0x70, "", &info)));

    let root = root_directory(&file, opts);
    write_at(&file, ntfs_record_offset(5), &mft_record(&root));

    let bitmap_attr = non_resident(0x80, "", opts.bitmap_lcn, 1, opts.bitmap_bytes);
    write_at(&file, ntfs_record_offset(6), &mft_record(&bitmap_attr));

    let mut bitmap = vec![0u8; (NTFS_CLUSTERS / 8) as usize];
    for &(start, end) in &opts.used {
        for cluster in start..end {
            set_bit(&mut bitmap, cluster);
        }
    }
    write_at(&file, NTFS_BITMAP_LCN * NTFS_CLUSTER, &bitmap);
}

// ---------------------------------------------------------------------------
// swap

pub fn page_size() -> usize {
    system_page_size().unwrap()
}

/// A swap area of `pages` pages with a version-1 header
pub fn swap_image(path: &Path, pages: u32, bad_pages: u32) {
    let page = page_size();
    let file = File::create(path).unwrap();
    file.set_len(pages as u64 * page as u64).unwrap();

    let mut header = vec![0u8; page];
    header[1024..1028].copy_from_slice(&1u32.to_ne_bytes());
    header[1028..1032].copy_from_slice(&(pages - 1).to_ne_bytes());
    header[1032..1036].copy_from_slice(&bad_pages.to_ne_bytes());
    header[page - 10..].copy_from_slice(b"SWAPSPACE2");
    write_at(&file, 0, &header);
}
