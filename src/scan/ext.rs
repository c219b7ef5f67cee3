//! ext2/3/4 block-bitmap scanner
//!
//! Reads the superblock and group descriptor table, assembles the per-group
//! block bitmaps into one bitmap covering
//! `[s_first_data_block, s_blocks_count)`, and walks its clear runs.
//!
//! Groups flagged `BLOCK_UNINIT` have no bitmap on disk. Their bitmap is
//! synthesised from the metadata known to live in the group, the same way
//! e2fsprogs does.

use super::bitmap::{set_bits, BitmapRuns};
use super::FilesystemKind;
use crate::core::extent::SECTOR_SIZE;
use crate::error::ScanError;
use crate::io::{le_u16, le_u32, DeviceReader};
use tracing::debug;

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const MAGIC: u16 = 0xEF53;

// s_state
const STATE_VALID: u16 = 0x0001;
const STATE_ERROR: u16 = 0x0002;

// s_feature_compat
const COMPAT_HAS_JOURNAL: u32 = 0x0004;
const COMPAT_SPARSE_SUPER2: u32 = 0x0200;

// s_feature_incompat
const INCOMPAT_COMPRESSION: u32 = 0x0001;
const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_RECOVER: u32 = 0x0004;
const INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
const INCOMPAT_META_BG: u32 = 0x0010;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_64BIT: u32 = 0x0080;
const INCOMPAT_MMP: u32 = 0x0100;
const INCOMPAT_FLEX_BG: u32 = 0x0200;
const INCOMPAT_EA_INODE: u32 = 0x0400;
const INCOMPAT_DIRDATA: u32 = 0x1000;
const INCOMPAT_CSUM_SEED: u32 = 0x2000;
const INCOMPAT_LARGEDIR: u32 = 0x4000;
const INCOMPAT_INLINE_DATA: u32 = 0x8000;
const INCOMPAT_ENCRYPT: u32 = 0x10000;
const INCOMPAT_CASEFOLD: u32 = 0x20000;

/// Incompatible features whose on-disk layout the scanner understands
const INCOMPAT_SUPPORTED: u32 = INCOMPAT_FILETYPE
    | INCOMPAT_RECOVER
    | INCOMPAT_META_BG
    | INCOMPAT_EXTENTS
    | INCOMPAT_64BIT
    | INCOMPAT_MMP
    | INCOMPAT_FLEX_BG
    | INCOMPAT_EA_INODE
    | INCOMPAT_DIRDATA
    | INCOMPAT_CSUM_SEED
    | INCOMPAT_LARGEDIR
    | INCOMPAT_INLINE_DATA
    | INCOMPAT_ENCRYPT
    | INCOMPAT_CASEFOLD;

/// Features beyond these mark a filesystem as ext4 rather than ext3
const EXT3_INCOMPAT: u32 = INCOMPAT_FILETYPE | INCOMPAT_RECOVER | INCOMPAT_META_BG;
const EXT3_RO_COMPAT: u32 = RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE | RO_COMPAT_BTREE_DIR;

// s_feature_ro_compat
const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
const RO_COMPAT_LARGE_FILE: u32 = 0x0002;
const RO_COMPAT_BTREE_DIR: u32 = 0x0004;
const RO_COMPAT_GDT_CSUM: u32 = 0x0010;
const RO_COMPAT_BIGALLOC: u32 = 0x0200;
const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

// bg_flags
const BG_BLOCK_UNINIT: u16 = 0x0002;

const DESC_SIZE: usize = 32;
const MIN_DESC_SIZE_64BIT: usize = 64;
const MAX_LOG_BLOCK_SIZE: u32 = 6;

/// Parsed ext superblock fields needed to locate the block bitmaps
#[derive(Debug, Clone)]
pub struct Superblock {
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub state: u16,
    pub rev_level: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub reserved_gdt_blocks: u16,
    pub desc_size: u16,
    pub backup_bgs: [u32; 2],
}

impl Superblock {
    /// Parse the 1024-byte superblock region
    ///
    /// Only structural problems are reported here. State flags are checked
    /// separately so the caller can give a precise reason.
    pub fn parse(bytes: &[u8]) -> Result<Self, ScanError> {
        if bytes.len() < SUPERBLOCK_SIZE || le_u16(bytes, 56) != MAGIC {
            return Err(ScanError::ReadFilesystem);
        }

        let feature_incompat = le_u32(bytes, 96);
        let mut blocks_count = le_u32(bytes, 4) as u64;
        if feature_incompat & INCOMPAT_64BIT != 0 {
            blocks_count |= (le_u32(bytes, 336) as u64) << 32;
        }

        let sb = Superblock {
            blocks_count,
            first_data_block: le_u32(bytes, 20),
            log_block_size: le_u32(bytes, 24),
            blocks_per_group: le_u32(bytes, 32),
            inodes_per_group: le_u32(bytes, 40),
            state: le_u16(bytes, 58),
            rev_level: le_u32(bytes, 76),
            inode_size: le_u16(bytes, 88),
            feature_compat: le_u32(bytes, 92),
            feature_incompat,
            feature_ro_compat: le_u32(bytes, 100),
            reserved_gdt_blocks: le_u16(bytes, 206),
            desc_size: le_u16(bytes, 254),
            backup_bgs: [le_u32(bytes, 588), le_u32(bytes, 592)],
        };
        sb.check_geometry()?;
        Ok(sb)
    }

    fn check_geometry(&self) -> Result<(), ScanError> {
        if self.log_block_size > MAX_LOG_BLOCK_SIZE || self.rev_level > 1 {
            return Err(ScanError::ReadFilesystem);
        }
        if self.feature_incompat & (INCOMPAT_COMPRESSION | INCOMPAT_JOURNAL_DEV) != 0
            || self.feature_incompat & !INCOMPAT_SUPPORTED != 0
        {
            return Err(ScanError::ReadFilesystem);
        }
        let bits_per_block = self.block_size() * 8;
        if self.blocks_per_group == 0
            || self.blocks_per_group > bits_per_block
            || self.blocks_per_group % 8 != 0
        {
            return Err(ScanError::ReadFilesystem);
        }
        if self.blocks_count <= self.first_data_block as u64 {
            return Err(ScanError::ReadFilesystem);
        }
        if self.group_count_u64() > u32::MAX as u64 {
            return Err(ScanError::ReadFilesystem);
        }
        if self.inodes_per_group > bits_per_block
            || self.inode_size() < 128
            || self.inode_size() > self.block_size()
            || !self.inode_size().is_power_of_two()
        {
            return Err(ScanError::ReadFilesystem);
        }
        if self.is_64bit() && (self.desc_size as usize) < MIN_DESC_SIZE_64BIT {
            return Err(ScanError::ReadFilesystem);
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn desc_size(&self) -> usize {
        if self.is_64bit() {
            self.desc_size as usize
        } else {
            DESC_SIZE
        }
    }

    /// Number of block groups; `parse` guarantees it fits in a `u32`
    pub fn group_count(&self) -> u32 {
        self.group_count_u64() as u32
    }

    fn group_count_u64(&self) -> u64 {
        let data_blocks = self.blocks_count - self.first_data_block as u64;
        data_blocks.div_ceil(self.blocks_per_group as u64)
    }

    /// Blocks in group `group`; the last group may be short
    pub fn blocks_in_group(&self, group: u32) -> u64 {
        let start = self.group_first_block(group);
        (self.blocks_count - start).min(self.blocks_per_group as u64)
    }

    pub fn group_first_block(&self, group: u32) -> u64 {
        self.first_data_block as u64 + group as u64 * self.blocks_per_group as u64
    }

    /// Blocks occupied by the group descriptor table
    pub fn gdt_blocks(&self) -> u64 {
        (self.group_count() as u64 * self.desc_size() as u64).div_ceil(self.block_size() as u64)
    }

    pub fn inode_size(&self) -> u32 {
        if self.rev_level == 0 {
            128
        } else {
            self.inode_size as u32
        }
    }

    pub fn inode_table_blocks(&self) -> u64 {
        (self.inodes_per_group as u64 * self.inode_size() as u64)
            .div_ceil(self.block_size() as u64)
    }

    /// Whether group `group` carries a superblock backup
    pub fn has_super(&self, group: u32) -> bool {
        if group == 0 {
            return true;
        }
        if self.feature_compat & COMPAT_SPARSE_SUPER2 != 0 {
            return group == self.backup_bgs[0] || group == self.backup_bgs[1];
        }
        if self.feature_ro_compat & RO_COMPAT_SPARSE_SUPER == 0 || group == 1 {
            return true;
        }
        [3u32, 5, 7].iter().any(|&base| is_power_of(group, base))
    }

    /// Whether `BLOCK_UNINIT` flags are trustworthy on this filesystem
    fn has_group_csums(&self) -> bool {
        self.feature_ro_compat & (RO_COMPAT_GDT_CSUM | RO_COMPAT_METADATA_CSUM) != 0
    }

    /// The blkid-style type name for this superblock
    pub fn kind(&self) -> FilesystemKind {
        if self.feature_incompat & !EXT3_INCOMPAT != 0
            || self.feature_ro_compat & !EXT3_RO_COMPAT != 0
        {
            FilesystemKind::Ext4
        } else if self.feature_compat & COMPAT_HAS_JOURNAL != 0 {
            FilesystemKind::Ext3
        } else {
            FilesystemKind::Ext2
        }
    }
}

fn is_power_of(mut n: u32, base: u32) -> bool {
    while n > 1 && n % base == 0 {
        n /= base;
    }
    n == 1
}

/// One block group descriptor
#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub flags: u16,
}

impl GroupDesc {
    pub fn parse(bytes: &[u8], desc_size: usize) -> Self {
        let mut desc = GroupDesc {
            block_bitmap: le_u32(bytes, 0) as u64,
            inode_bitmap: le_u32(bytes, 4) as u64,
            inode_table: le_u32(bytes, 8) as u64,
            flags: le_u16(bytes, 18),
        };
        if desc_size >= MIN_DESC_SIZE_64BIT {
            desc.block_bitmap |= (le_u32(bytes, 32) as u64) << 32;
            desc.inode_bitmap |= (le_u32(bytes, 36) as u64) << 32;
            desc.inode_table |= (le_u32(bytes, 40) as u64) << 32;
        }
        desc
    }

    fn is_block_uninit(&self) -> bool {
        self.flags & BG_BLOCK_UNINIT != 0
    }
}

/// Identify an ext superblock in a probe buffer starting at device offset 0
pub fn identify(probe: &[u8]) -> Option<FilesystemKind> {
    let start = SUPERBLOCK_OFFSET as usize;
    let region = probe.get(start..start + SUPERBLOCK_SIZE)?;
    if le_u16(region, 56) != MAGIC || le_u32(region, 96) & INCOMPAT_JOURNAL_DEV != 0 {
        return None;
    }
    Superblock::parse(region).ok().map(|sb| sb.kind())
}

/// Open an ext2/3/4 filesystem and return its free block runs in sectors
///
/// A filesystem claiming more blocks than `total_sectors` can hold is
/// treated as unreadable.
pub fn scan(reader: &DeviceReader, total_sectors: u64) -> Result<BitmapRuns, ScanError> {
    let sb_bytes = reader
        .read_vec(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)
        .map_err(|_| ScanError::ReadFilesystem)?;
    let sb = Superblock::parse(&sb_bytes)?;
    let block_sectors = sb.block_size() as u64 / SECTOR_SIZE;
    if sb.blocks_count > total_sectors / block_sectors {
        return Err(ScanError::ReadFilesystem);
    }

    if sb.state & STATE_ERROR != 0 {
        return Err(ScanError::FilesystemErrors);
    }
    if sb.state & STATE_VALID == 0 {
        return Err(ScanError::Unclean);
    }
    if sb.feature_ro_compat & RO_COMPAT_BIGALLOC != 0 {
        return Err(ScanError::UnsupportedFeature("bigalloc"));
    }
    if sb.feature_incompat & INCOMPAT_META_BG != 0 {
        return Err(ScanError::UnsupportedFeature("meta_bg"));
    }

    let groups = read_group_descs(reader, &sb)?;
    let bitmap = read_block_bitmap(reader, &sb, &groups)?;

    debug!(
        "{}: {} blocks of {} bytes in {} groups",
        reader.path().display(),
        sb.blocks_count,
        sb.block_size(),
        groups.len()
    );

    Ok(BitmapRuns::new(
        bitmap,
        sb.blocks_count - sb.first_data_block as u64,
        sb.first_data_block as u64,
        block_sectors,
    ))
}

fn read_group_descs(reader: &DeviceReader, sb: &Superblock) -> Result<Vec<GroupDesc>, ScanError> {
    let desc_size = sb.desc_size();
    let gdt_offset = (sb.first_data_block as u64 + 1) * sb.block_size() as u64;
    let gdt_len = sb.group_count() as usize * desc_size;
    let gdt = reader
        .read_vec(gdt_offset, gdt_len)
        .map_err(|_| ScanError::ReadFilesystem)?;

    Ok(gdt
        .chunks_exact(desc_size)
        .map(|chunk| GroupDesc::parse(chunk, desc_size))
        .collect())
}

/// Concatenate every group's bitmap into one, bit `i` describing block
/// `s_first_data_block + i`
fn read_block_bitmap(
    reader: &DeviceReader,
    sb: &Superblock,
    groups: &[GroupDesc],
) -> Result<Vec<u8>, ScanError> {
    let total_bits = sb.blocks_count - sb.first_data_block as u64;
    if (groups.len() as u64) * (sb.blocks_per_group as u64) < total_bits {
        return Err(ScanError::ReadFilesystem);
    }
    let mut bitmap = vec![0u8; total_bits.div_ceil(8) as usize];
    let block_size = sb.block_size() as u64;
    let group_bytes = sb.blocks_per_group as usize / 8;
    let trust_uninit = sb.has_group_csums();

    for (group, desc) in groups.iter().enumerate() {
        if trust_uninit && desc.is_block_uninit() {
            continue;
        }

        let blocks = sb.blocks_in_group(group as u32);
        let dest_start = group * group_bytes;
        let dest_len = blocks.div_ceil(8) as usize;
        if desc.block_bitmap >= sb.blocks_count {
            return Err(ScanError::ReadBlockBitmap);
        }
        reader
            .read_exact_at(
                desc.block_bitmap * block_size,
                &mut bitmap[dest_start..dest_start + dest_len],
            )
            .map_err(|_| ScanError::ReadBlockBitmap)?;
    }

    if trust_uninit {
        mark_uninit_groups(sb, groups, &mut bitmap);
    }
    Ok(bitmap)
}

/// Synthesise the bitmaps of all `BLOCK_UNINIT` groups
///
/// Such a group has only metadata in use: its own superblock backup and
/// descriptor table, plus any bitmaps and inode tables placed there. With
/// flex_bg those can belong to any group, so every descriptor is visited
/// once and its metadata is marked wherever it lands in an uninit group.
fn mark_uninit_groups(sb: &Superblock, groups: &[GroupDesc], bitmap: &mut [u8]) {
    let uninit: Vec<bool> = groups.iter().map(GroupDesc::is_block_uninit).collect();
    if !uninit.contains(&true) {
        return;
    }

    let super_blocks = 1 + sb.gdt_blocks() + sb.reserved_gdt_blocks as u64;
    for (group, _) in uninit.iter().enumerate().filter(|(_, &u)| u) {
        let group = group as u32;
        if sb.has_super(group) {
            mark_in_uninit(sb, &uninit, bitmap, sb.group_first_block(group), super_blocks);
        }
    }

    let inode_table_blocks = sb.inode_table_blocks();
    for desc in groups {
        mark_in_uninit(sb, &uninit, bitmap, desc.block_bitmap, 1);
        mark_in_uninit(sb, &uninit, bitmap, desc.inode_bitmap, 1);
        mark_in_uninit(sb, &uninit, bitmap, desc.inode_table, inode_table_blocks);
    }
}

/// Mark `[start, start + count)` in use where it falls inside an uninit group
fn mark_in_uninit(sb: &Superblock, uninit: &[bool], bitmap: &mut [u8], start: u64, count: u64) {
    let base = sb.first_data_block as u64;
    let per_group = sb.blocks_per_group as u64;
    let end = start.saturating_add(count).min(sb.blocks_count);

    let mut block = start.max(base);
    while block < end {
        let group = (block - base) / per_group;
        let group_end = (base + (group + 1) * per_group).min(end);
        if uninit.get(group as usize) == Some(&true) {
            set_bits(bitmap, block - base, group_end - block);
        }
        block = group_end;
    }
}
