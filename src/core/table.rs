//! Linear mapping table assembly
//!
//! Retained extents are sorted by device and start sector, then laid end to
//! end in virtual-offset space. Extents from different devices are never
//! interleaved: two "devices" may be partitions on the same spindle, and
//! keeping each device's contribution grouped preserves locality.

use crate::core::device::{DeviceId, DeviceRegistry};
use crate::core::extent::Extent;
use crate::core::selector::ExtentSelector;
use std::fmt::Write as _;

/// One linear target of the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRow {
    pub virtual_offset: u64,
    pub device: DeviceId,
    pub start_sector: u64,
    pub length_sectors: u64,
}

impl TableRow {
    /// First virtual sector past this row
    pub fn virtual_end(&self) -> u64 {
        self.virtual_offset + self.length_sectors
    }
}

/// The assembled mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    rows: Vec<TableRow>,
    smallest_extent_sectors: u64,
    total_sectors: u64,
}

impl MappingTable {
    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Length of the shortest row, or 0 for an empty table
    pub fn smallest_extent_sectors(&self) -> u64 {
        self.smallest_extent_sectors
    }

    /// Size of the virtual device
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Render in `dmsetup` table syntax, one linear target per line
    pub fn to_dm_table(&self, devices: &DeviceRegistry) -> String {
        let mut out = String::new();
        for row in &self.rows {
            // Writing to a String cannot fail
            let _ = writeln!(
                out,
                "{} {} linear {} {}",
                row.virtual_offset,
                row.length_sectors,
                devices.get(row.device).path().display(),
                row.start_sector
            );
        }
        out
    }
}

/// Builds a [`MappingTable`] from a finished selection
pub struct TableAssembler;

impl TableAssembler {
    /// Assemble the table from everything the selector retained
    pub fn build(selector: &ExtentSelector) -> MappingTable {
        Self::assemble(selector.retained().copied().collect())
    }

    /// Assemble the table from an arbitrary extent set
    ///
    /// The extents must not overlap; a sector mapped twice would be handed
    /// out twice.
    pub fn assemble(mut extents: Vec<Extent>) -> MappingTable {
        extents.sort_unstable();
        debug_assert!(
            extents.windows(2).all(|pair| !pair[0].overlaps(&pair[1])),
            "overlapping extents in mapping table"
        );

        let mut rows = Vec::with_capacity(extents.len());
        let mut offset = 0u64;
        let mut smallest = u64::MAX;

        for extent in &extents {
            rows.push(TableRow {
                virtual_offset: offset,
                device: extent.device,
                start_sector: extent.start_sector,
                length_sectors: extent.length_sectors,
            });
            offset += extent.length_sectors;
            smallest = smallest.min(extent.length_sectors);
        }

        MappingTable {
            rows,
            smallest_extent_sectors: if extents.is_empty() { 0 } else { smallest },
            total_sectors: offset,
        }
    }
}
