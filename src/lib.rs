//! # freespace-rs - Gather Free Disk Space into One Block Device
//!
//! `freespace-rs` inventories unused space on ext2/3/4, NTFS, and swap
//! devices and stitches it together into a single device-mapper `linear`
//! device:
//!
//! - **Scanners** read each filesystem's allocation bitmap and emit free runs
//! - **Selection** keeps only the largest `max_extent_count` runs, so the
//!   kernel's mapping table stays bounded
//! - **Assembly** orders the survivors by device and sector and lays them
//!   out back to back
//!
//! Devices that are mounted read-write, in use as swap, busy, dirty, or of an
//! unsupported type are skipped with a reason.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use freespace_rs::{GatherConfig, Gatherer, Report, Result};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<()> {
//! let config = GatherConfig {
//!     dry_run: true,
//!     ..Default::default()
//! };
//! let gathered = Gatherer::new(config)?.run(&[PathBuf::from("/dev/sdb1")])?;
//!
//! print!("{}", gathered.dm_table());
//! print!("{}", Report::from_gathered(&gathered).to_yaml());
//! # Ok(())
//! # }
//! ```
//!
//! ## Using the selector directly
//!
//! ```rust
//! use freespace_rs::{ExtentSelector, TableAssembler};
//! use std::num::NonZeroUsize;
//!
//! let mut selector = ExtentSelector::new(NonZeroUsize::new(2).unwrap(), 8);
//! let dev = selector.register_device("/dev/sda1", "ext4", 1 << 20);
//! selector.accept(dev, 0, 64);
//! selector.accept(dev, 512, 4); // below the minimum
//! selector.accept(dev, 1024, 128);
//! selector.accept(dev, 4096, 32); // shorter than everything retained
//!
//! let table = TableAssembler::build(&selector);
//! assert_eq!(table.total_sectors(), 192);
//! assert_eq!(table.smallest_extent_sectors(), 64);
//! ```

pub mod config;
pub mod core;
pub mod dm;
pub mod error;
pub mod gather;
pub mod io;
pub mod probe;
pub mod report;
pub mod safety;
pub mod scan;

pub use crate::config::GatherConfig;
pub use crate::core::{
    Device, DeviceId, DeviceRegistry, Extent, ExtentSelector, MappingTable, Run, TableAssembler,
    TableRow, SECTOR_SIZE,
};
pub use crate::dm::{publish, Dmsetup, MappingSink, Outcome};
pub use crate::error::{GatherError, Result, ScanError};
pub use crate::gather::{Gathered, Gatherer, Rejection};
pub use crate::report::{Report, ReportFormat};
pub use crate::scan::{FilesystemKind, FreeRuns};
