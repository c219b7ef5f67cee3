//! Extent selection and table assembly
//!
//! Scanners feed runs into an [`ExtentSelector`](selector::ExtentSelector),
//! which keeps the largest `K` of them. [`TableAssembler`](table::TableAssembler)
//! then lays the survivors out as a gapless linear mapping.

pub mod device;
pub mod extent;
pub mod selector;
pub mod table;

pub use device::{Device, DeviceId, DeviceRegistry};
pub use extent::{Extent, Run, SECTOR_SIZE};
pub use selector::ExtentSelector;
pub use table::{MappingTable, TableAssembler, TableRow};
