//! Gathering driver
//!
//! Walks the candidate devices in path order, rejects the ones that are
//! unsafe or unreadable, and feeds the free runs of the rest through one
//! [`ExtentSelector`]. The table is assembled once, after the last device.

use crate::config::GatherConfig;
use crate::core::{DeviceRegistry, ExtentSelector, MappingTable, TableAssembler};
use crate::error::{Result, ScanError};
use crate::probe::{self, Candidate};
use crate::safety::{self, MountTable};
use crate::scan::FilesystemKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A device that contributed nothing, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub path: PathBuf,
    pub fstype: Option<String>,
    pub total_sectors: Option<u64>,
    pub reason: ScanError,
}

/// Outcome of a gathering pass
#[derive(Debug, Clone)]
pub struct Gathered {
    pub table: MappingTable,
    pub devices: DeviceRegistry,
    pub rejections: Vec<Rejection>,
}

impl Gathered {
    /// Total sectors retained across all devices
    pub fn accepted_sectors(&self) -> u64 {
        self.devices.accepted_sectors()
    }

    /// The dm table text for the retained extents
    pub fn dm_table(&self) -> String {
        self.table.to_dm_table(&self.devices)
    }
}

/// Drives probing, safety checks, and scanning
pub struct Gatherer {
    config: GatherConfig,
    selector: ExtentSelector,
    mounts: Option<MountTable>,
    dump: Option<Box<dyn Write>>,
    rejections: Vec<Rejection>,
}

impl Gatherer {
    /// Create a gatherer using the live mount and swap tables
    ///
    /// If the tables can't be read, every device is rejected rather than
    /// scanned blind.
    pub fn new(config: GatherConfig) -> Result<Self> {
        let mounts = match MountTable::load() {
            Ok(table) => Some(table),
            Err(e) => {
                warn!("Couldn't read mount table: {}", e);
                None
            }
        };
        Self::with_mount_table(config, mounts)
    }

    pub fn with_mount_table(config: GatherConfig, mounts: Option<MountTable>) -> Result<Self> {
        config.validate()?;
        let selector = ExtentSelector::new(config.capacity()?, config.min_extent_sectors());
        Ok(Gatherer {
            config,
            selector,
            mounts,
            dump: None,
            rejections: Vec::new(),
        })
    }

    /// Write every examined run to `out` as `<path> <start> <length>`
    pub fn with_dump(mut self, out: Box<dyn Write>) -> Self {
        self.dump = Some(out);
        self
    }

    /// Scan `paths`, or every recognisable block device if `paths` is empty
    pub fn run(mut self, paths: &[PathBuf]) -> Result<Gathered> {
        let candidates = self.candidates(paths)?;
        for candidate in &candidates {
            self.scan_device(candidate)?;
        }
        if let Some(out) = self.dump.as_mut() {
            out.flush()?;
        }

        let table = TableAssembler::build(&self.selector);
        let (_, devices) = self.selector.into_parts();
        Ok(Gathered {
            table,
            devices,
            rejections: self.rejections,
        })
    }

    /// Probe and order the devices to scan
    fn candidates(&mut self, paths: &[PathBuf]) -> Result<Vec<Candidate>> {
        let mut candidates = if paths.is_empty() {
            probe::enumerate_devices()?
        } else {
            let mut found = Vec::with_capacity(paths.len());
            for path in paths {
                match probe::probe_device(path) {
                    Ok(fstype) => found.push(Candidate {
                        path: path.clone(),
                        fstype,
                    }),
                    Err(reason) => self.reject(path, None, None, reason),
                }
            }
            found
        };

        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        candidates.dedup_by(|a, b| a.path == b.path);
        candidates.retain(|c| !self.config.is_excluded(&c.path));
        Ok(candidates)
    }

    fn scan_device(&mut self, candidate: &Candidate) -> Result<()> {
        let path = candidate.path.as_path();
        let fstype = candidate.fstype.as_str();

        let total_sectors = match safety::query_size(path) {
            Ok(sectors) => sectors,
            Err(reason) => {
                self.reject(path, Some(fstype), None, reason);
                return Ok(());
            }
        };

        let usage = match &self.mounts {
            Some(mounts) => safety::check_usage(mounts, path),
            None => Err(ScanError::MountStatus),
        };
        if let Err(reason) = usage {
            self.reject(path, Some(fstype), Some(total_sectors), reason);
            return Ok(());
        }

        let Some(kind) = FilesystemKind::from_fstype(fstype) else {
            let reason = ScanError::UnknownFilesystem(fstype.to_string());
            self.reject(path, Some(fstype), Some(total_sectors), reason);
            return Ok(());
        };

        debug!("{}: Detected {}", path.display(), kind);
        let runs = match kind.scanner(path, total_sectors) {
            Ok(runs) => runs,
            Err(reason) => {
                self.reject(path, Some(fstype), Some(total_sectors), reason);
                return Ok(());
            }
        };

        let device = self.selector.register_device(path, fstype, total_sectors);
        for run in runs {
            if let Some(out) = self.dump.as_mut() {
                writeln!(out, "{} {} {}", path.display(), run.start_sector, run.length_sectors)?;
            }
            self.selector.accept(device, run.start_sector, run.length_sectors);
        }

        let scanned = self.selector.device(device);
        debug!(
            "{}: {} free sectors in {} runs",
            path.display(),
            scanned.free_sectors(),
            scanned.free_extent_count()
        );
        Ok(())
    }

    fn reject(
        &mut self,
        path: &Path,
        fstype: Option<&str>,
        total_sectors: Option<u64>,
        reason: ScanError,
    ) {
        debug!("{}: {}, skipping", path.display(), reason);
        self.rejections.push(Rejection {
            path: path.to_path_buf(),
            fstype: fstype.map(str::to_string),
            total_sectors,
            reason,
        });
    }
}
