//! Gathering options
//!
//! Options come from three layers, later ones winning: built-in defaults,
//! an optional TOML file, then command-line flags.

use crate::error::{GatherError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Options controlling which free space is gathered
///
/// # Examples
///
/// ```
/// use freespace_rs::GatherConfig;
///
/// let config = GatherConfig::from_toml_str("min_extent_kb = 1024\nexclude = [\"/dev/sda1\"]").unwrap();
/// assert_eq!(config.min_extent_sectors(), 2048);
/// assert_eq!(config.max_extent_count, 100_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatherConfig {
    /// Smallest virtual device worth creating, in MiB; 0 disables the check
    pub min_size_mb: u64,

    /// Shortest free run kept, in KiB
    pub min_extent_kb: u64,

    /// Most extents the mapping table may hold
    pub max_extent_count: usize,

    /// Devices never scanned
    pub exclude: Vec<PathBuf>,

    /// Do everything except create the device
    pub dry_run: bool,

    /// Write every examined run to stdout
    pub dump_extents: bool,
}

impl Default for GatherConfig {
    fn default() -> Self {
        GatherConfig {
            min_size_mb: 4,
            min_extent_kb: 4096,
            max_extent_count: 100_000,
            exclude: Vec::new(),
            dry_run: false,
            dump_extents: false,
        }
    }
}

impl GatherConfig {
    /// Load options from a TOML file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| GatherError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: GatherConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_extent_count == 0 {
            return Err(GatherError::Config(
                "--max-extent-count must be at least 1.".to_string(),
            ));
        }
        if self.min_extent_kb.checked_mul(2).is_none() {
            return Err(GatherError::Config(format!(
                "--min-extent-size {} KB is out of range.",
                self.min_extent_kb
            )));
        }
        Ok(())
    }

    /// Selector capacity
    pub fn capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.max_extent_count).ok_or_else(|| {
            GatherError::Config("--max-extent-count must be at least 1.".to_string())
        })
    }

    /// Extent floor in sectors; saturates for sizes `validate` rejects
    pub fn min_extent_sectors(&self) -> u64 {
        self.min_extent_kb.saturating_mul(2)
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|p| p == path)
    }
}
