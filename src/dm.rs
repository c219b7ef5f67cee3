//! Device-mapper output
//!
//! The assembled table is handed to the kernel through `dmsetup`, one
//! `linear` target per row.

use crate::config::GatherConfig;
use crate::error::{GatherError, Result};
use crate::gather::Gathered;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::{debug, info, warn};

/// Destination for an assembled mapping table
pub trait MappingSink {
    /// Whether a mapped device called `name` already exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Create `name` from a table in dmsetup syntax
    fn create(&self, name: &str, table: &str) -> Result<()>;
}

/// [`MappingSink`] backed by the `dmsetup` command
#[derive(Debug, Clone)]
pub struct Dmsetup {
    program: PathBuf,
}

impl Default for Dmsetup {
    fn default() -> Self {
        Dmsetup {
            program: PathBuf::from("dmsetup"),
        }
    }
}

impl Dmsetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `dmsetup` binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Dmsetup {
            program: program.into(),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> GatherError {
        GatherError::DeviceMapper(format!("Couldn't run {}: {}", self.program.display(), e))
    }
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

impl MappingSink for Dmsetup {
    fn exists(&self, name: &str) -> Result<bool> {
        let output = Command::new(&self.program)
            .args(["info", name])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_text(&output);
        if stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(GatherError::DeviceMapper(format!(
                "Couldn't query device {}: {}",
                name, stderr
            )))
        }
    }

    fn create(&self, name: &str, table: &str) -> Result<()> {
        debug!("Creating {} with {} targets", name, table.lines().count());
        let mut child = Command::new(&self.program)
            .args(["create", name])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(table.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(GatherError::DeviceMapper(format!(
                "Couldn't create device: {}",
                stderr_text(&output)
            )));
        }
        Ok(())
    }
}

/// What became of the mapped device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Less space was accepted than `min_size_mb` asks for
    TooSmall,
    /// Dry run; nothing was created
    DryRun,
    Created,
}

/// Apply the minimum-size gate, then create `name` unless this is a dry run
pub fn publish(
    sink: &dyn MappingSink,
    name: &str,
    gathered: &Gathered,
    config: &GatherConfig,
) -> Result<Outcome> {
    let accepted_mb = gathered.accepted_sectors() >> 11;
    if config.min_size_mb > 0 && accepted_mb < config.min_size_mb {
        warn!("Minimum size requirement not met, aborting");
        return Ok(Outcome::TooSmall);
    }
    if config.dry_run {
        info!("Test mode, not creating device");
        return Ok(Outcome::DryRun);
    }

    sink.create(name, &gathered.dm_table())?;
    info!("Created device {}", name);
    Ok(Outcome::Created)
}
