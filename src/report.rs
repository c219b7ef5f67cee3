//! Per-device statistics and the summary report
//!
//! The report lists rejected devices first, then every device that had free
//! space, followed by the size of the smallest mapped extent. It renders as
//! YAML (the tool's traditional format) or JSON.

use crate::core::Device;
use crate::error::{GatherError, Result};
use crate::gather::{Gathered, Rejection};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Yaml,
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(ReportFormat::Yaml),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!(
                "Invalid report format '{}'. Valid options: yaml, json",
                s
            )),
        }
    }
}

/// One device entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceReport {
    pub device: String,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_kb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_extents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_extents: Option<u64>,
}

impl DeviceReport {
    fn rejected(rejection: &Rejection) -> Self {
        DeviceReport {
            device: rejection.path.display().to_string(),
            error: true,
            problem: Some(rejection.reason.to_string()),
            filesystem: rejection.fstype.clone(),
            size_kb: rejection.total_sectors.filter(|&s| s > 0).map(|s| s / 2),
            free_kb: None,
            accepted_kb: None,
            free_extents: None,
            accepted_extents: None,
        }
    }

    fn scanned(device: &Device) -> Self {
        DeviceReport {
            device: device.path().display().to_string(),
            error: false,
            problem: None,
            filesystem: Some(device.fstype().to_string()),
            size_kb: Some(device.total_sectors() / 2),
            free_kb: Some(device.free_sectors() / 2),
            accepted_kb: Some(device.accepted_sectors() / 2),
            free_extents: Some(device.free_extent_count()),
            accepted_extents: Some(device.accepted_extent_count()),
        }
    }

    /// Fields in output order, skipping absent ones
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("error", self.error.to_string())];
        let optional = [
            ("problem", self.problem.clone()),
            ("filesystem", self.filesystem.clone()),
            ("size-kb", self.size_kb.map(|v| v.to_string())),
            ("free-kb", self.free_kb.map(|v| v.to_string())),
            ("accepted-kb", self.accepted_kb.map(|v| v.to_string())),
            ("free-extents", self.free_extents.map(|v| v.to_string())),
            ("accepted-extents", self.accepted_extents.map(|v| v.to_string())),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v))),
        );
        fields
    }
}

/// The full report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Report {
    pub devices: Vec<DeviceReport>,
    pub smallest_extent_kb: u64,
}

impl Report {
    pub fn from_gathered(gathered: &Gathered) -> Self {
        let mut devices: Vec<DeviceReport> = gathered
            .rejections
            .iter()
            .map(DeviceReport::rejected)
            .collect();
        devices.extend(
            gathered
                .devices
                .iter()
                .filter(|d| d.free_sectors() > 0)
                .map(DeviceReport::scanned),
        );

        Report {
            devices,
            smallest_extent_kb: gathered.table.smallest_extent_sectors() / 2,
        }
    }

    /// Render as YAML, two spaces per nesting level
    pub fn to_yaml(&self) -> String {
        let mut out = String::from("devices:\n");
        for device in &self.devices {
            let _ = writeln!(out, "  - device: {}", yaml_scalar(&device.device));
            for (key, value) in device.fields() {
                let _ = writeln!(out, "    {}: {}", key, yaml_scalar(&value));
            }
        }
        let _ = writeln!(out, "smallest-extent-kb: {}", self.smallest_extent_kb);
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Yaml => Ok(self.to_yaml()),
            ReportFormat::Json => self.to_json().map(|mut json| {
                json.push('\n');
                json
            }),
        }
    }

    /// Write to `dest`, where `-` means stdout
    pub fn write_to(&self, dest: &Path, format: ReportFormat) -> Result<()> {
        let text = self.render(format)?;
        if dest == Path::new("-") {
            let mut stdout = io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            return Ok(());
        }
        fs::write(dest, text).map_err(|e| {
            GatherError::Io(io::Error::new(
                e.kind(),
                format!("{}: {}", dest.display(), e),
            ))
        })
    }
}

/// Log the per-device and total summary lines
pub fn log_summary(gathered: &Gathered) {
    for device in gathered.devices.iter().filter(|d| d.free_sectors() > 0) {
        info!("{}", device_summary(device));
    }
    info!("{}", total_summary(gathered));
}

/// `<path> (<fstype>): accepted/free/size MB, accepted/free extents`
pub fn device_summary(device: &Device) -> String {
    format!(
        "{} ({}): {}/{}/{} MB, {}/{} extents",
        device.path().display(),
        device.fstype(),
        device.accepted_sectors() >> 11,
        device.free_sectors() >> 11,
        device.total_sectors() >> 11,
        device.accepted_extent_count(),
        device.free_extent_count()
    )
}

pub fn total_summary(gathered: &Gathered) -> String {
    format!(
        "Total accepted: {} MB, {} extents, smallest {} KB",
        gathered.accepted_sectors() >> 11,
        gathered.table.len(),
        gathered.table.smallest_extent_sectors() >> 1
    )
}

/// Quote a scalar only when plain style would change its meaning
fn yaml_scalar(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains(": ")
        || value.contains(" #")
        || value.ends_with(':')
        || value.starts_with(|c: char| "-?:,[]{}#&*!|>'\"%@`".contains(c) || c.is_whitespace())
        || value.ends_with(char::is_whitespace);
    if !needs_quotes {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
