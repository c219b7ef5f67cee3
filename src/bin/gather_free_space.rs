//! gather-free-space
//!
//! Collects free disk space into a device-mapper node.

use anyhow::{Context, Result};
use clap::Parser;
use freespace_rs::safety;
use freespace_rs::{
    publish, report, Dmsetup, GatherConfig, GatherError, Gatherer, MappingSink, Outcome, Report,
    ReportFormat,
};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gather-free-space")]
#[command(about = "Collects free disk space into a device-mapper node.")]
struct Args {
    /// Name of the device-mapper node to create
    node: String,

    /// Devices to scan [default: every block device with a known signature]
    devices: Vec<PathBuf>,

    /// Skip the specified device
    #[arg(short = 'x', long, value_name = "DEVICE")]
    exclude: Vec<PathBuf>,

    /// Minimum size for new device
    #[arg(short = 'm', long = "min", value_name = "MB")]
    min_size: Option<u64>,

    /// Minimum length of free space extent
    #[arg(short = 'e', long = "min-extent-size", value_name = "KB")]
    min_extent_size: Option<u64>,

    /// Maximum number of free space extents
    #[arg(short = 'E', long, value_name = "N")]
    max_extent_count: Option<usize>,

    /// Do everything except create the device
    #[arg(short = 't', long)]
    test: bool,

    /// Suppress summary information
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Be verbose
    #[arg(short, long)]
    verbose: bool,

    /// Write summary report to FILE ("-" for stdout)
    #[arg(short, long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Report format (yaml, json)
    #[arg(long, default_value = "yaml")]
    report_format: ReportFormat,

    /// Log every examined extent to stdout
    #[arg(short, long)]
    dump: bool,

    /// Read options from a TOML file; flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Args {
    fn gather_config(&self) -> Result<GatherConfig> {
        let mut config = match &self.config {
            Some(path) => GatherConfig::load(path)
                .with_context(|| format!("Couldn't load {}", path.display()))?,
            None => GatherConfig::default(),
        };

        if let Some(mb) = self.min_size {
            config.min_size_mb = mb;
        }
        if let Some(kb) = self.min_extent_size {
            config.min_extent_kb = kb;
        }
        if let Some(count) = self.max_extent_count {
            config.max_extent_count = count;
        }
        config.exclude.extend(self.exclude.iter().cloned());
        config.dry_run |= self.test;
        config.dump_extents |= self.dump;

        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level())),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config = args.gather_config()?;

    // Image files can be dry-run without privileges
    if !config.dry_run && !safety::is_root() {
        return Err(GatherError::NotRoot.into());
    }

    let dm = Dmsetup::new();
    match dm.exists(&args.node) {
        Ok(true) => return Err(GatherError::NodeExists(args.node.clone()).into()),
        Ok(false) => {}
        Err(e) if config.dry_run => warn!("{}", e),
        Err(e) => return Err(e.into()),
    }

    let mut gatherer = Gatherer::new(config.clone())?;
    if config.dump_extents {
        gatherer = gatherer.with_dump(Box::new(io::stdout()));
    }
    let gathered = gatherer.run(&args.devices)?;

    report::log_summary(&gathered);
    let outcome = publish(&dm, &args.node, &gathered, &config)?;

    let mut failed = outcome == Outcome::TooSmall;
    if let Some(dest) = &args.report {
        // The report is written even when the size gate fails
        if let Err(e) = Report::from_gathered(&gathered).write_to(dest, args.report_format) {
            warn!("{}", e);
            failed = true;
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
