//! Error types for free-space gathering
//!
//! Two tiers: [`ScanError`] rejects a single device and scanning carries on
//! with the rest, [`GatherError`] aborts the whole run.

use thiserror::Error;

/// Reasons a device is skipped
///
/// The `Display` text of each variant is the operator-facing rejection
/// reason written to the log and to the report's `problem` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Couldn't probe device")]
    Probe,

    #[error("Couldn't determine filesystem type")]
    UnknownType,

    #[error("Couldn't query size")]
    QuerySize,

    #[error("Couldn't check mount status")]
    MountStatus,

    #[error("Device is {0}")]
    InUse(&'static str),

    #[error("Unknown filesystem {0}")]
    UnknownFilesystem(String),

    // ext2/3/4
    #[error("Couldn't read filesystem")]
    ReadFilesystem,

    #[error("Filesystem has errors")]
    FilesystemErrors,

    #[error("Unclean filesystem")]
    Unclean,

    #[error("Couldn't read block bitmap")]
    ReadBlockBitmap,

    #[error("Unsupported filesystem feature {0}")]
    UnsupportedFeature(&'static str),

    // NTFS
    #[error("Couldn't open filesystem; it may be unclean or hibernated")]
    OpenNtfs,

    #[error("Unsupported filesystem version")]
    UnsupportedVersion,

    #[error("Filesystem needs checking")]
    NeedsChecking,

    #[error("Unexpectedly short volume bitmap")]
    ShortBitmap,

    #[error("Short read for volume bitmap")]
    ShortBitmapRead,

    // swap
    #[error("Couldn't open device")]
    OpenDevice,

    #[error("Couldn't read device")]
    ReadDevice,

    #[error("Unrecognized swap signature")]
    SwapSignature,

    #[error("Unknown swap version {0}")]
    SwapVersion(u32),

    #[error("Swap device has {0} bad pages")]
    SwapBadPages(u32),

    #[error("Length mismatch on swap device")]
    SwapLength,
}

/// Errors that terminate the run
#[derive(Error, Debug)]
pub enum GatherError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Couldn't parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("You must be root.")]
    NotRoot,

    #[error("Device {0} already exists")]
    NodeExists(String),

    #[error("Couldn't probe devices: {0}")]
    Enumerate(String),

    #[error("Device mapper error: {0}")]
    DeviceMapper(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatherError>;
