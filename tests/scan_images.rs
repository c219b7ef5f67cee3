//! Scanner tests against synthetic filesystem images

mod common;

use common::*;
use freespace_rs::probe::probe_device;
use freespace_rs::{FilesystemKind, Run, ScanError};
use std::path::Path;

fn scan(kind: FilesystemKind, path: &Path, total_sectors: u64) -> Result<Vec<Run>, ScanError> {
    kind.scanner(path, total_sectors).map(|runs| runs.collect())
}

fn ext_runs() -> Vec<Run> {
    vec![
        Run::new(21 * 2, 979 * 2),
        Run::new(1100 * 2, 7093 * 2),
        Run::new(8213 * 2, 8171 * 2),
    ]
}

#[test]
fn test_ext2_free_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext2.img");
    ext_image(&path, &ExtOptions::default());

    assert_eq!(probe_device(&path).unwrap(), "ext2");
    assert_eq!(scan(FilesystemKind::Ext2, &path, EXT_BLOCKS * 2).unwrap(), ext_runs());
}

#[test]
fn test_ext_uninit_group_is_synthesised() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext4.img");
    let opts = ExtOptions {
        ro_compat: 0x0010, // gdt_csum
        uninit_group1: true,
        ..Default::default()
    };
    ext_image(&path, &opts);

    assert_eq!(probe_device(&path).unwrap(), "ext4");
    assert_eq!(scan(FilesystemKind::Ext4, &path, EXT_BLOCKS * 2).unwrap(), ext_runs());
}

#[test]
fn test_ext_uninit_flag_ignored_without_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext2.img");
    let opts = ExtOptions {
        uninit_group1: true,
        ..Default::default()
    };
    ext_image(&path, &opts);

    // The on-disk bitmap of group 1 is all ones, and is trusted
    let runs = scan(FilesystemKind::Ext2, &path, EXT_BLOCKS * 2).unwrap();
    assert_eq!(runs, ext_runs()[..2].to_vec());
}

#[test]
fn test_ext3_journal_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext3.img");
    let opts = ExtOptions {
        compat: 0x0004,
        ..Default::default()
    };
    ext_image(&path, &opts);
    assert_eq!(probe_device(&path).unwrap(), "ext3");
}

#[test]
fn test_ext_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
        (
            ExtOptions {
                state: 0x0003,
                ..Default::default()
            },
            ScanError::FilesystemErrors,
        ),
        (
            ExtOptions {
                state: 0,
                ..Default::default()
            },
            ScanError::Unclean,
        ),
        (
            ExtOptions {
                incompat: 0x0010,
                ..Default::default()
            },
            ScanError::UnsupportedFeature("meta_bg"),
        ),
        (
            ExtOptions {
                ro_compat: 0x0200,
                ..Default::default()
            },
            ScanError::UnsupportedFeature("bigalloc"),
        ),
        (
            ExtOptions {
                incompat: 0x0001,
                ..Default::default()
            },
            ScanError::ReadFilesystem,
        ),
    ];

    for (i, (opts, expected)) in cases.into_iter().enumerate() {
        let path = dir.path().join(format!("ext-{}.img", i));
        ext_image(&path, &opts);
        assert_eq!(
            scan(FilesystemKind::Ext4, &path, EXT_BLOCKS * 2).unwrap_err(),
            expected
        );
    }
}

#[test]
fn test_ext_truncated_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.img");
    ext_image(&path, &ExtOptions::default());

    // Cut the image before group 1's bitmap
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(8000 * EXT_BLOCK).unwrap();

    assert_eq!(
        scan(FilesystemKind::Ext2, &path, EXT_BLOCKS * 2).unwrap_err(),
        ScanError::ReadBlockBitmap
    );
}

#[test]
fn test_ext_larger_than_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ext2.img");
    ext_image(&path, &ExtOptions::default());

    assert_eq!(
        scan(FilesystemKind::Ext2, &path, EXT_BLOCKS).unwrap_err(),
        ScanError::ReadFilesystem
    );
}

#[test]
fn test_ntfs_free_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ntfs.img");
    ntfs_image(&path, &NtfsOptions::default());

    assert_eq!(probe_device(&path).unwrap(), "ntfs");
    let runs = scan(FilesystemKind::Ntfs, &path, NTFS_CLUSTERS * 8).unwrap();
    assert_eq!(runs, vec![Run::new(30 * 8, 70 * 8), Run::new(200 * 8, 824 * 8)]);
}

#[test]
fn test_ntfs_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
        (
            NtfsOptions {
                volume_flags: 0x0001,
                ..Default::default()
            },
            ScanError::NeedsChecking,
        ),
        (
            NtfsOptions {
                major: 2,
                minor: 0,
                ..Default::default()
            },
            ScanError::UnsupportedVersion,
        ),
        (
            NtfsOptions {
                bitmap_bytes: NTFS_CLUSTERS / 16,
                ..Default::default()
            },
            ScanError::ShortBitmap,
        ),
        (
            NtfsOptions {
                bitmap_lcn: 5000,
                ..Default::default()
            },
            ScanError::ShortBitmapRead,
        ),
    ];

    for (i, (opts, expected)) in cases.into_iter().enumerate() {
        let path = dir.path().join(format!("ntfs-{}.img", i));
        ntfs_image(&path, &opts);
        assert_eq!(
            scan(FilesystemKind::Ntfs, &path, NTFS_CLUSTERS * 8).unwrap_err(),
            expected
        );
    }
}

fn ntfs_scan(opts: &NtfsOptions) -> Result<Vec<Run>, ScanError> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ntfs.img");
    ntfs_image(&path, opts);
    scan(FilesystemKind::Ntfs, &path, NTFS_CLUSTERS * 8)
}

#[test]
fn test_ntfs_active_logfile_rejected() {
    let opts = NtfsOptions {
        log: LogState::Active,
        ..Default::default()
    };
    assert_eq!(ntfs_scan(&opts).unwrap_err(), ScanError::OpenNtfs);
}

#[test]
fn test_ntfs_reset_logfile_accepted() {
    let opts = NtfsOptions {
        log: LogState::Reset,
        ..Default::default()
    };
    assert_eq!(ntfs_scan(&opts).unwrap().len(), 2);
}

#[test]
fn test_ntfs_hibernated_rejected() {
    for (magic, in_subnode) in [(*b"HIBR", false), (*b"hibr", true)] {
        let opts = NtfsOptions {
            hiberfile: Some(magic),
            hiberfile_in_subnode: in_subnode,
            ..Default::default()
        };
        assert_eq!(
            ntfs_scan(&opts).unwrap_err(),
            ScanError::OpenNtfs,
            "hiberfile {:?} in subnode {}",
            magic,
            in_subnode
        );
    }
}

#[test]
fn test_ntfs_resumed_hiberfile_accepted() {
    for in_subnode in [false, true] {
        let opts = NtfsOptions {
            hiberfile: Some(*b"wake"),
            hiberfile_in_subnode: in_subnode,
            ..Default::default()
        };
        assert_eq!(ntfs_scan(&opts).unwrap().len(), 2);
    }
}

#[test]
fn test_ntfs_damaged_mft() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ntfs.img");
    ntfs_image(&path, &NtfsOptions::default());

    // Clobber the $Volume record signature
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    write_at(&file, 4 * NTFS_CLUSTER + 3 * 1024, b"BAAD");

    assert_eq!(
        scan(FilesystemKind::Ntfs, &path, NTFS_CLUSTERS * 8).unwrap_err(),
        ScanError::OpenNtfs
    );
}

#[test]
fn test_swap_single_extent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swap.img");
    swap_image(&path, 64, 0);

    let page_sectors = (page_size() / 512) as u64;
    assert_eq!(probe_device(&path).unwrap(), "swap");
    let runs = scan(FilesystemKind::Swap, &path, 64 * page_sectors).unwrap();
    assert_eq!(runs, vec![Run::new(page_sectors, 63 * page_sectors)]);
}

#[test]
fn test_swap_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let page_sectors = (page_size() / 512) as u64;

    let bad = dir.path().join("bad.img");
    swap_image(&bad, 64, 2);
    assert_eq!(
        scan(FilesystemKind::Swap, &bad, 64 * page_sectors).unwrap_err(),
        ScanError::SwapBadPages(2)
    );

    let resized = dir.path().join("resized.img");
    swap_image(&resized, 64, 0);
    assert_eq!(
        scan(FilesystemKind::Swap, &resized, 128 * page_sectors).unwrap_err(),
        ScanError::SwapLength
    );

    let blank = dir.path().join("blank.img");
    std::fs::write(&blank, vec![0u8; page_size() * 2]).unwrap();
    assert_eq!(
        scan(FilesystemKind::Swap, &blank, 2 * page_sectors).unwrap_err(),
        ScanError::SwapSignature
    );
}
