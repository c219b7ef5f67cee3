#![no_main]
use freespace_rs::scan::ntfs::{self, BootSector};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if ntfs::identify(data) {
        if let Ok(boot) = BootSector::parse(data) {
            assert!(boot.cluster_size >= 512);
            let _ = boot.nr_clusters();
        }
    }

    if let Ok(runs) = ntfs::decode_runlist(data) {
        assert!(runs.iter().all(|run| run.clusters > 0));
    }
});
