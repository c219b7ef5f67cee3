#![no_main]
use freespace_rs::scan::ext::{self, Superblock};
use libfuzzer_sys::fuzz_target;

// Superblock parsing and the geometry derived from it must never panic
fuzz_target!(|data: &[u8]| {
    let _ = ext::identify(data);

    let Ok(sb) = Superblock::parse(data) else {
        return;
    };
    let groups = sb.group_count();
    assert!(groups > 0);
    let _ = sb.gdt_blocks();
    let _ = sb.inode_table_blocks();
    for group in [0, 1, groups / 2, groups - 1] {
        let _ = sb.has_super(group);
        assert!(sb.blocks_in_group(group) <= sb.blocks_per_group as u64);
    }
});
