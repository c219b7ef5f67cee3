#![no_main]
use freespace_rs::{ExtentSelector, TableAssembler};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use std::num::NonZeroUsize;

#[derive(Debug, Arbitrary)]
struct Offers {
    capacity: u8,
    min_extent_sectors: u16,
    runs: Vec<(u8, u32, u32)>,
}

// Whatever is offered, the table stays within capacity and contiguous
fuzz_target!(|offers: Offers| {
    let Some(capacity) = NonZeroUsize::new(offers.capacity as usize) else {
        return;
    };
    let mut selector = ExtentSelector::new(capacity, offers.min_extent_sectors as u64);
    let devices = [
        selector.register_device("/dev/fuzz0", "ext4", u32::MAX as u64 * 2),
        selector.register_device("/dev/fuzz1", "ntfs", u32::MAX as u64 * 2),
    ];

    let mut next = [0u64; 2];
    for (dev, gap, len) in offers.runs {
        if len == 0 {
            continue;
        }
        let dev = dev as usize % 2;
        let start = next[dev] + gap as u64;
        selector.accept(devices[dev], start, len as u64);
        next[dev] = start + len as u64;
    }

    assert!(selector.len() <= capacity.get());
    let table = TableAssembler::build(&selector);
    let mut offset = 0;
    for row in table.rows() {
        assert_eq!(row.virtual_offset, offset);
        assert!(row.length_sectors >= offers.min_extent_sectors as u64);
        offset = row.virtual_end();
    }
    assert_eq!(offset, table.total_sectors());
});
