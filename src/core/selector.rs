//! Bounded top-K extent selection
//!
//! The device-mapper table handed to the kernel lives in a vmalloc'd array,
//! so it has to stay bounded no matter how fragmented the scanned
//! filesystems are. The selector keeps the `K` largest extents offered so
//! far in a min-heap keyed by length. Once full, a candidate is admitted only
//! if it beats the current smallest, which it then evicts.
//!
//! Every offered run counts toward its device's free totals. Only runs that
//! are currently retained count toward the accepted totals.

use crate::core::device::{Device, DeviceId, DeviceRegistry};
use crate::core::extent::Extent;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;

/// Upper bound on the buffer's initial allocation
const PREALLOC_LIMIT: usize = 1 << 16;

/// Heap entry ordered so that the shortest extent sits at the root
#[derive(Debug, Clone, Copy)]
struct ByLength(Extent);

impl PartialEq for ByLength {
    fn eq(&self, other: &Self) -> bool {
        self.0.length_sectors == other.0.length_sectors
    }
}

impl Eq for ByLength {}

impl Ord for ByLength {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other.0.length_sectors.cmp(&self.0.length_sectors)
    }
}

impl PartialOrd for ByLength {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming selector over candidate free extents
///
/// # Examples
///
/// ```
/// use freespace_rs::core::selector::ExtentSelector;
/// use std::num::NonZeroUsize;
///
/// let mut selector = ExtentSelector::new(NonZeroUsize::new(3).unwrap(), 0);
/// let dev = selector.register_device("/dev/sda1", "ext4", 1 << 20);
///
/// for (i, len) in [5, 3, 8, 1, 9, 2].into_iter().enumerate() {
///     selector.accept(dev, i as u64 * 100, len);
/// }
///
/// let mut lengths: Vec<u64> = selector.retained().map(|e| e.length_sectors).collect();
/// lengths.sort();
/// assert_eq!(lengths, vec![5, 8, 9]);
/// assert_eq!(selector.device(dev).accepted_sectors(), 22);
/// ```
#[derive(Debug, Clone)]
pub struct ExtentSelector {
    buffer: BinaryHeap<ByLength>,
    capacity: NonZeroUsize,
    min_extent_sectors: u64,
    devices: DeviceRegistry,
}

impl ExtentSelector {
    /// Create a selector retaining at most `capacity` extents, each at least
    /// `min_extent_sectors` long
    pub fn new(capacity: NonZeroUsize, min_extent_sectors: u64) -> Self {
        ExtentSelector {
            buffer: BinaryHeap::with_capacity(capacity.get().min(PREALLOC_LIMIT)),
            capacity,
            min_extent_sectors,
            devices: DeviceRegistry::new(),
        }
    }

    /// Register a device before offering any of its runs
    pub fn register_device(
        &mut self,
        path: impl Into<std::path::PathBuf>,
        fstype: impl Into<String>,
        total_sectors: u64,
    ) -> DeviceId {
        self.devices.register(path, fstype, total_sectors)
    }

    /// Offer one free run
    ///
    /// # Panics
    ///
    /// Panics if `length_sectors` is zero or `device` was not registered with
    /// this selector.
    pub fn accept(&mut self, device: DeviceId, start_sector: u64, length_sectors: u64) {
        assert!(length_sectors > 0, "zero-length extent offered");

        self.devices.get_mut(device).record_free(length_sectors);
        if length_sectors < self.min_extent_sectors {
            return;
        }

        let extent = Extent::new(device, start_sector, length_sectors);
        if self.buffer.len() < self.capacity.get() {
            self.buffer.push(ByLength(extent));
        } else {
            let evicted = {
                // Buffer is full and capacity is nonzero, so a root exists
                let Some(mut root) = self.buffer.peek_mut() else {
                    return;
                };
                if length_sectors <= root.0.length_sectors {
                    return;
                }
                std::mem::replace(&mut root.0, extent)
                // PeekMut restores heap order on drop
            };
            self.devices
                .get_mut(evicted.device)
                .record_evicted(evicted.length_sectors);
        }

        self.devices.get_mut(device).record_accepted(length_sectors);
    }

    /// Number of extents currently retained
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether the buffer has reached capacity
    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn min_extent_sectors(&self) -> u64 {
        self.min_extent_sectors
    }

    /// The heap root: the shortest retained extent
    pub fn smallest_retained(&self) -> Option<&Extent> {
        self.buffer.peek().map(|e| &e.0)
    }

    /// Retained extents in buffer order (unsorted)
    pub fn retained(&self) -> impl Iterator<Item = &Extent> {
        self.buffer.iter().map(|e| &e.0)
    }

    pub fn device(&self, id: DeviceId) -> &Device {
        self.devices.get(id)
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Split into the retained extents and the device registry
    pub fn into_parts(self) -> (Vec<Extent>, DeviceRegistry) {
        let extents = self.buffer.into_vec().into_iter().map(|e| e.0).collect();
        (extents, self.devices)
    }
}
