//! A fixed-size LRU cache of block-sized buffers sitting in front of a
//! [`BlockDevice`].
//!
//! Callers ask for a block by index and get back a [`BlockLease`]: an
//! unlocked handle into the cache. Locking it (`.lock()`) produces a
//! [`BlockView`] whose type parameter tracks, at compile time, whether the
//! buffer's contents have been loaded yet — `read`, `set_data`, and `zeroed`
//! each consume an unloaded view and hand back a loaded one, so the data
//! accessors (`bytes`, `data`, `write`, ...) only exist on views that are
//! known to hold real contents.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, collections::linked_list::LinkedList, sync::Arc};
use dataview::{Pod, PodMethods as _};
use sync::Mutex;

/// A fixed-size block device addressed by block index.
pub trait BlockDevice<const BLOCK_SIZE: usize> {
    type Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}

/// The cache itself: a device plus a fixed pool of buffer slots, ordered
/// most- to least-recently-used.
pub struct BlockCache<Device, ListLock> {
    device: Device,
    slots: ListLock,
}

pub struct SlotList<BlockLock>(LinkedList<Arc<Slot<BlockLock>>>);

struct Slot<BlockLock> {
    index: usize,
    buf: BlockLock,
}

/// An unlocked reference into the cache for one block index.
pub struct BlockLease<'a, Device, ListLock, BlockLock>
where
    ListLock: Mutex<Data = SlotList<BlockLock>>,
{
    index: usize,
    cache: &'a BlockCache<Device, ListLock>,
    slot: Arc<Slot<BlockLock>>,
}

/// A locked view onto a block's buffer. `LOADED` is `false` until `read`,
/// `set_data`, or `zeroed` has run; only a `true` view exposes the buffer's
/// bytes.
pub struct BlockView<'a, 'b, Device, ListLock, BlockLock, const BLOCK_SIZE: usize, const LOADED: bool>
where
    ListLock: Mutex<Data = SlotList<BlockLock>>,
    BlockLock: Mutex<Data = BlockBuf<BLOCK_SIZE>> + 'b,
{
    index: usize,
    cache: &'a BlockCache<Device, ListLock>,
    slot: Arc<Slot<BlockLock>>,
    buf: BlockLock::Guard<'b>,
}

/// A single buffer slot's contents, plus which block index (if any) they
/// currently hold.
pub struct BlockBuf<const BLOCK_SIZE: usize> {
    index: usize,
    loaded: bool,
    bytes: Box<[u8; BLOCK_SIZE]>,
}

impl<Device, ListLock, BlockLock, const BLOCK_SIZE: usize> BlockCache<Device, ListLock>
where
    ListLock: Mutex<Data = SlotList<BlockLock>>,
    BlockLock: Mutex<Data = BlockBuf<BLOCK_SIZE>>,
{
    pub fn new(device: Device) -> Self {
        Self {
            device,
            slots: ListLock::new(SlotList(LinkedList::new())),
        }
    }

    /// Allocates `capacity` empty buffer slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or the cache has already been initialized.
    pub fn init(&self, capacity: usize) {
        assert!(capacity > 0, "a block cache needs at least one slot");
        let mut slots = self.slots.lock();
        assert!(slots.0.is_empty(), "block cache already initialized");

        for _ in 0..capacity {
            slots.0.push_back(Arc::new(Slot {
                index: usize::MAX,
                buf: BlockLock::new(BlockBuf {
                    index: usize::MAX,
                    loaded: false,
                    bytes: Box::new([0; BLOCK_SIZE]),
                }),
            }));
        }
    }

    /// Returns a handle to `index`, reusing a cached slot if present and
    /// otherwise recycling the least-recently-used unreferenced one.
    ///
    /// # Panics
    ///
    /// Panics if the cache is uninitialized or every slot is currently
    /// referenced (cache exhaustion is fatal, mirroring a full buffer cache
    /// in the system this is modeled on).
    pub fn get(&self, index: usize) -> BlockLease<'_, Device, ListLock, BlockLock> {
        let mut slots = self.slots.lock();
        assert!(!slots.0.is_empty(), "block cache not initialized");

        if let Some(slot) = slots.0.iter().find(|s| s.index == index) {
            return BlockLease {
                index,
                cache: self,
                slot: Arc::clone(slot),
            };
        }

        let reused = slots.0.iter_mut().rev().find_map(|slot| {
            let owned = Arc::get_mut(slot)?;
            owned.index = index;
            Some(slot)
        });
        match reused {
            Some(slot) => BlockLease {
                index,
                cache: self,
                slot: Arc::clone(slot),
            },
            None => panic!("block cache exhausted: every slot is in use"),
        }
    }
}

impl<Device, ListLock, BlockLock> Drop for BlockLease<'_, Device, ListLock, BlockLock>
where
    ListLock: Mutex<Data = SlotList<BlockLock>>,
{
    fn drop(&mut self) {
        let mut slots = self.cache.slots.lock();
        // `LinkedList` can't remove by predicate in place, so the list is
        // rebuilt, moving this lease's slot (if it's still the one holding
        // this index) to the front as most-recently-used.
        let mut released = None;
        let mut remaining = LinkedList::new();
        while let Some(slot) = slots.0.pop_front() {
            if released.is_none() && slot.index == self.index {
                released = Some(slot);
            } else {
                remaining.push_back(slot);
            }
        }
        slots.0 = remaining;
        if let Some(slot) = released {
            slots.0.push_front(slot);
        }
    }
}

impl<'a, Device, ListLock, BlockLock, const BLOCK_SIZE: usize> BlockLease<'a, Device, ListLock, BlockLock>
where
    Device: BlockDevice<BLOCK_SIZE>,
    ListLock: Mutex<Data = SlotList<BlockLock>>,
    BlockLock: Mutex<Data = BlockBuf<BLOCK_SIZE>> + 'a,
{
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Locks the underlying buffer, returning an unloaded view. If the slot
    /// was just recycled for a different index, the stale contents are
    /// marked unloaded so the next `read` goes back to the device.
    pub fn lock<'b>(&'b mut self) -> BlockView<'a, 'b, Device, ListLock, BlockLock, BLOCK_SIZE, false> {
        let mut buf = self.slot.buf.lock();
        if buf.index != self.index {
            buf.index = self.index;
            buf.loaded = false;
        }
        BlockView {
            index: self.index,
            cache: self.cache,
            slot: Arc::clone(&self.slot),
            buf,
        }
    }
}

impl<'a, 'b, Device, ListLock, BlockLock, const BLOCK_SIZE: usize, const LOADED: bool>
    BlockView<'a, 'b, Device, ListLock, BlockLock, BLOCK_SIZE, LOADED>
where
    Device: BlockDevice<BLOCK_SIZE>,
    ListLock: Mutex<Data = SlotList<BlockLock>>,
    BlockLock: Mutex<Data = BlockBuf<BLOCK_SIZE>> + 'a,
{
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Loads the block from the device if its buffer isn't already valid.
    ///
    /// # Errors
    ///
    /// Returns the device error alongside the still-unloaded view, so the
    /// caller can retry without losing the lock.
    pub fn read(
        mut self,
    ) -> Result<BlockView<'a, 'b, Device, ListLock, BlockLock, BLOCK_SIZE, true>, (Self, Device::Error)> {
        if !self.buf.loaded {
            if let Err(e) = self.cache.device.read(self.index, &mut self.buf.bytes) {
                return Err((self, e));
            }
            self.buf.loaded = true;
        }
        Ok(BlockView {
            index: self.index,
            cache: self.cache,
            slot: Arc::clone(&self.slot),
            buf: self.buf,
        })
    }

    /// Overwrites the buffer with `data`, marking it loaded without
    /// touching the device.
    pub fn set_data(mut self, data: &[u8]) -> BlockView<'a, 'b, Device, ListLock, BlockLock, BLOCK_SIZE, true> {
        self.buf.loaded = true;
        self.buf.bytes.copy_from_slice(data);
        BlockView {
            index: self.index,
            cache: self.cache,
            slot: Arc::clone(&self.slot),
            buf: self.buf,
        }
    }

    /// Zero-fills the buffer and marks it loaded.
    pub fn zeroed(mut self) -> BlockView<'a, 'b, Device, ListLock, BlockLock, BLOCK_SIZE, true> {
        self.buf.loaded = true;
        self.buf.bytes.fill(0);
        BlockView {
            index: self.index,
            cache: self.cache,
            slot: Arc::clone(&self.slot),
            buf: self.buf,
        }
    }
}

impl<Device, ListLock, BlockLock, const BLOCK_SIZE: usize> BlockView<'_, '_, Device, ListLock, BlockLock, BLOCK_SIZE, true>
where
    Device: BlockDevice<BLOCK_SIZE>,
    ListLock: Mutex<Data = SlotList<BlockLock>>,
    BlockLock: Mutex<Data = BlockBuf<BLOCK_SIZE>>,
{
    #[must_use]
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.buf.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.buf.bytes
    }

    #[must_use]
    pub fn data<T: Pod>(&self) -> &T {
        self.bytes().as_data_view().get(0)
    }

    pub fn data_mut<T: Pod>(&mut self) -> &mut T {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Writes the buffer back to the device.
    ///
    /// # Panics
    ///
    /// Panics if the buffer somehow isn't loaded — unreachable through the
    /// public API, since only `read`/`set_data`/`zeroed` produce a `true`
    /// view.
    pub fn write(&mut self) -> Result<(), Device::Error> {
        assert!(self.buf.loaded, "writing back an unloaded buffer");
        self.cache.device.write(self.index, self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::{
        convert::Infallible,
        ops::{Deref, DerefMut},
    };

    const BLOCK_SIZE: usize = 512;

    struct StdLock<T>(std::sync::Mutex<T>);
    struct StdLockGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> sync::Mutex for StdLock<T> {
        type Data = T;
        type Guard<'a>
            = StdLockGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            StdLockGuard(self.0.lock().unwrap())
        }
    }

    impl<T> Deref for StdLockGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for StdLockGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    /// An in-memory device that also counts reads/writes per block, so
    /// tests can assert the cache actually avoids redundant device traffic.
    #[derive(Clone)]
    struct CountingDevice(std::sync::Arc<Vec<std::sync::Mutex<([u8; BLOCK_SIZE], usize, usize)>>>);

    impl CountingDevice {
        fn new(blocks: usize) -> Self {
            Self(std::sync::Arc::new(
                (0..blocks).map(|_| std::sync::Mutex::new(([0; BLOCK_SIZE], 0, 0))).collect(),
            ))
        }

        fn reads(&self, index: usize) -> usize {
            self.0[index].lock().unwrap().1
        }

        fn writes(&self, index: usize) -> usize {
            self.0[index].lock().unwrap().2
        }
    }

    impl BlockDevice<BLOCK_SIZE> for CountingDevice {
        type Error = Infallible;

        fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            let mut slot = self.0[index].lock().unwrap();
            slot.1 += 1;
            *data = slot.0;
            Ok(())
        }

        fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            let mut slot = self.0[index].lock().unwrap();
            slot.2 += 1;
            slot.0 = *data;
            Ok(())
        }
    }

    type TestCache = BlockCache<CountingDevice, StdLock<TestSlotList>>;
    type TestSlotList = SlotList<StdLock<BlockBuf<BLOCK_SIZE>>>;

    #[test]
    fn init_allocates_the_requested_slot_count() {
        let cache = TestCache::new(CountingDevice::new(10));
        cache.init(5);
        assert_eq!(cache.slots.lock().0.len(), 5);
    }

    #[test]
    #[should_panic]
    fn init_rejects_zero_capacity() {
        let cache = TestCache::new(CountingDevice::new(10));
        cache.init(0);
    }

    #[test]
    fn get_does_not_touch_the_device() {
        let device = CountingDevice::new(10);
        let cache = TestCache::new(device.clone());
        cache.init(5);

        let lease = cache.get(0);
        assert_eq!(lease.index(), 0);
        assert_eq!(device.reads(0), 0);
        assert_eq!(device.writes(0), 0);
    }

    #[test]
    fn write_then_read_round_trips_and_hits_cache() {
        let device = CountingDevice::new(10);
        let cache = TestCache::new(device.clone());
        cache.init(5);

        {
            let mut lease = cache.get(0);
            let Ok(mut view) = lease.lock().read();
            view.bytes_mut().copy_from_slice(&[7; BLOCK_SIZE]);
            view.write().unwrap();
        }
        {
            let mut lease = cache.get(0);
            let Ok(view) = lease.lock().read();
            assert_eq!(view.bytes(), &[7; BLOCK_SIZE]);
        }

        assert_eq!(device.reads(0), 1);
        assert_eq!(device.writes(0), 1);
    }

    #[test]
    #[should_panic]
    fn get_panics_once_every_slot_is_held() {
        let cache = TestCache::new(CountingDevice::new(10));
        cache.init(1);
        let _held = cache.get(0);
        let _second = cache.get(1);
    }

    #[test]
    fn least_recently_used_slot_is_recycled_first() {
        let device = CountingDevice::new(10);
        let cache = TestCache::new(device.clone());
        cache.init(3);

        for i in 0..3 {
            let mut lease = cache.get(i);
            let _ = lease.lock().read();
        }
        // cache holds 0, 1, 2 (2 most recent)

        let mut lease = cache.get(3);
        let _ = lease.lock().read(); // evicts 0, the least recently used
        drop(lease);

        let mut lease = cache.get(0);
        let _ = lease.lock().read();
        assert_eq!(device.reads(0), 2, "block 0 was evicted and had to be reloaded");

        let mut lease = cache.get(2);
        let _ = lease.lock().read();
        assert_eq!(device.reads(2), 1, "block 2 was still cached");
    }
}
