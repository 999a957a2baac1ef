//! Segmented fixed-width pools.
//!
//! Every node and every small buffer comes out of a pool. A pool grows
//! one segment at a time and threads the new units onto its free list;
//! segments are only returned to the system when the [`Pools`] are dropped.
//! Pools `0` and `1` are dedicated to stubs and standalone API cells, the
//! configured size tiers follow.

use std::{
    alloc::{self, Layout},
    mem,
    ptr::{self, NonNull},
};

use crate::{
    Error, Result,
    cell::Cell,
    node::FREE_BYTE,
    settings::RuntimeSettings,
    stub::Stub,
};

/// Alignment of every unit handed out by a pool.
pub const POOL_ALIGN: usize = 8;

/// Size of the header a free unit carries; no pool may be narrower.
pub const POOL_SLOT_SIZE: usize = mem::size_of::<PoolSlot>();

/// Written over the payload of released units in checked mode.
const POISON_BYTE: u8 = 0xDB;

pub type PoolId = usize;

pub const STUB_POOL: PoolId = 0;
pub const CELL_POOL: PoolId = 1;
const FIRST_TIER: PoolId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub width: usize,
    pub units: usize,
}

impl PoolSpec {
    pub const fn new(width: usize, units: usize) -> Self {
        Self { width, units }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub width: usize,
    pub segments: usize,
    pub units: usize,
    pub free: usize,
    pub live: usize,
}

#[repr(C)]
struct PoolSlot {
    tag: u8,
    _pad: [u8; 7],
    next: *mut PoolSlot,
}

struct Segment {
    start: NonNull<u8>,
    layout: Layout,
}

/// A contiguous run of units belonging to one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpan {
    pub start: NonNull<u8>,
    pub width: usize,
    pub units: usize,
}

impl SegmentSpan {
    #[inline(always)]
    pub fn unit(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.units);
        // SAFETY: index is within the segment
        unsafe { self.start.add(index * self.width) }
    }

    pub fn iter(self) -> impl Iterator<Item = NonNull<u8>> {
        (0..self.units).map(move |index| self.unit(index))
    }

    #[inline]
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.start.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start
            && addr < start + self.width * self.units
            && (addr - start).is_multiple_of(self.width)
    }
}

struct Pool {
    width: usize,
    units: usize,
    segments: Vec<Segment>,
    first: *mut PoolSlot,
    last: *mut PoolSlot,
    free: usize,
    has: usize,
    /// units carry a node tag byte while live, so double release is visible
    tagged: bool,
}

impl Pool {
    fn new(spec: PoolSpec, scale: usize, tagged: bool) -> Self {
        Self {
            width: spec.width,
            units: spec.units * scale,
            segments: Vec::new(),
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            free: 0,
            has: 0,
            tagged,
        }
    }

    fn spans(&self) -> impl Iterator<Item = SegmentSpan> + '_ {
        self.segments.iter().map(|segment| SegmentSpan {
            start: segment.start,
            width: self.width,
            units: segment.layout.size() / self.width,
        })
    }

    /// # Safety
    /// `slot` must be an unused unit of this pool
    unsafe fn push_head(&mut self, slot: *mut PoolSlot) {
        // SAFETY: slot is a unit of at least POOL_SLOT_SIZE bytes
        unsafe {
            (*slot).tag = FREE_BYTE;
            (*slot).next = self.first;
        }
        if self.first.is_null() {
            self.last = slot;
        }
        self.first = slot;
        self.free += 1;
    }

    /// # Safety
    /// `slot` must be an unused unit of this pool
    unsafe fn push_tail(&mut self, slot: *mut PoolSlot) {
        // SAFETY: slot is a unit of at least POOL_SLOT_SIZE bytes
        unsafe {
            (*slot).tag = FREE_BYTE;
            (*slot).next = ptr::null_mut();
        }
        if self.last.is_null() {
            self.first = slot;
        } else {
            // SAFETY: last is a free unit of this pool
            unsafe { (*self.last).next = slot };
        }
        self.last = slot;
        self.free += 1;
    }
}

/// The full set of pools owned by one runtime.
pub struct Pools {
    pools: Vec<Pool>,
    checked: bool,
    mem_usage: usize,
    mem_limit: Option<usize>,
}

impl Pools {
    pub fn new(settings: &RuntimeSettings) -> Self {
        let scale = settings.segment_scale;
        let mut pools = Vec::with_capacity(FIRST_TIER + settings.pool_tiers.len());
        pools.push(Pool::new(
            PoolSpec::new(mem::size_of::<Stub>(), settings.stub_units),
            scale,
            true,
        ));
        pools.push(Pool::new(
            PoolSpec::new(mem::size_of::<Cell>(), settings.cell_units),
            scale,
            true,
        ));
        pools.extend(
            settings
                .pool_tiers
                .iter()
                .map(|&spec| Pool::new(spec, scale, false)),
        );
        Self {
            pools,
            checked: settings.checked,
            mem_usage: 0,
            mem_limit: settings.memory_limit,
        }
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.pools.len()
    }

    #[inline(always)]
    pub fn mem_usage(&self) -> usize {
        self.mem_usage
    }

    /// Reserve `bytes` against the memory limit.
    fn charge(&mut self, bytes: usize) -> Result<()> {
        let total = self.mem_usage.saturating_add(bytes);
        if self.mem_limit.is_some_and(|limit| total > limit) {
            return Err(Error::OutOfMemory { requested: bytes });
        }
        self.mem_usage = total;
        Ok(())
    }

    /// Allocate one more segment for `id` and append its units to the
    /// free list.
    fn fill(&mut self, id: PoolId) -> Result<()> {
        let (width, units) = {
            let pool = &self.pools[id];
            (pool.width, pool.units)
        };
        let size = width * units;
        let layout = Layout::from_size_align(size, POOL_ALIGN)
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        self.charge(size)?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            self.mem_usage -= size;
            return Err(Error::OutOfMemory { requested: size });
        };

        let pool = &mut self.pools[id];
        for index in 0..units {
            // SAFETY: index < units, so the unit lies inside the segment
            let slot = unsafe { start.as_ptr().add(index * width) } as *mut PoolSlot;
            // SAFETY: fresh memory owned by this pool
            unsafe { pool.push_tail(slot) };
        }
        pool.segments.push(Segment { start, layout });
        pool.has += units;

        log::trace!(
            "pool {id}: new segment of {units} x {width} bytes ({} segments)",
            pool.segments.len()
        );
        Ok(())
    }

    /// Pop a unit from pool `id`, growing the pool when its free list is
    /// empty. The unit still carries [`FREE_BYTE`]; the caller must write a
    /// live tag before anything else can see it.
    pub fn allocate(&mut self, id: PoolId) -> Result<NonNull<u8>> {
        if self.pools[id].first.is_null() {
            self.fill(id)?;
        }
        let pool = &mut self.pools[id];
        let slot = pool.first;
        // SAFETY: fill guarantees a non-empty free list
        pool.first = unsafe { (*slot).next };
        if pool.first.is_null() {
            pool.last = ptr::null_mut();
        }
        pool.free -= 1;

        if self.checked {
            assert!(
                (slot as usize).is_multiple_of(POOL_ALIGN),
                "pool {id} handed out a misaligned unit {slot:p}"
            );
        }
        // SAFETY: free list entries are never null
        Ok(unsafe { NonNull::new_unchecked(slot.cast()) })
    }

    /// Return `unit` to pool `id`.
    ///
    /// Unchecked mode pushes on the head for immediate reuse. Checked mode
    /// instead refills an empty pool, poisons the payload and appends to the
    /// tail, so a stale pointer keeps reading poison for as long as possible.
    ///
    /// # Safety
    /// `unit` must have come from `allocate(id)` and must not be used again.
    pub unsafe fn release(&mut self, id: PoolId, unit: NonNull<u8>) {
        if !self.checked {
            // SAFETY: caller contract
            unsafe { self.pools[id].push_head(unit.as_ptr().cast()) };
            return;
        }

        assert!(self.owns(id, unit.as_ptr()), "unit {unit:p} does not belong to pool {id}");
        let width = self.pools[id].width;
        if self.pools[id].tagged {
            // SAFETY: owned units are always readable
            let tag = unsafe { *unit.as_ptr() };
            assert_ne!(tag, FREE_BYTE, "double release of unit {unit:p} in pool {id}");
        }
        // SAFETY: the unit spans `width` bytes
        unsafe {
            unit.as_ptr()
                .add(POOL_SLOT_SIZE)
                .write_bytes(POISON_BYTE, width - POOL_SLOT_SIZE);
        }

        if self.pools[id].first.is_null() {
            // a failed refill only shortens the reuse delay
            if let Err(err) = self.fill(id) {
                log::trace!("pool {id}: refill on release failed: {err}");
            }
        }
        // SAFETY: caller contract
        unsafe { self.pools[id].push_tail(unit.as_ptr().cast()) };
    }

    /// Smallest size tier able to hold `size` bytes.
    pub fn pool_for_size(&self, size: usize) -> Option<PoolId> {
        self.pools[FIRST_TIER..]
            .iter()
            .position(|pool| pool.width >= size)
            .map(|index| index + FIRST_TIER)
    }

    /// Allocate a raw buffer of at least `size` bytes. Returns the buffer
    /// and its real capacity, which must be passed back to
    /// [`free_buffer`](Self::free_buffer).
    pub fn alloc_buffer(&mut self, size: usize) -> Result<(NonNull<u8>, usize)> {
        let size = size.max(1);
        if let Some(id) = self.pool_for_size(size) {
            let unit = self.allocate(id)?;
            return Ok((unit, self.pools[id].width));
        }

        let layout = Layout::from_size_align(size, POOL_ALIGN)
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        self.charge(size)?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc(layout) };
        match NonNull::new(raw) {
            Some(buffer) => Ok((buffer, size)),
            None => {
                self.mem_usage -= size;
                Err(Error::OutOfMemory { requested: size })
            }
        }
    }

    /// # Safety
    /// `buffer` and `bytes` must be exactly what `alloc_buffer` returned.
    pub unsafe fn free_buffer(&mut self, buffer: NonNull<u8>, bytes: usize) {
        match self.pool_for_size(bytes) {
            Some(id) => {
                debug_assert_eq!(self.pools[id].width, bytes, "buffer capacity is not a tier width");
                // SAFETY: caller contract
                unsafe { self.release(id, buffer) };
            }
            None => {
                // SAFETY: same layout as in alloc_buffer
                unsafe {
                    alloc::dealloc(
                        buffer.as_ptr(),
                        Layout::from_size_align_unchecked(bytes, POOL_ALIGN),
                    )
                };
                self.mem_usage -= bytes;
            }
        }
    }

    /// Give up a buffer while the pools are torn down. Tier units go back
    /// with their segments, so only system allocations are freed here.
    ///
    /// # Safety
    /// As for [`free_buffer`](Self::free_buffer).
    pub(crate) unsafe fn discard_buffer(&mut self, buffer: NonNull<u8>, bytes: usize) {
        if self.pool_for_size(bytes).is_some() {
            return;
        }
        // SAFETY: same layout as in alloc_buffer
        unsafe {
            alloc::dealloc(
                buffer.as_ptr(),
                Layout::from_size_align_unchecked(bytes, POOL_ALIGN),
            )
        };
        self.mem_usage -= bytes;
    }

    pub fn owns(&self, id: PoolId, ptr: *const u8) -> bool {
        self.pools[id].spans().any(|span| span.contains(ptr))
    }

    pub fn segment_spans(&self, id: PoolId) -> Vec<SegmentSpan> {
        self.pools[id].spans().collect()
    }

    pub fn stats(&self, id: PoolId) -> PoolStats {
        let pool = &self.pools[id];
        PoolStats {
            width: pool.width,
            segments: pool.segments.len(),
            units: pool.has,
            free: pool.free,
            live: pool.has - pool.free,
        }
    }

    /// Walk every free list and verify it against the pool counters.
    pub fn check(&self) -> Result<()> {
        let corrupt = |pool: PoolId, reason: String| Err(Error::PoolCorrupt { pool, reason });

        for (id, pool) in self.pools.iter().enumerate() {
            let mut count = 0;
            let mut slot = pool.first;
            let mut prev = ptr::null_mut();
            while !slot.is_null() {
                if count >= pool.has {
                    return corrupt(id, "free list is cyclic".into());
                }
                if !(slot as usize).is_multiple_of(POOL_ALIGN) {
                    return corrupt(id, format!("misaligned free unit {slot:p}"));
                }
                if !pool.spans().any(|span| span.contains(slot.cast())) {
                    return corrupt(id, format!("free unit {slot:p} outside of segments"));
                }
                // SAFETY: slot lies inside one of this pool's segments
                let tag = unsafe { (*slot).tag };
                if tag != FREE_BYTE {
                    return corrupt(id, format!("free unit {slot:p} tagged {tag:#04x}"));
                }
                count += 1;
                prev = slot;
                // SAFETY: as above
                slot = unsafe { (*slot).next };
            }
            if count != pool.free {
                return corrupt(id, format!("free list holds {count} units, counter says {}", pool.free));
            }
            if prev != pool.last {
                return corrupt(id, "free list tail out of sync".into());
            }
            if pool.tagged {
                let free_tagged = pool
                    .spans()
                    .flat_map(SegmentSpan::iter)
                    // SAFETY: every unit of a segment is readable
                    .filter(|unit| unsafe { *unit.as_ptr() } == FREE_BYTE)
                    .count();
                if free_tagged != pool.free {
                    return corrupt(
                        id,
                        format!("{free_tagged} units tagged free, {} on the free list", pool.free),
                    );
                }
            }
        }
        Ok(())
    }
}

impl Drop for Pools {
    fn drop(&mut self) {
        for pool in &mut self.pools {
            for segment in pool.segments.drain(..) {
                // SAFETY: allocated in fill with this layout
                unsafe { alloc::dealloc(segment.start.as_ptr(), segment.layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn create_test_settings(checked: bool) -> RuntimeSettings {
        RuntimeSettings {
            pool_tiers: vec![PoolSpec::new(16, 4), PoolSpec::new(64, 4)],
            stub_units: 4,
            cell_units: 4,
            checked,
            ..Default::default()
        }
    }

    #[test]
    fn test_allocate_grows_by_segment() {
        let mut pools = Pools::new(&create_test_settings(true));
        assert_eq!(pools.stats(STUB_POOL).segments, 0);

        let unit = pools.allocate(STUB_POOL).unwrap();
        assert_eq!(unsafe { *unit.as_ptr() }, FREE_BYTE);
        assert_eq!(unit.as_ptr() as usize % POOL_ALIGN, 0);
        unsafe { *unit.as_ptr() = 0xA0 };

        let stats = pools.stats(STUB_POOL);
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.units, 4);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.free, 3);

        for _ in 0..4 {
            let unit = pools.allocate(STUB_POOL).unwrap();
            unsafe { *unit.as_ptr() = 0xA0 };
        }
        assert_eq!(pools.stats(STUB_POOL).segments, 2);
        pools.check().unwrap();
    }

    #[test]
    fn test_unchecked_release_reuses_immediately() {
        let mut pools = Pools::new(&create_test_settings(false));
        let unit = pools.allocate(CELL_POOL).unwrap();
        unsafe {
            *unit.as_ptr() = 0x84;
            pools.release(CELL_POOL, unit);
        }
        assert_eq!(pools.allocate(CELL_POOL).unwrap(), unit);
    }

    #[test]
    fn test_checked_release_delays_reuse_and_poisons() {
        let mut pools = Pools::new(&create_test_settings(true));
        let units: Vec<_> = (0..4).map(|_| pools.allocate(STUB_POOL).unwrap()).collect();
        let victim = units[0];
        unsafe {
            *victim.as_ptr() = 0x80;
            pools.release(STUB_POOL, victim);
            assert_eq!(*victim.as_ptr(), FREE_BYTE);
            assert_eq!(*victim.as_ptr().add(POOL_SLOT_SIZE), POISON_BYTE);
        }
        // empty pool was refilled before the release, fresh units come first
        assert_eq!(pools.stats(STUB_POOL).segments, 2);
        for _ in 0..4 {
            assert_ne!(pools.allocate(STUB_POOL).unwrap(), victim);
        }
        assert_eq!(pools.allocate(STUB_POOL).unwrap(), victim);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_is_detected() {
        let mut pools = Pools::new(&create_test_settings(true));
        let unit = pools.allocate(STUB_POOL).unwrap();
        unsafe {
            *unit.as_ptr() = 0xA0;
            pools.release(STUB_POOL, unit);
            pools.release(STUB_POOL, unit);
        }
    }

    #[test]
    #[should_panic(expected = "does not belong to pool")]
    fn test_foreign_release_is_detected() {
        let mut pools = Pools::new(&create_test_settings(true));
        let unit = pools.allocate(CELL_POOL).unwrap();
        unsafe { pools.release(STUB_POOL, unit) };
    }

    #[test]
    fn test_buffers_pick_the_smallest_tier() {
        let mut pools = Pools::new(&create_test_settings(true));
        assert_eq!(pools.pool_for_size(1), Some(FIRST_TIER));
        assert_eq!(pools.pool_for_size(17), Some(FIRST_TIER + 1));
        assert_eq!(pools.pool_for_size(65), None);

        let (small, width) = pools.alloc_buffer(10).unwrap();
        assert_eq!(width, 16);
        let (big, bytes) = pools.alloc_buffer(1000).unwrap();
        assert_eq!(bytes, 1000);
        assert_eq!(big.as_ptr() as usize % POOL_ALIGN, 0);

        let before = pools.mem_usage();
        unsafe {
            pools.free_buffer(big, bytes);
            pools.free_buffer(small, width);
        }
        assert_eq!(pools.mem_usage(), before - 1000);
        assert_eq!(pools.stats(FIRST_TIER).live, 0);
        pools.check().unwrap();
    }

    #[test]
    fn test_memory_limit_reports_out_of_memory() {
        let settings = RuntimeSettings {
            memory_limit: Some(300),
            ..create_test_settings(true)
        };
        let mut pools = Pools::new(&settings);
        // one stub segment is 4 * 64 = 256 bytes
        for _ in 0..4 {
            pools.allocate(STUB_POOL).unwrap();
        }
        let err = pools.allocate(STUB_POOL).unwrap_err();
        assert_eq!(err, Error::OutOfMemory { requested: 256 });
        assert!(pools.alloc_buffer(100).unwrap_err().is_out_of_memory());
        assert_eq!(pools.mem_usage(), 256);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![Just(Op::Allocate), (0usize..64).prop_map(Op::Release)],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn pool_balance(ops in ops(), checked in any::<bool>()) {
            let mut pools = Pools::new(&create_test_settings(checked));
            let mut outstanding = Vec::new();
            for op in ops {
                match op {
                    Op::Allocate => {
                        let unit = pools.allocate(STUB_POOL).unwrap();
                        unsafe { *unit.as_ptr() = 0xA0 };
                        outstanding.push(unit);
                    }
                    Op::Release(index) if !outstanding.is_empty() => {
                        let unit = outstanding.swap_remove(index % outstanding.len());
                        unsafe { pools.release(STUB_POOL, unit) };
                    }
                    Op::Release(_) => {}
                }
                prop_assert_eq!(pools.stats(STUB_POOL).live, outstanding.len());
            }
            prop_assert!(pools.check().is_ok());
        }
    }
}
