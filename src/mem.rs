//                    Conditioned-Jump Memory Allocator
// ---------------------------------------------------------------------------
//
// Services allocations from tens of bytes up to multi-granule contiguous
// runs over two disjoint physical windows (near and far), with an urgent
// reserve carved out of the near window.
//
// Layers, leaves first:
//
//   raw        - both windows as one granule (128 KiB) bitmap; lowest-fit
//                run search with reserved-prefix handling.
//   lookup     - one slot per 4 KiB page recording which layer's entry owns
//                the page / the enclosing granule; lets `free` work from an
//                address alone.
//   spa        - a 4 KiB page split into 32..2048-byte subareas.
//   mpa        - a granule split into 4 KiB..128 KiB subareas; also the
//                backing-page supplier for spa.
//   hpa        - whole-granule runs for everything larger.
//   directory  - spa/mpa/hpa descriptors live inside directory pages, which
//                are themselves granules from the raw layer; pages come and
//                go with demand.
//
// Requests round through `calculate`: powers of two up to one granule, then
// granule multiples. Rounded sizes above half a page route to mpa, smaller
// ones to spa; anything beyond the largest mpa class falls through to hpa.
//
// The allocator performs no locking discipline of its own beyond one spin
// mutex around its state: callers in interrupt-style environments keep their
// own exclusion, hosted callers get a usable default.

pub(crate) mod directory;
pub(crate) mod hash;
pub(crate) mod hpa;
pub(crate) mod mpa;
pub(crate) mod raw;
pub(crate) mod spa;

use core::ops::Range;
use core::ptr::NonNull;

use log::{debug, warn};
use spin::{Mutex, Once};
use static_assertions::const_assert_eq;

use crate::address::PhysicalAddress;
use crate::error::{Error, Result};
use crate::mem::directory::{new_chain, DirChain};
use crate::mem::hash::{GranuleOwner, PageSlot};
use crate::mem::hpa::HugeArea;
use crate::mem::mpa::MultiPageArea;
use crate::mem::raw::{Pool, RawArea};

/// One page, the spa subdivision unit and the lookup-table granularity.
pub const ONE_PAGE_AREA_SIZE: usize = 4096;
/// One granule, the raw-layer bookkeeping unit.
pub const FIXED_PAGE_AREA_SIZE: usize = 128 * 1024;
/// Smallest subarea ever handed out.
pub const MIN_SUBAREA_SIZE: usize = 32;

const PAGES_PER_GRANULE: usize = FIXED_PAGE_AREA_SIZE / ONE_PAGE_AREA_SIZE;
const_assert_eq!(FIXED_PAGE_AREA_SIZE % ONE_PAGE_AREA_SIZE, 0);

/// Window / reserve selection for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFlag {
    /// Near window only (the default policy).
    Near,
    /// Prefer the far window, falling back to near.
    Far,
    /// Near window first, then the urgent reserve.
    UrgentNear,
}

/// A served request: the address and the size actually consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: PhysicalAddress,
    pub size: usize,
}

/// Host accounting hooks, invoked at every raw-granule and backing-page
/// boundary. A kernel shim typically maintains its free-page counter and
/// per-page reference counts here. All hooks default to no-ops.
pub trait MemoryEvents: Sync {
    fn on_init_raw(
        &self,
        _near: PhysicalAddress,
        _near_size: usize,
        _far: PhysicalAddress,
        _far_size: usize,
    ) {
    }
    fn on_alloc_raw(&self, _area: PhysicalAddress, _size: usize) {}
    fn on_free_raw(&self, _area: PhysicalAddress, _size: usize) {}
    fn on_alloc_page(&self, _page: PhysicalAddress, _size: usize) {}
    fn on_free_page(&self, _page: PhysicalAddress, _size: usize) {}
}

/// The do-nothing hook set.
pub struct NoEvents;

impl MemoryEvents for NoEvents {}

/// Size a request would actually consume: the smallest value at or above
/// `size` that is either a power of two no larger than one granule, or a
/// whole multiple of the granule. Never smaller than [`MIN_SUBAREA_SIZE`].
pub fn calculate(size: usize) -> usize {
    if size <= MIN_SUBAREA_SIZE {
        MIN_SUBAREA_SIZE
    } else if size <= FIXED_PAGE_AREA_SIZE {
        size.next_power_of_two()
    } else {
        size.div_ceil(FIXED_PAGE_AREA_SIZE)
            .saturating_mul(FIXED_PAGE_AREA_SIZE)
    }
}

pub(crate) fn window_index(flag: AllocFlag) -> usize {
    matches!(flag, AllocFlag::Far) as usize
}

pub(crate) struct Inner {
    raw: RawArea,
    near_slots: &'static mut [PageSlot],
    far_slots: &'static mut [PageSlot],
    spa_dirs: [DirChain; 2],
    mpa_dirs: [DirChain; 2],
    hpa_dirs: [DirChain; 2],
    events: &'static dyn MemoryEvents,
}

// All interior pointers target the managed windows, which the allocator owns
// exclusively for its whole lifetime.
unsafe impl Send for Inner {}

impl Inner {
    pub(crate) fn events(&self) -> &'static dyn MemoryEvents {
        self.events
    }

    pub(crate) fn window_of(&self, addr: PhysicalAddress) -> Option<usize> {
        self.raw.window_of(addr)
    }

    fn slot_at(&mut self, addr: PhysicalAddress, align: usize) -> Option<&mut PageSlot> {
        let page = addr.align_down(align);
        match self.raw.window_of(page)? {
            0 => {
                let index = (page - self.raw.base()) / ONE_PAGE_AREA_SIZE;
                self.near_slots.get_mut(index)
            }
            _ => {
                let index = (page - self.raw.far_base()) / ONE_PAGE_AREA_SIZE;
                self.far_slots.get_mut(index)
            }
        }
    }

    /// Lookup slot of the page covering `addr`.
    pub(crate) fn page_slot(&mut self, addr: PhysicalAddress) -> Option<&mut PageSlot> {
        self.slot_at(addr, ONE_PAGE_AREA_SIZE)
    }

    /// Lookup slot of the enclosing granule's first page.
    pub(crate) fn granule_slot(&mut self, addr: PhysicalAddress) -> Option<&mut PageSlot> {
        self.slot_at(addr, FIXED_PAGE_AREA_SIZE)
    }

    fn data_pool(flag: AllocFlag) -> Pool {
        match flag {
            AllocFlag::Near => Pool::Near,
            AllocFlag::Far => Pool::Far,
            AllocFlag::UrgentNear => Pool::UrgentNear,
        }
    }

    /// Directory pages always live in the near window; only the urgent flag
    /// changes which part of it they may use.
    fn dir_pool(flag: AllocFlag) -> Pool {
        match flag {
            AllocFlag::UrgentNear => Pool::UrgentNear,
            _ => Pool::Near,
        }
    }

    /// One untagged granule for a directory page.
    pub(crate) fn alloc_dir_granule(&mut self, flag: AllocFlag) -> Result<PhysicalAddress> {
        let (addr, size) = self
            .raw
            .alloc_run(FIXED_PAGE_AREA_SIZE, Self::dir_pool(flag))?;
        debug!("new directory page at {addr}");
        self.events.on_alloc_raw(addr, size);
        Ok(addr)
    }

    pub(crate) fn free_dir_granule(&mut self, addr: PhysicalAddress) {
        let freed = self.raw.free_run(addr, FIXED_PAGE_AREA_SIZE);
        debug_assert!(freed.is_ok());
        debug!("released directory page at {addr}");
        self.events.on_free_raw(addr, FIXED_PAGE_AREA_SIZE);
    }

    /// One granule for a multi-page entry, tagged in the reverse lookup
    /// before the address is seen by anyone else.
    pub(crate) fn alloc_granule_for(
        &mut self,
        owner: NonNull<MultiPageArea>,
        flag: AllocFlag,
    ) -> Result<PhysicalAddress> {
        let (addr, size) = self
            .raw
            .alloc_run(FIXED_PAGE_AREA_SIZE, Self::data_pool(flag))?;
        if let Some(slot) = self.granule_slot(addr) {
            slot.granule = GranuleOwner::Multi(owner);
        }
        self.events.on_alloc_raw(addr, size);
        Ok(addr)
    }

    pub(crate) fn free_owned_granule(&mut self, addr: PhysicalAddress) -> Result<usize> {
        if let Some(slot) = self.granule_slot(addr) {
            slot.granule = GranuleOwner::None;
        }
        let result = self.raw.free_run(addr, FIXED_PAGE_AREA_SIZE);
        self.events.on_free_raw(addr, FIXED_PAGE_AREA_SIZE);
        result
    }

    /// A whole-granule run for a huge entry, tagged on its first granule.
    pub(crate) fn alloc_run_for(
        &mut self,
        owner: NonNull<HugeArea>,
        size: usize,
        flag: AllocFlag,
    ) -> Result<(PhysicalAddress, usize)> {
        let (addr, rounded) = self.raw.alloc_run(size, Self::data_pool(flag))?;
        if let Some(slot) = self.granule_slot(addr) {
            slot.granule = GranuleOwner::Huge(owner);
        }
        self.events.on_alloc_raw(addr, rounded);
        Ok((addr, rounded))
    }

    pub(crate) fn free_owned_run(&mut self, addr: PhysicalAddress, len: usize) -> Result<usize> {
        if let Some(slot) = self.granule_slot(addr) {
            slot.granule = GranuleOwner::None;
        }
        let result = self.raw.free_run(addr, len);
        self.events.on_free_raw(addr, len);
        result
    }
}

/// A page-and-subpage allocator over one near and one far byte window.
///
/// All methods take `&self`; state sits behind one internal spin mutex. The
/// allocator is non-reentrant and performs no blocking beyond that lock.
pub struct MemAllocator {
    inner: Mutex<Inner>,
}

impl core::fmt::Debug for MemAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemAllocator").finish_non_exhaustive()
    }
}

impl MemAllocator {
    /// Take ownership of the two windows and build the allocator inside
    /// them: both bases are aligned up to the granule (losing at most one
    /// granule each), the granule bitmap and the reverse-lookup tables are
    /// carved from the head of the near window, and `urgent_size` bytes
    /// (clamped to what remains) are reserved for [`AllocFlag::UrgentNear`].
    ///
    /// An empty `far` range configures a near-only allocator; a far window
    /// that overlaps or precedes the near window is rejected.
    ///
    /// # Safety
    ///
    /// Both ranges must denote valid, unused, non-overlapping memory that
    /// outlives the allocator and is touched by nobody else from here on.
    pub unsafe fn manage(
        near: Range<PhysicalAddress>,
        far: Range<PhysicalAddress>,
        urgent_size: usize,
        events: &'static dyn MemoryEvents,
    ) -> Result<Self> {
        let base = near.start.align_up(FIXED_PAGE_AREA_SIZE);
        if base.as_raw() >= near.end.as_raw() {
            return Err(Error::BadConfig("near window smaller than one granule"));
        }
        let bit_count = (near.end - base) / FIXED_PAGE_AREA_SIZE;
        if bit_count == 0 {
            return Err(Error::BadConfig("near window smaller than one granule"));
        }
        let near_end = base + bit_count * FIXED_PAGE_AREA_SIZE;

        let (far_base, far_bit_count) = if far.start >= far.end {
            (near_end, 0)
        } else {
            let far_aligned = far.start.align_up(FIXED_PAGE_AREA_SIZE);
            if far_aligned < near_end {
                return Err(Error::BadConfig("far window must lie beyond the near window"));
            }
            let bits = if far_aligned.as_raw() >= far.end.as_raw() {
                0
            } else {
                (far.end - far_aligned) / FIXED_PAGE_AREA_SIZE
            };
            (far_aligned, bits)
        };

        // Bitmap and lookup tables, carved from the head of the near window.
        // The tables cover both windows but the carve is near-only, charged
        // whole to the bookkeeping reservation.
        let total_bits = bit_count + far_bit_count;
        let near_pages = bit_count * PAGES_PER_GRANULE;
        let far_pages = far_bit_count * PAGES_PER_GRANULE;
        let bitmap_bytes = total_bits.div_ceil(8);
        let slots_offset = bitmap_bytes.next_multiple_of(core::mem::align_of::<PageSlot>());
        let meta_bytes = slots_offset + (near_pages + far_pages) * core::mem::size_of::<PageSlot>();
        let meta_granules = meta_bytes.div_ceil(FIXED_PAGE_AREA_SIZE);
        if meta_granules >= bit_count {
            return Err(Error::BadConfig("near window too small for bookkeeping"));
        }

        let mut urgent_granules = urgent_size.div_ceil(FIXED_PAGE_AREA_SIZE);
        let usable = bit_count - meta_granules;
        if urgent_granules > usable {
            warn!(
                "urgent reserve of {urgent_size} bytes clamped to {} granules",
                usable
            );
            urgent_granules = usable;
        }

        let bits = core::slice::from_raw_parts_mut(base.as_mut_ptr::<u8>(), bitmap_bytes);
        bits.fill(0);
        let slots_ptr = (base.as_raw() + slots_offset) as *mut PageSlot;
        for index in 0..near_pages + far_pages {
            slots_ptr.add(index).write(PageSlot::EMPTY);
        }
        let near_slots = core::slice::from_raw_parts_mut(slots_ptr, near_pages);
        let far_slots = core::slice::from_raw_parts_mut(slots_ptr.add(near_pages), far_pages);

        let raw = RawArea::new(
            base,
            bit_count,
            far_base,
            far_bit_count,
            [meta_granules, urgent_granules],
            bits,
        );

        events.on_init_raw(
            base,
            bit_count * FIXED_PAGE_AREA_SIZE,
            far_base,
            far_bit_count * FIXED_PAGE_AREA_SIZE,
        );
        events.on_alloc_raw(base, meta_granules * FIXED_PAGE_AREA_SIZE);

        Ok(Self {
            inner: Mutex::new(Inner {
                raw,
                near_slots,
                far_slots,
                spa_dirs: [new_chain(), new_chain()],
                mpa_dirs: [new_chain(), new_chain()],
                hpa_dirs: [new_chain(), new_chain()],
                events,
            }),
        })
    }

    /// Serve `size` bytes under `flag`'s window policy. The returned
    /// [`Allocation`] carries the rounded size, which is what a later free
    /// of the address will report.
    pub fn alloc(&self, size: usize, flag: AllocFlag) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let route_mpa = calculate(size) > ONE_PAGE_AREA_SIZE / 2;
        let attempts = [
            (flag == AllocFlag::Far).then_some(AllocFlag::Far),
            Some(AllocFlag::Near),
            (flag == AllocFlag::UrgentNear).then_some(AllocFlag::UrgentNear),
        ];
        for attempt in attempts.into_iter().flatten() {
            let served = if route_mpa {
                mpa::alloc(inner, size, attempt)
            } else {
                spa::alloc(inner, size, attempt)
            };
            match served {
                Ok((addr, size)) => return Ok(Allocation { addr, size }),
                Err(Error::OutOfMemory) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::OutOfMemory)
    }

    /// `2^order` pages in one contiguous piece.
    pub fn alloc_order(&self, order: u32, flag: AllocFlag) -> Result<Allocation> {
        let size = 1usize
            .checked_shl(order)
            .and_then(|pages| ONE_PAGE_AREA_SIZE.checked_mul(pages))
            .ok_or(Error::InvalidSize)?;
        self.alloc(size, flag)
    }

    /// Size-less free: the reverse lookup identifies the owning layer from
    /// the address alone. Returns the rounded size that was allocated.
    /// Failure leaves the allocator untouched.
    pub fn free(&self, addr: PhysicalAddress) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.window_of(addr).is_none() {
            return Err(Error::UnknownAddress(addr.as_raw()));
        }
        if let Some(owner) = inner.page_slot(addr).and_then(|slot| slot.spa) {
            return spa::free_hit(inner, owner, addr);
        }
        match inner.granule_slot(addr).map(|slot| slot.granule) {
            Some(GranuleOwner::Multi(owner)) => mpa::free_hit(inner, owner, addr),
            Some(GranuleOwner::Huge(owner)) => hpa::free_hit(inner, owner, addr),
            _ => Err(Error::UnknownAddress(addr.as_raw())),
        }
    }

    /// Scanning free: walks every directory of every window instead of
    /// consulting the reverse lookup. Slow; kept as a diagnostic cross-check
    /// of the lookup-driven path.
    pub fn free_scan(&self, addr: PhysicalAddress) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for window in 0..2 {
            if let Some(size) = spa::free_scan(inner, addr, window) {
                return Ok(size);
            }
        }
        for window in 0..2 {
            // a multi-page miss falls through to the huge runs
            if let Some(size) = mpa::free_scan(inner, addr, window) {
                return Ok(size);
            }
        }
        Err(Error::UnknownAddress(addr.as_raw()))
    }
}

static GLOBAL: Once<MemAllocator> = Once::new();

/// Install the process-wide default instance. The first successful call
/// configures it; later calls return the existing instance untouched.
///
/// # Safety
///
/// See [`MemAllocator::manage`].
pub unsafe fn install_global(
    near: Range<PhysicalAddress>,
    far: Range<PhysicalAddress>,
    urgent_size: usize,
    events: &'static dyn MemoryEvents,
) -> Result<&'static MemAllocator> {
    GLOBAL.try_call_once(|| MemAllocator::manage(near, far, urgent_size, events))
}

/// The instance installed by [`install_global`], if any.
pub fn global() -> Option<&'static MemAllocator> {
    GLOBAL.get()
}

#[cfg(test)]
impl MemAllocator {
    pub(crate) fn used_granule_bits(&self) -> std::vec::Vec<usize> {
        self.inner.lock().raw.used_bits()
    }

    pub(crate) fn reserved_granules(&self) -> [usize; 2] {
        self.inner.lock().raw.reserved()
    }

    pub(crate) fn near_base(&self) -> PhysicalAddress {
        self.inner.lock().raw.base()
    }

    pub(crate) fn far_base(&self) -> PhysicalAddress {
        self.inner.lock().raw.far_base()
    }

    pub(crate) fn directory_pages(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .spa_dirs
            .iter()
            .chain(inner.mpa_dirs.iter())
            .chain(inner.hpa_dirs.iter())
            .map(|chain| chain.iter().count())
            .sum()
    }

    pub(crate) fn owner_kind(&self, addr: PhysicalAddress) -> &'static str {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.page_slot(addr) {
            if slot.spa.is_some() {
                return "single";
            }
        }
        match inner.granule_slot(addr).map(|slot| slot.granule) {
            Some(GranuleOwner::Multi(_)) => "multi",
            Some(GranuleOwner::Huge(_)) => "huge",
            _ => "none",
        }
    }

    /// Every non-empty lookup slot must agree with the entry it points at.
    pub(crate) fn check_lookup_coherence(&self) {
        let inner = self.inner.lock();
        let windows = [
            (inner.raw.base(), &inner.near_slots),
            (inner.raw.far_base(), &inner.far_slots),
        ];
        for (window_base, slots) in windows {
            for (index, slot) in slots.iter().enumerate() {
                let page_addr = window_base + index * ONE_PAGE_AREA_SIZE;
                if let Some(owner) = slot.spa {
                    assert_eq!(
                        unsafe { owner.as_ref() }.base(),
                        page_addr.as_raw(),
                        "single-page owner of {page_addr} is stale"
                    );
                }
                match slot.granule {
                    GranuleOwner::None => {}
                    GranuleOwner::Multi(owner) => {
                        assert_eq!(index % PAGES_PER_GRANULE, 0);
                        assert_eq!(unsafe { owner.as_ref() }.base(), page_addr.as_raw());
                    }
                    GranuleOwner::Huge(owner) => {
                        assert_eq!(index % PAGES_PER_GRANULE, 0);
                        assert_eq!(unsafe { owner.as_ref() }.base(), page_addr.as_raw());
                    }
                }
            }
        }
    }

    pub(crate) fn lookup_is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .near_slots
            .iter()
            .chain(inner.far_slots.iter())
            .all(|slot| slot.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::vec::Vec;

    use rand::{thread_rng, Rng};

    use super::*;

    const G: usize = FIXED_PAGE_AREA_SIZE;

    // field order matters: the allocator must drop before its backing store
    struct TestHeap {
        alloc: MemAllocator,
        _backing: Vec<u8>,
    }

    fn heap_with(
        near: usize,
        far: usize,
        urgent: usize,
        events: &'static dyn MemoryEvents,
    ) -> TestHeap {
        let mut backing = vec![0u8; near + far + 3 * G];
        let start = PhysicalAddress::new(backing.as_mut_ptr() as usize);
        let near_start = start.align_up(G);
        let far_start = near_start + near;
        let alloc = unsafe {
            MemAllocator::manage(
                near_start..near_start + near,
                far_start..far_start + far,
                urgent,
                events,
            )
        }
        .unwrap();
        TestHeap {
            alloc,
            _backing: backing,
        }
    }

    fn heap(near: usize, far: usize, urgent: usize) -> TestHeap {
        heap_with(near, far, urgent, &NoEvents)
    }

    fn assert_clean(heap: &TestHeap) {
        let reserved = heap.alloc.reserved_granules();
        let used = heap.alloc.used_granule_bits();
        assert_eq!(used, (0..reserved[0]).collect::<Vec<_>>());
        assert_eq!(heap.alloc.directory_pages(), 0);
        assert!(heap.alloc.lookup_is_empty());
    }

    fn assert_disjoint(live: &HashMap<usize, usize>) {
        let mut ranges: Vec<(usize, usize)> = live.iter().map(|(&a, &s)| (a, s)).collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 <= pair[1].0,
                "allocations overlap: {pair:?}"
            );
        }
    }

    #[test]
    fn calculate_rounds_the_documented_way() {
        assert_eq!(calculate(0), 32);
        assert_eq!(calculate(1), 32);
        assert_eq!(calculate(32), 32);
        assert_eq!(calculate(33), 64);
        assert_eq!(calculate(100), 128);
        assert_eq!(calculate(2048), 2048);
        assert_eq!(calculate(2049), 4096);
        assert_eq!(calculate(4095), 4096);
        assert_eq!(calculate(4097), 8192);
        assert_eq!(calculate(131072), 131072);
        assert_eq!(calculate(131073), 262144);
        assert_eq!(calculate(262145), 393216);
    }

    #[test]
    fn calculate_is_monotonic() {
        let mut rng = thread_rng();
        for _ in 0..10_000 {
            let a = rng.gen_range(0..2 * G);
            let b = rng.gen_range(0..2 * G);
            let (lo, hi) = (a.min(b), a.max(b));
            assert!(calculate(lo) <= calculate(hi));
        }
    }

    #[test]
    fn small_roundtrip() {
        let heap = heap(16 * G, 0, 0);
        let a = heap.alloc.alloc(100, AllocFlag::Near).unwrap();
        assert_eq!(a.size, 128);
        assert_eq!(heap.alloc.owner_kind(a.addr), "single");
        assert_eq!(heap.alloc.free(a.addr).unwrap(), 128);
        assert_clean(&heap);
    }

    #[test]
    fn page_boundary_requests_route_to_granule_classes() {
        let heap = heap(16 * G, 0, 0);
        let a = heap.alloc.alloc(4095, AllocFlag::Near).unwrap();
        let b = heap.alloc.alloc(4097, AllocFlag::Near).unwrap();
        assert_eq!(a.size, 4096);
        assert_eq!(b.size, 8192);
        assert_eq!(heap.alloc.owner_kind(a.addr), "multi");
        assert_eq!(heap.alloc.free(a.addr).unwrap(), 4096);
        assert_eq!(heap.alloc.free(b.addr).unwrap(), 8192);
        assert_clean(&heap);
    }

    #[test]
    fn oversized_requests_become_granule_runs() {
        let heap = heap(16 * G, 0, 0);
        let a = heap.alloc.alloc(262145, AllocFlag::Near).unwrap();
        assert_eq!(a.size, 3 * G);
        assert!(a.addr.is_aligned(G));
        assert_eq!(heap.alloc.owner_kind(a.addr), "huge");
        assert_eq!(heap.alloc.free(a.addr).unwrap(), 3 * G);
        assert_clean(&heap);
    }

    #[test]
    fn order_allocations_roundtrip() {
        let heap = heap(64 * G, 0, 0);
        let mut live = Vec::new();
        for _ in 0..10 {
            let a = heap.alloc.alloc_order(7, AllocFlag::Near).unwrap();
            assert_eq!(a.size, ONE_PAGE_AREA_SIZE << 7);
            live.push(a.addr);
        }
        for addr in live.into_iter().rev() {
            assert_eq!(heap.alloc.free(addr).unwrap(), ONE_PAGE_AREA_SIZE << 7);
        }
        assert_clean(&heap);
    }

    #[test]
    fn urgent_reserve_is_isolated() {
        let heap = heap(32 * G, 0, 8 * G);
        let [meta, urgent] = heap.alloc.reserved_granules();
        assert_eq!(urgent, 8);

        let mut live = Vec::new();
        loop {
            match heap.alloc.alloc(64, AllocFlag::Near) {
                Ok(a) => live.push(a.addr),
                Err(Error::OutOfMemory) => break,
                Err(err) => panic!("unexpected failure: {err}"),
            }
        }
        // the near pool is exhausted but nothing leaked into the reserve
        let urgent_range = meta..meta + urgent;
        assert!(heap
            .alloc
            .used_granule_bits()
            .into_iter()
            .all(|bit| !urgent_range.contains(&bit)));
        assert!(matches!(
            heap.alloc.alloc(64, AllocFlag::Near),
            Err(Error::OutOfMemory)
        ));

        let rescue = heap.alloc.alloc(G, AllocFlag::UrgentNear).unwrap();
        let urgent_base = heap.alloc.near_base() + meta * G;
        assert!(rescue.addr >= urgent_base && rescue.addr < urgent_base + urgent * G);
        // the plain policy still may not touch the reserve
        assert!(matches!(
            heap.alloc.alloc(G, AllocFlag::Near),
            Err(Error::OutOfMemory)
        ));

        assert_eq!(heap.alloc.free(rescue.addr).unwrap(), G);
        for addr in live {
            heap.alloc.free(addr).unwrap();
        }
        assert_clean(&heap);
    }

    #[test]
    fn far_window_allocations() {
        let heap = heap(32 * G, 32 * G, 0);
        let far_base = heap.alloc.far_base();

        let small = heap.alloc.alloc(64, AllocFlag::Far).unwrap();
        // first far data page is the very first far granule
        assert_eq!(small.addr, far_base);
        assert_eq!(heap.alloc.owner_kind(small.addr), "single");
        heap.alloc.check_lookup_coherence();
        assert_eq!(heap.alloc.free(small.addr).unwrap(), 64);

        let huge = heap.alloc.alloc(200 * 1024, AllocFlag::Far).unwrap();
        assert_eq!(huge.addr, far_base);
        assert_eq!(huge.size, 2 * G);
        assert_eq!(heap.alloc.owner_kind(huge.addr), "huge");
        assert_eq!(heap.alloc.free(huge.addr).unwrap(), 2 * G);
        assert_clean(&heap);
    }

    #[test]
    fn far_policy_falls_back_to_near() {
        let heap = heap(32 * G, 0, 0);
        let a = heap.alloc.alloc(1000, AllocFlag::Far).unwrap();
        assert_eq!(a.size, 1024);
        let near_base = heap.alloc.near_base();
        assert!(a.addr >= near_base && a.addr < near_base + 32 * G);
        assert_eq!(heap.alloc.free(a.addr).unwrap(), 1024);
        assert_clean(&heap);
    }

    #[test]
    fn bad_window_configurations_are_rejected() {
        let mut backing = vec![0u8; 8 * G];
        let start = PhysicalAddress::new(backing.as_mut_ptr() as usize).align_up(G);

        // far overlapping near
        let err = unsafe {
            MemAllocator::manage(start..start + 4 * G, start + 2 * G..start + 6 * G, 0, &NoEvents)
        }
        .unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));

        // near window too small to hold anything
        let err = unsafe {
            MemAllocator::manage(start..start + 100, start + G..start + 2 * G, 0, &NoEvents)
        }
        .unwrap_err();
        assert!(matches!(err, Error::BadConfig(_)));
    }

    #[test]
    fn oversized_urgent_reserve_is_clamped() {
        let heap = heap(16 * G, 0, 1024 * G);
        let [meta, urgent] = heap.alloc.reserved_granules();
        assert_eq!(meta + urgent, 16);
        // everything beyond bookkeeping went to the reserve; only urgent
        // requests can allocate at all
        assert!(matches!(
            heap.alloc.alloc(64, AllocFlag::Near),
            Err(Error::OutOfMemory)
        ));
        let a = heap.alloc.alloc(64, AllocFlag::UrgentNear).unwrap();
        assert_eq!(heap.alloc.free(a.addr).unwrap(), 64);
        assert_clean(&heap);
    }

    #[test]
    fn frees_of_alien_and_stale_pointers_change_nothing() {
        let heap = heap(16 * G, 0, 0);
        let a = heap.alloc.alloc(500, AllocFlag::Near).unwrap();
        assert_eq!(a.size, 512);

        // outside both windows
        assert!(matches!(
            heap.alloc.free(PhysicalAddress::new(0x10)),
            Err(Error::UnknownAddress(_))
        ));
        // interior pointer, not a subarea boundary
        assert!(matches!(
            heap.alloc.free(a.addr + 3),
            Err(Error::Misaligned(_))
        ));
        // in-window page nobody owns
        let idle = heap.alloc.near_base() + 15 * G;
        assert!(matches!(
            heap.alloc.free(idle),
            Err(Error::UnknownAddress(_))
        ));

        assert_eq!(heap.alloc.free(a.addr).unwrap(), 512);
        assert!(matches!(
            heap.alloc.free(a.addr),
            Err(Error::UnknownAddress(_) | Error::DoubleFree(_))
        ));
        assert_clean(&heap);
    }

    #[test]
    fn scanning_free_agrees_with_lookup_free() {
        let heap = heap(64 * G, 32 * G, 0);
        let sizes = [40, 700, 2048, 5000, 70_000, 140_000, 300_000];
        let mut live = Vec::new();
        for (index, &size) in sizes.iter().enumerate() {
            let flag = if index % 2 == 0 {
                AllocFlag::Near
            } else {
                AllocFlag::Far
            };
            let a = heap.alloc.alloc(size, flag).unwrap();
            assert_eq!(a.size, calculate(size));
            live.push(a);
        }
        for (index, a) in live.into_iter().enumerate() {
            let freed = if index % 2 == 0 {
                heap.alloc.free_scan(a.addr).unwrap()
            } else {
                heap.alloc.free(a.addr).unwrap()
            };
            assert_eq!(freed, a.size);
        }
        assert_clean(&heap);
    }

    #[test]
    fn randomized_workload_holds_the_invariants() {
        let heap = heap(128 * G, 64 * G, 8 * G);
        let mut rng = thread_rng();
        let mut live: HashMap<usize, usize> = HashMap::new();

        for step in 0..600 {
            if !live.is_empty() && rng.gen_bool(0.45) {
                let &addr = live.keys().next().unwrap();
                let rounded = live.remove(&addr).unwrap();
                assert_eq!(heap.alloc.free(PhysicalAddress::new(addr)).unwrap(), rounded);
            } else {
                let size = match rng.gen_range(0..10) {
                    0..=5 => rng.gen_range(1..=2048),
                    6..=8 => rng.gen_range(2049..=131_072),
                    _ => rng.gen_range(131_073..=500_000),
                };
                let flag = match rng.gen_range(0..10) {
                    0..=6 => AllocFlag::Near,
                    7..=8 => AllocFlag::Far,
                    _ => AllocFlag::UrgentNear,
                };
                match heap.alloc.alloc(size, flag) {
                    Ok(a) => {
                        assert_eq!(a.size, calculate(size));
                        assert!(live.insert(a.addr.as_raw(), a.size).is_none());
                    }
                    Err(Error::OutOfMemory) => {}
                    Err(err) => panic!("unexpected failure: {err}"),
                }
            }
            assert_disjoint(&live);
            if step % 100 == 0 {
                heap.alloc.check_lookup_coherence();
            }
        }

        for (addr, rounded) in live.drain() {
            assert_eq!(heap.alloc.free(PhysicalAddress::new(addr)).unwrap(), rounded);
        }
        assert_clean(&heap);
    }

    #[test]
    fn directory_pages_cycle_with_demand() {
        let heap = heap(32 * G, 0, 0);
        assert_eq!(heap.alloc.directory_pages(), 0);
        let a = heap.alloc.alloc(64, AllocFlag::Near).unwrap();
        // one single-page and one multi-page directory
        assert_eq!(heap.alloc.directory_pages(), 2);
        heap.alloc.free(a.addr).unwrap();
        assert_eq!(heap.alloc.directory_pages(), 0);

        let b = heap.alloc.alloc(G, AllocFlag::Near).unwrap();
        assert_eq!(heap.alloc.directory_pages(), 1);
        heap.alloc.free(b.addr).unwrap();
        assert_clean(&heap);
    }

    struct CountingEvents {
        raw_bytes: AtomicIsize,
        pages: AtomicIsize,
    }

    impl MemoryEvents for CountingEvents {
        fn on_alloc_raw(&self, _area: PhysicalAddress, size: usize) {
            self.raw_bytes.fetch_add(size as isize, Ordering::Relaxed);
        }
        fn on_free_raw(&self, _area: PhysicalAddress, size: usize) {
            self.raw_bytes.fetch_sub(size as isize, Ordering::Relaxed);
        }
        fn on_alloc_page(&self, _page: PhysicalAddress, _size: usize) {
            self.pages.fetch_add(1, Ordering::Relaxed);
        }
        fn on_free_page(&self, _page: PhysicalAddress, _size: usize) {
            self.pages.fetch_sub(1, Ordering::Relaxed);
        }
    }

    static COUNTING: CountingEvents = CountingEvents {
        raw_bytes: AtomicIsize::new(0),
        pages: AtomicIsize::new(0),
    };

    #[test]
    fn event_hooks_balance_out() {
        let heap = heap_with(32 * G, 0, 0, &COUNTING);
        let meta_bytes = heap.alloc.reserved_granules()[0] as isize * G as isize;

        let mut live = Vec::new();
        for size in [50, 3000, 40_000, 300_000, 64, 128] {
            live.push(heap.alloc.alloc(size, AllocFlag::Near).unwrap().addr);
        }
        assert!(COUNTING.raw_bytes.load(Ordering::Relaxed) > meta_bytes);
        assert!(COUNTING.pages.load(Ordering::Relaxed) > 0);

        for addr in live {
            heap.alloc.free(addr).unwrap();
        }
        assert_eq!(COUNTING.raw_bytes.load(Ordering::Relaxed), meta_bytes);
        assert_eq!(COUNTING.pages.load(Ordering::Relaxed), 0);
        assert_clean(&heap);
    }

    #[test]
    fn contended_use_through_the_mutex() {
        use rayon::prelude::*;

        let heap = heap(64 * G, 0, 0);
        let alloc = &heap.alloc;

        let served: Vec<(usize, usize)> = (0..200usize)
            .into_par_iter()
            .map(|index| {
                let size = 64 + (index * 97) % 4000;
                let a = alloc.alloc(size, AllocFlag::Near).unwrap();
                (a.addr.as_raw(), a.size)
            })
            .collect();

        let mut sorted = served.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }

        served.par_iter().for_each(|&(addr, size)| {
            assert_eq!(alloc.free(PhysicalAddress::new(addr)).unwrap(), size);
        });
        assert_clean(&heap);
    }

    #[test]
    fn global_instance_installs_once() {
        let mut backing = vec![0u8; 8 * G];
        let start = PhysicalAddress::new(backing.as_mut_ptr() as usize).align_up(G);
        let near = start..start + 4 * G;
        let first =
            unsafe { install_global(near.clone(), near.end..near.end, 0, &NoEvents) }.unwrap();
        let again =
            unsafe { install_global(near.clone(), near.end..near.end, 0, &NoEvents) }.unwrap();
        assert!(core::ptr::eq(first, again));
        assert!(global().is_some());

        let a = global().unwrap().alloc(64, AllocFlag::Near).unwrap();
        assert_eq!(global().unwrap().free(a.addr).unwrap(), 64);
        // the backing buffer must outlive the static instance
        core::mem::forget(backing);
    }
}
