//! Single-page areas: one 4 KiB page subdivided into power-of-two subareas
//! of 32..2048 bytes, one size class per entry.

use core::cell::Cell;
use core::mem::{offset_of, size_of};
use core::ptr::NonNull;

use log::warn;
use static_assertions::{const_assert, const_assert_eq};

use crate::address::PhysicalAddress;
use crate::error::{Error, Result};
use crate::list::{entry_of, Link};
use crate::mem::directory::{self, ClassRow, DirEntry, DirPage, DirPageHead};
use crate::mem::{
    mpa, window_index, AllocFlag, Inner, FIXED_PAGE_AREA_SIZE, MIN_SUBAREA_SIZE,
    ONE_PAGE_AREA_SIZE,
};

pub(crate) const SPA_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];

/// Describes one backing page subdivided for a single size class. Lives
/// inside a directory page; all mutable state is `Cell`-based so ring
/// neighbours stay untouched while an entry is updated in place.
#[repr(C)]
pub(crate) struct SinglePageArea {
    link: Link,
    base: Cell<usize>,
    row: Cell<Option<NonNull<ClassRow>>>,
    bits: [Cell<u32>; 4],
    used: Cell<u32>,
}

const_assert_eq!(offset_of!(SinglePageArea, link), 0);
// every subarea of the smallest class gets a bit
const_assert!(ONE_PAGE_AREA_SIZE / MIN_SUBAREA_SIZE <= 4 * 32);

impl DirEntry for SinglePageArea {
    const INIT: Self = Self {
        link: Link::new(),
        base: Cell::new(0),
        row: Cell::new(None),
        bits: [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)],
        used: Cell::new(0),
    };

    fn link(&self) -> &Link {
        &self.link
    }
}

impl SinglePageArea {
    pub fn base(&self) -> usize {
        self.base.get()
    }

    /// Take the lowest clear subarea bit, if the entry still has room.
    fn claim(&self, capacity: u32) -> Option<u32> {
        for (word_index, word) in self.bits.iter().enumerate() {
            let value = word.get();
            if value == u32::MAX {
                continue;
            }
            let bit = value.trailing_ones();
            let index = word_index as u32 * 32 + bit;
            if index >= capacity {
                return None;
            }
            word.set(value | 1 << bit);
            self.used.set(self.used.get() + 1);
            return Some(index);
        }
        None
    }

    /// Clear one subarea bit; `false` means the bit was already clear and
    /// nothing was changed.
    fn test_and_clear(&self, index: u32) -> bool {
        let word = &self.bits[(index / 32) as usize];
        let mask = 1u32 << (index % 32);
        let value = word.get();
        if value & mask == 0 {
            return false;
        }
        word.set(value & !mask);
        self.used.set(self.used.get() - 1);
        true
    }

    /// Subarea index of `addr`, provided it is an exact slot boundary.
    fn slot_index(&self, addr: usize, class: usize, capacity: u32) -> Option<u32> {
        let base = self.base.get();
        if base == 0 || addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % class != 0 {
            return None;
        }
        let index = (offset / class) as u32;
        (index < capacity).then_some(index)
    }

    fn assign(&self, base: usize, row: NonNull<ClassRow>) {
        self.base.set(base);
        self.row.set(Some(row));
        self.bits[0].set(1);
        for word in &self.bits[1..] {
            word.set(0);
        }
        self.used.set(1);
    }

    fn reset(&self) {
        self.base.set(0);
        self.row.set(None);
        for word in &self.bits {
            word.set(0);
        }
        self.used.set(0);
    }
}

#[repr(C)]
pub(crate) struct SpaDirPage {
    head: DirPageHead,
    classes: [ClassRow; SPA_CLASSES.len()],
}

const_assert_eq!(offset_of!(SpaDirPage, head), 0);
const_assert!(size_of::<SpaDirPage>() + size_of::<SinglePageArea>() <= FIXED_PAGE_AREA_SIZE);

impl DirPage for SpaDirPage {
    type Entry = SinglePageArea;

    unsafe fn write_header(ptr: *mut Self) {
        ptr.write(Self {
            head: DirPageHead::new(),
            classes: core::array::from_fn(|i| ClassRow::new(SPA_CLASSES[i])),
        });
        (*ptr).head.init_rings();
        for row in &(*ptr).classes {
            row.init_rings();
        }
    }

    fn head(&self) -> &DirPageHead {
        &self.head
    }
}

/// Serve a small request out of the first size class that fits, preferring
/// partially used entries anywhere in the window's directory chain before
/// putting a spare entry (and a fresh backing page) to work.
pub(crate) fn alloc(
    inner: &mut Inner,
    size: usize,
    flag: AllocFlag,
) -> Result<(PhysicalAddress, usize)> {
    if size == 0 {
        return Err(Error::InvalidSize);
    }
    let Some(class_index) = SPA_CLASSES.iter().position(|&c| c >= size) else {
        return Err(Error::OutOfMemory);
    };
    let class = SPA_CLASSES[class_index];
    let capacity = (ONE_PAGE_AREA_SIZE / class) as u32;
    let window = window_index(flag);

    for head in inner.spa_dirs[window].iter() {
        let page = unsafe { SpaDirPage::from_head(head) };
        let row = &page.classes[class_index];
        for link in row.chain.iter() {
            let entry = unsafe { entry_of::<SinglePageArea>(link).as_ref() };
            if let Some(slot) = entry.claim(capacity) {
                if entry.used.get() == capacity {
                    entry.link.unlink();
                    row.full.push_front(&entry.link);
                }
                return Ok((
                    PhysicalAddress::new(entry.base.get() + class * slot as usize),
                    class,
                ));
            }
        }
    }

    // No partial entry anywhere: bring a spare entry into play.
    let mut spare: Option<NonNull<SpaDirPage>> = None;
    for head in inner.spa_dirs[window].iter() {
        if head.has_spare() {
            spare = Some(NonNull::from(unsafe { SpaDirPage::from_head(head) }));
            break;
        }
    }
    let page_ptr = match spare {
        Some(page) => page,
        None => {
            let area = inner.alloc_dir_granule(flag)?;
            let page = unsafe { directory::format_page::<SpaDirPage>(area) };
            inner.spa_dirs[window].push_front(&page.head);
            NonNull::from(page)
        }
    };
    let page = unsafe { page_ptr.as_ref() };
    let Some(free_link) = page.head.first_free() else {
        return Err(Error::OutOfMemory);
    };
    let entry_ptr = unsafe { entry_of::<SinglePageArea>(free_link) };
    let base = match mpa::alloc_page(inner, entry_ptr, flag) {
        Ok(base) => base,
        Err(err) => {
            // Do not strand a directory page that never got an entry placed.
            if page.head.all_free() {
                directory::unlink_page(&mut inner.spa_dirs[window], &page.head);
                inner.free_dir_granule(directory::page_of(page_ptr));
            }
            return Err(err);
        }
    };
    let entry = unsafe { entry_ptr.as_ref() };
    page.head.consume_free(&entry.link);
    let row = &page.classes[class_index];
    entry.assign(base.as_raw(), NonNull::from(row));
    if capacity == 1 {
        row.full.push_front(&entry.link);
    } else {
        row.chain.push_front(&entry.link);
    }
    Ok((base, class))
}

/// Free `addr` out of the entry the reverse lookup resolved. O(1) except for
/// the page-return cascade when the entry empties.
pub(crate) fn free_hit(
    inner: &mut Inner,
    entry_ptr: NonNull<SinglePageArea>,
    addr: PhysicalAddress,
) -> Result<usize> {
    let window = inner
        .window_of(addr)
        .ok_or(Error::UnknownAddress(addr.as_raw()))?;
    let entry = unsafe { entry_ptr.as_ref() };
    let Some(row_ptr) = entry.row.get() else {
        warn!("single-page lookup for {addr} hit a retired entry");
        return Err(Error::UnknownAddress(addr.as_raw()));
    };
    let row = unsafe { row_ptr.as_ref() };
    let class = row.size();
    let capacity = (ONE_PAGE_AREA_SIZE / class) as u32;
    let Some(slot) = entry.slot_index(addr.as_raw(), class, capacity) else {
        return Err(Error::Misaligned(addr.as_raw()));
    };
    let was_full = entry.used.get() == capacity;
    if !entry.test_and_clear(slot) {
        warn!("double free of {addr} in the {class}-byte class");
        return Err(Error::DoubleFree(addr.as_raw()));
    }

    if entry.used.get() == 0 {
        mpa::free_page(inner, PhysicalAddress::new(entry.base()));
        entry.link.unlink();
        entry.reset();
        let page_addr = directory::page_of(entry_ptr);
        let page = unsafe { &*page_addr.as_ptr::<SpaDirPage>() };
        page.head.recycle(&entry.link);
        if page.head.all_free() {
            directory::unlink_page(&mut inner.spa_dirs[window], &page.head);
            inner.free_dir_granule(page_addr);
        }
    } else if was_full {
        entry.link.unlink();
        row.chain.push_front(&entry.link);
    }
    Ok(class)
}

/// Slow diagnostic path: walk every directory page of the window looking for
/// the entry owning `addr`'s page, then free through the common path.
pub(crate) fn free_scan(inner: &mut Inner, addr: PhysicalAddress, window: usize) -> Option<usize> {
    let page_base = addr.align_down(ONE_PAGE_AREA_SIZE).as_raw();
    let mut hit: Option<NonNull<SinglePageArea>> = None;
    'pages: for head in inner.spa_dirs[window].iter() {
        let page = unsafe { SpaDirPage::from_head(head) };
        for row in &page.classes {
            for link in row.full.iter().chain(row.chain.iter()) {
                let entry_ptr = unsafe { entry_of::<SinglePageArea>(link) };
                if unsafe { entry_ptr.as_ref() }.base() == page_base {
                    hit = Some(entry_ptr);
                    break 'pages;
                }
            }
        }
    }
    free_hit(inner, hit?, addr).ok()
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use super::{ClassRow, DirEntry, SinglePageArea};

    #[test]
    fn claim_fills_lowest_bit_first() {
        let row = ClassRow::new(32);
        row.init_rings();
        let entry = SinglePageArea::INIT;
        entry.assign(0x8000, NonNull::from(&row));

        for expected in 1u32..128 {
            assert_eq!(entry.claim(128), Some(expected));
        }
        assert_eq!(entry.claim(128), None);

        assert!(entry.test_and_clear(77));
        assert!(!entry.test_and_clear(77));
        assert_eq!(entry.claim(128), Some(77));
    }

    #[test]
    fn capacity_bounds_the_bitmap() {
        let row = ClassRow::new(2048);
        row.init_rings();
        let entry = SinglePageArea::INIT;
        entry.assign(0x8000, NonNull::from(&row));

        assert_eq!(entry.claim(2), Some(1));
        assert_eq!(entry.claim(2), None);
    }

    #[test]
    fn slot_index_requires_exact_boundaries() {
        let row = ClassRow::new(256);
        row.init_rings();
        let entry = SinglePageArea::INIT;
        entry.assign(0x8000, NonNull::from(&row));

        assert_eq!(entry.slot_index(0x8000, 256, 16), Some(0));
        assert_eq!(entry.slot_index(0x8000 + 256 * 3, 256, 16), Some(3));
        assert_eq!(entry.slot_index(0x8000 + 100, 256, 16), None);
        assert_eq!(entry.slot_index(0x8000 + 256 * 16, 256, 16), None);
        assert_eq!(entry.slot_index(0x7000, 256, 16), None);
    }
}
