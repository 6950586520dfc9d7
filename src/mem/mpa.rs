//! Multi-page areas: one 128 KiB granule subdivided into subareas of
//! 4 KiB..128 KiB, one size class per entry. Also the supplier of single
//! backing pages for the layer below and the fall-through into huge runs for
//! anything above the largest class.

use core::cell::Cell;
use core::mem::{offset_of, size_of};
use core::ptr::NonNull;

use log::warn;
use static_assertions::{const_assert, const_assert_eq};

use crate::address::PhysicalAddress;
use crate::error::{Error, Result};
use crate::list::{entry_of, Link};
use crate::mem::directory::{self, ClassRow, DirEntry, DirPage, DirPageHead};
use crate::mem::hash::GranuleOwner;
use crate::mem::spa::SinglePageArea;
use crate::mem::{
    hpa, window_index, AllocFlag, Inner, FIXED_PAGE_AREA_SIZE, ONE_PAGE_AREA_SIZE,
};

pub(crate) const MPA_CLASSES: [usize; 6] = [4096, 8192, 16384, 32768, 65536, 131072];

/// Describes one granule subdivided for a single size class.
#[repr(C)]
pub(crate) struct MultiPageArea {
    link: Link,
    base: Cell<usize>,
    row: Cell<Option<NonNull<ClassRow>>>,
    bits: Cell<u32>,
    used: Cell<u32>,
}

const_assert_eq!(offset_of!(MultiPageArea, link), 0);
const_assert!(FIXED_PAGE_AREA_SIZE / ONE_PAGE_AREA_SIZE <= 32);

impl DirEntry for MultiPageArea {
    const INIT: Self = Self {
        link: Link::new(),
        base: Cell::new(0),
        row: Cell::new(None),
        bits: Cell::new(0),
        used: Cell::new(0),
    };

    fn link(&self) -> &Link {
        &self.link
    }
}

impl MultiPageArea {
    pub fn base(&self) -> usize {
        self.base.get()
    }

    fn claim(&self, capacity: u32) -> Option<u32> {
        let value = self.bits.get();
        if value == u32::MAX {
            return None;
        }
        let index = value.trailing_ones();
        if index >= capacity {
            return None;
        }
        self.bits.set(value | 1 << index);
        self.used.set(self.used.get() + 1);
        Some(index)
    }

    fn test_and_clear(&self, index: u32) -> bool {
        let mask = 1u32 << index;
        let value = self.bits.get();
        if value & mask == 0 {
            return false;
        }
        self.bits.set(value & !mask);
        self.used.set(self.used.get() - 1);
        true
    }

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
        self.bits.set(1);
        self.used.set(1);
    }

    fn reset(&self) {
        self.base.set(0);
        self.row.set(None);
        self.bits.set(0);
        self.used.set(0);
    }
}

#[repr(C)]
pub(crate) struct MpaDirPage {
    head: DirPageHead,
    classes: [ClassRow; MPA_CLASSES.len()],
}

const_assert_eq!(offset_of!(MpaDirPage, head), 0);
const_assert!(size_of::<MpaDirPage>() + size_of::<MultiPageArea>() <= FIXED_PAGE_AREA_SIZE);

impl DirPage for MpaDirPage {
    type Entry = MultiPageArea;

    unsafe fn write_header(ptr: *mut Self) {
        ptr.write(Self {
            head: DirPageHead::new(),
            classes: core::array::from_fn(|i| ClassRow::new(MPA_CLASSES[i])),
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

/// Serve a medium request out of the first class that fits; anything larger
/// than the largest class falls through to the huge-run layer.
pub(crate) fn alloc(
    inner: &mut Inner,
    size: usize,
    flag: AllocFlag,
) -> Result<(PhysicalAddress, usize)> {
    if size == 0 {
        return Err(Error::InvalidSize);
    }
    let Some(class_index) = MPA_CLASSES.iter().position(|&c| c >= size) else {
        return hpa::alloc(inner, size, flag);
    };
    let class = MPA_CLASSES[class_index];
    let capacity = (FIXED_PAGE_AREA_SIZE / class) as u32;
    let window = window_index(flag);

    for head in inner.mpa_dirs[window].iter() {
        let page = unsafe { MpaDirPage::from_head(head) };
        let row = &page.classes[class_index];
        for link in row.chain.iter() {
            let entry = unsafe { entry_of::<MultiPageArea>(link).as_ref() };
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

    let mut spare: Option<NonNull<MpaDirPage>> = None;
    for head in inner.mpa_dirs[window].iter() {
        if head.has_spare() {
            spare = Some(NonNull::from(unsafe { MpaDirPage::from_head(head) }));
            break;
        }
    }
    let page_ptr = match spare {
        Some(page) => page,
        None => {
            let area = inner.alloc_dir_granule(flag)?;
            let page = unsafe { directory::format_page::<MpaDirPage>(area) };
            inner.mpa_dirs[window].push_front(&page.head);
            NonNull::from(page)
        }
    };
    let page = unsafe { page_ptr.as_ref() };
    let Some(free_link) = page.head.first_free() else {
        return Err(Error::OutOfMemory);
    };
    let entry_ptr = unsafe { entry_of::<MultiPageArea>(free_link) };
    let base = match inner.alloc_granule_for(entry_ptr, flag) {
        Ok(base) => base,
        Err(err) => {
            // Do not strand a directory page that never got an entry placed.
            if page.head.all_free() {
                directory::unlink_page(&mut inner.mpa_dirs[window], &page.head);
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

/// One 4 KiB backing page for a single-page entry, tagged with its owner in
/// the reverse lookup before the address escapes.
pub(crate) fn alloc_page(
    inner: &mut Inner,
    owner: NonNull<SinglePageArea>,
    flag: AllocFlag,
) -> Result<PhysicalAddress> {
    let (page, size) = alloc(inner, ONE_PAGE_AREA_SIZE, flag)?;
    debug_assert_eq!(size, ONE_PAGE_AREA_SIZE);
    if let Some(slot) = inner.page_slot(page) {
        slot.spa = Some(owner);
    }
    inner.events().on_alloc_page(page, size);
    Ok(page)
}

/// Return a backing page to the granule that carved it. Internal call; the
/// page owner tag is dropped before the subarea bit is given back.
pub(crate) fn free_page(inner: &mut Inner, page: PhysicalAddress) -> usize {
    let Some(owner) = inner.granule_slot(page).map(|slot| slot.granule) else {
        return 0;
    };
    let GranuleOwner::Multi(entry) = owner else {
        warn!("backing page {page} has no multi-page owner");
        return 0;
    };
    if let Some(slot) = inner.page_slot(page) {
        slot.spa = None;
    }
    let size = free_hit(inner, entry, page).unwrap_or(0);
    inner.events().on_free_page(page, size);
    size
}

pub(crate) fn free_hit(
    inner: &mut Inner,
    entry_ptr: NonNull<MultiPageArea>,
    addr: PhysicalAddress,
) -> Result<usize> {
    if !addr.is_aligned(ONE_PAGE_AREA_SIZE) {
        return Err(Error::Misaligned(addr.as_raw()));
    }
    let window = inner
        .window_of(addr)
        .ok_or(Error::UnknownAddress(addr.as_raw()))?;
    let entry = unsafe { entry_ptr.as_ref() };
    let Some(row_ptr) = entry.row.get() else {
        warn!("multi-page lookup for {addr} hit a retired entry");
        return Err(Error::UnknownAddress(addr.as_raw()));
    };
    let row = unsafe { row_ptr.as_ref() };
    let class = row.size();
    let capacity = (FIXED_PAGE_AREA_SIZE / class) as u32;
    let Some(slot) = entry.slot_index(addr.as_raw(), class, capacity) else {
        return Err(Error::Misaligned(addr.as_raw()));
    };
    let was_full = entry.used.get() == capacity;
    if !entry.test_and_clear(slot) {
        warn!("double free of {addr} in the {class}-byte class");
        return Err(Error::DoubleFree(addr.as_raw()));
    }

    if entry.used.get() == 0 {
        let granule = PhysicalAddress::new(entry.base());
        let freed = inner.free_owned_granule(granule);
        debug_assert!(freed.is_ok());
        entry.link.unlink();
        entry.reset();
        let page_addr = directory::page_of(entry_ptr);
        let page = unsafe { &*page_addr.as_ptr::<MpaDirPage>() };
        page.head.recycle(&entry.link);
        if page.head.all_free() {
            directory::unlink_page(&mut inner.mpa_dirs[window], &page.head);
            inner.free_dir_granule(page_addr);
        }
    } else if was_full {
        entry.link.unlink();
        row.chain.push_front(&entry.link);
    }
    Ok(class)
}

/// Slow diagnostic path. A miss falls through to the huge-run layer, which
/// serves everything above the largest class.
pub(crate) fn free_scan(inner: &mut Inner, addr: PhysicalAddress, window: usize) -> Option<usize> {
    if !addr.is_aligned(ONE_PAGE_AREA_SIZE) {
        return None;
    }
    let granule_base = addr.align_down(FIXED_PAGE_AREA_SIZE).as_raw();
    let mut hit: Option<NonNull<MultiPageArea>> = None;
    'pages: for head in inner.mpa_dirs[window].iter() {
        let page = unsafe { MpaDirPage::from_head(head) };
        for row in &page.classes {
            for link in row.full.iter().chain(row.chain.iter()) {
                let entry_ptr = unsafe { entry_of::<MultiPageArea>(link) };
                if unsafe { entry_ptr.as_ref() }.base() == granule_base {
                    hit = Some(entry_ptr);
                    break 'pages;
                }
            }
        }
    }
    match hit {
        Some(entry) => free_hit(inner, entry, addr).ok(),
        None => hpa::free_scan(inner, addr, window),
    }
}
