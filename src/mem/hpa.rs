//! Huge-page areas: contiguous multi-granule runs recorded one entry per
//! allocation. No size classes; a directory page carries a free ring and a
//! hot ring of live runs.

use core::cell::Cell;
use core::mem::offset_of;
use core::ptr::NonNull;

use log::warn;
use static_assertions::const_assert_eq;

use crate::address::PhysicalAddress;
use crate::error::{Error, Result};
use crate::list::{entry_of, Link};
use crate::mem::directory::{self, DirEntry, DirPage, DirPageHead};
use crate::mem::{window_index, AllocFlag, Inner, FIXED_PAGE_AREA_SIZE};

/// One contiguous granule run and its byte length.
#[repr(C)]
pub(crate) struct HugeArea {
    link: Link,
    base: Cell<usize>,
    len: Cell<usize>,
}

const_assert_eq!(offset_of!(HugeArea, link), 0);

impl DirEntry for HugeArea {
    const INIT: Self = Self {
        link: Link::new(),
        base: Cell::new(0),
        len: Cell::new(0),
    };

    fn link(&self) -> &Link {
        &self.link
    }
}

impl HugeArea {
    pub fn base(&self) -> usize {
        self.base.get()
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }
}

#[repr(C)]
pub(crate) struct HpaDirPage {
    head: DirPageHead,
    hot: Link,
}

const_assert_eq!(offset_of!(HpaDirPage, head), 0);

impl DirPage for HpaDirPage {
    type Entry = HugeArea;

    unsafe fn write_header(ptr: *mut Self) {
        ptr.write(Self {
            head: DirPageHead::new(),
            hot: Link::new(),
        });
        (*ptr).head.init_rings();
        (*ptr).hot.init_ring();
    }

    fn head(&self) -> &DirPageHead {
        &self.head
    }
}

/// Record and return a run of whole granules covering `size` bytes.
pub(crate) fn alloc(
    inner: &mut Inner,
    size: usize,
    flag: AllocFlag,
) -> Result<(PhysicalAddress, usize)> {
    if size == 0 {
        return Err(Error::InvalidSize);
    }
    let window = window_index(flag);

    let mut spare: Option<NonNull<HpaDirPage>> = None;
    for head in inner.hpa_dirs[window].iter() {
        if head.has_spare() {
            spare = Some(NonNull::from(unsafe { HpaDirPage::from_head(head) }));
            break;
        }
    }
    let page_ptr = match spare {
        Some(page) => page,
        None => {
            let area = inner.alloc_dir_granule(flag)?;
            let page = unsafe { directory::format_page::<HpaDirPage>(area) };
            inner.hpa_dirs[window].push_front(&page.head);
            NonNull::from(page)
        }
    };
    let page = unsafe { page_ptr.as_ref() };
    let Some(free_link) = page.head.first_free() else {
        return Err(Error::OutOfMemory);
    };
    let entry_ptr = unsafe { entry_of::<HugeArea>(free_link) };
    let (base, rounded) = match inner.alloc_run_for(entry_ptr, size, flag) {
        Ok(run) => run,
        Err(err) => {
            // Do not strand a directory page that never got an entry placed.
            if page.head.all_free() {
                directory::unlink_page(&mut inner.hpa_dirs[window], &page.head);
                inner.free_dir_granule(directory::page_of(page_ptr));
            }
            return Err(err);
        }
    };
    let entry = unsafe { entry_ptr.as_ref() };
    page.head.consume_free(&entry.link);
    entry.base.set(base.as_raw());
    entry.len.set(rounded);
    page.hot.push_front(&entry.link);
    Ok((base, rounded))
}

fn release(inner: &mut Inner, entry_ptr: NonNull<HugeArea>, window: usize) -> usize {
    let entry = unsafe { entry_ptr.as_ref() };
    let base = PhysicalAddress::new(entry.base());
    let len = entry.len();
    let freed = inner.free_owned_run(base, len);
    debug_assert!(freed.is_ok());
    entry.link.unlink();
    entry.base.set(0);
    entry.len.set(0);
    let page_addr = directory::page_of(entry_ptr);
    let page = unsafe { &*page_addr.as_ptr::<HpaDirPage>() };
    page.head.recycle(&entry.link);
    if page.head.all_free() {
        directory::unlink_page(&mut inner.hpa_dirs[window], &page.head);
        inner.free_dir_granule(page_addr);
    }
    len
}

pub(crate) fn free_hit(
    inner: &mut Inner,
    entry_ptr: NonNull<HugeArea>,
    addr: PhysicalAddress,
) -> Result<usize> {
    if !addr.is_aligned(FIXED_PAGE_AREA_SIZE) {
        return Err(Error::Misaligned(addr.as_raw()));
    }
    let window = inner
        .window_of(addr)
        .ok_or(Error::UnknownAddress(addr.as_raw()))?;
    let entry = unsafe { entry_ptr.as_ref() };
    if entry.base() != addr.as_raw() {
        warn!("huge-run lookup for {addr} does not match its record");
        return Err(Error::UnknownAddress(addr.as_raw()));
    }
    Ok(release(inner, entry_ptr, window))
}

/// Slow diagnostic path: walk the hot rings of the window's directory chain.
pub(crate) fn free_scan(inner: &mut Inner, addr: PhysicalAddress, window: usize) -> Option<usize> {
    if !addr.is_aligned(FIXED_PAGE_AREA_SIZE) {
        return None;
    }
    let raw_addr = addr.as_raw();
    let mut hit: Option<NonNull<HugeArea>> = None;
    'pages: for head in inner.hpa_dirs[window].iter() {
        let page = unsafe { HpaDirPage::from_head(head) };
        for link in page.hot.iter() {
            let entry_ptr = unsafe { entry_of::<HugeArea>(link) };
            if unsafe { entry_ptr.as_ref() }.base() == raw_addr {
                hit = Some(entry_ptr);
                break 'pages;
            }
        }
    }
    Some(release(inner, hit?, window))
}
