//! Directory-page lifecycle.
//!
//! Size-class descriptors do not live in static arrays: they live inside
//! directory pages, which are ordinary 128 KiB granules taken from the raw
//! layer and formatted in place. A directory page starts with a header
//! (allocator-chain link, node counts, free-entry ring), followed by the
//! per-class rows where applicable, followed by as many entry records as fit
//! in the rest of the granule. A page is created the first time a layer needs
//! an entry and no existing page has one spare; it is unlinked and its
//! granule returned as soon as every entry is back on its free ring.

use core::cell::Cell;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

use crate::address::PhysicalAddress;
use crate::list::Link;
use crate::mem::FIXED_PAGE_AREA_SIZE;

/// Leading record of every directory page, independent of the entry kind.
#[repr(C)]
pub(crate) struct DirPageHead {
    /// Links the page into the allocator-level chain for its kind and window.
    pub link: LinkedListLink,
    total: Cell<u32>,
    free_count: Cell<u32>,
    free: Link,
}

intrusive_adapter!(pub(crate) DirChainAdapter<'a> = &'a DirPageHead: DirPageHead { link: LinkedListLink });

/// Allocator-level chain of directory pages of one kind in one window.
pub(crate) type DirChain = LinkedList<DirChainAdapter<'static>>;

pub(crate) fn new_chain() -> DirChain {
    LinkedList::new(DirChainAdapter::new())
}

impl DirPageHead {
    pub fn new() -> Self {
        Self {
            link: LinkedListLink::new(),
            total: Cell::new(0),
            free_count: Cell::new(0),
            free: Link::new(),
        }
    }

    pub fn init_rings(&self) {
        self.free.init_ring();
    }

    pub fn has_spare(&self) -> bool {
        self.free_count.get() > 0
    }

    /// First entry on the free ring without detaching it; the caller only
    /// consumes it once the backing memory is secured.
    pub fn first_free(&self) -> Option<NonNull<Link>> {
        self.free.first()
    }

    pub fn consume_free(&self, link: &Link) {
        link.unlink();
        self.free_count.set(self.free_count.get() - 1);
    }

    pub fn recycle(&self, link: &Link) {
        self.free.push_front(link);
        self.free_count.set(self.free_count.get() + 1);
    }

    /// True once every entry of the page is back on the free ring.
    pub fn all_free(&self) -> bool {
        self.free_count.get() == self.total.get()
    }
}

/// One size class of a subdividing directory: the subarea size plus the rings
/// of partially used and fully used entries.
#[repr(C)]
pub(crate) struct ClassRow {
    size: usize,
    pub chain: Link,
    pub full: Link,
}

impl ClassRow {
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            chain: Link::new(),
            full: Link::new(),
        }
    }

    pub fn init_rings(&self) {
        self.chain.init_ring();
        self.full.init_ring();
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Entry record hosted by a directory page. The link must be the first field
/// of a `#[repr(C)]` struct so ring nodes can be cast back to entries.
pub(crate) trait DirEntry: Sized + 'static {
    const INIT: Self;

    fn link(&self) -> &Link;
}

/// A directory page header type. The header must be the first bytes of the
/// granule so an entry address rounded down to the granule recovers it.
pub(crate) trait DirPage: Sized + 'static {
    type Entry: DirEntry;

    /// Write a fresh header at `ptr`, all rings initialized and empty.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `Self` and stay pinned afterwards.
    unsafe fn write_header(ptr: *mut Self);

    fn head(&self) -> &DirPageHead;

    /// # Safety
    ///
    /// `head` must be the header of a formatted page of this type.
    unsafe fn from_head(head: &DirPageHead) -> &Self {
        &*(head as *const DirPageHead).cast::<Self>()
    }
}

/// Granule base address of the directory page hosting `entry`.
pub(crate) fn page_of<E>(entry: NonNull<E>) -> PhysicalAddress {
    PhysicalAddress::new(entry.as_ptr() as usize).align_down(FIXED_PAGE_AREA_SIZE)
}

/// Format a raw granule as a directory page: header first, then every entry
/// that fits appended to the free ring.
///
/// # Safety
///
/// `area` must be a granule-aligned region of `FIXED_PAGE_AREA_SIZE` bytes
/// exclusively owned by the caller.
pub(crate) unsafe fn format_page<P: DirPage>(area: PhysicalAddress) -> &'static P {
    debug_assert!(area.is_aligned(FIXED_PAGE_AREA_SIZE));
    let ptr = area.as_mut_ptr::<P>();
    P::write_header(ptr);
    let page = &*ptr;
    let head = page.head();

    let entry_size = size_of::<P::Entry>();
    let mut at = (area.as_raw() + size_of::<P>()).next_multiple_of(align_of::<P::Entry>());
    let end = area.as_raw() + FIXED_PAGE_AREA_SIZE;
    let mut count = 0u32;
    while at + entry_size <= end {
        let entry = at as *mut P::Entry;
        entry.write(P::Entry::INIT);
        head.free.push_back((*entry).link());
        count += 1;
        at += entry_size;
    }
    head.total.set(count);
    head.free_count.set(count);
    page
}

/// Detach a wholly free page from its chain; the caller returns the granule.
pub(crate) fn unlink_page(chain: &mut DirChain, head: &DirPageHead) {
    debug_assert!(head.all_free());
    let mut cursor = unsafe { chain.cursor_mut_from_ptr(head as *const DirPageHead) };
    let removed = cursor.remove();
    debug_assert!(removed.is_some());
}
