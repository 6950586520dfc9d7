#![cfg_attr(feature = "no_std", no_std)]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod address;
pub mod error;
mod list;
pub mod mem;

pub use address::PhysicalAddress;
pub use error::{Error, Result};
pub use mem::{
    calculate, global, install_global, AllocFlag, Allocation, MemAllocator, MemoryEvents,
    NoEvents, FIXED_PAGE_AREA_SIZE, MIN_SUBAREA_SIZE, ONE_PAGE_AREA_SIZE,
};
