/*
 * Copyright 2026 the Sonata developers
 *
 * This file is part of Sonata.
 *
 * Sonata is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Sonata is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Sonata. If not, see <https://www.gnu.org/licenses/>.
 */

//! The buddy allocator allows to allocate blocks of `2^n` pages of physical
//! memory.
//!
//! The allocator works by dividing blocks of memory in two recursively until
//! a block of the required size is available.
//!
//! The order of a block is the `n` in the expression `pow(2, n)` that
//! represents its size in pages.
//!
//! Every physical page is described by a [`Page`] descriptor, carved from the
//! head of the managed region at initialization. A descriptor carries the
//! order of the block its page belongs to and a reference count. Descriptors
//! live for the whole life of the system; address spaces only hold non-owning
//! handles to them and mutate the reference count through this module.

use crate::{
	errno::{EResult, Error},
	memory::{PhysAddr, PAGE_SIZE},
};
use core::{
	cmp::min,
	mem::{align_of, size_of},
	ptr::NonNull,
};
use spin::{Mutex, Once};

/// The order of a block of physical memory.
pub type FrameOrder = u8;
/// The identifier of a physical page inside the managed region.
type FrameId = u32;

/// The maximum order of an allocatable block.
pub const MAX_ORDER: FrameOrder = 17;

/// Value for a descriptor link indicating the page is allocated.
const FRAME_STATE_USED: FrameId = !0_u32;

/// Physical address of the first managed page.
///
/// Lower physical memory is left to the early boot code and is never handed
/// out, so a frame number of zero can be used as a niche in paging entries.
const BEGIN_PHYS: PhysAddr = PhysAddr(0x100000);

bitflags::bitflags! {
	/// Allocation flags.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct GfpFlags: u32 {
		/// The allocation is for kernel internal use.
		const KERNEL = 0b01;
		/// The allocation backs process memory.
		const HIGHUSER = 0b10;
	}
}

/// The descriptor of a page of physical memory.
///
/// The descriptor has an internal linked list for the free list. The list
/// does not store pointers but frame identifiers to save memory.
///
/// If either `prev` or `next` has value [`FRAME_STATE_USED`], the page is
/// allocated.
///
/// If a free page points to itself, no more elements are present on that side
/// of the list.
#[repr(C)]
pub struct Page {
	/// Identifier of the previous block in the free list.
	prev: FrameId,
	/// Identifier of the next block in the free list.
	next: FrameId,
	/// Order of the block the page belongs to.
	order: FrameOrder,
	/// The number of address spaces referencing the page.
	refcount: u32,
}

impl Page {
	/// Tells whether the page is allocated.
	#[inline]
	fn is_used(&self) -> bool {
		self.prev == FRAME_STATE_USED || self.next == FRAME_STATE_USED
	}
}

/// Immutable description of the managed region, set at initialization.
struct Region {
	/// Pointer to the descriptors of the region's pages.
	meta: *mut Page,
	/// Kernel-side window on the first managed page.
	base: *mut u8,
	/// The number of managed pages.
	pages_count: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
	/// Returns a pointer to the descriptor with identifier `id`.
	#[inline]
	fn frame(&self, id: FrameId) -> *mut Page {
		debug_assert!((id as usize) < self.pages_count);
		unsafe { self.meta.add(id as usize) }
	}

	/// Returns the identifier of the page described by `page`.
	#[inline]
	fn frame_id(&self, page: NonNull<Page>) -> FrameId {
		let off = page.as_ptr() as usize - self.meta as usize;
		(off / size_of::<Page>()) as FrameId
	}
}

/// The mutable state of the allocator.
struct Zone {
	/// The number of currently allocated pages.
	allocated_pages: usize,
	/// The free lists, one per order. Each stores the identifier of the first
	/// free block of that order.
	free_list: [Option<FrameId>; (MAX_ORDER + 1) as usize],
}

/// The managed region. Set once at boot.
static REGION: Once<Region> = Once::new();
/// The allocator's state.
static ZONE: Mutex<Zone> = Mutex::new(Zone {
	allocated_pages: 0,
	free_list: [None; (MAX_ORDER + 1) as usize],
});

/// Returns the managed region.
///
/// Panics if the allocator has not been initialized.
#[inline]
fn region() -> &'static Region {
	REGION.get().expect("buddy allocator not initialized")
}

/// Links the block with head `id` into the free list for `order`.
fn link(region: &Region, zone: &mut Zone, id: FrameId, order: FrameOrder) {
	unsafe {
		let frame = region.frame(id);
		(*frame).order = order;
		(*frame).prev = id;
		(*frame).next = match zone.free_list[order as usize] {
			Some(next) => {
				(*region.frame(next)).prev = id;
				next
			}
			None => id,
		};
	}
	zone.free_list[order as usize] = Some(id);
}

/// Unlinks the free block with head `id` from the free list for its order.
fn unlink(region: &Region, zone: &mut Zone, id: FrameId) {
	unsafe {
		let frame = region.frame(id);
		let (prev, next, order) = ((*frame).prev, (*frame).next, (*frame).order);
		if zone.free_list[order as usize] == Some(id) {
			zone.free_list[order as usize] = (next != id).then_some(next);
		}
		if prev != id {
			(*region.frame(prev)).next = if next == id { prev } else { next };
		}
		if next != id {
			(*region.frame(next)).prev = if prev == id { next } else { prev };
		}
	}
}

/// Fills the free lists during initialization according to the number of
/// available pages.
fn fill_free_list(region: &Region, zone: &mut Zone) {
	let mut frame: usize = 0;
	let mut order = min(MAX_ORDER, usize::BITS as FrameOrder - 1);
	while frame < region.pages_count {
		let p = 1usize << order;
		if frame + p > region.pages_count {
			order -= 1;
			continue;
		}
		link(region, zone, frame as FrameId, order);
		frame += p;
	}
}

/// Initializes the buddy allocator over the memory region starting at `begin`
/// and spanning `size` bytes.
///
/// The head of the region is carved out to store the page descriptors; the
/// rest becomes allocatable memory mapped at physical address [`BEGIN_PHYS`].
///
/// Further calls are ignored.
pub fn init(begin: NonNull<u8>, size: usize) {
	REGION.call_once(|| {
		let end = begin.as_ptr() as usize + size;
		// Reserve the head of the region for the descriptors
		let meta = (begin.as_ptr() as usize).next_multiple_of(align_of::<Page>());
		let mut pages_count = (end - meta) / (PAGE_SIZE + size_of::<Page>());
		let base = loop {
			let meta_end = meta + pages_count * size_of::<Page>();
			let base = meta_end.next_multiple_of(PAGE_SIZE);
			if base + pages_count * PAGE_SIZE <= end {
				break base as *mut u8;
			}
			pages_count -= 1;
		};
		let region = Region {
			meta: meta as *mut Page,
			base,
			pages_count,
		};
		// Init descriptors as allocated so that `fill_free_list` can link them
		for id in 0..pages_count {
			unsafe {
				region.frame(id as FrameId).write(Page {
					prev: FRAME_STATE_USED,
					next: FRAME_STATE_USED,
					order: 0,
					refcount: 0,
				});
			}
		}
		let mut zone = ZONE.lock();
		fill_free_list(&region, &mut zone);
		log::info!(
			"buddy: {} pages available ({} KiB metadata)",
			pages_count,
			pages_count * size_of::<Page>() / 1024
		);
		region
	});
}

/// Returns the buddy order required to fit `pages` pages.
pub fn get_order(pages: usize) -> FrameOrder {
	let mut order: FrameOrder = 0;
	let mut p = 1;
	while p < pages {
		p <<= 1;
		order += 1;
	}
	order
}

/// Returns the size in bytes of a block of the given order.
#[inline]
pub fn get_frame_size(order: FrameOrder) -> usize {
	PAGE_SIZE << order
}

/// Allocates a block of `2^order` contiguous pages and returns the descriptor
/// of its first page.
///
/// Every page of the block gets a reference count of `1`.
pub fn alloc_pages(_flags: GfpFlags, order: FrameOrder) -> EResult<NonNull<Page>> {
	if order > MAX_ORDER {
		return Err(Error::InvalidArgs);
	}
	let region = region();
	let mut zone = ZONE.lock();
	// Find the smallest available block that fits
	let (id, mut o) = (order..=MAX_ORDER)
		.find_map(|o| zone.free_list[o as usize].map(|id| (id, o)))
		.ok_or(Error::OutOfMemory)?;
	unlink(region, &mut zone, id);
	// Split the block down to the required order
	while o > order {
		o -= 1;
		let buddy = id + (1 << o);
		link(region, &mut zone, buddy, o);
	}
	debug_assert_eq!(id & ((1 << order) - 1), 0);
	// Mark the whole block as used
	for i in id..id + (1 << order) {
		unsafe {
			region.frame(i).write(Page {
				prev: FRAME_STATE_USED,
				next: FRAME_STATE_USED,
				order,
				refcount: 1,
			});
		}
	}
	zone.allocated_pages += 1 << order;
	Ok(unsafe { NonNull::new_unchecked(region.frame(id)) })
}

/// Frees the block whose first page is described by `page`, merging it with
/// its free buddies.
///
/// `page` must come from [`alloc_pages`] and reference counts of the block's
/// pages must have dropped back to at most `1`.
pub fn free_pages(page: NonNull<Page>) {
	let region = region();
	let mut zone = ZONE.lock();
	let mut id = region.frame_id(page);
	let mut order = unsafe { (*page.as_ptr()).order };
	debug_assert_eq!(id & ((1 << order) - 1), 0);
	for i in id..id + (1 << order) {
		let frame = region.frame(i);
		unsafe {
			debug_assert!((*frame).is_used());
			(*frame).refcount = 0;
		}
	}
	zone.allocated_pages -= 1 << order;
	// Merge with free buddies
	while order < MAX_ORDER {
		let buddy = id ^ (1 << order);
		let buddy_usable = (buddy as usize + (1 << order)) <= region.pages_count && {
			let b = unsafe { &*region.frame(buddy) };
			!b.is_used() && b.order == order
		};
		if !buddy_usable {
			break;
		}
		unlink(region, &mut zone, buddy);
		id = min(id, buddy);
		order += 1;
	}
	link(region, &mut zone, id, order);
}

/// Returns the number of references on the given page.
pub fn page_count(page: NonNull<Page>) -> u32 {
	unsafe { (*page.as_ptr()).refcount }
}

/// Adds a reference on the given page.
pub fn page_inc(page: NonNull<Page>) {
	unsafe {
		(*page.as_ptr()).refcount += 1;
	}
}

/// Removes a reference on the given page.
///
/// The count never drops to zero this way: the last reference is released by
/// freeing the whole block through [`free_pages`].
pub fn page_dec(page: NonNull<Page>) {
	unsafe {
		debug_assert!((*page.as_ptr()).refcount > 1);
		(*page.as_ptr()).refcount -= 1;
	}
}

/// Returns the order of the block the given page belongs to.
pub fn page_order(page: NonNull<Page>) -> FrameOrder {
	unsafe { (*page.as_ptr()).order }
}

/// Returns the offset in pages of the given page from the head of its block.
pub fn block_offset(page: NonNull<Page>) -> usize {
	let region = region();
	let id = region.frame_id(page);
	let order = unsafe { (*page.as_ptr()).order };
	(id as usize) & ((1 << order) - 1)
}

/// Returns the physical address of the given page.
pub fn phys(page: NonNull<Page>) -> PhysAddr {
	let region = region();
	let id = region.frame_id(page);
	BEGIN_PHYS + id as usize * PAGE_SIZE
}

/// Returns the descriptor of the page containing the physical address `addr`,
/// if managed.
pub fn page_from_phys(addr: PhysAddr) -> Option<NonNull<Page>> {
	let region = region();
	let off = addr.0.checked_sub(BEGIN_PHYS.0)?;
	let id = off / PAGE_SIZE;
	if id < region.pages_count {
		NonNull::new(region.frame(id as FrameId))
	} else {
		None
	}
}

/// Returns the kernel-side pointer to the memory of the given page.
pub fn virt_from_page(page: NonNull<Page>) -> NonNull<u8> {
	let region = region();
	let id = region.frame_id(page);
	unsafe { NonNull::new_unchecked(region.base.add(id as usize * PAGE_SIZE)) }
}

/// Returns the descriptor of the page containing the kernel-side pointer
/// `ptr`, if managed.
pub fn page_from_virt(ptr: NonNull<u8>) -> Option<NonNull<Page>> {
	virt_to_phys(ptr).and_then(page_from_phys)
}

/// Returns the kernel-side pointer on the given physical address, if managed.
pub fn phys_to_virt(addr: PhysAddr) -> Option<NonNull<u8>> {
	let region = region();
	let off = addr.0.checked_sub(BEGIN_PHYS.0)?;
	if off / PAGE_SIZE < region.pages_count {
		unsafe { Some(NonNull::new_unchecked(region.base.add(off))) }
	} else {
		None
	}
}

/// Returns the physical address of the kernel-side pointer `ptr`, if managed.
pub fn virt_to_phys(ptr: NonNull<u8>) -> Option<PhysAddr> {
	let region = region();
	let off = (ptr.as_ptr() as usize).checked_sub(region.base as usize)?;
	if off / PAGE_SIZE < region.pages_count {
		Some(BEGIN_PHYS + off)
	} else {
		None
	}
}

/// Returns the total number of currently allocated pages.
pub fn allocated_pages_count() -> usize {
	ZONE.lock().allocated_pages
}

#[cfg(test)]
pub(crate) fn init_test() {
	static INIT: Once<()> = Once::new();
	INIT.call_once(|| {
		// 256 MiB of simulated physical memory, shared by every test
		let region = vec![0u8; 256 * 1024 * 1024].leak();
		init(NonNull::new(region.as_mut_ptr()).unwrap(), region.len());
	});
}
