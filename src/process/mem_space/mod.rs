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

//! A memory space is the virtual memory handler of a process. It owns the
//! process's virtual layout, an ordered list of memory areas, and drives the
//! page mapper to keep the hardware view in sync with it.
//!
//! Physical memory is allocated eagerly, in power-of-two page blocks, when an
//! area is created; copy-on-write areas start with no backing at all and
//! materialize their pages from the page-fault resolver.

pub mod area;
pub mod copy;
pub mod heap;

use crate::{
	errno::{EResult, Error},
	memory::{
		buddy,
		buddy::GfpFlags,
		slab::Cache,
		vmem,
		vmem::{
			x86::{entry_addr, to_entry, FLAG_COW, FLAG_GLOBAL, FLAG_PRESENT, FLAG_USER, FLAG_WRITE},
			MapFlags, VMem,
		},
		PhysAddr, VirtAddr, PAGE_SIZE,
	},
};
use area::{VmArea, VmFlags};
use core::{marker::PhantomData, ptr::NonNull};

/// Slab cache providing memory area descriptors.
static AREA_CACHE: Cache<VmArea> = Cache::new("vm-area", None);

/// Converts mapper request flags into the user-visible flags stored on an
/// area.
fn vm_flags(pg_flags: MapFlags) -> VmFlags {
	let mut flags = VmFlags::empty();
	if pg_flags.contains(MapFlags::WRITE) {
		flags |= VmFlags::WRITE;
	}
	if pg_flags.contains(MapFlags::USER) {
		flags |= VmFlags::USER;
	}
	if pg_flags.contains(MapFlags::COW) {
		flags |= VmFlags::COW;
	}
	flags
}

/// An iterator over the areas of a memory space, in address order.
pub struct AreaIter<'m> {
	cur: Option<NonNull<VmArea>>,
	_marker: PhantomData<&'m VmArea>,
}

impl<'m> Iterator for AreaIter<'m> {
	type Item = &'m VmArea;

	fn next(&mut self) -> Option<Self::Item> {
		let cur = self.cur?;
		let area = unsafe { &*cur.as_ptr() };
		self.cur = area.next;
		Some(area)
	}
}

/// A process's address space descriptor.
pub struct MemSpace {
	/// The virtual memory context.
	vmem: VMem,

	/// Head of the area list, sorted by ascending start address.
	areas: Option<NonNull<VmArea>>,
	/// The most recently touched area.
	cache: Option<NonNull<VmArea>>,
	/// The number of areas in the list.
	map_count: usize,
	/// The number of virtual memory pages in use.
	total_vm: usize,

	/// The beginning of the process's heap.
	pub start_brk: VirtAddr,
	/// The current end of the process's heap.
	pub brk: VirtAddr,
	/// The beginning of the process's stack.
	pub start_stack: VirtAddr,
}

impl MemSpace {
	/// Creates a new, empty memory space.
	pub fn new() -> EResult<Self> {
		Ok(Self {
			vmem: VMem::new()?,
			areas: None,
			cache: None,
			map_count: 0,
			total_vm: 0,
			start_brk: VirtAddr::default(),
			brk: VirtAddr::default(),
			start_stack: VirtAddr::default(),
		})
	}

	/// Returns the virtual memory context.
	#[inline]
	pub fn vmem(&self) -> &VMem {
		&self.vmem
	}

	/// Returns the number of areas in the space.
	#[inline]
	pub fn map_count(&self) -> usize {
		self.map_count
	}

	/// Returns the number of virtual memory pages in use.
	#[inline]
	pub fn total_vm(&self) -> usize {
		self.total_vm
	}

	/// Returns an iterator over the areas of the space, in address order.
	pub fn areas(&self) -> AreaIter<'_> {
		AreaIter {
			cur: self.areas,
			_marker: PhantomData,
		}
	}

	/// Checks that `[start, end)` is a sane, free virtual range.
	///
	/// Returns [`Error::InvalidArgs`] if the range is reversed or empty and
	/// [`Error::Overlap`] if it intersects an existing area.
	pub fn is_valid_range(&self, start: VirtAddr, end: VirtAddr) -> EResult<()> {
		if start >= end {
			return Err(Error::InvalidArgs);
		}
		for area in self.areas() {
			if area.overlaps(start, end) {
				return Err(Error::Overlap);
			}
		}
		Ok(())
	}

	/// Returns the area starting exactly at `start`.
	pub fn find_vm_area(&mut self, start: VirtAddr) -> Option<NonNull<VmArea>> {
		let mut cur = self.areas;
		while let Some(area) = cur {
			let a = unsafe { &*area.as_ptr() };
			if a.start == start {
				self.cache = Some(area);
				return Some(area);
			}
			if a.start > start {
				break;
			}
			cur = a.next;
		}
		None
	}

	/// Returns the area containing `addr`, checking the most-recently-used
	/// cache first.
	pub fn find_vm_area_containing(&mut self, addr: VirtAddr) -> Option<NonNull<VmArea>> {
		if let Some(cached) = self.cache {
			if unsafe { cached.as_ref() }.contains(addr) {
				return Some(cached);
			}
		}
		let mut cur = self.areas;
		while let Some(area) = cur {
			let a = unsafe { &*area.as_ptr() };
			if a.contains(addr) {
				self.cache = Some(area);
				return Some(area);
			}
			if a.start > addr {
				break;
			}
			cur = a.next;
		}
		None
	}

	/// Links `area` into the list, keeping it sorted by start address.
	fn insert_area(&mut self, mut area: NonNull<VmArea>) {
		let start = unsafe { area.as_ref() }.start;
		// Find the last area starting before the new one
		let mut prev: Option<NonNull<VmArea>> = None;
		let mut cur = self.areas;
		while let Some(c) = cur {
			let c_ref = unsafe { &*c.as_ptr() };
			if c_ref.start > start {
				break;
			}
			prev = Some(c);
			cur = c_ref.next;
		}
		unsafe {
			match prev {
				Some(mut p) => area.as_mut().insert_after(p.as_mut()),
				None => {
					let a = area.as_mut();
					a.next = self.areas;
					a.prev = None;
					if let Some(mut head) = self.areas {
						head.as_mut().prev = Some(area);
					}
					self.areas = Some(area);
				}
			}
		}
		self.map_count += 1;
		self.total_vm += unsafe { area.as_ref() }.pages();
		self.cache = Some(area);
	}

	/// Unlinks `area` from the list.
	fn remove_area(&mut self, mut area: NonNull<VmArea>) {
		if self.areas == Some(area) {
			self.areas = unsafe { area.as_ref() }.next;
		}
		if self.cache == Some(area) {
			self.cache = None;
		}
		self.map_count -= 1;
		self.total_vm -= unsafe { area.as_ref() }.pages();
		unsafe {
			area.as_mut().unlink();
		}
	}

	/// Creates an area of `size` bytes at `start` and installs its mapping.
	///
	/// The physical footprint is the smallest power-of-two block of pages
	/// fitting the area. Copy-on-write areas get no physical memory at all:
	/// their entries trap until the fault resolver materializes them.
	///
	/// On failure, every allocation performed by the call is released again:
	/// a partially created area is never observable.
	pub fn create_vm_area(
		&mut self,
		start: VirtAddr,
		size: usize,
		pg_flags: MapFlags,
		gfp_flags: GfpFlags,
	) -> EResult<NonNull<VmArea>> {
		if start.is_null() || size == 0 {
			return Err(Error::InvalidArgs);
		}
		let exact_end = VirtAddr(start.0.checked_add(size).ok_or(Error::InvalidArgs)?);
		// Check the requested byte range before anything else, so that an
		// overlapping request reports the overlap whatever its alignment
		self.is_valid_range(start, exact_end)?;
		if !start.is_aligned_to(PAGE_SIZE) {
			return Err(Error::InvalidArgs);
		}
		let pages = size.div_ceil(PAGE_SIZE);
		let end = start + pages * PAGE_SIZE;
		// The rounded tail must not overlap either
		self.is_valid_range(start, end)?;
		let area = AREA_CACHE.alloc(gfp_flags)?;
		// Allocate the physical block, unless the area is copy-on-write
		let mut pg_flags = pg_flags;
		let (block, phys) = if pg_flags.contains(MapFlags::COW) {
			pg_flags.remove(MapFlags::PRESENT | MapFlags::UPDADDR);
			(None, PhysAddr::default())
		} else {
			let order = buddy::get_order(pages);
			let block = match buddy::alloc_pages(gfp_flags, order) {
				Ok(block) => block,
				Err(e) => {
					unsafe {
						AREA_CACHE.free(area);
					}
					return Err(e);
				}
			};
			unsafe {
				buddy::virt_from_page(block)
					.as_ptr()
					.write_bytes(0, buddy::get_frame_size(order));
			}
			pg_flags.insert(MapFlags::UPDADDR);
			(Some(block), buddy::phys(block))
		};
		if let Err(e) = self.vmem.update_range(start, phys, size, pg_flags) {
			if let Some(block) = block {
				buddy::free_pages(block);
			}
			unsafe {
				AREA_CACHE.free(area);
			}
			return Err(e);
		}
		unsafe {
			area.as_ptr().write(VmArea::new(start, end, vm_flags(pg_flags)));
		}
		self.insert_area(area);
		log::trace!("mem_space: created area {start:?}..{end:?}");
		Ok(area)
	}

	/// Clones `area` into the address space `dst`.
	///
	/// With `cow` unset, a fresh physical block of the same order is
	/// allocated and the source bytes are copied into it through the kernel's
	/// frame window.
	///
	/// With `cow` set, the source mapping itself is re-marked copy-on-write
	/// and the destination inherits the same trapping entries, sharing the
	/// backing frames; the shared blocks take one more reference per page.
	pub fn clone_vm_area(
		&mut self,
		dst: &mut MemSpace,
		mut area: NonNull<VmArea>,
		cow: bool,
		gfp_flags: GfpFlags,
	) -> EResult<()> {
		let (start, end, flags) = {
			let a = unsafe { area.as_ref() };
			(a.start, a.end, a.flags)
		};
		let size = end.0 - start.0;
		let pages = size / PAGE_SIZE;
		dst.is_valid_range(start, end)?;
		let dst_area = AREA_CACHE.alloc(gfp_flags)?;
		let res = if cow {
			self.clone_cow(dst, start, size)
		} else {
			self.clone_eager(dst, start, size, pages, gfp_flags)
		};
		if let Err(e) = res {
			unsafe {
				AREA_CACHE.free(dst_area);
			}
			return Err(e);
		}
		let dst_flags = if cow {
			// Both sides are now copy-on-write
			unsafe {
				area.as_mut().flags |= VmFlags::COW;
			}
			flags | VmFlags::COW
		} else {
			flags
		};
		unsafe {
			dst_area.as_ptr().write(VmArea::new(start, end, dst_flags));
		}
		dst.insert_area(dst_area);
		Ok(())
	}

	/// Eager-copy part of [`Self::clone_vm_area`].
	fn clone_eager(
		&mut self,
		dst: &mut MemSpace,
		start: VirtAddr,
		size: usize,
		pages: usize,
		gfp_flags: GfpFlags,
	) -> EResult<()> {
		let order = buddy::get_order(pages);
		let block = buddy::alloc_pages(gfp_flags, order)?;
		let res = dst.vmem.update_range(
			start,
			buddy::phys(block),
			size,
			MapFlags::WRITE | MapFlags::PRESENT | MapFlags::UPDADDR | MapFlags::USER,
		);
		if let Err(e) = res {
			buddy::free_pages(block);
			return Err(e);
		}
		// Copy the source bytes through the kernel window on the new block
		let dst_base = buddy::virt_from_page(block).as_ptr();
		for i in 0..pages {
			let dst_ptr = unsafe { dst_base.add(i * PAGE_SIZE) };
			match self.vmem.translate(start + i * PAGE_SIZE) {
				Some(src_phys) => unsafe {
					let src_ptr = buddy::phys_to_virt(src_phys).unwrap().as_ptr();
					dst_ptr.copy_from_nonoverlapping(src_ptr, PAGE_SIZE);
				},
				// Unmaterialized page: the copy reads as zeros
				None => unsafe {
					dst_ptr.write_bytes(0, PAGE_SIZE);
				},
			}
		}
		Ok(())
	}

	/// Copy-on-write part of [`Self::clone_vm_area`].
	fn clone_cow(&mut self, dst: &mut MemSpace, start: VirtAddr, size: usize) -> EResult<()> {
		// Re-mark the source so that writes on either side trap from now on.
		// The mapper records copy-on-write as non-present, whatever flags say.
		self.vmem
			.update_range(start, PhysAddr::default(), size, MapFlags::COW | MapFlags::PRESENT | MapFlags::USER)?;
		self.vmem.clone_range_to(
			&mut dst.vmem,
			start,
			start,
			size,
			MapFlags::COW | MapFlags::PRESENT | MapFlags::USER,
		)?;
		// The destination now references the shared blocks: take a reference
		// on every page of every backing block
		let end = start + size;
		let mut cur = start;
		while cur < end {
			let Some((page, span)) = self.vmem.virt_to_page(cur, end.0 - cur.0) else {
				cur = cur + PAGE_SIZE;
				continue;
			};
			debug_assert_eq!(buddy::block_offset(page), 0);
			let head = buddy::phys(page);
			let block_pages = 1usize << buddy::page_order(page);
			for i in 0..block_pages {
				buddy::page_inc(buddy::page_from_phys(head + i * PAGE_SIZE).unwrap());
			}
			cur = cur + span;
		}
		Ok(())
	}

	/// Destroys `area`, releasing its physical memory.
	///
	/// The walk advances one backing block at a time. Blocks still referenced
	/// by another address space only lose one reference per page; exclusive
	/// blocks are freed. Copy-on-write pages that never materialized are
	/// skipped.
	pub fn destroy_vm_area(&mut self, area: NonNull<VmArea>) -> EResult<()> {
		let (start, end) = {
			let a = unsafe { area.as_ref() };
			(a.start, a.end)
		};
		let mut cur = start;
		while cur < end {
			let Some((page, span)) = self.vmem.virt_to_page(cur, end.0 - cur.0) else {
				// Copy-on-write page with no backing materialized
				cur = cur + PAGE_SIZE;
				continue;
			};
			debug_assert_eq!(buddy::block_offset(page), 0);
			if buddy::page_count(page) > 1 {
				// Other address spaces still map the block
				let head = buddy::phys(page);
				let block_pages = 1usize << buddy::page_order(page);
				for i in 0..block_pages {
					buddy::page_dec(buddy::page_from_phys(head + i * PAGE_SIZE).unwrap());
				}
			} else {
				buddy::free_pages(page);
			}
			cur = cur + span;
		}
		self.vmem.unmap_range(start, (end.0 - start.0) / PAGE_SIZE);
		self.remove_area(area);
		unsafe {
			AREA_CACHE.free(area);
		}
		log::trace!("mem_space: destroyed area {start:?}..{end:?}");
		Ok(())
	}

	/// Looks for a free gap of at least `length` bytes between two areas.
	///
	/// The list is walked from the top; the returned address is the topmost
	/// start such that `[start, start + length)` fits in the highest gap
	/// found.
	pub fn search_free_area(&self, length: usize) -> EResult<VirtAddr> {
		if length == 0 {
			return Err(Error::InvalidArgs);
		}
		// Go to the topmost area
		let mut tail = self.areas;
		while let Some(t) = tail {
			let next = unsafe { &*t.as_ptr() }.next;
			if next.is_none() {
				break;
			}
			tail = next;
		}
		// Walk back, looking at the gap below each area
		let mut cur = tail;
		while let Some(c) = cur {
			let c_ref = unsafe { &*c.as_ptr() };
			let Some(prev) = c_ref.prev else {
				break;
			};
			let prev_end = unsafe { &*prev.as_ptr() }.end;
			if c_ref.start.0 - prev_end.0 >= length {
				return Ok(c_ref.start - length);
			}
			cur = Some(prev);
		}
		Err(Error::NotFound)
	}

	/// Clones the whole memory space for process forking.
	///
	/// Every area is cloned copy-on-write: parent and child share the
	/// physical memory until one of them writes.
	pub fn fork(&mut self) -> EResult<MemSpace> {
		let mut child = MemSpace::new()?;
		child.start_brk = self.start_brk;
		child.brk = self.brk;
		child.start_stack = self.start_stack;
		let mut cur = self.areas;
		while let Some(area) = cur {
			// Read the link before the clone touches the source mapping
			let next = unsafe { &*area.as_ptr() }.next;
			self.clone_vm_area(&mut child, area, true, GfpFlags::HIGHUSER)?;
			cur = next;
		}
		Ok(child)
	}

	/// Function called whenever the CPU triggered a page fault for the
	/// context.
	///
	/// Arguments:
	/// - `addr` is the virtual address of the wrong memory access that caused
	///   the fault.
	/// - `code` is the error code given along with the error.
	///
	/// If the fault was a copy-on-write trap, the function resolves it and
	/// returns `true`: the process can resume. Any other fault returns
	/// `false` and is the caller's problem (usually a `SIGSEGV`).
	pub fn handle_page_fault(&mut self, addr: VirtAddr, code: u32) -> EResult<bool> {
		let Some(area) = self.find_vm_area_containing(addr) else {
			return Ok(false);
		};
		let write = code & vmem::x86::PAGE_FAULT_WRITE != 0;
		if write && !unsafe { area.as_ref() }.flags.contains(VmFlags::WRITE) {
			return Ok(false);
		}
		let entry = self.vmem.entry(addr.down_align_to(PAGE_SIZE));
		if entry & FLAG_COW == 0 {
			// Not a copy-on-write trap
			return Ok(false);
		}
		self.resolve_cow(addr)?;
		Ok(true)
	}

	/// Resolves a copy-on-write trap at `addr`.
	///
	/// If the backing frame is exclusive to this space, the entry merely
	/// turns present and writable again. If it is shared, the backing block
	/// is copied into a fresh block of the same order, the copy-on-write
	/// entries of the block are re-pointed at it and the old block loses one
	/// reference per page. An entry with no backing frame at all gets a
	/// zeroed page.
	///
	/// The trap is fully resolved before the function returns: there is no
	/// suspension point here.
	pub(crate) fn resolve_cow(&mut self, addr: VirtAddr) -> EResult<()> {
		let page_va = addr.down_align_to(PAGE_SIZE);
		let entry = self.vmem.entry(page_va);
		debug_assert_ne!(entry & FLAG_COW, 0);
		// Keep user/global, gain present/write, lose the trap
		let bits = FLAG_PRESENT | FLAG_WRITE | (entry & (FLAG_USER | FLAG_GLOBAL));
		let frame = entry_addr(entry);
		if frame.is_null() {
			// Never materialized: a zeroed page will do
			let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 0)?;
			unsafe {
				buddy::virt_from_page(block).as_ptr().write_bytes(0, PAGE_SIZE);
			}
			self.vmem.set_entry(page_va, to_entry(buddy::phys(block), bits));
			vmem::x86::invalidate_page_current(page_va);
			log::trace!("mem_space: materialized page at {page_va:?}");
			return Ok(());
		}
		let page = buddy::page_from_phys(frame).ok_or(Error::NotFound)?;
		if buddy::page_count(page) == 1 {
			// Sole owner: no copy needed
			self.vmem.set_entry(page_va, to_entry(frame, bits));
			vmem::x86::invalidate_page_current(page_va);
			return Ok(());
		}
		// The block is shared: copy it whole and switch over
		let order = buddy::page_order(page);
		let off = buddy::block_offset(page);
		let old_head = frame - off * PAGE_SIZE;
		let block_va = page_va - off * PAGE_SIZE;
		let new_block = buddy::alloc_pages(GfpFlags::HIGHUSER, order)?;
		let new_head = buddy::phys(new_block);
		unsafe {
			buddy::virt_from_page(new_block).as_ptr().copy_from_nonoverlapping(
				buddy::phys_to_virt(old_head).unwrap().as_ptr(),
				buddy::get_frame_size(order),
			);
		}
		let block_pages = 1usize << order;
		for i in 0..block_pages {
			let va = block_va + i * PAGE_SIZE;
			let e = self.vmem.entry(va);
			// Re-point the trapping entries of this block
			if e & FLAG_COW != 0 && entry_addr(e) == old_head + i * PAGE_SIZE {
				let ebits = FLAG_PRESENT | FLAG_WRITE | (e & (FLAG_USER | FLAG_GLOBAL));
				self.vmem.set_entry(va, to_entry(new_head + i * PAGE_SIZE, ebits));
				vmem::x86::invalidate_page_current(va);
			}
			buddy::page_dec(buddy::page_from_phys(old_head + i * PAGE_SIZE).unwrap());
		}
		log::trace!(
			"mem_space: copy-on-write break at {page_va:?} (order {order})"
		);
		Ok(())
	}
}

impl Drop for MemSpace {
	fn drop(&mut self) {
		while let Some(area) = self.areas {
			let _ = self.destroy_vm_area(area);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	pub(crate) fn new_space() -> MemSpace {
		buddy::init_test();
		MemSpace::new().unwrap()
	}

	const RW_USER: MapFlags = MapFlags::PRESENT
		.union(MapFlags::WRITE)
		.union(MapFlags::USER);

	#[test]
	fn area_sort() {
		let mut space = new_space();
		space
			.create_vm_area(VirtAddr(0x40100000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		space
			.create_vm_area(VirtAddr(0x40300000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		space
			.create_vm_area(VirtAddr(0x40200000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		let starts: Vec<_> = space.areas().map(|a| a.start().0).collect();
		assert_eq!(starts, vec![0x40100000, 0x40200000, 0x40300000]);
		assert_eq!(space.map_count(), 3);
		assert_eq!(space.total_vm(), 3);
	}

	#[test]
	fn overlap_rejected() {
		let mut space = new_space();
		space
			.create_vm_area(VirtAddr(0x40100000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		space
			.create_vm_area(VirtAddr(0x40200000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		// Straddling an existing area must fail and leave the list unchanged
		let res = space.create_vm_area(
			VirtAddr(0x40200800),
			PAGE_SIZE,
			RW_USER,
			GfpFlags::HIGHUSER,
		);
		assert_eq!(res.unwrap_err(), Error::Overlap);
		let starts: Vec<_> = space.areas().map(|a| a.start().0).collect();
		assert_eq!(starts, vec![0x40100000, 0x40200000]);
		assert_eq!(space.map_count(), 2);
	}

	#[test]
	fn create_invalid_args() {
		let mut space = new_space();
		assert_eq!(
			space
				.create_vm_area(VirtAddr(0), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
				.unwrap_err(),
			Error::InvalidArgs
		);
		assert_eq!(
			space
				.create_vm_area(VirtAddr(0x40100000), 0, RW_USER, GfpFlags::HIGHUSER)
				.unwrap_err(),
			Error::InvalidArgs
		);
	}

	#[test]
	fn mapping_lifecycle() {
		let mut space = new_space();
		let area = space
			.create_vm_area(VirtAddr(0x40100000), 3 * PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		// The mapping resolves and stays within one block
		let phys = space.vmem().translate(VirtAddr(0x40100000)).unwrap();
		assert_eq!(
			space.vmem().translate(VirtAddr(0x40102000)),
			Some(phys + 2 * PAGE_SIZE)
		);
		space.destroy_vm_area(area).unwrap();
		assert_eq!(space.vmem().translate(VirtAddr(0x40100000)), None);
		assert_eq!(space.map_count(), 0);
		assert_eq!(space.total_vm(), 0);
	}

	#[test]
	fn cow_fork_roundtrip() {
		let mut parent = new_space();
		let area = parent
			.create_vm_area(VirtAddr(0x80000000), 4 * PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		// Scribble a value the child must still observe after the parent's
		// copy-on-write break
		parent
			.write_obj(VirtAddr(0x80001000), &0u32)
			.unwrap();
		let mut child = MemSpace::new().unwrap();
		parent
			.clone_vm_area(&mut child, area, true, GfpFlags::HIGHUSER)
			.unwrap();
		// Both sides resolve to the same frames, with two references
		let (p_page, _) = parent.vmem().virt_to_page(VirtAddr(0x80001000), 1).unwrap();
		let (c_page, _) = child.vmem().virt_to_page(VirtAddr(0x80001000), 1).unwrap();
		assert_eq!(p_page, c_page);
		assert_eq!(buddy::page_count(p_page), 2);
		// Neither side is present anymore
		assert_eq!(
			parent.vmem().entry(VirtAddr(0x80001000)) & FLAG_PRESENT,
			0
		);
		// Simulated write fault on the parent
		let resumed = parent
			.handle_page_fault(VirtAddr(0x80001000), vmem::x86::PAGE_FAULT_WRITE)
			.unwrap();
		assert!(resumed);
		parent.write_obj(VirtAddr(0x80001000), &0x1234u32).unwrap();
		// The parent got its private copy, the child kept the old frame
		let (p_page2, _) = parent.vmem().virt_to_page(VirtAddr(0x80001000), 1).unwrap();
		let (c_page2, _) = child.vmem().virt_to_page(VirtAddr(0x80001000), 1).unwrap();
		assert_ne!(p_page2, c_page2);
		assert_eq!(c_page2, c_page);
		assert_eq!(buddy::page_count(p_page2), 1);
		assert_eq!(buddy::page_count(c_page2), 1);
		// The child still reads the pre-write value
		assert_eq!(child.read_obj::<u32>(VirtAddr(0x80001000)).unwrap(), 0);
		assert_eq!(parent.read_obj::<u32>(VirtAddr(0x80001000)).unwrap(), 0x1234);
	}

	#[test]
	fn cow_exclusive_fast_path() {
		let mut parent = new_space();
		let area = parent
			.create_vm_area(VirtAddr(0x80000000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		parent.write_obj(VirtAddr(0x80000000), &0xabcdu32).unwrap();
		let phys = parent.vmem().translate(VirtAddr(0x80000000)).unwrap();
		// Dropping the child releases its references
		let child = parent.fork().unwrap();
		drop(child);
		// The frame is exclusive again: the fault must not copy
		let resumed = parent
			.handle_page_fault(VirtAddr(0x80000000), vmem::x86::PAGE_FAULT_WRITE)
			.unwrap();
		assert!(resumed);
		assert_eq!(parent.vmem().translate(VirtAddr(0x80000000)), Some(phys));
		assert_eq!(parent.read_obj::<u32>(VirtAddr(0x80000000)).unwrap(), 0xabcd);
		parent.destroy_vm_area(area).unwrap();
	}

	#[test]
	fn clone_eager_copies() {
		let mut src = new_space();
		let area = src
			.create_vm_area(VirtAddr(0x40100000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		src.write_obj(VirtAddr(0x40100010), &0xdeadbeefu32).unwrap();
		let mut dst = MemSpace::new().unwrap();
		src.clone_vm_area(&mut dst, area, false, GfpFlags::HIGHUSER)
			.unwrap();
		// Distinct frames, same content, untouched source mapping
		assert_ne!(
			src.vmem().translate(VirtAddr(0x40100000)),
			dst.vmem().translate(VirtAddr(0x40100000))
		);
		assert_eq!(dst.read_obj::<u32>(VirtAddr(0x40100010)).unwrap(), 0xdeadbeef);
		assert_ne!(src.vmem().entry(VirtAddr(0x40100000)) & FLAG_PRESENT, 0);
	}

	#[test]
	fn fault_unrelated() {
		let mut space = new_space();
		// No area: fatal for the caller
		assert!(!space
			.handle_page_fault(VirtAddr(0x40100000), vmem::x86::PAGE_FAULT_WRITE)
			.unwrap());
		// Present, non-cow mapping: also not ours
		space
			.create_vm_area(VirtAddr(0x40100000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		assert!(!space
			.handle_page_fault(VirtAddr(0x40100000), vmem::x86::PAGE_FAULT_WRITE)
			.unwrap());
	}

	#[test]
	fn search_gap_topmost() {
		let mut space = new_space();
		// Text low, stack high, one area in between
		space
			.create_vm_area(VirtAddr(0x40000000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		space
			.create_vm_area(VirtAddr(0x40800000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		space
			.create_vm_area(VirtAddr(0xbff00000), PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		// The highest gap wins, and the fit is topmost inside it
		let addr = space.search_free_area(4 * PAGE_SIZE).unwrap();
		assert_eq!(addr, VirtAddr(0xbff00000 - 4 * PAGE_SIZE));
		// A gap too small for the request is skipped
		let huge = space.search_free_area(0xc0000000);
		assert_eq!(huge.unwrap_err(), Error::NotFound);
	}

	#[test]
	fn fork_shares_then_isolates() {
		let mut parent = new_space();
		parent
			.create_vm_area(VirtAddr(0x40100000), 2 * PAGE_SIZE, RW_USER, GfpFlags::HIGHUSER)
			.unwrap();
		parent.write_obj(VirtAddr(0x40100000), &7u32).unwrap();
		let mut child = parent.fork().unwrap();
		assert_eq!(child.map_count(), 1);
		// Writing through the kernel accessors resolves the trap the same way
		// a fault would
		child.write_obj(VirtAddr(0x40100000), &9u32).unwrap();
		assert_eq!(parent.read_obj::<u32>(VirtAddr(0x40100000)).unwrap(), 7);
		assert_eq!(child.read_obj::<u32>(VirtAddr(0x40100000)).unwrap(), 9);
	}
}
