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

//! The page mapper materializes the flags of a memory area into hardware
//! paging entries.
//!
//! A [`VMem`] owns the page directory of one address space. Page tables are
//! created on demand out of the page-table slab cache and returned to it when
//! they empty out.
//!
//! Copy-on-write is recorded with the software [`x86::FLAG_COW`] bit and a
//! cleared present bit. The translation from request flags ([`MapFlags`]) to
//! entry bits goes through a single place ([`entry_bits`]) which enforces
//! that rule, so callers cannot produce an entry that is both present and
//! copy-on-write.

pub mod x86;

use crate::{
	errno::{EResult, Error},
	memory::{
		buddy,
		buddy::{GfpFlags, Page},
		slab::Cache,
		PhysAddr, VirtAddr, PAGE_SIZE, PROCESS_END,
	},
};
use core::{cmp::min, ptr::NonNull};
use x86::{
	dir_index, entry_addr, table_index, to_entry, Entry, Table, FLAG_COW, FLAG_GLOBAL,
	FLAG_PRESENT, FLAG_USER, FLAG_WRITE, USERSPACE_TABLES,
};

bitflags::bitflags! {
	/// Request flags for the page mapper.
	#[derive(Clone, Copy, Debug, Eq, PartialEq)]
	pub struct MapFlags: u32 {
		/// The mapping is materialized: accesses do not trap.
		const PRESENT = 0b000001;
		/// The mapping is writable.
		const WRITE = 0b000010;
		/// The mapping is accessible from userspace.
		const USER = 0b000100;
		/// The mapping survives TLB flushes. Once set on a directory entry
		/// this flag cannot be cleared.
		const GLOBAL = 0b001000;
		/// The mapping is copy-on-write. Implies non-present entries.
		const COW = 0b010000;
		/// The walk writes new frame addresses into the entries instead of
		/// keeping the existing ones.
		const UPDADDR = 0b100000;
	}
}

/// Zeroing constructor for paging tables.
fn table_ctor(table: NonNull<Table>) {
	unsafe {
		table.as_ptr().write_bytes(0, 1);
	}
}

/// Slab cache providing page directories and page tables.
///
/// Objects are page-sized and page-aligned so that their kernel address
/// coincides with the physical frame they occupy.
static TABLE_CACHE: Cache<Table> = Cache::new("paging-table", Some(table_ctor));

/// Computes the page table entry bits for the given request flags.
///
/// A copy-on-write request always yields a non-present entry, whatever else
/// the caller passed: this is the single place enforcing the rule.
fn entry_bits(flags: MapFlags) -> Entry {
	let mut e = 0;
	if flags.contains(MapFlags::COW) {
		e |= FLAG_COW;
	} else if flags.contains(MapFlags::PRESENT) {
		e |= FLAG_PRESENT;
	}
	if flags.contains(MapFlags::WRITE) {
		e |= FLAG_WRITE;
	}
	if flags.contains(MapFlags::USER) {
		e |= FLAG_USER;
	}
	if flags.contains(MapFlags::GLOBAL) {
		e |= FLAG_GLOBAL;
	}
	e
}

/// A virtual memory context: the owner of one page directory.
pub struct VMem {
	/// The page directory.
	page_dir: NonNull<Table>,
}

impl VMem {
	/// Creates a new, empty virtual memory context.
	pub fn new() -> EResult<Self> {
		Ok(Self {
			page_dir: TABLE_CACHE.alloc(GfpFlags::KERNEL)?,
		})
	}

	/// Returns an immutable reference to the page directory.
	fn dir(&self) -> &Table {
		unsafe { self.page_dir.as_ref() }
	}

	/// Returns a mutable reference to the page directory.
	fn dir_mut(&mut self) -> &mut Table {
		unsafe { self.page_dir.as_mut() }
	}

	/// Returns the physical address of the page directory.
	pub fn dir_phys(&self) -> PhysAddr {
		buddy::virt_to_phys(self.page_dir.cast()).unwrap()
	}

	/// Returns the page table for directory entry `slot`, if present.
	fn table(&self, slot: usize) -> Option<NonNull<Table>> {
		let entry = self.dir()[slot];
		if entry & FLAG_PRESENT == 0 {
			return None;
		}
		Some(buddy::phys_to_virt(entry_addr(entry)).unwrap().cast())
	}

	/// Makes sure a page table backs every directory slot covering `pages`
	/// pages from `virt`, allocating missing ones.
	///
	/// On allocation failure, tables allocated by this call are freed again
	/// and nothing is left modified.
	///
	/// Trying to drop the global flag from a directory entry carrying it is a
	/// protocol violation and panics.
	fn ensure_tables(&mut self, virt: VirtAddr, pages: usize, flags: MapFlags) -> EResult<()> {
		let first = dir_index(virt);
		let last = dir_index(virt + (pages - 1) * PAGE_SIZE);
		// Directory slots whose table was allocated by this call
		let mut new_tables = [0u32; USERSPACE_TABLES / 32];
		for slot in first..=last {
			let entry = self.dir()[slot];
			if entry & FLAG_PRESENT != 0 {
				if entry & FLAG_GLOBAL != 0 && !flags.contains(MapFlags::GLOBAL) {
					panic!("vmem: clearing the global bit of directory entry {slot}");
				}
				let mut e = entry;
				if flags.contains(MapFlags::GLOBAL) {
					e |= FLAG_GLOBAL;
				}
				if flags.contains(MapFlags::USER) {
					e |= FLAG_USER;
				}
				self.dir_mut()[slot] = e;
				continue;
			}
			let table = match TABLE_CACHE.alloc(GfpFlags::KERNEL) {
				Ok(table) => table,
				Err(e) => {
					// Unwind the tables created by this call
					log::warn!("vmem: out of page tables, rolling back");
					for s in first..slot {
						if new_tables[s / 32] & (1 << (s % 32)) == 0 {
							continue;
						}
						let table = self.table(s).unwrap();
						self.dir_mut()[s] = 0;
						unsafe {
							TABLE_CACHE.free(table);
						}
					}
					return Err(e);
				}
			};
			let phys = buddy::virt_to_phys(table.cast()).unwrap();
			let mut dflags = FLAG_PRESENT | FLAG_WRITE;
			if flags.contains(MapFlags::GLOBAL) {
				dflags |= FLAG_GLOBAL;
			}
			if flags.contains(MapFlags::USER) {
				dflags |= FLAG_USER;
			}
			self.dir_mut()[slot] = to_entry(phys, dflags);
			new_tables[slot / 32] |= 1 << (slot % 32);
		}
		Ok(())
	}

	/// Checks that `[virt, virt + pages * PAGE_SIZE)` stays in userspace.
	fn bound_check(virt: VirtAddr, pages: usize) -> EResult<()> {
		if pages == 0 {
			return Err(Error::InvalidArgs);
		}
		let end = virt.0.checked_add(pages * PAGE_SIZE).ok_or(Error::InvalidArgs)?;
		if end > PROCESS_END.0 {
			return Err(Error::InvalidArgs);
		}
		Ok(())
	}

	/// Walks the range `[virt, virt + size)` page by page and applies `flags`
	/// to every entry, creating missing page tables on the way.
	///
	/// If `flags` contains [`MapFlags::UPDADDR`], the entries' frames are set
	/// from `phys` onwards and each page gets a TLB invalidation; otherwise
	/// existing frames are kept.
	///
	/// A partial page at the end of the range still occupies a full entry.
	pub fn update_range(
		&mut self,
		virt: VirtAddr,
		phys: PhysAddr,
		size: usize,
		flags: MapFlags,
	) -> EResult<()> {
		debug_assert!(virt.is_aligned_to(PAGE_SIZE));
		debug_assert!(phys.is_aligned_to(PAGE_SIZE));
		let pages = size.div_ceil(PAGE_SIZE);
		Self::bound_check(virt, pages)?;
		self.ensure_tables(virt, pages, flags)?;
		let bits = entry_bits(flags);
		let upd = flags.contains(MapFlags::UPDADDR);
		for i in 0..pages {
			let va = virt + i * PAGE_SIZE;
			let table = self.table(dir_index(va)).unwrap();
			let table = unsafe { &mut *table.as_ptr() };
			let idx = table_index(va);
			let frame = if upd {
				phys + i * PAGE_SIZE
			} else {
				entry_addr(table[idx])
			};
			table[idx] = to_entry(frame, bits);
			if upd {
				x86::invalidate_page_current(va);
			}
		}
		Ok(())
	}

	/// Clones the entries for `[src_virt, src_virt + size)` into `dst` at
	/// `dst_virt`.
	///
	/// Copy-on-write entries are inherited as-is, still pointing at the shared
	/// frame; reference counting of the shared frames is the caller's duty.
	/// Other entries keep their frame and take `flags`.
	pub fn clone_range_to(
		&self,
		dst: &mut VMem,
		src_virt: VirtAddr,
		dst_virt: VirtAddr,
		size: usize,
		flags: MapFlags,
	) -> EResult<()> {
		debug_assert!(src_virt.is_aligned_to(PAGE_SIZE));
		debug_assert!(dst_virt.is_aligned_to(PAGE_SIZE));
		let pages = size.div_ceil(PAGE_SIZE);
		Self::bound_check(dst_virt, pages)?;
		dst.ensure_tables(dst_virt, pages, flags)?;
		let bits = entry_bits(flags);
		for i in 0..pages {
			let src_va = src_virt + i * PAGE_SIZE;
			let dst_va = dst_virt + i * PAGE_SIZE;
			let src_entry = self.entry(src_va);
			let table = dst.table(dir_index(dst_va)).unwrap();
			let table = unsafe { &mut *table.as_ptr() };
			let idx = table_index(dst_va);
			table[idx] = if src_entry & FLAG_COW != 0 {
				// Share the frame, keeping the trap on write
				src_entry
			} else if src_entry != 0 {
				to_entry(entry_addr(src_entry), bits)
			} else {
				0
			};
			x86::invalidate_page_current(dst_va);
		}
		Ok(())
	}

	/// Clears the entries for `pages` pages from `virt`, freeing page tables
	/// that end up empty.
	pub fn unmap_range(&mut self, virt: VirtAddr, pages: usize) {
		debug_assert!(virt.is_aligned_to(PAGE_SIZE));
		if pages == 0 {
			return;
		}
		for i in 0..pages {
			let va = virt + i * PAGE_SIZE;
			let Some(table) = self.table(dir_index(va)) else {
				continue;
			};
			let table = unsafe { &mut *table.as_ptr() };
			table[table_index(va)] = 0;
			x86::invalidate_page_current(va);
		}
		// Release tables that emptied out
		let first = dir_index(virt);
		let last = dir_index(virt + (pages - 1) * PAGE_SIZE);
		for slot in first..=last {
			let Some(table) = self.table(slot) else {
				continue;
			};
			if unsafe { table.as_ref() }.is_empty() {
				self.dir_mut()[slot] = 0;
				unsafe {
					TABLE_CACHE.free(table);
				}
			}
		}
	}

	/// Returns the raw paging entry for the virtual address `addr`, or `0` if
	/// no page table covers it.
	pub(crate) fn entry(&self, addr: VirtAddr) -> Entry {
		let Some(table) = self.table(dir_index(addr)) else {
			return 0;
		};
		(unsafe { table.as_ref() })[table_index(addr)]
	}

	/// Replaces the paging entry for `addr`.
	///
	/// The caller is responsible for TLB invalidation.
	pub(crate) fn set_entry(&mut self, addr: VirtAddr, entry: Entry) {
		let table = self
			.table(dir_index(addr))
			.expect("vmem: setting an entry without a page table");
		(unsafe { &mut *table.as_ptr() })[table_index(addr)] = entry;
	}

	/// Translates the virtual address `addr` to the physical address backing
	/// it.
	///
	/// Both present and copy-on-write mappings resolve; an entry without a
	/// backing frame does not.
	pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
		let entry = self.entry(addr);
		if entry & (FLAG_PRESENT | FLAG_COW) == 0 {
			return None;
		}
		let base = entry_addr(entry);
		if base.is_null() {
			return None;
		}
		Some(base + (addr.0 & (PAGE_SIZE - 1)))
	}

	/// Returns the physical page backing `addr` along with the number of
	/// bytes, at most `len`, that remain contiguous up to the end of the
	/// page's buddy block.
	///
	/// This lets callers walk a region one physical block at a time.
	pub fn virt_to_page(&self, addr: VirtAddr, len: usize) -> Option<(NonNull<Page>, usize)> {
		let phys = self.translate(addr)?;
		let page = buddy::page_from_phys(phys)?;
		let off = buddy::block_offset(page) * PAGE_SIZE + (addr.0 & (PAGE_SIZE - 1));
		let remaining = buddy::get_frame_size(buddy::page_order(page)) - off;
		Some((page, min(len, remaining)))
	}

	/// Binds the context to the current CPU.
	#[cfg(all(target_arch = "x86", target_os = "none"))]
	pub fn bind(&self) {
		unsafe {
			x86::bind(self.dir_phys());
		}
	}
}

impl Drop for VMem {
	fn drop(&mut self) {
		// Only userspace tables belong to the context
		for slot in 0..USERSPACE_TABLES {
			if let Some(table) = self.table(slot) {
				unsafe {
					TABLE_CACHE.free(table);
				}
			}
		}
		unsafe {
			TABLE_CACHE.free(self.page_dir);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::buddy::GfpFlags;

	#[test]
	fn vmem_basic0() {
		buddy::init_test();
		let vmem = VMem::new().unwrap();
		for i in (0usize..0x1000000).step_by(PAGE_SIZE) {
			assert_eq!(vmem.translate(VirtAddr(i)), None);
		}
	}

	#[test]
	fn vmem_map0() {
		buddy::init_test();
		let mut vmem = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 0).unwrap();
		let phys = buddy::phys(block);
		vmem.update_range(
			VirtAddr(0x40000000),
			phys,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER | MapFlags::UPDADDR,
		)
		.unwrap();
		assert_eq!(vmem.translate(VirtAddr(0x40000000)), Some(phys));
		assert_eq!(vmem.translate(VirtAddr(0x40000123)), Some(phys + 0x123));
		assert_eq!(vmem.translate(VirtAddr(0x40001000)), None);
		assert_eq!(vmem.translate(VirtAddr(0x3ffff000)), None);
		vmem.unmap_range(VirtAddr(0x40000000), 1);
		assert_eq!(vmem.translate(VirtAddr(0x40000000)), None);
		buddy::free_pages(block);
	}

	#[test]
	fn vmem_map_partial_page() {
		buddy::init_test();
		let mut vmem = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 1).unwrap();
		let phys = buddy::phys(block);
		// A partial last page still takes a whole entry
		vmem.update_range(
			VirtAddr(0x40000000),
			phys,
			PAGE_SIZE + 123,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::UPDADDR,
		)
		.unwrap();
		assert_eq!(
			vmem.translate(VirtAddr(0x40001000)),
			Some(phys + PAGE_SIZE)
		);
		vmem.unmap_range(VirtAddr(0x40000000), 2);
		buddy::free_pages(block);
	}

	#[test]
	fn vmem_cow_entries() {
		buddy::init_test();
		let mut vmem = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 0).unwrap();
		let phys = buddy::phys(block);
		vmem.update_range(
			VirtAddr(0x40000000),
			phys,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER | MapFlags::UPDADDR,
		)
		.unwrap();
		// Re-mark as copy-on-write: the present bit must drop even though the
		// caller passed it
		vmem.update_range(
			VirtAddr(0x40000000),
			PhysAddr::default(),
			PAGE_SIZE,
			MapFlags::COW | MapFlags::PRESENT | MapFlags::USER,
		)
		.unwrap();
		let entry = vmem.entry(VirtAddr(0x40000000));
		assert_eq!(entry & x86::FLAG_PRESENT, 0);
		assert_ne!(entry & x86::FLAG_COW, 0);
		// The frame was kept and still resolves
		assert_eq!(vmem.translate(VirtAddr(0x40000000)), Some(phys));
		vmem.unmap_range(VirtAddr(0x40000000), 1);
		buddy::free_pages(block);
	}

	#[test]
	fn vmem_clone_cow() {
		buddy::init_test();
		let mut src = VMem::new().unwrap();
		let mut dst = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 0).unwrap();
		let phys = buddy::phys(block);
		src.update_range(
			VirtAddr(0x40000000),
			phys,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER | MapFlags::UPDADDR,
		)
		.unwrap();
		src.update_range(
			VirtAddr(0x40000000),
			PhysAddr::default(),
			PAGE_SIZE,
			MapFlags::COW | MapFlags::USER,
		)
		.unwrap();
		src.clone_range_to(
			&mut dst,
			VirtAddr(0x40000000),
			VirtAddr(0x40000000),
			PAGE_SIZE,
			MapFlags::COW | MapFlags::USER,
		)
		.unwrap();
		// Both sides carry the same non-present entry on the same frame
		assert_eq!(
			src.entry(VirtAddr(0x40000000)),
			dst.entry(VirtAddr(0x40000000))
		);
		assert_eq!(dst.translate(VirtAddr(0x40000000)), Some(phys));
		src.unmap_range(VirtAddr(0x40000000), 1);
		dst.unmap_range(VirtAddr(0x40000000), 1);
		buddy::free_pages(block);
	}

	#[test]
	fn vmem_span() {
		buddy::init_test();
		let mut vmem = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::HIGHUSER, 2).unwrap();
		let phys = buddy::phys(block);
		vmem.update_range(
			VirtAddr(0x40000000),
			phys,
			4 * PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::UPDADDR,
		)
		.unwrap();
		// From the start, the whole block is contiguous
		let (page, span) = vmem.virt_to_page(VirtAddr(0x40000000), usize::MAX).unwrap();
		assert_eq!(page, block);
		assert_eq!(span, 4 * PAGE_SIZE);
		// From the middle, only the remaining part is
		let (page, span) = vmem.virt_to_page(VirtAddr(0x40002800), usize::MAX).unwrap();
		assert_eq!(buddy::phys(page), phys + 2 * PAGE_SIZE);
		assert_eq!(span, 2 * PAGE_SIZE - 0x800);
		// The request length clamps the span
		let (_, span) = vmem.virt_to_page(VirtAddr(0x40000000), 42).unwrap();
		assert_eq!(span, 42);
		vmem.unmap_range(VirtAddr(0x40000000), 4);
		buddy::free_pages(block);
	}

	#[test]
	#[should_panic]
	fn vmem_global_monotonic() {
		buddy::init_test();
		let mut vmem = VMem::new().unwrap();
		let block = buddy::alloc_pages(GfpFlags::KERNEL, 0).unwrap();
		let phys = buddy::phys(block);
		vmem.update_range(
			VirtAddr(0x40000000),
			phys,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::GLOBAL | MapFlags::UPDADDR,
		)
		.unwrap();
		// Trying to drop the global bit is a protocol violation
		let _ = vmem.update_range(
			VirtAddr(0x40001000),
			phys,
			PAGE_SIZE,
			MapFlags::PRESENT | MapFlags::UPDADDR,
		);
	}
}
