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

//! Kernel-side access to the memory mapped in a [`MemSpace`].
//!
//! The kernel never dereferences process virtual addresses: accesses go page
//! by page through the translation tables and the kernel's frame window, so
//! they work whether or not the target space is the bound one.
//!
//! Writing through a copy-on-write mapping materializes the private copy
//! exactly like a hardware write fault would.

use super::MemSpace;
use crate::{
	errno::{EResult, Error},
	memory::{
		buddy,
		vmem::x86::{entry_addr, FLAG_COW, FLAG_PRESENT},
		VirtAddr, PAGE_SIZE,
	},
};
use core::{cmp::min, mem::size_of, mem::MaybeUninit, slice};

/// Marker for types that can be copied to and from process memory as plain
/// bytes.
///
/// # Safety
///
/// Implementors must be plain data: any bit pattern must be a valid value.
pub unsafe trait AnyRepr: Copy {}

unsafe impl AnyRepr for u8 {}
unsafe impl AnyRepr for u32 {}

impl MemSpace {
	/// Copies bytes at `addr` in the space into `buf`.
	///
	/// Copy-on-write pages that never materialized read as zeros. Unmapped
	/// addresses make the whole copy fail.
	pub fn copy_from_space(&self, addr: VirtAddr, buf: &mut [u8]) -> EResult<()> {
		let mut off = 0;
		while off < buf.len() {
			let va = addr + off;
			let page_off = va.0 & (PAGE_SIZE - 1);
			let n = min(PAGE_SIZE - page_off, buf.len() - off);
			let entry = self.vmem.entry(va.down_align_to(PAGE_SIZE));
			if entry & (FLAG_PRESENT | FLAG_COW) == 0 {
				return Err(Error::NotFound);
			}
			let base = entry_addr(entry);
			if base.is_null() {
				// Lazy page, not materialized yet
				buf[off..off + n].fill(0);
			} else {
				let src = buddy::phys_to_virt(base).ok_or(Error::NotFound)?;
				unsafe {
					buf.as_mut_ptr()
						.add(off)
						.copy_from_nonoverlapping(src.as_ptr().add(page_off), n);
				}
			}
			off += n;
		}
		Ok(())
	}

	/// Copies `buf` to `addr` in the space.
	///
	/// Writes resolve copy-on-write mappings on the way, exactly like a
	/// hardware write fault. Unmapped addresses make the whole copy fail.
	pub fn copy_to_space(&mut self, addr: VirtAddr, buf: &[u8]) -> EResult<()> {
		let mut off = 0;
		while off < buf.len() {
			let va = addr + off;
			let page_va = va.down_align_to(PAGE_SIZE);
			let page_off = va.0 & (PAGE_SIZE - 1);
			let n = min(PAGE_SIZE - page_off, buf.len() - off);
			let mut entry = self.vmem.entry(page_va);
			if entry & FLAG_PRESENT == 0 {
				if entry & FLAG_COW == 0 {
					return Err(Error::NotFound);
				}
				// Break the sharing before writing
				self.resolve_cow(page_va)?;
				entry = self.vmem.entry(page_va);
				debug_assert_ne!(entry & FLAG_PRESENT, 0);
			}
			let dst = buddy::phys_to_virt(entry_addr(entry)).ok_or(Error::NotFound)?;
			unsafe {
				dst.as_ptr()
					.add(page_off)
					.copy_from_nonoverlapping(buf.as_ptr().add(off), n);
			}
			off += n;
		}
		Ok(())
	}

	/// Reads an object at `addr` in the space.
	pub fn read_obj<T: AnyRepr>(&self, addr: VirtAddr) -> EResult<T> {
		let mut val = MaybeUninit::<T>::uninit();
		let buf = unsafe {
			slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, size_of::<T>())
		};
		self.copy_from_space(addr, buf)?;
		Ok(unsafe { val.assume_init() })
	}

	/// Writes the object `val` at `addr` in the space.
	pub fn write_obj<T: AnyRepr>(&mut self, addr: VirtAddr, val: &T) -> EResult<()> {
		let buf =
			unsafe { slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) };
		self.copy_to_space(addr, buf)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::{buddy::GfpFlags, vmem::MapFlags};

	#[test]
	fn cross_page_roundtrip() {
		buddy::init_test();
		let mut space = MemSpace::new().unwrap();
		space
			.create_vm_area(
				VirtAddr(0x40100000),
				2 * PAGE_SIZE,
				MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
				GfpFlags::HIGHUSER,
			)
			.unwrap();
		// An object straddling the page boundary
		let addr = VirtAddr(0x40100000 + PAGE_SIZE - 2);
		space.write_obj(addr, &0xdead_beefu32).unwrap();
		assert_eq!(space.read_obj::<u32>(addr).unwrap(), 0xdead_beef);
	}

	#[test]
	fn unmapped_fails() {
		buddy::init_test();
		let mut space = MemSpace::new().unwrap();
		assert_eq!(
			space.read_obj::<u32>(VirtAddr(0x40100000)).unwrap_err(),
			Error::NotFound
		);
		assert_eq!(
			space.write_obj(VirtAddr(0x40100000), &0u32).unwrap_err(),
			Error::NotFound
		);
	}

	#[test]
	fn lazy_pages_read_as_zeros() {
		buddy::init_test();
		let mut space = MemSpace::new().unwrap();
		// A copy-on-write area with no backing yet
		space
			.create_vm_area(
				VirtAddr(0x40100000),
				PAGE_SIZE,
				MapFlags::PRESENT | MapFlags::WRITE | MapFlags::COW | MapFlags::USER,
				GfpFlags::HIGHUSER,
			)
			.unwrap();
		assert_eq!(space.read_obj::<u32>(VirtAddr(0x40100abc)).unwrap(), 0);
		// The first write materializes a private zeroed page
		space.write_obj(VirtAddr(0x40100abc), &1u32).unwrap();
		assert_eq!(space.read_obj::<u32>(VirtAddr(0x40100abc)).unwrap(), 1);
		assert_eq!(space.read_obj::<u32>(VirtAddr(0x40100ac0)).unwrap(), 0);
	}
}
