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

//! The `mmap` system call allows the process to allocate memory.

use crate::{
	errno,
	errno::Errno,
	memory::{
		buddy::GfpFlags,
		vmem::MapFlags,
		VirtAddr, PAGE_SIZE, PROCESS_END,
	},
	process::{mem_space::area::VmFlags, Task},
};

/// Data can be read.
pub const PROT_READ: i32 = 0x1;
/// Data can be written.
pub const PROT_WRITE: i32 = 0x2;
/// Data can be executed.
pub const PROT_EXEC: i32 = 0x4;

/// Changes are shared across mappings on the same region.
pub const MAP_SHARED: i32 = 0x01;
/// Changes are not carried to the underlying file.
pub const MAP_PRIVATE: i32 = 0x02;
/// Interpret `addr` exactly.
pub const MAP_FIXED: i32 = 0x10;
/// The mapping is not backed by any file.
pub const MAP_ANONYMOUS: i32 = 0x20;

/// Converts mmap's `flags` and `prot` to memory area flags.
fn get_flags(flags: i32, prot: i32) -> VmFlags {
	let mut vm_flags = VmFlags::USER | VmFlags::COW;
	if flags & MAP_SHARED != 0 {
		vm_flags |= VmFlags::SHARED;
	}
	if prot & PROT_WRITE != 0 {
		vm_flags |= VmFlags::WRITE;
	}
	if prot & PROT_EXEC != 0 {
		vm_flags |= VmFlags::EXEC;
	}
	vm_flags
}

pub fn mmap(
	proc: &mut Task,
	addr: usize,
	length: usize,
	prot: i32,
	flags: i32,
	fd: i32,
	offset: u64,
) -> Result<usize, Errno> {
	// Check alignment of `addr` and sanity of `length`
	if addr % PAGE_SIZE != 0 || length == 0 {
		return Err(errno::EINVAL);
	}
	let pages = length.div_ceil(PAGE_SIZE);
	let length = pages * PAGE_SIZE;
	// Check for overflow
	let end = addr.wrapping_add(length);
	if end < addr {
		return Err(errno::EINVAL);
	}
	// The file descriptor is only validated here; nothing is read from it
	if flags & MAP_ANONYMOUS == 0 {
		if fd < 0 || fd as usize >= proc.files {
			return Err(errno::EBADF);
		}
		if offset as usize % PAGE_SIZE != 0 {
			return Err(errno::EINVAL);
		}
	}
	let mm = &mut proc.mem_space;
	// Use the given address when it names a valid free range, else pick a gap
	let start = if addr != 0
		&& end <= PROCESS_END.0
		&& mm.is_valid_range(VirtAddr(addr), VirtAddr(end)).is_ok()
	{
		VirtAddr(addr)
	} else {
		mm.search_free_area(length).map_err(|_| errno::ENOMEM)?
	};
	let mut area = mm
		.create_vm_area(
			start,
			length,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::COW | MapFlags::USER,
			GfpFlags::HIGHUSER,
		)
		.map_err(|e| e.errno())?;
	// Record the caller's protection and flags on the area
	unsafe {
		area.as_mut().flags = get_flags(flags, prot);
	}
	Ok(start.0)
}

#[cfg(test)]
pub(crate) mod test {
	use super::*;
	use crate::memory::buddy;

	/// A task with a text and a stack area, the layout every process has by
	/// the time it can issue system calls.
	pub(crate) fn task_with_layout(name: &'static str) -> Task {
		buddy::init_test();
		let mut proc = Task::new(name).unwrap();
		proc.files = 3;
		proc.mem_space
			.create_vm_area(
				VirtAddr(0x08048000),
				4 * PAGE_SIZE,
				MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
				GfpFlags::HIGHUSER,
			)
			.unwrap();
		proc.mem_space
			.create_vm_area(
				VirtAddr(0xbfff0000),
				16 * PAGE_SIZE,
				MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
				GfpFlags::HIGHUSER,
			)
			.unwrap();
		proc.mem_space.start_stack = VirtAddr(0xc0000000);
		proc
	}

	#[test]
	fn anonymous_mapping() {
		let mut proc = task_with_layout("test-mmap");
		let addr = mmap(
			&mut proc,
			0,
			4 * PAGE_SIZE,
			PROT_READ | PROT_WRITE,
			MAP_PRIVATE | MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		assert_eq!(addr % PAGE_SIZE, 0);
		let area = proc.mem_space.find_vm_area(VirtAddr(addr)).unwrap();
		let area = unsafe { area.as_ref() };
		assert_eq!(area.size(), 4 * PAGE_SIZE);
		assert!(area.flags().contains(VmFlags::COW | VmFlags::WRITE));
		// The pages are lazy: a first write materializes them
		proc.mem_space.write_obj(VirtAddr(addr), &42u32).unwrap();
		assert_eq!(proc.mem_space.read_obj::<u32>(VirtAddr(addr)).unwrap(), 42);
	}

	#[test]
	fn address_hint() {
		let mut proc = task_with_layout("test-mmap-hint");
		let addr = mmap(
			&mut proc,
			0x50000000,
			PAGE_SIZE,
			PROT_READ,
			MAP_PRIVATE | MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		assert_eq!(addr, 0x50000000);
		// A taken hint falls back to gap search
		let other = mmap(
			&mut proc,
			0x50000000,
			PAGE_SIZE,
			PROT_READ,
			MAP_PRIVATE | MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		assert_ne!(other, 0x50000000);
	}

	#[test]
	fn fd_validation() {
		let mut proc = task_with_layout("test-mmap-fd");
		// File-backed mappings need a descriptor inside the table
		assert_eq!(
			mmap(&mut proc, 0, PAGE_SIZE, PROT_READ, MAP_PRIVATE, -1, 0),
			Err(errno::EBADF)
		);
		assert_eq!(
			mmap(&mut proc, 0, PAGE_SIZE, PROT_READ, MAP_PRIVATE, 7, 0),
			Err(errno::EBADF)
		);
		assert!(mmap(&mut proc, 0, PAGE_SIZE, PROT_READ, MAP_PRIVATE, 2, 0).is_ok());
	}

	#[test]
	fn bad_args() {
		let mut proc = task_with_layout("test-mmap-args");
		assert_eq!(
			mmap(&mut proc, 123, PAGE_SIZE, PROT_READ, MAP_ANONYMOUS, -1, 0),
			Err(errno::EINVAL)
		);
		assert_eq!(
			mmap(&mut proc, 0, 0, PROT_READ, MAP_ANONYMOUS, -1, 0),
			Err(errno::EINVAL)
		);
	}
}
