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

//! The `munmap` system call allows the process to free memory that was
//! allocated with `mmap`.
//!
//! Only whole areas can be unmapped: the call must name an existing area's
//! start and full length exactly.

use crate::{
	errno,
	errno::Errno,
	memory::{VirtAddr, PAGE_SIZE, PROCESS_END},
	process::Task,
};

pub fn munmap(proc: &mut Task, addr: usize, length: usize) -> Result<i32, Errno> {
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
	// Prevent from unmapping kernel memory
	if end > PROCESS_END.0 {
		return Err(errno::EINVAL);
	}
	let mm = &mut proc.mem_space;
	// The area must match the requested range exactly
	let area = mm.find_vm_area(VirtAddr(addr)).ok_or(errno::EINVAL)?;
	if unsafe { area.as_ref() }.size() != length {
		return Err(errno::EINVAL);
	}
	mm.destroy_vm_area(area).map_err(|e| e.errno())?;
	Ok(0)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::syscall::mmap::{mmap, test::task_with_layout, MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

	#[test]
	fn map_unmap_roundtrip() {
		let mut proc = task_with_layout("test-munmap");
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
		assert_eq!(munmap(&mut proc, addr, 4 * PAGE_SIZE), Ok(0));
		// The area is gone: a second unmap has nothing to match
		assert_eq!(munmap(&mut proc, addr, 4 * PAGE_SIZE), Err(errno::EINVAL));
	}

	#[test]
	fn length_must_match() {
		let mut proc = task_with_layout("test-munmap-len");
		let addr = mmap(
			&mut proc,
			0,
			4 * PAGE_SIZE,
			PROT_READ,
			MAP_PRIVATE | MAP_ANONYMOUS,
			-1,
			0,
		)
		.unwrap();
		assert_eq!(
			munmap(&mut proc, addr, 2 * PAGE_SIZE),
			Err(errno::EINVAL)
		);
		assert_eq!(munmap(&mut proc, addr + PAGE_SIZE, PAGE_SIZE), Err(errno::EINVAL));
		assert_eq!(munmap(&mut proc, addr, 4 * PAGE_SIZE), Ok(0));
	}

	#[test]
	fn bad_args() {
		let mut proc = task_with_layout("test-munmap-args");
		assert_eq!(munmap(&mut proc, 123, PAGE_SIZE), Err(errno::EINVAL));
		assert_eq!(munmap(&mut proc, 0x40000000, 0), Err(errno::EINVAL));
		assert_eq!(
			munmap(&mut proc, 0xbffff000, 2 * PAGE_SIZE),
			Err(errno::EINVAL)
		);
	}
}
