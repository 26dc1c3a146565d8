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

//! The `brk` system call is the single entry point of the userspace
//! allocator. It dispatches on its argument's value:
//! - `0`: make sure the heap exists and return the current break
//! - an address inside the heap area: free the block whose payload starts
//!   there, and return the current break
//! - anything else: treat the value as a byte size, allocate, and return the
//!   payload address

use crate::{
	errno::Errno,
	memory::{buddy::GfpFlags, VirtAddr},
	process::{mem_space::heap, Task},
};

pub fn brk(proc: &mut Task, addr: usize) -> Result<usize, Errno> {
	let mm = &mut proc.mem_space;
	// First use: place the heap
	if mm.start_brk.is_null() {
		heap::create(mm, GfpFlags::HIGHUSER).map_err(|e| e.errno())?;
	}
	if addr == 0 {
		return Ok(mm.brk.0);
	}
	let addr = VirtAddr(addr);
	if heap::contains(mm, addr) {
		heap::free(mm, addr).map_err(|e| e.errno())?;
		Ok(mm.brk.0)
	} else {
		// The value is a size request
		let payload = heap::alloc(mm, addr.0).map_err(|e| e.errno())?;
		Ok(payload.0)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{memory::buddy, process::mem_space::heap::test::all_blocks};

	#[test]
	fn brk_dispatch() {
		buddy::init_test();
		let mut proc = Task::new("test-brk").unwrap();
		// First call creates the heap
		let break0 = brk(&mut proc, 0).unwrap();
		assert!(heap::contains(&proc.mem_space, VirtAddr(break0 - 1)));
		// A size request returns a payload inside the heap
		let p = brk(&mut proc, 123).unwrap();
		assert!(heap::contains(&proc.mem_space, VirtAddr(p)));
		// An in-heap address frees the block and returns the break
		let blocks_used = all_blocks(&proc.mem_space);
		let ret = brk(&mut proc, p).unwrap();
		assert_eq!(ret, proc.mem_space.brk.0);
		assert_ne!(all_blocks(&proc.mem_space), blocks_used);
		// The break did not move through all this
		assert_eq!(brk(&mut proc, 0).unwrap(), break0);
	}

	#[test]
	fn brk_failure() {
		buddy::init_test();
		let mut proc = Task::new("test-brk-fail").unwrap();
		brk(&mut proc, 0).unwrap();
		// An impossible size request fails without disturbing the heap
		let break0 = proc.mem_space.brk;
		assert!(brk(&mut proc, 0x10000000).is_err());
		assert_eq!(proc.mem_space.brk, break0);
	}
}
