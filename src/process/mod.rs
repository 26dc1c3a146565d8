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

//! The task descriptor, as far as the memory core is concerned.
//!
//! Scheduling lives elsewhere; the syscall dispatcher resolves the current
//! task and passes it down explicitly, so the memory core never reaches for a
//! global. This is also what keeps the whole subsystem testable: a test is
//! free to juggle several tasks.

pub mod mem_space;

use crate::errno::EResult;
use mem_space::MemSpace;

/// A process, reduced to what the memory subsystem needs to know about it.
pub struct Task {
	/// The process name, for diagnostics.
	pub name: &'static str,
	/// The process's address space.
	pub mem_space: MemSpace,
	/// The number of open file descriptors. Used to validate descriptors
	/// passed to `mmap`; the file table itself lives in the VFS layer.
	pub files: usize,
}

impl Task {
	/// Creates a task with an empty address space.
	pub fn new(name: &'static str) -> EResult<Self> {
		Ok(Self {
			name,
			mem_space: MemSpace::new()?,
			files: 0,
		})
	}

	/// Forks the task's address space into a new task.
	///
	/// The child shares every physical page with the parent, copy-on-write.
	pub fn fork(&mut self, name: &'static str) -> EResult<Self> {
		log::trace!("{}: fork", self.name);
		Ok(Self {
			name,
			mem_space: self.mem_space.fork()?,
			files: self.files,
		})
	}
}
