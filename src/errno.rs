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

//! Error handling for the memory core.
//!
//! Inside the kernel, operations return [`Error`], which tells what went wrong
//! precisely. The syscall layer is the single place where an [`Error`] is
//! turned into the Unix errno reported to userspace.
//!
//! Protocol violations (clearing a `GLOBAL` mapping, freeing an unmanaged
//! heap pointer, ...) are not errors but bugs: they make the kernel panic and
//! never cross the syscall boundary.

/// Type representing a Unix errno.
pub type Errno = i32;

/// Operation not permitted.
pub const EPERM: Errno = 1;
/// No such file or directory.
pub const ENOENT: Errno = 2;
/// Bad file descriptor.
pub const EBADF: Errno = 9;
/// Cannot allocate memory.
pub const ENOMEM: Errno = 12;
/// Bad address.
pub const EFAULT: Errno = 14;
/// Invalid argument.
pub const EINVAL: Errno = 22;

/// An error occurring inside the memory core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
	/// An argument does not make sense: null size, reversed range,
	/// misaligned address, ...
	#[error("invalid arguments")]
	InvalidArgs,
	/// A proposed virtual range overlaps an existing memory area.
	#[error("overlapping memory area")]
	Overlap,
	/// The physical allocator, a slab cache, or the process heap is
	/// exhausted.
	#[error("out of memory")]
	OutOfMemory,
	/// The requested object (area, mapping, gap) does not exist.
	#[error("not found")]
	NotFound,
}

impl Error {
	/// Returns the errno to report to userspace for this error.
	pub fn errno(self) -> Errno {
		match self {
			Self::InvalidArgs => EINVAL,
			Self::Overlap => EINVAL,
			Self::OutOfMemory => ENOMEM,
			Self::NotFound => ENOENT,
		}
	}
}

/// Result type for fallible operations of the memory core.
pub type EResult<T> = Result<T, Error>;
