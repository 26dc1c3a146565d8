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

//! Memory management.
//!
//! The system's virtual memory is divided in two chunks:
//! - Userspace: virtual memory below [`PROCESS_END`], owned by the currently
//!   running process
//! - Kernelspace: virtual memory above [`PROCESS_END`], owned by the kernel
//!   itself and shared across processes
//!
//! Physical memory is handed out by the buddy allocator ([`buddy`]), cut into
//! typed objects by the slab caches ([`slab`]) and wired into address spaces
//! by the page mapper ([`vmem`]).

use core::{
	fmt,
	mem::size_of,
	ops::{Add, Sub},
	ptr::NonNull,
};

pub mod buddy;
pub mod slab;
pub mod vmem;

/// The size of a page of memory in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Address of the beginning of the allocatable region in the virtual memory.
pub const ALLOC_BEGIN: VirtAddr = VirtAddr(0x40000000);
/// Address of the end of the virtual memory reserved to the process.
pub const PROCESS_END: VirtAddr = VirtAddr(0xc0000000);

/// An address on physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(pub usize);

/// An address on virtual memory.
///
/// This would usually be represented by a pointer. However, process virtual
/// addresses are never dereferenced directly by the kernel: they go through
/// the translation tables first, so a plain integer is the honest type.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(pub usize);

impl<T> From<NonNull<T>> for VirtAddr {
	fn from(ptr: NonNull<T>) -> Self {
		Self(ptr.as_ptr() as usize)
	}
}

macro_rules! addr_impl {
	($name:ident) => {
		impl $name {
			/// Tells whether the address is null.
			pub fn is_null(self) -> bool {
				self.0 == 0
			}

			/// Tells whether the address is aligned to `align`.
			pub fn is_aligned_to(self, align: usize) -> bool {
				self.0 % align == 0
			}

			/// Computes and returns the next address aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn align_to(self, align: usize) -> Self {
				Self(self.0.next_multiple_of(align))
			}

			/// Computes and returns the previous address aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn down_align_to(self, align: usize) -> Self {
				Self(self.0 & !(align - 1))
			}
		}

		impl Add<usize> for $name {
			type Output = Self;

			/// Adds the given offset in bytes, wrapping on overflow.
			fn add(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_add(off))
			}
		}

		impl Sub<usize> for $name {
			type Output = Self;

			/// Subtracts the given offset in bytes, wrapping on overflow.
			fn sub(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_sub(off))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
				const LEN: usize = size_of::<usize>() * 2;
				write!(fmt, "{:0LEN$x}", self.0)
			}
		}
	};
}

addr_impl!(PhysAddr);
addr_impl!(VirtAddr);

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn addr_align() {
		let addr = VirtAddr(0x1234);
		assert!(!addr.is_aligned_to(PAGE_SIZE));
		assert_eq!(addr.align_to(PAGE_SIZE), VirtAddr(0x2000));
		assert_eq!(addr.down_align_to(PAGE_SIZE), VirtAddr(0x1000));
		assert_eq!(VirtAddr(0x2000).align_to(PAGE_SIZE), VirtAddr(0x2000));
	}
}
