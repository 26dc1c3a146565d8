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

//! Slab caches allocate fixed-size, typed objects out of pages drawn from the
//! buddy allocator.
//!
//! Small objects are carved out of a page holding a [`SlabHeader`] at its
//! beginning, with free objects linked through their own storage. Objects
//! whose size or alignment leave no room for an in-page header (page
//! directories and page tables, which must coincide with the physical page
//! they occupy) are allocated as whole buddy blocks instead.
//!
//! An optional constructor runs on every object handed out, before the caller
//! sees it.

use crate::{
	errno::EResult,
	memory::{buddy, PAGE_SIZE},
};
use core::{
	marker::PhantomData,
	mem::{align_of, size_of},
	ptr::NonNull,
};
use spin::Mutex;

/// Header at the beginning of a page carved into small objects.
struct SlabHeader {
	/// The previous slab of the cache.
	prev: Option<NonNull<SlabHeader>>,
	/// The next slab of the cache.
	next: Option<NonNull<SlabHeader>>,
	/// The first free object of the slab.
	free: Option<NonNull<FreeObject>>,
	/// The number of objects currently allocated in the slab.
	used: usize,
}

/// Link stored inside the storage of a free object.
struct FreeObject {
	/// The next free object in the slab.
	next: Option<NonNull<FreeObject>>,
}

/// A cache of fixed-size objects of type `T`.
pub struct Cache<T> {
	/// Name of the cache, for diagnostics.
	name: &'static str,
	/// Constructor called on each object before it is handed out.
	ctor: Option<fn(NonNull<T>)>,
	/// The slabs of the cache. Protected against concurrent syscalls; the
	/// embedder masks interrupts around allocator sections.
	slabs: Mutex<Option<NonNull<SlabHeader>>>,
	_marker: PhantomData<T>,
}

unsafe impl<T> Send for Cache<T> {}
unsafe impl<T> Sync for Cache<T> {}

impl<T> Cache<T> {
	/// The stride between two objects in a slab.
	const OBJ_SIZE: usize = {
		let size = if size_of::<T>() > size_of::<FreeObject>() {
			size_of::<T>()
		} else {
			size_of::<FreeObject>()
		};
		size.div_ceil(align_of::<T>()) * align_of::<T>()
	};
	/// The offset of the first object in a slab.
	const OBJ_BASE: usize =
		size_of::<SlabHeader>().div_ceil(align_of::<T>()) * align_of::<T>();

	/// Tells whether objects are allocated as whole buddy blocks rather than
	/// carved from slabs.
	const WHOLE_BLOCKS: bool =
		align_of::<T>() >= PAGE_SIZE || Self::OBJ_BASE + Self::OBJ_SIZE > PAGE_SIZE;

	/// Creates a cache.
	///
	/// `ctor` is run on every allocated object; the caches backing paging
	/// structures use it to zero every entry.
	pub const fn new(name: &'static str, ctor: Option<fn(NonNull<T>)>) -> Self {
		Self {
			name,
			ctor,
			slabs: Mutex::new(None),
			_marker: PhantomData,
		}
	}

	/// Allocates an object from the cache.
	///
	/// The object is **not** initialized, except by the cache's constructor if
	/// any. It is the caller's responsibility to write it before use.
	pub fn alloc(&self, flags: buddy::GfpFlags) -> EResult<NonNull<T>> {
		let obj = if Self::WHOLE_BLOCKS {
			let order = buddy::get_order(size_of::<T>().div_ceil(PAGE_SIZE));
			let page = buddy::alloc_pages(flags, order)?;
			buddy::virt_from_page(page).cast::<T>()
		} else {
			self.alloc_small(flags)?
		};
		if let Some(ctor) = self.ctor {
			ctor(obj);
		}
		Ok(obj)
	}

	/// Allocates an object out of the slabs.
	fn alloc_small(&self, flags: buddy::GfpFlags) -> EResult<NonNull<T>> {
		let mut slabs = self.slabs.lock();
		// Look for a slab with a free object
		let mut cur = *slabs;
		while let Some(mut slab) = cur {
			let slab = unsafe { slab.as_mut() };
			if let Some(free) = slab.free {
				slab.free = unsafe { (*free.as_ptr()).next };
				slab.used += 1;
				return Ok(free.cast());
			}
			cur = slab.next;
		}
		// Every slab is full, allocate a new one
		let page = buddy::alloc_pages(flags, 0)?;
		let base = buddy::virt_from_page(page);
		let count = (PAGE_SIZE - Self::OBJ_BASE) / Self::OBJ_SIZE;
		debug_assert!(count > 0);
		unsafe {
			// Carve the free list
			let mut free = None;
			for i in (0..count).rev() {
				let obj = base.add(Self::OBJ_BASE + i * Self::OBJ_SIZE).cast::<FreeObject>();
				obj.write(FreeObject {
					next: free,
				});
				free = Some(obj);
			}
			let first = free.unwrap();
			let header = base.cast::<SlabHeader>();
			header.write(SlabHeader {
				prev: None,
				next: *slabs,
				free: (*first.as_ptr()).next,
				used: 1,
			});
			if let Some(mut next) = *slabs {
				next.as_mut().prev = Some(header);
			}
			*slabs = Some(header);
			Ok(first.cast())
		}
	}

	/// Returns an object to the cache.
	///
	/// # Safety
	///
	/// `obj` must come from a call to [`Self::alloc`] on the same cache and
	/// must not be used afterwards.
	pub unsafe fn free(&self, obj: NonNull<T>) {
		if Self::WHOLE_BLOCKS {
			let page = buddy::page_from_virt(obj.cast())
				.unwrap_or_else(|| panic!("slab {}: freeing foreign object", self.name));
			buddy::free_pages(page);
			return;
		}
		let mut slabs = self.slabs.lock();
		// The slab header sits at the beginning of the object's page
		let header = (obj.as_ptr() as usize) & !(PAGE_SIZE - 1);
		let slab_ptr = NonNull::new(header as *mut SlabHeader).unwrap();
		let slab = unsafe { &mut *slab_ptr.as_ptr() };
		let free_obj = obj.cast::<FreeObject>();
		unsafe {
			free_obj.write(FreeObject {
				next: slab.free,
			});
		}
		slab.free = Some(free_obj);
		slab.used -= 1;
		if slab.used > 0 {
			return;
		}
		// The slab is empty, give the page back
		unsafe {
			if let Some(mut prev) = slab.prev {
				prev.as_mut().next = slab.next;
			} else {
				*slabs = slab.next;
			}
			if let Some(mut next) = slab.next {
				next.as_mut().prev = slab.prev;
			}
		}
		let page = buddy::page_from_virt(slab_ptr.cast()).unwrap();
		buddy::free_pages(page);
	}
}
