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

//! The per-process heap backing the userspace `malloc`/`free`.
//!
//! The heap lives in a single memory area placed at a pseudo-random,
//! non-secret base. At the base sits a [`HeapHeader`] holding the anchors of
//! two intrusive lists: all blocks in address order, and free blocks. Each
//! block is a [`Block`] header followed by its payload; neighboring blocks
//! tile the region between the header and the process break without gaps.
//!
//! Allocation is best-fit with ties broken by lowest address, splitting
//! oversized blocks; freeing coalesces with free neighbors so that two
//! adjacent blocks are never both free. When no free block fits, the break
//! grows, bounded by the end of the heap area.
//!
//! All block metadata lives in process memory and is only touched through the
//! page-table-walking accessors, so the heap keeps working on a space whose
//! pages went copy-on-write over a fork.

use super::{copy::AnyRepr, MemSpace};
use crate::{
	errno::{EResult, Error},
	memory::{buddy::GfpFlags, vmem::MapFlags, VirtAddr, PAGE_SIZE},
};
use core::mem::{offset_of, size_of};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use spin::{Lazy, Mutex};

/// Lower bound for the heap base.
pub const HEAP_LB: VirtAddr = VirtAddr(0x40000000);
/// Upper bound for the heap base.
pub const HEAP_UB: VirtAddr = VirtAddr(0x50000000);
/// Payload size of the block present at heap creation.
const INITIAL_PAYLOAD: usize = 1024;
/// Total size of the heap area.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024 + size_of::<HeapHeader>() + size_of::<Block>();
/// Granularity of payload sizes.
const ALIGNMENT: usize = 16;
/// The number of bytes a block takes in addition to its payload.
pub const OVERHEAD: usize = size_of::<Block>();

/// Bit of [`Block`] `size` telling the block is free.
const BLOCK_FREE: u32 = 1 << 31;

/// A link in an intrusive list stored in process memory.
///
/// Both fields are virtual addresses of other [`ListHead`]s; lists are
/// circular, rooted at an anchor in the [`HeapHeader`].
#[repr(C)]
#[derive(Clone, Copy)]
struct ListHead {
	/// Address of the previous node.
	prev: u32,
	/// Address of the next node.
	next: u32,
}

unsafe impl AnyRepr for ListHead {}

/// The block header preceding every payload.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Block {
	/// Payload size in bytes; bit 31 is the free flag.
	size: u32,
	/// Node in the all-blocks list, ordered by address.
	entry: ListHead,
	/// Node in the free list. Only linked while the block is free.
	free: ListHead,
}

unsafe impl AnyRepr for Block {}

/// The header at the base of the heap area.
#[repr(C)]
struct HeapHeader {
	/// Anchor of the all-blocks list.
	list: ListHead,
	/// Anchor of the free list.
	free: ListHead,
}

/// Offset of a block's node in the all-blocks list.
const ENTRY_OFF: usize = offset_of!(Block, entry);
/// Offset of a block's node in the free list.
const FREE_OFF: usize = offset_of!(Block, free);

/// Weak generator for heap base placement. Not security: there is no entropy
/// here, only spreading.
static HEAP_RNG: Lazy<Mutex<SmallRng>> =
	Lazy::new(|| Mutex::new(SmallRng::seed_from_u64(0x736f6e6174615f68)));

/// Returns the address of the all-blocks anchor.
#[inline]
fn list_anchor(mm: &MemSpace) -> VirtAddr {
	mm.start_brk + offset_of!(HeapHeader, list)
}

/// Returns the address of the free-list anchor.
#[inline]
fn free_anchor(mm: &MemSpace) -> VirtAddr {
	mm.start_brk + offset_of!(HeapHeader, free)
}

/// Returns the end of the heap area.
#[inline]
fn heap_end(mm: &MemSpace) -> VirtAddr {
	mm.start_brk + HEAP_SIZE.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Reads the `prev` field of the node at `node`.
fn prev_of(mm: &MemSpace, node: VirtAddr) -> EResult<VirtAddr> {
	Ok(VirtAddr(mm.read_obj::<ListHead>(node)?.prev as usize))
}

/// Reads the `next` field of the node at `node`.
fn next_of(mm: &MemSpace, node: VirtAddr) -> EResult<VirtAddr> {
	Ok(VirtAddr(mm.read_obj::<ListHead>(node)?.next as usize))
}

/// Writes the `prev` field of the node at `node`.
fn set_prev(mm: &mut MemSpace, node: VirtAddr, val: VirtAddr) -> EResult<()> {
	mm.write_obj(node + offset_of!(ListHead, prev), &(val.0 as u32))
}

/// Writes the `next` field of the node at `node`.
fn set_next(mm: &mut MemSpace, node: VirtAddr, val: VirtAddr) -> EResult<()> {
	mm.write_obj(node + offset_of!(ListHead, next), &(val.0 as u32))
}

/// Makes the node at `node` a singleton circular list.
fn list_init(mm: &mut MemSpace, node: VirtAddr) -> EResult<()> {
	set_prev(mm, node, node)?;
	set_next(mm, node, node)
}

/// Inserts the node at `node` right after the node at `prev`.
fn list_insert_after(mm: &mut MemSpace, prev: VirtAddr, node: VirtAddr) -> EResult<()> {
	let next = next_of(mm, prev)?;
	set_prev(mm, node, prev)?;
	set_next(mm, node, next)?;
	set_next(mm, prev, node)?;
	set_prev(mm, next, node)
}

/// Unlinks the node at `node` from its list.
fn list_remove(mm: &mut MemSpace, node: VirtAddr) -> EResult<()> {
	let prev = prev_of(mm, node)?;
	let next = next_of(mm, node)?;
	set_next(mm, prev, next)?;
	set_prev(mm, next, prev)
}

/// Reads the size and free flag of the block at `block`.
fn block_meta(mm: &MemSpace, block: VirtAddr) -> EResult<(usize, bool)> {
	let raw = mm.read_obj::<Block>(block)?.size;
	Ok(((raw & !BLOCK_FREE) as usize, raw & BLOCK_FREE != 0))
}

/// Writes the size and free flag of the block at `block`, leaving its links
/// alone.
fn set_block(mm: &mut MemSpace, block: VirtAddr, size: usize, free: bool) -> EResult<()> {
	debug_assert!(size < BLOCK_FREE as usize);
	let mut raw = size as u32;
	if free {
		raw |= BLOCK_FREE;
	}
	mm.write_obj(block + offset_of!(Block, size), &raw)
}

/// Creates the process's heap area and its initial block, and places the
/// break just past that block.
///
/// Returns the heap base address.
pub fn create(mm: &mut MemSpace, gfp_flags: GfpFlags) -> EResult<VirtAddr> {
	debug_assert!(mm.start_brk.is_null());
	let span_pages = HEAP_SIZE.div_ceil(PAGE_SIZE);
	let slots = (HEAP_UB.0 - HEAP_LB.0) / PAGE_SIZE - span_pages;
	// Pick a base; on collision with an existing area, pick again
	let mut base = None;
	for _ in 0..16 {
		let off = HEAP_RNG.lock().next_u32() as usize % slots;
		let candidate = HEAP_LB + off * PAGE_SIZE;
		match mm.create_vm_area(
			candidate,
			HEAP_SIZE,
			MapFlags::PRESENT | MapFlags::WRITE | MapFlags::USER,
			gfp_flags,
		) {
			Ok(_) => {
				base = Some(candidate);
				break;
			}
			Err(Error::Overlap) => continue,
			Err(e) => return Err(e),
		}
	}
	let base = base.ok_or(Error::OutOfMemory)?;
	mm.start_brk = base;
	// Lay out the header and the initial block
	let block0 = base + size_of::<HeapHeader>();
	list_init(mm, list_anchor(mm))?;
	list_init(mm, free_anchor(mm))?;
	set_block(mm, block0, INITIAL_PAYLOAD, true)?;
	list_insert_after(mm, list_anchor(mm), block0 + ENTRY_OFF)?;
	list_insert_after(mm, free_anchor(mm), block0 + FREE_OFF)?;
	mm.brk = block0 + OVERHEAD + INITIAL_PAYLOAD;
	log::debug!("heap: created at {base:?}, break {:?}", mm.brk);
	Ok(base)
}

/// Tells whether `addr` falls inside the process's heap area.
pub fn contains(mm: &MemSpace, addr: VirtAddr) -> bool {
	!mm.start_brk.is_null() && mm.start_brk <= addr && addr < heap_end(mm)
}

/// Allocates `size` bytes on the heap and returns the payload address.
///
/// The best-fitting free block is used, split when the leftover is large
/// enough to form a block of its own. When nothing fits, the break grows;
/// the heap area bounds that growth.
pub fn alloc(mm: &mut MemSpace, size: usize) -> EResult<VirtAddr> {
	if size == 0 {
		return Err(Error::InvalidArgs);
	}
	debug_assert!(!mm.start_brk.is_null());
	let rounded = size.next_multiple_of(ALIGNMENT);
	let fa = free_anchor(mm);
	// Best fit: smallest free block large enough, lowest address on ties
	let mut best: Option<(VirtAddr, usize)> = None;
	let mut node = next_of(mm, fa)?;
	while node != fa {
		let block = node - FREE_OFF;
		let (bsize, bfree) = block_meta(mm, block)?;
		debug_assert!(bfree);
		if bsize >= rounded {
			let better = match best {
				None => true,
				Some((baddr, bs)) => bsize < bs || (bsize == bs && block < baddr),
			};
			if better {
				best = Some((block, bsize));
			}
		}
		node = next_of(mm, node)?;
	}
	if let Some((block, bsize)) = best {
		if bsize > OVERHEAD + rounded {
			// Carve a free block out of the leftover
			let rest = block + OVERHEAD + rounded;
			set_block(mm, rest, bsize - OVERHEAD - rounded, true)?;
			list_insert_after(mm, block + ENTRY_OFF, rest + ENTRY_OFF)?;
			list_insert_after(mm, block + FREE_OFF, rest + FREE_OFF)?;
			set_block(mm, block, rounded, false)?;
		} else {
			set_block(mm, block, bsize, false)?;
		}
		list_remove(mm, block + FREE_OFF)?;
		return Ok(block + OVERHEAD);
	}
	// Nothing fits: push the break
	let block = mm.brk;
	let new_brk = block + OVERHEAD + rounded;
	if new_brk > heap_end(mm) {
		return Err(Error::OutOfMemory);
	}
	set_block(mm, block, rounded, false)?;
	let la = list_anchor(mm);
	let tail = prev_of(mm, la)?;
	list_insert_after(mm, tail, block + ENTRY_OFF)?;
	mm.brk = new_brk;
	Ok(block + OVERHEAD)
}

/// Merges the block at `right` into the block at `left`.
///
/// The two blocks must be direct neighbors. `right_in_free` tells whether
/// `right` currently sits in the free list.
fn merge(mm: &mut MemSpace, left: VirtAddr, right: VirtAddr, right_in_free: bool) -> EResult<()> {
	debug_assert!(left < right);
	list_remove(mm, right + ENTRY_OFF)?;
	if right_in_free {
		list_remove(mm, right + FREE_OFF)?;
	}
	let (lsize, lfree) = block_meta(mm, left)?;
	let (rsize, _) = block_meta(mm, right)?;
	set_block(mm, left, lsize + OVERHEAD + rsize, lfree)
}

/// Frees the block whose payload starts at `ptr`, coalescing it with its free
/// neighbors.
///
/// Freeing an address that is not the payload of a live block is a protocol
/// violation and panics.
pub fn free(mm: &mut MemSpace, ptr: VirtAddr) -> EResult<()> {
	let la = list_anchor(mm);
	let block = ptr - OVERHEAD;
	// The pointer must name a live block
	let mut found = false;
	let mut node = next_of(mm, la)?;
	while node != la {
		let b = node - ENTRY_OFF;
		if b >= block {
			found = b == block;
			break;
		}
		node = next_of(mm, node)?;
	}
	let live = found && !block_meta(mm, block)?.1;
	if !live {
		panic!("heap: freeing unmanaged pointer {ptr:?}");
	}
	let (size, _) = block_meta(mm, block)?;
	set_block(mm, block, size, true)?;
	// Coalesce with direct neighbors
	let prev_node = prev_of(mm, block + ENTRY_OFF)?;
	let next_node = next_of(mm, block + ENTRY_OFF)?;
	let prev = (prev_node != la).then(|| prev_node - ENTRY_OFF);
	let next = (next_node != la).then(|| next_node - ENTRY_OFF);
	let prev_free = match prev {
		Some(p) => block_meta(mm, p)?.1,
		None => false,
	};
	let next_free = match next {
		Some(n) => block_meta(mm, n)?.1,
		None => false,
	};
	match (prev_free, next_free) {
		(true, true) => {
			merge(mm, prev.unwrap(), block, false)?;
			merge(mm, prev.unwrap(), next.unwrap(), true)?;
		}
		(true, false) => merge(mm, prev.unwrap(), block, false)?,
		(false, true) => {
			merge(mm, block, next.unwrap(), true)?;
			list_insert_after(mm, free_anchor(mm), block + FREE_OFF)?;
		}
		(false, false) => list_insert_after(mm, free_anchor(mm), block + FREE_OFF)?,
	}
	Ok(())
}
