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

//! Sonata is an educational Unix-like kernel for 32 bit x86. This crate is its
//! memory core: the physical-frame allocator, the slab caches, the page
//! mapper, the per-process address spaces with copy-on-write, the per-process
//! heap and the memory system calls built on top of them.
//!
//! The rest of the system (boot, interrupts, scheduler, filesystems, ...) sits
//! on the other side of a few explicit seams:
//! - [`process::Task`] stands for the scheduler's "current task"
//! - [`process::mem_space::MemSpace::handle_page_fault`] is called from the
//!   CPU trap dispatcher
//! - the [`syscall`] module is called from the system call dispatcher
//!
//! Hardware control (CR3, `invlpg`) is only compiled when targeting the bare
//! machine. Everywhere else the paging structures remain a bit-exact model,
//! which is what the test suite runs against.

#![cfg_attr(not(test), no_std)]

pub mod errno;
pub mod memory;
pub mod process;
pub mod syscall;
