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

//! The memory system calls.
//!
//! These are thin adapters: the trap dispatcher resolves the current task,
//! extracts the arguments from the saved registers and calls down here. An
//! `Err` becomes the negative errno (or a null pointer, for `brk`) in the
//! return register; kernel-internal panics never get this far.

pub mod brk;
pub mod mmap;
pub mod munmap;

pub use brk::brk;
pub use mmap::mmap;
pub use munmap::munmap;
