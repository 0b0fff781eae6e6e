//! Atomic shared pointers for lock-free data structures.
//!
//! A [`SharedPtr`] is a reference-counted pointer, much like [`Arc`](alloc::sync::Arc), that can
//! also be stored in an atomic cell and loaded back out by any number of threads while others
//! concurrently replace it. The hard part of that is the load: between reading the address of the
//! control block out of the cell and incrementing its count, a concurrent store may release the
//! last reference and free the block. This crate offers two answers to that race, chosen per
//! pointer by its [`Reclaimer`]:
//!
//! - **Hazard pointers** (`&Domain<F>`, loaded through a [`HazardCell`]): the loader announces the
//!   block's address in a [hazard record][hazptr] first, and a writer that releases the last
//!   reference hands the block to the [`Domain`], which only frees it once no announcement names
//!   it. The domain machinery is adapted from the [implementation][folly-hazptr] found in
//!   Facebook's [Folly library][folly].
//! - **Split reference counts** ([`SplitCount`], loaded through a [`SplitCell`]): the cell packs
//!   a small local count next to the address, and a load reserves a reference on it in the same
//!   atomic step it reads the address. Blocks are freed immediately.
//!
//! Either way, values are dropped as soon as the last reference to them goes away. Only the
//! control block may linger, and only under hazard pointers.
//!
//! ```rust
//! use atomic_shared::{AtomicShared, HazardCell, SharedPtr, SplitCell, SplitCount, Domain};
//!
//! let hazard = HazardCell::new_in(Some(SharedPtr::new(1)), Domain::global());
//! let split = SplitCell::new_in(Some(SharedPtr::new_in(1, SplitCount)), SplitCount);
//!
//! let one = hazard.load().unwrap();
//! hazard.store(Some(SharedPtr::new(2)));
//! assert_eq!(*one, 1);
//!
//! let one = split.swap(None).unwrap();
//! assert_eq!(*one, 1);
//! assert!(split.load().is_none());
//! ```
//!
//! Built on top of the cells are two classic lock-free containers that work with either
//! strategy: a Treiber [`Stack`] and a Michael-Scott [`Queue`].
//!
//! # Logging
//!
//! The crate emits [`tracing`] events on its cold paths only: `trace` when a domain grows its
//! set of hazard records, and `debug` when a reclamation pass frees retired blocks or a domain is
//! torn down. Loads, stores and the container operations never log.
//!
//! [hazptr]: https://citeseerx.ist.psu.edu/viewdoc/download?doi=10.1.1.395.378&rep=rep1&type=pdf
//! [folly-hazptr]: https://github.com/facebook/folly/blob/main/folly/synchronization/Hazptr.h
//! [folly]: https://github.com/facebook/folly

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod atomic;
mod control;
mod domain;
mod hazard;
mod hazard_cell;
mod queue;
mod record;
mod shared;
mod split_cell;
mod stack;
mod sync;

pub use atomic::AtomicShared;
pub use control::{ControlBlock, Reclaimer};
pub use domain::{Domain, Global};
pub use hazard::HazardPointer;
pub use hazard_cell::HazardCell;
pub use queue::Queue;
pub use shared::SharedPtr;
pub use split_cell::{SplitCell, SplitCount};
pub use stack::Stack;
