//! Core types shared by every layer of the kernel.
//!
//! This crate holds the host-testable foundation the rest of the workspace
//! builds on: address types, page/frame abstractions, per-CPU identity and
//! storage, the error taxonomy, log levels, and the two spin-based
//! primitives (`SpinLock`, `IrqSpinLock`) that are safe to use before a
//! scheduler exists. Thread-blocking primitives (`Mutex`, `RwLock`,
//! `Condvar`, `Semaphore`) live in `hadron-sched`, since they need a
//! turnstile and a thread to block.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![feature(negative_impls)]
#![warn(missing_docs)]

extern crate alloc;

pub mod addr;
pub mod cell;
pub mod cpu_local;
pub mod error;
pub mod id;
pub mod log;
pub mod paging;
pub mod safety;
pub mod static_assert;
pub mod sync;
