//! Freestanding binary entry point.
//!
//! The actual `_start` symbol, panic handler, and module tree all live in
//! the `embodios_kernel_lib` rlib (see `lib.rs` / `boot.rs`); this bin crate
//! exists only so the linker has something to build, and pulls the lib in
//! so its `_start` is reachable.

#![no_std]
#![no_main]

extern crate embodios_kernel_lib;
