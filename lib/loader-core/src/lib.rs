// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side core of the dynamic code loader.
//!
//! This crate is the portable part of the loader firmware: the framed
//! receive state machine, the command dispatcher, the allocation-tracking
//! table that keeps a misbehaving host from faulting the CPU, and a small
//! event trace ring for post-mortem inspection.
//!
//! The heap allocator, the cache-maintenance primitive, raw memory access,
//! and the jump into loaded code all sit behind the [`platform::Platform`]
//! trait, so this crate builds and tests on the host. The firmware task
//! that wraps it owns the statics, implements `Platform` with the real
//! unsafe operations, and pumps bytes from the interrupt-fed `byteq`
//! consumer half:
//!
//! ```ignore
//! let (mut isr_tx, mut rx) = RX_QUEUE.split();
//! // isr_tx moves to the UART interrupt handler...
//! loop {
//!     if let Some(byte) = rx.pop() {
//!         if let Some(resp) = server.step(byte) {
//!             uart_write_all(resp);
//!         }
//!     } else {
//!         wait_for_rx_notification();
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod platform;
pub mod server;
pub mod table;
pub mod trace;

pub use platform::{HeapStats, Platform};
pub use server::Server;
pub use table::{AllocTable, MAX_ALLOCATIONS};
