// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side driver for the remote dynamic code loader.
//!
//! The flow, top to bottom: [`build`] turns a C source file and a function
//! name into a position-specific binary linked for a chosen address, with
//! the generated [`wrapper`] as its entry point; [`load`] runs the build
//! twice (probe for size, final at the allocated address) and uploads the
//! result through the [`device`] façade; [`args`] marshals typed host
//! values through the 128-byte argument frame and triggers execution.
//!
//! Below the façade, [`client`] frames and checksums requests over any
//! ordered byte pipe, and [`shadow`] mirrors the device's allocation table
//! so bad addresses are caught before a packet is ever sent.

pub mod args;
pub mod build;
pub mod client;
pub mod config;
pub mod device;
pub mod elf;
pub mod linker;
pub mod load;
pub mod shadow;
pub mod sig;
pub mod toolchain;
pub mod wrapper;

pub use build::{Artifact, BuildRequest, Builder};
pub use client::Client;
pub use device::Device;
pub use load::{LoadOptions, LoadedFunction};
pub use sig::Signature;
