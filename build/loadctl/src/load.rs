// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two-pass load flow.
//!
//! Position-specific code can't be relocated after linking, and the load
//! address isn't known until the device's allocator answers. So: build
//! once at placeholder addresses to learn the size, allocate exactly that
//! much (plus slack), build again at the real addresses, upload. Build
//! determinism guarantees the second artifact is the same size as the
//! first — that property is what makes this scheme sound, and it's
//! re-checked here rather than assumed.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::build::{Artifact, BuildRequest, Builder};
use crate::device::Device;
use crate::sig::Signature;
use wire::{ARG_AREA_SIZE, CAP_BYTE_ACCESSIBLE, CAP_EXEC};

/// Placeholder link addresses for the probe pass. Any valid, aligned
/// values work; only the probe artifact's size is used.
const PROBE_BASE: u32 = 0x4800_0000;
const PROBE_ARGS: u32 = 0x48F0_0000;

#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Optimization override for both passes.
    pub optimization: Option<String>,
    /// Resolve external references against the configured firmware ELF.
    pub resolve_against_firmware: bool,
    /// Read mutated arrays back after each call.
    pub sync_arrays: bool,
    /// Extra bytes reserved beyond the probe size.
    pub slack: u32,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            optimization: None,
            resolve_against_firmware: false,
            sync_arrays: true,
            slack: 64,
        }
    }
}

/// A function resident on the device, ready to call.
#[derive(Debug)]
pub struct LoadedFunction {
    pub artifact: Artifact,
    /// Base of the uploaded image (== link base of the final pass).
    pub code_address: u32,
    /// Base of this function's 128-byte argument frame.
    pub args_address: u32,
    /// Whether calls read mutated arrays back.
    pub sync: bool,
    valid: bool,
}

impl LoadedFunction {
    /// Binds a handle to a function that is already resident — its
    /// regions allocated in this session and its image uploaded. The
    /// normal path is [`load`]; this exists for callers that upload
    /// through some other route and still want the marshaller.
    pub fn from_resident(
        artifact: Artifact,
        code_address: u32,
        args_address: u32,
        sync: bool,
    ) -> Self {
        Self {
            artifact,
            code_address,
            args_address,
            sync,
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn signature(&self) -> &Signature {
        &self.artifact.signature
    }

    /// The address the device jumps to: the generated entry shim.
    pub fn entry(&self) -> u32 {
        self.artifact.entry
    }
}

/// Builds, allocates, relinks, and uploads `function` from `entry_source`.
/// Errors name the stage that failed.
pub fn load<T: Read + Write>(
    device: &mut Device<T>,
    builder: &Builder<'_>,
    entry_source: &Path,
    function: &str,
    options: &LoadOptions,
) -> Result<LoadedFunction> {
    // Pass one: measure.
    let probe_req = BuildRequest {
        entry_source,
        function,
        base_address: PROBE_BASE,
        args_address: PROBE_ARGS,
        optimization: options.optimization.as_deref(),
        resolve_against_firmware: options.resolve_against_firmware,
    };
    let probe = builder.build(&probe_req).context("probe build failed")?;
    let reserve = probe.image.len() as u32 + options.slack;

    // Allocate both regions before the final pass; their addresses are
    // baked into it.
    let alignment = builder.config().build.alignment;
    let code_address = device
        .alloc(reserve, alignment, CAP_EXEC)
        .context("allocating code region failed")?;
    let args_address = match device.alloc(
        ARG_AREA_SIZE as u32,
        4,
        CAP_BYTE_ACCESSIBLE,
    ) {
        Ok(a) => a,
        Err(e) => {
            let _ = device.free(code_address);
            return Err(e).context("allocating argument region failed");
        }
    };

    // Pass two: relink at the real addresses and upload. On any failure,
    // give both regions back.
    let uploaded: Result<Artifact> = (|| {
        let final_req = BuildRequest {
            base_address: code_address,
            args_address,
            ..probe_req
        };
        let artifact = builder.build(&final_req).context("final build failed")?;
        ensure!(
            artifact.image.len() as u32 <= reserve,
            "final artifact ({} bytes) outgrew the probe reservation ({} bytes); \
             the build is not deterministic",
            artifact.image.len(),
            reserve,
        );
        device
            .write(code_address, &artifact.image)
            .context("uploading image failed")?;
        Ok(artifact)
    })();

    match uploaded {
        Ok(artifact) => Ok(LoadedFunction {
            artifact,
            code_address,
            args_address,
            sync: options.sync_arrays,
            valid: true,
        }),
        Err(e) => {
            let _ = device.free(args_address);
            let _ = device.free(code_address);
            Err(e)
        }
    }
}

/// Releases both device regions and invalidates the handle. Safe to call
/// twice; the second call is a no-op.
pub fn unload<T: Read + Write>(
    device: &mut Device<T>,
    func: &mut LoadedFunction,
) -> Result<()> {
    if !func.valid {
        return Ok(());
    }
    device
        .free(func.args_address)
        .context("freeing argument region failed")?;
    device
        .free(func.code_address)
        .context("freeing code region failed")?;
    func.valid = false;
    Ok(())
}
