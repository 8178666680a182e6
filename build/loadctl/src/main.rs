// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin CLI over the loader library: connectivity checks, build
//! inspection, and end-to-end load-and-call.
//!
//! The serial port is opened as a plain file and treated as an ordered
//! byte pipe; configure the tty (raw mode, read timeout) before use, the
//! way the CDC-ACM transport normally comes up.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;

use loadctl::args::{self, ArrayArg, RetValue, Value};
use loadctl::build::{BuildRequest, Builder};
use loadctl::config::Config;
use loadctl::device::Device;
use loadctl::load::{self, LoadOptions};
use loadctl::sig::{ParamClass, Scalar, Signature};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "drive the remote dynamic code loader")]
enum Loadctl {
    /// Check the link: echo a test pattern through the device.
    Ping {
        /// Path to loader.toml.
        #[clap(short, long, default_value = "loader.toml")]
        cfg: PathBuf,
    },
    /// Print the device's protocol version, limits, and firmware version.
    Info {
        #[clap(short, long, default_value = "loader.toml")]
        cfg: PathBuf,
    },
    /// Print device heap occupancy.
    Heap {
        #[clap(short, long, default_value = "loader.toml")]
        cfg: PathBuf,
    },
    /// Build a function at probe addresses and print its layout.
    Build {
        #[clap(short, long, default_value = "loader.toml")]
        cfg: PathBuf,
        /// Entry source file.
        source: PathBuf,
        /// Function to wrap.
        function: String,
        /// Also print a disassembly listing.
        #[clap(long)]
        disasm: bool,
        /// Resolve external references against the firmware ELF.
        #[clap(long)]
        firmware: bool,
    },
    /// Load a function onto the device and call it.
    Run {
        #[clap(short, long, default_value = "loader.toml")]
        cfg: PathBuf,
        source: PathBuf,
        function: String,
        /// Arguments: scalars as plain numbers, arrays as [1,2,3].
        #[clap(allow_hyphen_values = true)]
        args: Vec<String>,
        #[clap(long)]
        firmware: bool,
        /// Skip post-call array readback.
        #[clap(long)]
        no_sync: bool,
        /// Optimization override, e.g. -O1.
        #[clap(short, long)]
        opt: Option<String>,
    },
}

fn main() -> Result<()> {
    match Loadctl::parse() {
        Loadctl::Ping { cfg } => ping(&cfg),
        Loadctl::Info { cfg } => info(&cfg),
        Loadctl::Heap { cfg } => heap(&cfg),
        Loadctl::Build {
            cfg,
            source,
            function,
            disasm,
            firmware,
        } => build(&cfg, &source, &function, disasm, firmware),
        Loadctl::Run {
            cfg,
            source,
            function,
            args,
            firmware,
            no_sync,
            opt,
        } => run(&cfg, &source, &function, &args, firmware, no_sync, opt),
    }
}

fn open_device(config: &Config) -> Result<Device<File>> {
    let port = &config.transport.port;
    let io = OpenOptions::new()
        .read(true)
        .write(true)
        .open(port)
        .with_context(|| format!("opening {}", port.display()))?;
    Ok(Device::open(io)?)
}

fn ping(cfg: &PathBuf) -> Result<()> {
    let config = Config::from_path(cfg)?;
    let mut device = open_device(&config)?;
    device.ping(&[0xCA, 0xFE, 0xBA, 0xBE])?;
    println!("{} {}", "link ok:".green(), device.info().firmware_version);
    Ok(())
}

fn info(cfg: &PathBuf) -> Result<()> {
    let config = Config::from_path(cfg)?;
    let device = open_device(&config)?;
    let i = device.info();
    println!("protocol        {}.{}", i.protocol_major, i.protocol_minor);
    println!("firmware        {}", i.firmware_version);
    println!("max payload     {} bytes", i.max_payload);
    println!("cache line      {} bytes", i.cache_line);
    println!("allocation slots {}", i.max_allocations);
    Ok(())
}

fn heap(cfg: &PathBuf) -> Result<()> {
    let config = Config::from_path(cfg)?;
    let mut device = open_device(&config)?;
    let h = device.heap_info()?;
    println!(
        "external {} free / {} total",
        h.free_external, h.total_external
    );
    println!(
        "internal {} free / {} total",
        h.free_internal, h.total_internal
    );
    Ok(())
}

fn build(
    cfg: &PathBuf,
    source: &PathBuf,
    function: &str,
    disasm: bool,
    firmware: bool,
) -> Result<()> {
    let config = Config::from_path(cfg)?;
    let builder = Builder::new(&config)?;
    let request = BuildRequest {
        entry_source: source,
        function,
        base_address: 0x4800_0000,
        args_address: 0x48F0_0000,
        optimization: None,
        resolve_against_firmware: firmware,
    };
    let artifact = builder.build(&request)?;

    println!(
        "{} {} bytes, entry {:#010x}",
        "built:".green(),
        artifact.image.len(),
        artifact.entry
    );
    for (name, s) in &artifact.sections {
        println!("  {name:<8} {:#010x} {:>6} bytes", s.addr, s.size);
    }
    print!("{}", artifact.symbol_listing());
    if disasm {
        print!("{}", builder.disassemble(&artifact)?);
    }
    Ok(())
}

fn run(
    cfg: &PathBuf,
    source: &PathBuf,
    function: &str,
    raw_args: &[String],
    firmware: bool,
    no_sync: bool,
    opt: Option<String>,
) -> Result<()> {
    let config = Config::from_path(cfg)?;
    let builder = Builder::new(&config)?;
    let mut device = open_device(&config)?;

    let options = LoadOptions {
        optimization: opt,
        resolve_against_firmware: firmware,
        sync_arrays: !no_sync,
        ..LoadOptions::default()
    };
    let mut func = load::load(&mut device, &builder, source, function, &options)?;
    println!(
        "{} {} at {:#010x} ({} bytes)",
        "loaded:".green(),
        function,
        func.code_address,
        func.artifact.image.len()
    );

    let mut owned = parse_args(func.signature(), raw_args)?;
    let mut values: Vec<Value<'_>> = owned
        .iter_mut()
        .map(|a| match a {
            OwnedArg::Scalar(v) => clone_scalar(v),
            OwnedArg::Array(arr) => Value::Array(arr),
        })
        .collect();

    let result = args::call(&mut device, &func, &mut values);
    drop(values);

    match result {
        Ok(ret) => {
            println!("{} {}", "returned:".green(), describe(&ret));
            for (i, arg) in owned.iter().enumerate() {
                if let OwnedArg::Array(arr) = arg {
                    println!("  arg {i} after call: {}", describe_array(arr));
                }
            }
        }
        Err(e) => {
            let _ = load::unload(&mut device, &mut func);
            return Err(e).context("call failed");
        }
    }

    load::unload(&mut device, &mut func)?;
    Ok(())
}

/// Owner for parsed CLI arguments; `Value` borrows the arrays from here.
enum OwnedArg {
    Scalar(Value<'static>),
    Array(ArrayArg),
}

fn clone_scalar<'a>(v: &Value<'static>) -> Value<'a> {
    match v {
        Value::I8(x) => Value::I8(*x),
        Value::U8(x) => Value::U8(*x),
        Value::I16(x) => Value::I16(*x),
        Value::U16(x) => Value::U16(*x),
        Value::I32(x) => Value::I32(*x),
        Value::U32(x) => Value::U32(*x),
        Value::F32(x) => Value::F32(*x),
        Value::Array(_) => unreachable!("scalars only"),
    }
}

fn parse_args(sig: &Signature, raw: &[String]) -> Result<Vec<OwnedArg>> {
    if raw.len() != sig.params.len() {
        bail!(
            "{} takes {} arguments, got {}",
            sig.name,
            sig.params.len(),
            raw.len()
        );
    }
    sig.params
        .iter()
        .zip(raw)
        .enumerate()
        .map(|(i, (param, text))| {
            let parsed = match param.class {
                ParamClass::Value => {
                    let scalar = param.scalar.expect("value param has scalar");
                    OwnedArg::Scalar(parse_scalar(text, scalar).with_context(
                        || format!("argument {i} ({})", param.name),
                    )?)
                }
                ParamClass::Pointer => {
                    let Some(dtype) = param.scalar else {
                        bail!(
                            "argument {i} ({}): opaque pointer parameters \
                             cannot be passed from the command line",
                            param.name
                        );
                    };
                    OwnedArg::Array(parse_array(text, dtype).with_context(
                        || format!("argument {i} ({})", param.name),
                    )?)
                }
            };
            Ok(parsed)
        })
        .collect()
}

fn parse_scalar(text: &str, scalar: Scalar) -> Result<Value<'static>> {
    Ok(match scalar {
        Scalar::I8 => Value::I8(text.parse()?),
        Scalar::U8 => Value::U8(text.parse()?),
        Scalar::I16 => Value::I16(text.parse()?),
        Scalar::U16 => Value::U16(text.parse()?),
        Scalar::I32 => Value::I32(text.parse()?),
        Scalar::U32 => Value::U32(text.parse()?),
        Scalar::F32 => Value::F32(text.parse()?),
    })
}

fn parse_array(text: &str, dtype: Scalar) -> Result<ArrayArg> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .with_context(|| format!("expected an array like [1,2,3], got {text:?}"))?;
    let items: Vec<&str> = if inner.trim().is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(str::trim).collect()
    };

    macro_rules! collect {
        ($ty:ty, $ctor:ident) => {{
            let values = items
                .iter()
                .map(|s| s.parse::<$ty>().map_err(anyhow::Error::from))
                .collect::<Result<Vec<_>>>()?;
            ArrayArg::$ctor(&values)
        }};
    }

    Ok(match dtype {
        Scalar::I8 => collect!(i8, from_i8),
        Scalar::U8 => collect!(u8, from_u8),
        Scalar::I16 => collect!(i16, from_i16),
        Scalar::U16 => collect!(u16, from_u16),
        Scalar::I32 => collect!(i32, from_i32),
        Scalar::U32 => collect!(u32, from_u32),
        Scalar::F32 => collect!(f32, from_f32),
    })
}

fn describe(ret: &RetValue) -> String {
    match ret {
        RetValue::Void => "void".to_string(),
        RetValue::Pointer(p) => format!("{p:#010x}"),
        RetValue::I8(v) => format!("{v} (int8_t)"),
        RetValue::U8(v) => format!("{v} (uint8_t)"),
        RetValue::I16(v) => format!("{v} (int16_t)"),
        RetValue::U16(v) => format!("{v} (uint16_t)"),
        RetValue::I32(v) => format!("{v} (int32_t)"),
        RetValue::U32(v) => format!("{v} (uint32_t)"),
        RetValue::F32(v) => format!("{v} (float)"),
    }
}

fn describe_array(arr: &ArrayArg) -> String {
    match arr.dtype() {
        Scalar::I8 => format!("{:?}", arr.to_i8()),
        Scalar::U8 => format!("{:?}", arr.to_u8()),
        Scalar::I16 => format!("{:?}", arr.to_i16()),
        Scalar::U16 => format!("{:?}", arr.to_u16()),
        Scalar::I32 => format!("{:?}", arr.to_i32()),
        Scalar::U32 => format!("{:?}", arr.to_u32()),
        Scalar::F32 => format!("{:?}", arr.to_f32()),
    }
}
