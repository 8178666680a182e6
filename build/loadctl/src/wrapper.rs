// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry shim generation.
//!
//! The host can't set the target's CPU registers, so every loaded function
//! gets a generated companion: `call_remote`, a no-argument function that
//! reads each argument out of its slot in the shared frame, calls the
//! target with the platform calling convention, and stores the result to
//! the last slot. The compiler emits the register moves; all we emit is C.
//!
//! The frame alias is `volatile` so reads and writes can't be elided or
//! reordered across the call. Slot loads reinterpret rather than convert:
//! a float argument's bit pattern crosses untouched, and narrow integers
//! are stored through their declared type so the call site sees correct
//! sign extension.

use std::fmt::Write;

use crate::sig::{ParamClass, RetKind, Signature};
use wire::{ARG_SLOTS, ENTRY_NAME, RETURN_SLOT};

/// Name of the generated declaration header, included by the wrapper.
pub const DECL_HEADER: &str = "remote_decl.h";

/// Fixed-width typedefs prepended to everything we generate, so the
/// declaration compiles without the target's libc headers. These are also
/// the parser's type vocabulary: a signature type not expressible here is
/// rejected at parse time.
const TYPEDEF_PREAMBLE: &str = "\
typedef signed char int8_t;
typedef unsigned char uint8_t;
typedef short int16_t;
typedef unsigned short uint16_t;
typedef int int32_t;
typedef unsigned int uint32_t;
typedef long long int64_t;
typedef unsigned long long uint64_t;
typedef unsigned int size_t;
typedef unsigned int uintptr_t;
typedef int intptr_t;
typedef int ptrdiff_t;
";

/// A parameter name that would collide with the wrapper's own locals.
fn local_name(name: &str) -> String {
    match name {
        "io" | "result" => format!("{name}_arg"),
        _ => name.to_string(),
    }
}

/// The extern declaration of the target function, in canonical types.
fn declaration(sig: &Signature) -> String {
    let params = if sig.params.is_empty() {
        "void".to_string()
    } else {
        sig.params
            .iter()
            .map(|p| match p.class {
                ParamClass::Pointer => format!("{}{}", p.text, local_name(&p.name)),
                ParamClass::Value => format!("{} {}", p.text, local_name(&p.name)),
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    let sep = if sig.ret_text.ends_with('*') { "" } else { " " };
    format!("{}{sep}{}({params});", sig.ret_text, sig.name)
}

/// Generates the declaration header the wrapper compiles against.
pub fn declaration_header(sig: &Signature) -> String {
    let mut out = String::new();
    writeln!(out, "#ifndef REMOTE_DECL_H").unwrap();
    writeln!(out, "#define REMOTE_DECL_H").unwrap();
    writeln!(out).unwrap();
    out.push_str(TYPEDEF_PREAMBLE);
    writeln!(out).unwrap();
    writeln!(out, "{}", declaration(sig)).unwrap();
    writeln!(out).unwrap();
    writeln!(out, "#endif").unwrap();
    out
}

/// Generates the wrapper translation unit for a frame at `args_address`.
pub fn wrapper_source(sig: &Signature, args_address: u32) -> String {
    let mut out = String::new();
    writeln!(out, "#include \"{DECL_HEADER}\"").unwrap();
    writeln!(out).unwrap();
    writeln!(
        out,
        "/* {ARG_SLOTS} argument slots; slot {RETURN_SLOT} is the return value. */"
    )
    .unwrap();
    writeln!(
        out,
        "static volatile uint32_t * const io = (volatile uint32_t *) {args_address:#010x}u;"
    )
    .unwrap();
    writeln!(out).unwrap();
    writeln!(out, "int {ENTRY_NAME}(void)").unwrap();
    writeln!(out, "{{").unwrap();

    for (i, p) in sig.params.iter().enumerate() {
        let name = local_name(&p.name);
        match p.class {
            ParamClass::Pointer => {
                // The slot holds the device address; the bit pattern is the
                // pointer.
                writeln!(out, "    {}{name} = ({}) io[{i}];", p.text, p.text.trim_end())
                    .unwrap();
            }
            ParamClass::Value => {
                writeln!(
                    out,
                    "    {} {name} = *({} *)&io[{i}];",
                    p.text, p.text
                )
                .unwrap();
            }
        }
    }

    let args = sig
        .params
        .iter()
        .map(|p| local_name(&p.name))
        .collect::<Vec<_>>()
        .join(", ");

    match sig.ret {
        RetKind::Void => {
            writeln!(out, "    {}({args});", sig.name).unwrap();
        }
        _ => {
            let sep = if sig.ret_text.ends_with('*') { "" } else { " " };
            writeln!(
                out,
                "    {}{sep}result = {}({args});",
                sig.ret_text, sig.name
            )
            .unwrap();
        }
    }

    match sig.ret {
        RetKind::Void => {}
        RetKind::Pointer => {
            writeln!(out, "    io[{RETURN_SLOT}] = (uint32_t) result;").unwrap();
        }
        RetKind::Scalar(s) => {
            writeln!(
                out,
                "    *({} *)&io[{RETURN_SLOT}] = result;",
                s.c_name()
            )
            .unwrap();
        }
        RetKind::Double => {
            // Documented lossy: the frame slot is 32 bits.
            writeln!(
                out,
                "    *(float *)&io[{RETURN_SLOT}] = (float) result;"
            )
            .unwrap();
        }
    }

    writeln!(out, "    return 0;").unwrap();
    writeln!(out, "}}").unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::parse_signature;
    use indoc::indoc;

    #[test]
    fn add_wrapper_is_exact() {
        let sig =
            parse_signature("int add(int a, int b) { return a + b; }", "add")
                .unwrap();
        let expected = indoc! {r#"
            #include "remote_decl.h"

            /* 32 argument slots; slot 31 is the return value. */
            static volatile uint32_t * const io = (volatile uint32_t *) 0x3fc80000u;

            int call_remote(void)
            {
                int32_t a = *(int32_t *)&io[0];
                int32_t b = *(int32_t *)&io[1];
                int32_t result = add(a, b);
                *(int32_t *)&io[31] = result;
                return 0;
            }
        "#};
        assert_eq!(wrapper_source(&sig, 0x3FC8_0000), expected);
    }

    #[test]
    fn pointer_and_float_arguments() {
        let sig = parse_signature(
            "void scale(float* data, int n, float factor) { }",
            "scale",
        )
        .unwrap();
        let src = wrapper_source(&sig, 0x3FC8_0000);
        assert!(src.contains("float *data = (float *) io[0];"));
        assert!(src.contains("int32_t n = *(int32_t *)&io[1];"));
        assert!(src.contains("float factor = *(float *)&io[2];"));
        // Void return: a bare call and no slot-31 store.
        assert!(src.contains("    scale(data, n, factor);"));
        assert!(!src.contains("io[31]"));
    }

    #[test]
    fn narrow_integers_reinterpret_through_their_type() {
        let sig = parse_signature(
            "short clip(short v, unsigned char limit) { return v; }",
            "clip",
        )
        .unwrap();
        let src = wrapper_source(&sig, 0x1000_0000);
        assert!(src.contains("int16_t v = *(int16_t *)&io[0];"));
        assert!(src.contains("uint8_t limit = *(uint8_t *)&io[1];"));
        assert!(src.contains("*(int16_t *)&io[31] = result;"));
    }

    #[test]
    fn double_return_truncates_to_float() {
        let sig = parse_signature(
            "double mean(float *x, int n) { return 0; }",
            "mean",
        )
        .unwrap();
        let src = wrapper_source(&sig, 0x1000_0000);
        assert!(src.contains("double result = mean(x, n);"));
        assert!(src.contains("*(float *)&io[31] = (float) result;"));
    }

    #[test]
    fn pointer_return_stores_the_address() {
        let sig =
            parse_signature("float *head(float *x) { return x; }", "head")
                .unwrap();
        let src = wrapper_source(&sig, 0x1000_0000);
        assert!(src.contains("float *result = head(x);"));
        assert!(src.contains("io[31] = (uint32_t) result;"));
    }

    #[test]
    fn header_declares_with_canonical_types() {
        let sig = parse_signature(
            "unsigned short crc(const uint8_t *p, int n) { return 0; }",
            "crc",
        )
        .unwrap();
        let header = declaration_header(&sig);
        assert!(header.contains("typedef unsigned int uint32_t;"));
        assert!(header.contains("uint16_t crc(uint8_t *p, int32_t n);"));
        assert!(header.starts_with("#ifndef REMOTE_DECL_H"));
    }

    #[test]
    fn colliding_names_are_renamed() {
        let sig = parse_signature(
            "int probe(int io, int result) { return io + result; }",
            "probe",
        )
        .unwrap();
        let src = wrapper_source(&sig, 0x1000_0000);
        assert!(src.contains("int32_t io_arg = *(int32_t *)&io[0];"));
        assert!(src.contains("int32_t result_arg = *(int32_t *)&io[1];"));
        assert!(src.contains("probe(io_arg, result_arg);"));
    }

    #[test]
    fn no_arg_function() {
        let sig =
            parse_signature("uint32_t ticks(void) { return 7; }", "ticks")
                .unwrap();
        let src = wrapper_source(&sig, 0x2000_0000);
        assert!(src.contains("uint32_t result = ticks();"));
        let header = declaration_header(&sig);
        assert!(header.contains("uint32_t ticks(void);"));
    }
}
