// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Linker script generation.
//!
//! Every build gets a script describing one read-write-execute region at
//! the chosen base address. The entry shim's section is placed first so
//! the entry point coincides with the base of the region, then the rest of
//! text, read-only data, data, and BSS, each 4-byte aligned. Debug,
//! comment, and unwind sections are discarded — nothing reads them out of
//! a raw RAM image.

use std::fmt::Write;

use wire::ENTRY_NAME;

/// Renders the script for a region of `max_size` bytes at `base`.
pub fn link_script(base: u32, max_size: u32) -> String {
    let mut out = String::new();

    writeln!(out, "ENTRY({ENTRY_NAME})").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "MEMORY").unwrap();
    writeln!(out, "{{").unwrap();
    writeln!(
        out,
        "    LOADRAM (rwx) : ORIGIN = {base:#010x}, LENGTH = {max_size:#x}"
    )
    .unwrap();
    writeln!(out, "}}").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "SECTIONS").unwrap();
    writeln!(out, "{{").unwrap();
    writeln!(out, "    .text : ALIGN(4) {{").unwrap();
    // The shim must land at the base so entry == base regardless of what
    // else gets linked in.
    writeln!(out, "        KEEP(*(.text.{ENTRY_NAME}))").unwrap();
    writeln!(out, "        *(.text .text.*)").unwrap();
    writeln!(out, "        *(.literal .literal.*)").unwrap();
    writeln!(out, "    }} > LOADRAM").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "    .rodata : ALIGN(4) {{").unwrap();
    writeln!(out, "        *(.rodata .rodata.*)").unwrap();
    writeln!(out, "        *(.srodata .srodata.*)").unwrap();
    writeln!(out, "    }} > LOADRAM").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "    .data : ALIGN(4) {{").unwrap();
    writeln!(out, "        *(.data .data.*)").unwrap();
    writeln!(out, "        *(.sdata .sdata.*)").unwrap();
    writeln!(out, "    }} > LOADRAM").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "    .bss : ALIGN(4) {{").unwrap();
    writeln!(out, "        __bss_start = .;").unwrap();
    writeln!(out, "        *(.bss .bss.*)").unwrap();
    writeln!(out, "        *(.sbss .sbss.*)").unwrap();
    writeln!(out, "        *(COMMON)").unwrap();
    writeln!(out, "        . = ALIGN(4);").unwrap();
    writeln!(out, "        __bss_end = .;").unwrap();
    writeln!(out, "    }} > LOADRAM").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "    __binary_end = .;").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "    /DISCARD/ : {{").unwrap();
    writeln!(out, "        *(.comment)").unwrap();
    writeln!(out, "        *(.note .note.*)").unwrap();
    writeln!(out, "        *(.eh_frame .eh_frame_hdr)").unwrap();
    writeln!(out, "        *(.riscv.attributes)").unwrap();
    writeln!(out, "        *(.debug_*)").unwrap();
    writeln!(out, "    }}").unwrap();
    writeln!(out, "}}").unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_places_the_shim_first() {
        let script = link_script(0x4800_1000, 0x2_0000);
        let shim = script.find("KEEP(*(.text.call_remote))").unwrap();
        let rest = script.find("*(.text .text.*)").unwrap();
        assert!(shim < rest, "shim section must precede the rest of .text");
    }

    #[test]
    fn script_substitutes_base_and_length() {
        let script = link_script(0x4800_1000, 0x2_0000);
        assert!(script.contains("ORIGIN = 0x48001000"));
        assert!(script.contains("LENGTH = 0x20000"));
        assert!(script.starts_with("ENTRY(call_remote)"));
    }

    #[test]
    fn script_exports_the_boundary_symbols() {
        let script = link_script(0, 0x1000);
        for sym in ["__bss_start", "__bss_end", "__binary_end"] {
            assert!(script.contains(sym), "{sym} missing");
        }
    }

    #[test]
    fn identical_inputs_render_identically() {
        assert_eq!(link_script(0x100, 0x200), link_script(0x100, 0x200));
    }
}
