// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ELF inspection and raw-image extraction.
//!
//! The linked artifact is position-specific, so extraction is flattening:
//! loadable segment bytes are laid out at `paddr - base` in a contiguous
//! image, gaps zero-filled, then padded to cover BSS and 4-byte alignment.
//! The padded length is the transport upload size.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use goblin::elf::Elf;

/// Sections worth keeping in the artifact's table.
pub const KEPT_SECTIONS: &[&str] = &[".text", ".rodata", ".data", ".bss"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub addr: u32,
    pub size: u32,
    /// True for sections with file-backed contents, false for zero-filled
    /// ones (`.bss`).
    pub progbits: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub addr: u32,
    pub size: u32,
    pub kind: SymbolKind,
}

/// Parses an ELF, checking it's the little-endian 32-bit RISC-V artifact
/// we expect before anything trusts its addresses.
pub fn parse(raw: &[u8]) -> Result<Elf<'_>> {
    use goblin::container::Container;
    use goblin::elf::header::EM_RISCV;

    let elf = Elf::parse(raw)?;
    if elf.header.container()? != Container::Little || !elf.little_endian {
        bail!("linked artifact is not little-endian 32-bit");
    }
    if elf.header.e_machine != EM_RISCV {
        bail!(
            "linked artifact is for machine {:#x}, not RISC-V",
            elf.header.e_machine
        );
    }
    Ok(elf)
}

/// The `.text`/`.rodata`/`.data`/`.bss` entries of the section header
/// table.
pub fn section_table(elf: &Elf<'_>) -> BTreeMap<String, Section> {
    use goblin::elf::section_header::SHT_PROGBITS;

    let mut table = BTreeMap::new();
    for sh in &elf.section_headers {
        let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) else {
            continue;
        };
        if !KEPT_SECTIONS.contains(&name) {
            continue;
        }
        table.insert(
            name.to_string(),
            Section {
                addr: sh.sh_addr as u32,
                size: sh.sh_size as u32,
                progbits: sh.sh_type == SHT_PROGBITS,
            },
        );
    }
    table
}

/// Function and data symbols, by name.
pub fn symbol_table(elf: &Elf<'_>) -> BTreeMap<String, SymbolInfo> {
    use goblin::elf::sym::{STT_FUNC, STT_OBJECT};

    let mut table = BTreeMap::new();
    for sym in elf.syms.iter() {
        let kind = match sym.st_type() {
            STT_FUNC => SymbolKind::Function,
            STT_OBJECT => SymbolKind::Object,
            _ => continue,
        };
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        table.insert(
            name.to_string(),
            SymbolInfo {
                addr: sym.st_value as u32,
                size: sym.st_size as u32,
                kind,
            },
        );
    }
    table
}

/// Flattens the loadable segments into one contiguous byte image based at
/// `base`, ordered by ascending address, gaps zero-filled.
pub fn extract_image(elf: &Elf<'_>, raw: &[u8], base: u32) -> Result<Vec<u8>> {
    use goblin::elf::program_header::PT_LOAD;

    let mut segments: Vec<_> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        .collect();
    // Physical (load) addresses, as for any image destined for raw memory.
    segments.sort_by_key(|ph| ph.p_paddr);

    let mut image = Vec::new();
    for ph in segments {
        let addr = ph.p_paddr as u32;
        if addr < base {
            bail!(
                "segment at {:#010x} lies below the link base {:#010x}",
                addr,
                base
            );
        }
        let offset = (addr - base) as usize;
        if offset < image.len() {
            bail!("segment at {:#010x} overlaps an earlier segment", addr);
        }
        image.resize(offset, 0);

        let start = ph.p_offset as usize;
        let len = ph.p_filesz as usize;
        if start + len > raw.len() {
            bail!("segment at {:#010x} runs past the end of the file", addr);
        }
        image.extend_from_slice(&raw[start..start + len]);
    }
    Ok(image)
}

/// Appends the zero padding the upload needs: BSS coverage first, then
/// out to a 4-byte boundary.
pub fn pad_image(image: &mut Vec<u8>, bss_size: u32) {
    image.resize(image.len() + bss_size as usize, 0);
    while image.len() % 4 != 0 {
        image.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_covers_bss_then_aligns() {
        let mut image = vec![0xAA; 10];
        pad_image(&mut image, 7);
        assert_eq!(image.len(), 20);
        assert!(image[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn aligned_image_with_no_bss_is_untouched() {
        let mut image = vec![0x55; 16];
        pad_image(&mut image, 0);
        assert_eq!(image.len(), 16);
    }

    #[test]
    fn empty_image_stays_empty() {
        let mut image = Vec::new();
        pad_image(&mut image, 0);
        assert!(image.is_empty());
    }

    #[test]
    fn padding_is_deterministic() {
        let mut a = vec![1, 2, 3];
        let mut b = vec![1, 2, 3];
        pad_image(&mut a, 5);
        pad_image(&mut b, 5);
        assert_eq!(a, b);
        assert_eq!(a.len() % 4, 0);
    }
}
