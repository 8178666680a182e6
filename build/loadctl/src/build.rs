// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The position-specific build pipeline.
//!
//! One operation: turn an entry source and a function name into a raw
//! binary linked for a given base address, entered through the generated
//! wrapper, with firmware symbols optionally resolved at link time.
//!
//! The pipeline is deterministic by construction — same sources, same
//! addresses, same flags, byte-identical artifact — because the two-pass
//! load scheme relies on the probe artifact's size exactly predicting the
//! final one. Nothing here may introduce timestamps, random paths, or
//! unordered iteration into the toolchain's inputs.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::elf::{self, Section, SymbolInfo, SymbolKind};
use crate::linker;
use crate::sig::{self, SigError, Signature};
use crate::toolchain::{unresolved_symbols, ToolError, Toolchain};
use crate::wrapper;
use wire::ENTRY_NAME;

/// The distinct ways a build can fail. Wrapped in `anyhow` for
/// propagation; callers that care which kind occurred downcast.
#[derive(Debug)]
pub enum BuildError {
    MissingSource(PathBuf),
    /// The entry source's directory holds nothing compilable.
    NoSources(PathBuf),
    Signature(SigError),
    Tool(ToolError),
    UnresolvedSymbols(Vec<String>),
    TooLarge { size: usize, limit: u32 },
    /// The linked artifact lacks the entry shim.
    EntryMissing,
    /// Firmware bridging was requested but no usable firmware ELF exists.
    FirmwareMissing(Option<PathBuf>),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::MissingSource(p) => {
                write!(f, "entry source {} does not exist", p.display())
            }
            BuildError::NoSources(d) => {
                write!(f, "no compilable sources in {}", d.display())
            }
            BuildError::Signature(e) => write!(f, "signature: {e}"),
            BuildError::Tool(e) => write!(f, "{e}"),
            BuildError::UnresolvedSymbols(syms) => {
                write!(f, "unresolved symbols: {}", syms.join(", "))
            }
            BuildError::TooLarge { size, limit } => write!(
                f,
                "binary is {size} bytes, exceeding the {limit}-byte limit"
            ),
            BuildError::EntryMissing => {
                write!(f, "entry symbol `{ENTRY_NAME}` missing after link")
            }
            BuildError::FirmwareMissing(Some(p)) => write!(
                f,
                "firmware ELF {} does not exist",
                p.display()
            ),
            BuildError::FirmwareMissing(None) => write!(
                f,
                "symbol bridging requested but no firmware ELF is configured"
            ),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Signature(e) => Some(e),
            BuildError::Tool(e) => Some(e),
            _ => None,
        }
    }
}

/// Inputs to one build pass.
#[derive(Clone, Debug)]
pub struct BuildRequest<'a> {
    pub entry_source: &'a Path,
    pub function: &'a str,
    /// Link base; must meet the platform's instruction-fetch alignment.
    pub base_address: u32,
    /// Address the wrapper aliases as the argument frame.
    pub args_address: u32,
    /// Optimization override; the config default when `None`.
    pub optimization: Option<&'a str>,
    pub resolve_against_firmware: bool,
}

/// A linked, extracted, padded binary plus everything the loader and
/// marshaller need to use it.
#[derive(Clone, Debug)]
pub struct Artifact {
    /// Raw upload bytes: code, data, BSS zeros, alignment padding.
    pub image: Vec<u8>,
    pub base: u32,
    pub entry: u32,
    pub sections: BTreeMap<String, Section>,
    pub symbols: BTreeMap<String, SymbolInfo>,
    pub signature: Signature,
    pub args_address: u32,
    /// The linked ELF, retained in the scratch dir for listings.
    pub elf_path: PathBuf,
}

impl Artifact {
    /// nm-style listing of the artifact's symbols, ascending by address.
    pub fn symbol_listing(&self) -> String {
        let mut rows: Vec<_> = self.symbols.iter().collect();
        rows.sort_by_key(|(_, s)| s.addr);
        let mut out = String::new();
        for (name, s) in rows {
            let kind = match s.kind {
                SymbolKind::Function => 'T',
                SymbolKind::Object => 'D',
            };
            writeln!(out, "{:08x} {kind} {name}", s.addr).unwrap();
        }
        out
    }
}

pub struct Builder<'a> {
    config: &'a Config,
    toolchain: Toolchain,
    scratch: PathBuf,
}

impl<'a> Builder<'a> {
    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn new(config: &'a Config) -> Result<Self> {
        let scratch = match &config.build.scratch_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir()
                .join(format!("loadctl-{}", std::process::id())),
        };
        fs::create_dir_all(&scratch).with_context(|| {
            format!("creating scratch directory {}", scratch.display())
        })?;
        Ok(Self {
            config,
            toolchain: Toolchain::new(&config.toolchain),
            scratch,
        })
    }

    /// Where generated inputs and outputs for this build pass land. Kept
    /// after the build for post-mortem.
    fn stage_dir(&self, req: &BuildRequest<'_>) -> PathBuf {
        self.scratch
            .join(format!("{}-{:08x}", req.function, req.base_address))
    }

    /// Runs the whole pipeline for one pass.
    pub fn build(&self, req: &BuildRequest<'_>) -> Result<Artifact> {
        if !req.entry_source.is_file() {
            return Err(
                BuildError::MissingSource(req.entry_source.to_path_buf()).into()
            );
        }
        let src_dir = req
            .entry_source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        let sources = discover_sources(src_dir, &self.toolchain)?;

        let entry_text = fs::read_to_string(req.entry_source)
            .with_context(|| {
                format!("reading {}", req.entry_source.display())
            })?;
        let signature = sig::parse_signature(&entry_text, req.function)
            .map_err(BuildError::Signature)?;

        let stage = self.stage_dir(req);
        fs::create_dir_all(&stage)?;

        fs::write(
            stage.join(wrapper::DECL_HEADER),
            wrapper::declaration_header(&signature),
        )?;
        let wrapper_path = stage.join("wrapper.c");
        fs::write(
            &wrapper_path,
            wrapper::wrapper_source(&signature, req.args_address),
        )?;
        let script_path = stage.join("link.ld");
        fs::write(
            &script_path,
            linker::link_script(
                req.base_address,
                self.config.build.max_binary_size,
            ),
        )?;

        let opt = req
            .optimization
            .unwrap_or(&self.config.build.optimization);

        let mut objects = Vec::new();
        for (i, src) in
            sources.iter().chain(std::iter::once(&wrapper_path)).enumerate()
        {
            let stem = src
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unit");
            let object = stage.join(format!("{i:02}_{stem}.o"));
            self.compile_unit(src, &object, src_dir, &stage, opt)
                .with_context(|| format!("compiling {}", src.display()))?;
            objects.push(object);
        }

        let elf_path = stage.join("image.elf");
        self.link(req, &script_path, &objects, &elf_path, opt)?;

        let raw = fs::read(&elf_path)
            .with_context(|| format!("reading {}", elf_path.display()))?;
        let elf_file = elf::parse(&raw)?;
        let sections = elf::section_table(&elf_file);
        let symbols = elf::symbol_table(&elf_file);

        let mut image = elf::extract_image(&elf_file, &raw, req.base_address)?;
        let bss = sections
            .get(".bss")
            .filter(|s| !s.progbits)
            .map(|s| s.size)
            .unwrap_or(0);
        elf::pad_image(&mut image, bss);

        let entry = symbols
            .get(ENTRY_NAME)
            .ok_or(BuildError::EntryMissing)?
            .addr;

        let artifact = Artifact {
            image,
            base: req.base_address,
            entry,
            sections,
            symbols,
            signature,
            args_address: req.args_address,
            elf_path,
        };
        self.validate(&artifact)?;
        Ok(artifact)
    }

    fn compile_unit(
        &self,
        src: &Path,
        object: &Path,
        src_dir: &Path,
        stage: &Path,
        opt: &str,
    ) -> Result<()> {
        let cc = self
            .toolchain
            .compiler_for(src)
            .with_context(|| format!("no compiler for {}", src.display()))?;
        let b = &self.config.build;

        let mut cmd = Command::new(cc);
        cmd.arg(format!("-march={}", b.march))
            .arg(format!("-mabi={}", b.mabi))
            .args([
                "-ffreestanding",
                "-fno-builtin",
                "-ffunction-sections",
                "-fdata-sections",
                "-flto",
            ])
            .arg(opt)
            .arg("-I")
            .arg(src_dir)
            .arg("-I")
            .arg(stage)
            .args(&b.common_flags)
            .args(&b.compile_flags)
            .arg("-c")
            .arg(src)
            .arg("-o")
            .arg(object);

        self.toolchain.run(cmd).map_err(BuildError::Tool)?;
        Ok(())
    }

    fn link(
        &self,
        req: &BuildRequest<'_>,
        script: &Path,
        objects: &[PathBuf],
        out: &Path,
        opt: &str,
    ) -> Result<()> {
        let b = &self.config.build;
        let mut cmd = Command::new(self.toolchain.link_driver());
        cmd.arg(format!("-march={}", b.march))
            .arg(format!("-mabi={}", b.mabi))
            .args(["-nostdlib", "-nostartfiles", "-flto"])
            .arg(opt)
            .arg("-Wl,--gc-sections")
            .arg(format!("-Wl,-T,{}", script.display()));

        if req.resolve_against_firmware {
            // Not dynamic linking: the linker reads the firmware artifact
            // for symbol addresses only and inlines them as absolutes.
            let fw = self
                .config
                .build
                .firmware_elf
                .as_ref()
                .ok_or(BuildError::FirmwareMissing(None))?;
            if !fw.is_file() {
                return Err(
                    BuildError::FirmwareMissing(Some(fw.clone())).into()
                );
            }
            cmd.arg(format!("-Wl,--just-symbols={}", fw.display()));
        }

        cmd.args(&b.common_flags)
            .args(&b.link_flags)
            .args(objects)
            .arg("-o")
            .arg(out);

        if let Err(e) = self.toolchain.run(cmd) {
            let symbols = unresolved_symbols(&e.stderr);
            let err = if symbols.is_empty() {
                BuildError::Tool(e)
            } else {
                BuildError::UnresolvedSymbols(symbols)
            };
            return Err(err).context("linking");
        }
        Ok(())
    }

    fn validate(&self, artifact: &Artifact) -> Result<()> {
        let limit = self.config.build.max_binary_size;
        if artifact.image.len() > limit as usize {
            return Err(BuildError::TooLarge {
                size: artifact.image.len(),
                limit,
            }
            .into());
        }
        for (name, s) in &artifact.sections {
            if s.size > 0 && s.addr < artifact.base {
                bail!(
                    "section {name} at {:#010x} lies below the base {:#010x}",
                    s.addr,
                    artifact.base
                );
            }
        }
        if let Some(text) = artifact.sections.get(".text") {
            let inside = artifact.entry >= text.addr
                && artifact.entry < text.addr + text.size;
            if !inside {
                bail!(
                    "entry {:#010x} lies outside .text ({:#010x}+{:#x})",
                    artifact.entry,
                    text.addr,
                    text.size
                );
            }
        }
        Ok(())
    }

    /// Disassembly listing of the linked artifact, via the configured
    /// objdump.
    pub fn disassemble(&self, artifact: &Artifact) -> Result<String> {
        let mut cmd = Command::new(self.toolchain.objdump());
        cmd.arg("-d").arg(&artifact.elf_path);
        let stdout = self.toolchain.run(cmd).map_err(BuildError::Tool)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// Enumerates the compilable files next to the entry source, sorted
/// lexicographically so every pass sees the same list in the same order.
fn discover_sources(dir: &Path, toolchain: &Toolchain) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if toolchain.extensions().any(|known| known == ext) {
            sources.push(path);
        }
    }
    sources.sort();
    if sources.is_empty() {
        return Err(BuildError::NoSources(dir.to_path_buf()).into());
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn test_config() -> Config {
        toml::from_str(indoc! {r#"
            [toolchain]
            prefix = "riscv32-esp-elf-"

            [build]
            march = "rv32imafc_zicsr_zifencei"
            mabi = "ilp32f"
        "#})
        .unwrap()
    }

    /// Disposable directory under the system temp dir; removed on drop.
    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "loadctl-test-{tag}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn file(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.0.join(name);
            fs::write(&path, contents).unwrap();
            path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn sources_are_discovered_sorted_and_filtered() {
        let dir = TempDir::new("discover");
        dir.file("zeta.c", "");
        dir.file("alpha.c", "");
        dir.file("mid.cpp", "");
        dir.file("notes.txt", "");
        dir.file("asm.S", "");
        fs::create_dir(dir.0.join("subdir.c")).unwrap();

        let config = test_config();
        let toolchain = Toolchain::new(&config.toolchain);
        let sources = discover_sources(&dir.0, &toolchain).unwrap();
        let names: Vec<_> = sources
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha.c", "asm.S", "mid.cpp", "zeta.c"]);
    }

    #[test]
    fn empty_directory_is_a_distinct_error() {
        let dir = TempDir::new("empty");
        dir.file("README.md", "");

        let config = test_config();
        let toolchain = Toolchain::new(&config.toolchain);
        let err = discover_sources(&dir.0, &toolchain).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NoSources(_))
        ));
    }

    #[test]
    fn missing_entry_source_is_a_distinct_error() {
        let config = test_config();
        let builder = Builder::new(&config).unwrap();
        let req = BuildRequest {
            entry_source: Path::new("/does/not/exist.c"),
            function: "f",
            base_address: 0x4800_0000,
            args_address: 0x4801_0000,
            optimization: None,
            resolve_against_firmware: false,
        };
        let err = builder.build(&req).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingSource(_))
        ));
    }

    #[test]
    fn unparseable_signature_is_a_distinct_error() {
        let dir = TempDir::new("badsig");
        let entry = dir.file("routine.c", "int f(matrix_t m) { return 0; }");

        let config = test_config();
        let builder = Builder::new(&config).unwrap();
        let req = BuildRequest {
            entry_source: &entry,
            function: "f",
            base_address: 0x4800_0000,
            args_address: 0x4801_0000,
            optimization: None,
            resolve_against_firmware: false,
        };
        let err = builder.build(&req).unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::Signature(SigError::UnknownType(ty))) => {
                assert_eq!(ty, "matrix_t");
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn symbol_listing_is_sorted_by_address() {
        let mut symbols = BTreeMap::new();
        symbols.insert(
            "zzz_data".to_string(),
            SymbolInfo {
                addr: 0x4800_0100,
                size: 4,
                kind: SymbolKind::Object,
            },
        );
        symbols.insert(
            ENTRY_NAME.to_string(),
            SymbolInfo {
                addr: 0x4800_0000,
                size: 32,
                kind: SymbolKind::Function,
            },
        );
        let artifact = Artifact {
            image: vec![],
            base: 0x4800_0000,
            entry: 0x4800_0000,
            sections: BTreeMap::new(),
            symbols,
            signature: crate::sig::parse_signature(
                "int f(void) { return 0; }",
                "f",
            )
            .unwrap(),
            args_address: 0,
            elf_path: PathBuf::new(),
        };
        let listing = artifact.symbol_listing();
        let lines: Vec<_> = listing.lines().collect();
        assert_eq!(lines[0], "48000000 T call_remote");
        assert_eq!(lines[1], "48000100 D zzz_data");
    }

    #[test]
    fn build_error_kinds_render_usefully() {
        let cases: Vec<(BuildError, &str)> = vec![
            (
                BuildError::TooLarge { size: 200_000, limit: 131_072 },
                "exceeding",
            ),
            (BuildError::EntryMissing, "call_remote"),
            (BuildError::FirmwareMissing(None), "no firmware ELF"),
            (
                BuildError::UnresolvedSymbols(vec!["printf".into()]),
                "printf",
            ),
        ];
        for (err, needle) in cases {
            let text = err.to_string();
            assert!(text.contains(needle), "{text:?} missing {needle:?}");
        }
    }
}
