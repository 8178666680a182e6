// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-toolchain invocation.
//!
//! Compilers, the link driver, and the binutils are opaque subprocesses:
//! we build argument lists, run them, and capture stderr. A nonzero exit
//! is a [`ToolError`] carrying the full stderr so the user sees exactly
//! what the toolchain said, without re-running anything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use indexmap::IndexMap;
use regex::Regex;

use crate::config::ToolchainConfig;

/// A toolchain subprocess failed.
#[derive(Clone, Debug)]
pub struct ToolError {
    pub tool: String,
    /// Exit code, or `None` if the tool couldn't be spawned or was killed.
    pub code: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => {
                write!(f, "{} exited with status {}", self.tool, code)?
            }
            None => write!(f, "failed to run {}", self.tool)?,
        }
        if !self.stderr.is_empty() {
            write!(f, ":\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolError {}

pub struct Toolchain {
    prefix: String,
    bin_dir: Option<PathBuf>,
    compilers: IndexMap<String, String>,
    linker: String,
    objdump: String,
}

impl Toolchain {
    pub fn new(config: &ToolchainConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            bin_dir: config.bin_dir.clone(),
            compilers: config.compilers.clone(),
            linker: config.linker.clone(),
            objdump: config.objdump.clone(),
        }
    }

    /// Full path (or bare name, for `PATH` resolution) of a prefixed tool.
    fn tool(&self, name: &str) -> PathBuf {
        let file = format!("{}{}", self.prefix, name);
        match &self.bin_dir {
            Some(dir) => dir.join(file),
            None => PathBuf::from(file),
        }
    }

    /// The compiler handling `path`, selected by extension.
    pub fn compiler_for(&self, path: &Path) -> Option<PathBuf> {
        let ext = path.extension()?.to_str()?;
        self.compilers.get(ext).map(|tool| self.tool(tool))
    }

    /// Extensions the toolchain can compile, in configuration order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.compilers.keys().map(|s| s.as_str())
    }

    pub fn link_driver(&self) -> PathBuf {
        self.tool(&self.linker)
    }

    pub fn objdump(&self) -> PathBuf {
        self.tool(&self.objdump)
    }

    /// Runs a prepared command, capturing output. Success returns stdout.
    pub fn run(&self, mut cmd: Command) -> Result<Vec<u8>, ToolError> {
        let tool = cmd.get_program().to_string_lossy().into_owned();
        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) => {
                return Err(ToolError {
                    tool,
                    code: None,
                    stderr: e.to_string(),
                })
            }
        };
        if !output.status.success() {
            return Err(ToolError {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }
}

/// Pulls undefined-symbol names out of linker stderr, covering the GNU ld
/// and lld spellings.
pub fn unresolved_symbols(stderr: &str) -> Vec<String> {
    let gnu = Regex::new(r"undefined reference to `([^']+)'").unwrap();
    let lld = Regex::new(r"undefined symbol: (\S+)").unwrap();

    let mut symbols: Vec<String> = gnu
        .captures_iter(stderr)
        .chain(lld.captures_iter(stderr))
        .map(|c| c[1].to_string())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use indoc::indoc;

    fn toolchain() -> Toolchain {
        let config: Config = toml::from_str(indoc! {r#"
            [toolchain]
            prefix = "riscv32-esp-elf-"
            bin-dir = "/opt/xtools/bin"

            [build]
            march = "rv32imafc"
            mabi = "ilp32f"
        "#})
        .unwrap();
        Toolchain::new(&config.toolchain)
    }

    #[test]
    fn tools_are_prefixed_and_rooted() {
        let tc = toolchain();
        assert_eq!(
            tc.link_driver(),
            PathBuf::from("/opt/xtools/bin/riscv32-esp-elf-gcc")
        );
        assert_eq!(
            tc.compiler_for(Path::new("/src/kernel.cpp")).unwrap(),
            PathBuf::from("/opt/xtools/bin/riscv32-esp-elf-g++")
        );
        assert!(tc.compiler_for(Path::new("/src/README.md")).is_none());
        assert!(tc.compiler_for(Path::new("/src/noext")).is_none());
    }

    #[test]
    fn unresolved_symbols_from_gnu_ld() {
        let stderr = indoc! {"
            /tmp/ccAbc.o: in function `call_remote':
            wrapper.c:(.text.call_remote+0x12): undefined reference to `vector_mac'
            wrapper.c:(.text.call_remote+0x20): undefined reference to `printf'
            collect2: error: ld returned 1 exit status
        "};
        assert_eq!(unresolved_symbols(stderr), vec!["printf", "vector_mac"]);
    }

    #[test]
    fn unresolved_symbols_from_lld() {
        let stderr = "ld.lld: error: undefined symbol: memcpy\n";
        assert_eq!(unresolved_symbols(stderr), vec!["memcpy"]);
    }

    #[test]
    fn clean_stderr_yields_nothing() {
        assert!(unresolved_symbols("warning: something benign\n").is_empty());
    }

    #[test]
    fn tool_error_display_carries_stderr() {
        let e = ToolError {
            tool: "riscv32-esp-elf-gcc".into(),
            code: Some(1),
            stderr: "fatal error: no input files\n".into(),
        };
        let text = e.to_string();
        assert!(text.contains("exited with status 1"));
        assert!(text.contains("no input files"));
    }
}
