// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `loader.toml` configuration surface.
//!
//! One file declares everything environment-specific: where the
//! cross-toolchain lives, which compiler handles which extension, the
//! target ISA/ABI strings, per-stage flag lists, the firmware ELF used for
//! symbol bridging, and the transport settings. Everything else (the wire
//! protocol, the argument frame, the entry symbol) is fixed ABI and not
//! configurable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub toolchain: ToolchainConfig,
    pub build: BuildConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ToolchainConfig {
    /// Tool name prefix, e.g. `riscv32-esp-elf-`.
    pub prefix: String,
    /// Directory holding the tools; resolved via `PATH` when absent.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    /// Compiler selection by source extension.
    #[serde(default = "default_compilers")]
    pub compilers: IndexMap<String, String>,
    /// Link driver. The compiler driver, so LTO works across the link.
    #[serde(default = "default_linker")]
    pub linker: String,
    /// Disassembler for listings; section, symbol, and raw-image
    /// extraction go through an ELF parser instead of binutils.
    #[serde(default = "default_objdump")]
    pub objdump: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildConfig {
    /// Target ISA string, e.g. `rv32imafc_zicsr_zifencei`.
    pub march: String,
    /// Target ABI string, e.g. `ilp32f`.
    pub mabi: String,
    /// Default optimization level for both passes.
    #[serde(default = "default_optimization")]
    pub optimization: String,
    /// Extra flags appended to every compile and link invocation.
    #[serde(default)]
    pub common_flags: Vec<String>,
    /// Extra flags for the compile stage only.
    #[serde(default)]
    pub compile_flags: Vec<String>,
    /// Extra flags for the link stage only.
    #[serde(default)]
    pub link_flags: Vec<String>,
    /// The firmware's linked ELF, read for symbol resolution only when a
    /// build asks to bridge against firmware services.
    #[serde(default)]
    pub firmware_elf: Option<PathBuf>,
    /// Hard cap on the padded binary, and the LENGTH of the linker
    /// script's memory region.
    #[serde(default = "default_max_binary_size")]
    pub max_binary_size: u32,
    /// Code-region alignment requested from the device allocator; must
    /// cover the platform's instruction-fetch alignment.
    #[serde(default = "default_alignment")]
    pub alignment: u32,
    /// Where generated wrappers, linker scripts, objects, and ELFs land.
    /// Kept after the build for post-mortem. Defaults to a per-process
    /// directory under the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TransportConfig {
    /// Serial device path.
    #[serde(default = "default_port")]
    pub port: PathBuf,
    /// Host-side read timeout; expiry tears down the session.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_compilers() -> IndexMap<String, String> {
    let mut m = IndexMap::new();
    m.insert("c".to_string(), "gcc".to_string());
    m.insert("cc".to_string(), "g++".to_string());
    m.insert("cpp".to_string(), "g++".to_string());
    m.insert("S".to_string(), "gcc".to_string());
    m
}

fn default_linker() -> String {
    "gcc".to_string()
}

fn default_objdump() -> String {
    "objdump".to_string()
}

fn default_optimization() -> String {
    "-O3".to_string()
}

fn default_max_binary_size() -> u32 {
    128 * 1024
}

fn default_alignment() -> u32 {
    16
}

fn default_port() -> PathBuf {
    PathBuf::from("/dev/ttyACM0")
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.build.alignment.is_power_of_two(),
            "alignment {:#x} is not a power of two",
            self.build.alignment
        );
        anyhow::ensure!(
            self.build.max_binary_size % 4 == 0,
            "max-binary-size {:#x} is not 4-byte aligned",
            self.build.max_binary_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn minimal() -> &'static str {
        indoc! {r#"
            [toolchain]
            prefix = "riscv32-esp-elf-"

            [build]
            march = "rv32imafc_zicsr_zifencei"
            mabi = "ilp32f"
        "#}
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(minimal()).unwrap();
        assert_eq!(config.toolchain.prefix, "riscv32-esp-elf-");
        assert_eq!(config.toolchain.compilers["c"], "gcc");
        assert_eq!(config.toolchain.compilers["cpp"], "g++");
        assert_eq!(config.toolchain.linker, "gcc");
        assert_eq!(config.build.optimization, "-O3");
        assert_eq!(config.build.max_binary_size, 128 * 1024);
        assert_eq!(config.build.alignment, 16);
        assert!(config.build.firmware_elf.is_none());
        assert_eq!(config.transport.timeout_ms, 5000);
    }

    #[test]
    fn full_config_round_trips() {
        let text = indoc! {r#"
            [toolchain]
            prefix = "riscv32-esp-elf-"
            bin-dir = "/opt/xtools/bin"
            linker = "gcc"
            compilers = { c = "gcc", cpp = "g++" }

            [build]
            march = "rv32imafc_zicsr_zifencei"
            mabi = "ilp32f"
            optimization = "-O2"
            firmware-elf = "/fw/server.elf"
            max-binary-size = 0x10000
            alignment = 64
            link-flags = ["-Wl,--no-warn-rwx-segments"]

            [transport]
            port = "/dev/ttyUSB1"
            timeout-ms = 250
        "#};
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(
            config.toolchain.bin_dir.as_deref(),
            Some(Path::new("/opt/xtools/bin"))
        );
        assert_eq!(config.build.optimization, "-O2");
        assert_eq!(config.build.max_binary_size, 0x10000);
        assert_eq!(
            config.build.firmware_elf.as_deref(),
            Some(Path::new("/fw/server.elf"))
        );
        assert_eq!(config.transport.port, PathBuf::from("/dev/ttyUSB1"));
        assert_eq!(config.transport.timeout_ms, 250);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!("{}\nbogus-key = 1\n", minimal());
        assert!(toml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let text = minimal().replace("mabi = \"ilp32f\"", "mabi = \"ilp32f\"\nalignment = 24");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }
}
