use std::fmt;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
}

impl Arch {
    /// Maps a `uname -m` style machine string to a release architecture.
    pub fn from_machine(machine: &str) -> Result<Self> {
        let machine = machine.trim().to_ascii_lowercase();
        match machine.as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" | "armv8" | "armv8l" => Ok(Arch::Arm64),
            m if m.starts_with("armv7") || m == "arm" => Ok(Arch::Arm),
            other => Err(CoreError::config(format!(
                "unsupported architecture: {other}"
            ))),
        }
    }

    pub fn detect() -> Result<Self> {
        Self::from_machine(std::env::consts::ARCH)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        }
    }

    /// sing-box publishes its 32-bit ARM archive under `armv7`.
    pub fn engine_asset_name(&self) -> &'static str {
        match self {
            Arch::Arm => "armv7",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
