use anyhow::Result;
use std::fmt;
use std::str::FromStr;

use crate::error::AssemblyError;

/// Target platform of the cluster being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    BareMetal,
    VSphere,
    None,
    /// Boots a minimal ISO and skips the helper binaries.
    External,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::BareMetal => "baremetal",
            Platform::VSphere => "vsphere",
            Platform::None => "none",
            Platform::External => "external",
        }
    }

    pub fn is_external(self) -> bool {
        self == Platform::External
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baremetal" => Ok(Platform::BareMetal),
            "vsphere" => Ok(Platform::VSphere),
            "none" => Ok(Platform::None),
            "external" => Ok(Platform::External),
            other => Err(AssemblyError::Configuration(format!(
                "unsupported platform '{other}' (expected baremetal, vsphere, none or external)"
            ))
            .into()),
        }
    }
}
