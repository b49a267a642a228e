//! CPU architecture naming.
//!
//! Release payloads filter by Go-style names (`linux/amd64`) while CoreOS
//! artifacts and output files use RPM-style names (`x86_64`).

use anyhow::Result;
use std::fmt;
use std::str::FromStr;

use crate::error::AssemblyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Ppc64le,
    S390x,
}

impl Architecture {
    /// RPM-style name, e.g. `x86_64`.
    pub fn rpm_name(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
        }
    }

    /// Go-style name, e.g. `amd64`.
    pub fn go_name(self) -> &'static str {
        match self {
            Architecture::X86_64 => "amd64",
            Architecture::Aarch64 => "arm64",
            Architecture::Ppc64le => "ppc64le",
            Architecture::S390x => "s390x",
        }
    }

    /// Value for `--filter-by-os`.
    pub fn os_filter(self) -> String {
        format!("linux/{}", self.go_name())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rpm_name())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Aarch64),
            "ppc64le" => Ok(Architecture::Ppc64le),
            "s390x" => Ok(Architecture::S390x),
            other => Err(AssemblyError::Configuration(format!(
                "unsupported architecture '{other}'"
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_aliases_parse() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("ARM64".parse::<Architecture>().unwrap(), Architecture::Aarch64);
        assert_eq!(Architecture::Aarch64.os_filter(), "linux/arm64");
        assert_eq!(Architecture::X86_64.to_string(), "x86_64");
    }

    #[test]
    fn unknown_arch_is_a_configuration_error() {
        let err = "riscv64".parse::<Architecture>().unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::Configuration)
        );
    }
}
