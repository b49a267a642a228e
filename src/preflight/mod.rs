//! Preflight checks for host tools.
//!
//! Fails early with a readable list instead of a spawn error halfway
//! through an assembly.
//!
//! # Example
//!
//! ```rust
//! use agent_image_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("xorriso") {
//!     println!("xorriso not installed");
//! }
//!
//! let tools = &[("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command is on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every assembly needs. Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("xorriso", "xorriso")];

/// Tools only some configurations need: `oc` is not used when the base ISO
/// comes from a URL and helper binaries can be skipped.
pub const OPTIONAL_TOOLS: &[(&str, &str)] = &[("oc", "openshift-clients")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);
    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

/// Check [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

/// Entries of [`OPTIONAL_TOOLS`] not found on PATH.
pub fn optional_tools_missing() -> Vec<(&'static str, &'static str)> {
    missing_tools(OPTIONAL_TOOLS)
}

fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}
