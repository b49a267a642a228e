//! Boot artifact assembly for the agent-based cluster installer.
//!
//! Takes a serialized ignition config and produces a bootable agent ISO:
//!
//! - **Content cache** - Downloads and extracted files under the user cache
//!   directory, checksum-verified and guarded by per-file locks
//! - **Release extraction** - Files pulled out of component images of a
//!   release payload, with retries and registry mirrors
//! - **Artifact builders** - cpio archives, embed-region patching, ISO editing
//! - **Assembly** - The build and persist phases that tie it together
//!
//! # Architecture
//!
//! ```text
//! assembly::AgentArtifacts
//!     │
//!     ├── build:   cache / release ──► base ISO + helper binaries
//!     │                                  │
//!     │            artifact::iso ──► scratch tree ◄── artifact::cpio (initrd)
//!     │
//!     └── persist: artifact::embed (ignition, kargs) ──► artifact::iso ──► agent.<arch>.iso
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_image_builder::assembly::{AgentArtifacts, IgnitionArtifact};
//! use agent_image_builder::config::AssemblyConfig;
//! use std::path::Path;
//!
//! let config = AssemblyConfig::load(Path::new("agent.toml"))?;
//! let ignition = IgnitionArtifact::load(
//!     Path::new("agent.ign"),
//!     config.architecture,
//!     config.rendezvous_ip,
//! )?;
//! let artifacts = AgentArtifacts::from_config(config)?;
//! let set = artifacts.build(&ignition)?;
//! let iso = artifacts.persist(set, Path::new("out"))?;
//! ```

pub mod arch;
pub mod artifact;
pub mod assembly;
pub mod cache;
pub mod config;
pub mod error;
pub mod preflight;
pub mod process;
pub mod release;

pub use arch::Architecture;
pub use assembly::{AgentArtifacts, BootArtifactSet, IgnitionArtifact, Platform};
pub use error::{AssemblyError, ErrorKind};
