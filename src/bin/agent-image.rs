use std::path::Path;

use agent_image_builder::assembly::{AgentArtifacts, IgnitionArtifact};
use agent_image_builder::cache;
use agent_image_builder::config::AssemblyConfig;
use agent_image_builder::preflight;
use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  agent-image create <config.toml> <ignition.ign> <output_dir> [-v]\n  agent-image base-iso <config.toml> [-v]\n  agent-image base-iso-version <config.toml> [-v]\n  agent-image cache-dir <image|files>"
}

fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let before = args.len();
    args.retain(|a| a != "-v" && a != "--verbose");
    init_tracing(args.len() != before);

    match args.as_slice() {
        [create, config, ignition, output_dir] if create == "create" => create_iso(
            Path::new(config),
            Path::new(ignition),
            Path::new(output_dir),
        ),
        [base_iso, config] if base_iso == "base-iso" => print_base_iso(Path::new(config)),
        [version, config] if version == "base-iso-version" => {
            print_base_iso_version(Path::new(config))
        }
        [cache_dir, data_type] if cache_dir == "cache-dir" => {
            println!("{}", cache::cache_dir(data_type)?.display());
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(config: &Path) -> Result<AgentArtifacts> {
    let config = AssemblyConfig::load(config)?;
    for (tool, package) in preflight::optional_tools_missing() {
        tracing::warn!("optional tool '{tool}' not found (install: {package})");
    }
    AgentArtifacts::from_config(config)
}

fn create_iso(config: &Path, ignition: &Path, output_dir: &Path) -> Result<()> {
    preflight::check_host_tools()?;
    let artifacts = load(config)?;
    let cfg = artifacts.config();
    let ignition = IgnitionArtifact::load(ignition, cfg.architecture, cfg.rendezvous_ip)?;

    let set = artifacts
        .build(&ignition)
        .context("building agent boot artifacts")?;
    let iso = artifacts
        .persist(set, output_dir)
        .with_context(|| format!("writing agent ISO to '{}'", output_dir.display()))?;
    println!("{}", iso.display());
    Ok(())
}

fn print_base_iso(config: &Path) -> Result<()> {
    let artifacts = load(config)?;
    let arch = artifacts.config().architecture;
    let iso = artifacts
        .extractor()
        .get_base_iso(arch)
        .with_context(|| format!("fetching base ISO for {arch}"))?;
    println!("{}", iso.display());
    Ok(())
}

fn print_base_iso_version(config: &Path) -> Result<()> {
    let artifacts = load(config)?;
    let arch = artifacts.config().architecture;
    let version = artifacts.extractor().get_base_iso_version(arch)?;
    println!("{version}");
    Ok(())
}
