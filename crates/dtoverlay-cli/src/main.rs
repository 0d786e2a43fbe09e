//! Devicetree Overlay Tool
//!
//! CLI for merging overlays into a base tree, applying override parameters,
//! and inspecting blobs.

mod config;
mod dump;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{OverlayConfig, Profile};
use dtoverlay_core::overrides::{OverrideSet, RuleSource};
use dtoverlay_core::{fdt, fragment, Resolution, Tree};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dtoverlay")]
#[command(about = "Resolve devicetree overlays and their parameters")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge an overlay into a base tree and apply parameters
    Apply {
        /// Base tree blob
        base: PathBuf,

        /// Overlay blob (omit to apply base tree parameters only)
        #[arg(long, short = 'O')]
        overlay: Option<PathBuf>,

        /// Parameters as name=value; a bare name means name=on
        params: Vec<String>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Fail if the result would exceed this many bytes
        #[arg(long)]
        max_size: Option<usize>,

        /// Also record this invocation as a profile
        #[arg(long)]
        save_profile: Option<PathBuf>,
    },
    /// Print a blob as source text
    Dump {
        file: PathBuf,

        /// Print JSON instead of source text
        #[arg(long)]
        json: bool,
    },
    /// List an overlay's fragments and parameters
    Params {
        overlay: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run a resolution profile
    Profile {
        /// Profile file (TOML)
        profile: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Apply {
            base,
            overlay,
            params,
            output,
            max_size,
            save_profile,
        } => {
            handle_apply(&base, overlay.as_deref(), &params, &output, max_size)?;
            if let Some(path) = save_profile {
                let profile = invocation_profile(base, overlay, params, output, max_size);
                profile.save(&path)?;
                println!("Saved profile to {}", path.display());
            }
            Ok(())
        }
        Commands::Dump { file, json } => handle_dump(&file, json),
        Commands::Params { overlay, json } => handle_params(&overlay, json),
        Commands::Profile { profile } => handle_profile(&profile),
    }
}

/// Splits `name=value`. A bare `name` yields an empty value, which rules
/// read as true.
fn parse_param(token: &str) -> Result<(&str, &str)> {
    let (name, value) = token.split_once('=').unwrap_or((token, ""));
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid parameter {:?}: missing name", token);
    }
    Ok((name, value))
}

fn parse_params(tokens: &[String]) -> Result<Vec<(&str, &str)>> {
    tokens.iter().map(|t| parse_param(t)).collect()
}

fn read_blob(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_tree(path: &Path) -> Result<Tree> {
    let blob = read_blob(path)?;
    fdt::decode(&blob).with_context(|| format!("Failed to decode {}", path.display()))
}

fn write_tree(tree: &Tree, output: &Path, max_size: Option<usize>) -> Result<usize> {
    let blob = match max_size {
        Some(limit) => fdt::encode_with_limit(tree, limit)?,
        None => fdt::encode(tree),
    };
    std::fs::write(output, &blob)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(blob.len())
}

/// Resolves one layer: `overlay` (if any) on top of `base`, then `params`.
fn apply_layer(base: Tree, overlay: Option<Tree>, params: &[String], what: &str) -> Result<Tree> {
    let mut resolution = Resolution::from_trees(base, overlay)
        .with_context(|| format!("Failed to merge {}", what))?;
    for (name, value) in parse_params(params)? {
        resolution
            .apply_override(name, value)
            .with_context(|| format!("Failed to apply {}={} from {}", name, value, what))?;
    }
    Ok(resolution.into_tree())
}

fn handle_apply(
    base: &Path,
    overlay: Option<&Path>,
    params: &[String],
    output: &Path,
    max_size: Option<usize>,
) -> Result<()> {
    let base_tree = read_tree(base)?;
    let overlay_tree = overlay.map(read_tree).transpose()?;
    let what = overlay.unwrap_or(base).display().to_string();
    let merged = apply_layer(base_tree, overlay_tree, params, &what)?;
    let size = write_tree(&merged, output, max_size).context("Failed to write merged tree")?;
    println!("Wrote {} ({} bytes)", output.display(), size);
    Ok(())
}

/// Profile equivalent to an `apply` invocation.
fn invocation_profile(
    base: PathBuf,
    overlay: Option<PathBuf>,
    params: Vec<String>,
    output: PathBuf,
    max_size: Option<usize>,
) -> Profile {
    let mut profile = Profile {
        output,
        max_size,
        ..Profile::new(base)
    };
    match overlay {
        Some(path) => profile.overlays.push(OverlayConfig { path, params }),
        None => profile.params = params,
    }
    profile
}

fn handle_dump(file: &Path, json: bool) -> Result<()> {
    let tree = read_tree(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&dump::to_json(&tree))?);
    } else {
        print!("{}", dump::to_dts(&tree));
    }
    Ok(())
}

fn handle_params(overlay: &Path, json: bool) -> Result<()> {
    let tree = read_tree(overlay)?;
    let fragments = fragment::collect(&tree).context("Failed to read fragments")?;
    let rules = OverrideSet::from_tree(&tree, RuleSource::Overlay)
        .context("Failed to read overrides")?;
    if json {
        let value = dump::params_json(&fragments, rules.rules());
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", dump::params_text(&fragments, rules.rules()));
    }
    Ok(())
}

fn handle_profile(path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let profile = Profile::load(path)?.relative_to(dir);
    info!("Running profile {}", path.display());

    let mut tree = read_tree(&profile.base)?;
    if !profile.params.is_empty() {
        let what = profile.base.display().to_string();
        tree = apply_layer(tree, None, &profile.params, &what)?;
    }
    for overlay in &profile.overlays {
        let what = overlay.path.display().to_string();
        tree = apply_layer(tree, Some(read_tree(&overlay.path)?), &overlay.params, &what)?;
    }

    let size = write_tree(&tree, &profile.output, profile.max_size)
        .context("Failed to write merged tree")?;
    println!(
        "Wrote {} ({} bytes, {} overlays)",
        profile.output.display(),
        size,
        profile.overlays.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtoverlay_core::overrides::{encode_entries, OVERRIDES_NODE};
    use dtoverlay_core::{NodeId, PropertyValue};

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("rotate=90").unwrap(), ("rotate", "90"));
        assert_eq!(parse_param("noaudio").unwrap(), ("noaudio", ""));
        assert_eq!(parse_param("label=a=b").unwrap(), ("label", "a=b"));
        assert!(parse_param("=1").is_err());
    }

    fn board() -> Tree {
        let mut t = Tree::new();
        let uart = t.add_child(NodeId::ROOT, "serial@7e201000").unwrap();
        t.set_value(uart, "status", "disabled".into());
        t.set_value(uart, "phandle", PropertyValue::Cells(vec![1]));
        let overrides = t.add_child(NodeId::ROOT, OVERRIDES_NODE).unwrap();
        t.set_property(overrides, "uart0", encode_entries(&[(1, "status")]));
        t
    }

    fn uart_overlay() -> Tree {
        let mut t = Tree::new();
        let frag = t.add_child(NodeId::ROOT, "fragment@0").unwrap();
        t.set_value(frag, "target-path", "/serial@7e201000".into());
        let patch = t.add_child(frag, "__overlay__").unwrap();
        t.set_value(patch, "current-speed", PropertyValue::Cells(vec![115200]));
        t
    }

    #[test]
    fn test_apply_layer() {
        let tree = apply_layer(board(), None, &["uart0=okay".to_string()], "board").unwrap();
        let uart = tree.find("/serial@7e201000").unwrap();
        assert_eq!(tree.property(uart, "status").unwrap().as_str(), Some("okay"));

        let err = apply_layer(board(), None, &["spi=on".to_string()], "board").unwrap_err();
        assert!(err.to_string().contains("spi=on"));
    }

    #[test]
    fn test_profile_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("board.dtb"), fdt::encode(&board())).unwrap();
        std::fs::write(dir.path().join("uart.dtbo"), fdt::encode(&uart_overlay())).unwrap();

        let mut profile = Profile::new("board.dtb");
        profile.params.push("uart0=okay".to_string());
        profile.overlays.push(OverlayConfig {
            path: PathBuf::from("uart.dtbo"),
            params: Vec::new(),
        });
        let path = dir.path().join("profile.toml");
        profile.save(&path).unwrap();

        handle_profile(&path).unwrap();
        let merged = read_tree(&dir.path().join("merged.dtb")).unwrap();
        let uart = merged.find("/serial@7e201000").unwrap();
        assert_eq!(merged.property(uart, "status").unwrap().as_str(), Some("okay"));
        assert_eq!(merged.property(uart, "current-speed").unwrap().as_u32(), Some(115200));
    }

    #[test]
    fn test_invocation_profile() {
        let profile = invocation_profile(
            PathBuf::from("board.dtb"),
            Some(PathBuf::from("panel.dtbo")),
            vec!["rotate=90".to_string()],
            PathBuf::from("out.dtb"),
            None,
        );
        assert!(profile.params.is_empty());
        assert_eq!(profile.overlays[0].path, PathBuf::from("panel.dtbo"));
        assert_eq!(profile.overlays[0].params, ["rotate=90"]);
        assert_eq!(profile.output, PathBuf::from("out.dtb"));
    }

    #[test]
    fn test_apply_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("board.dtb");
        std::fs::write(&base, fdt::encode(&board())).unwrap();
        let output = dir.path().join("out.dtb");
        assert!(handle_apply(&base, None, &[], &output, Some(16)).is_err());
        assert!(!output.exists());
        handle_apply(&base, None, &[], &output, None).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&base).unwrap());
    }
}
