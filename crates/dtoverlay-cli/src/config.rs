//! Resolution profiles.
//!
//! A profile names a base tree, the overlays to stack on it with their
//! parameters, and where the result goes:
//!
//! ```toml
//! base = "bcm2711-rpi-4-b.dtb"
//! output = "merged.dtb"
//! params = ["audio=off"]
//!
//! [[overlay]]
//! path = "overlays/panel.dtbo"
//! params = ["backlight-pwm-chan=3", "rotate=90"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One resolution job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Base tree blob
    pub base: PathBuf,

    /// Where the merged blob is written
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Upper bound on the merged blob size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,

    /// Parameters declared by the base tree itself, applied before any overlay
    #[serde(default)]
    pub params: Vec<String>,

    /// Overlays, applied in order
    #[serde(default, rename = "overlay")]
    pub overlays: Vec<OverlayConfig>,
}

/// An overlay and the parameters applied with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Overlay blob
    pub path: PathBuf,

    /// `name=value` tokens, in application order
    #[serde(default)]
    pub params: Vec<String>,
}

fn default_output() -> PathBuf {
    PathBuf::from("merged.dtb")
}

impl Profile {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            output: default_output(),
            max_size: None,
            params: Vec::new(),
            overlays: Vec::new(),
        }
    }

    /// Loads a profile from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read profile")?;
        let profile: Profile = toml::from_str(&content).context("Failed to parse profile")?;
        Ok(profile)
    }

    /// Saves the profile to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize profile")?;
        std::fs::write(path.as_ref(), content).context("Failed to write profile")?;
        Ok(())
    }

    /// Interprets relative paths as relative to `dir`, normally the directory
    /// holding the profile.
    pub fn relative_to(mut self, dir: &Path) -> Self {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        rebase(&mut self.base);
        rebase(&mut self.output);
        for overlay in &mut self.overlays {
            rebase(&mut overlay.path);
        }
        self
    }
}
