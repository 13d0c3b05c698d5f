//! Relocation job files for the command-line tool

use crate::image::{RamZpRange, RelocationTarget};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_CYCLES_PER_RUN: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TargetConfig {
    pub code_base: u16,
    pub zp_base: u8,
    pub zp_length: u8,
}

impl From<TargetConfig> for RelocationTarget {
    fn from(target: TargetConfig) -> Self {
        RelocationTarget::new(target.code_base, RamZpRange::new(target.zp_base, target.zp_length))
    }
}

/// One relocation, as described in a TOML job file:
///
/// ```toml
/// input = "game.bin"
/// origin = 0xC000
/// entry_points = [0xC000]
///
/// [target]
/// code_base = 0x2000
/// zp_base = 0x80
/// zp_length = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelocationJob {
    pub input: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    pub origin: u16,
    /// Defaults to `[origin]`
    #[serde(default)]
    pub entry_points: Vec<u16>,
    #[serde(default = "default_max_cycles")]
    pub max_cycles_per_run: u64,
    pub target: TargetConfig,
}

fn default_max_cycles() -> u64 {
    DEFAULT_MAX_CYCLES_PER_RUN
}

impl RelocationJob {
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let mut job: RelocationJob =
            toml::from_str(text).map_err(|e| format!("Invalid job file: {}", e))?;
        if job.entry_points.is_empty() {
            job.entry_points.push(job.origin);
        }
        Ok(job)
    }

    /// Load a job file. Relative input and output paths are resolved against
    /// the job file's directory.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let mut job = Self::from_toml_str(&text)?;
        if let Some(dir) = path.parent() {
            job.input = dir.join(&job.input);
            job.output = job.output.map(|output| dir.join(output));
        }
        Ok(job)
    }

    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(output) => output.clone(),
            None => {
                let mut name = self.input.clone().into_os_string();
                name.push(".reloc");
                PathBuf::from(name)
            }
        }
    }

    pub fn relocation_target(&self) -> RelocationTarget {
        self.target.into()
    }
}
