use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::SpillError;

/// Tuning for spillable containers: slab geometry, where spill files go,
/// and how much buffering the spill writer and readers get.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpillConfig {
    #[serde(default = "SpillConfig::default_slab_capacity")]
    pub slab_capacity: usize,
    #[serde(default = "SpillConfig::default_spill_dir")]
    pub spill_dir: PathBuf,
    #[serde(default = "SpillConfig::default_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "SpillConfig::default_buffer_size")]
    pub read_buffer_size: usize,
}

impl SpillConfig {
    fn default_slab_capacity() -> usize {
        1000
    }

    fn default_buffer_size() -> usize {
        4 * 1024 * 1024
    }

    fn default_spill_dir() -> PathBuf {
        resolve_spill_root().unwrap_or_else(|_| std::env::temp_dir())
    }

    /// Config rooted at `dir` with default geometry. Skips directory probing.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            slab_capacity: Self::default_slab_capacity(),
            spill_dir: dir.into(),
            write_buffer_size: Self::default_buffer_size(),
            read_buffer_size: Self::default_buffer_size(),
        }
    }

    pub fn with_slab_capacity(mut self, slab_capacity: usize) -> Self {
        self.slab_capacity = slab_capacity;
        self
    }

    pub fn validate(&self) -> Result<(), SpillError> {
        if self.slab_capacity == 0 {
            return Err(SpillError::InvalidConfig(
                "spill.slab_capacity must be positive".into(),
            ));
        }
        if self.slab_capacity > i32::MAX as usize {
            return Err(SpillError::InvalidConfig(format!(
                "spill.slab_capacity {} does not fit a batch length",
                self.slab_capacity
            )));
        }
        if self.write_buffer_size == 0 || self.read_buffer_size == 0 {
            return Err(SpillError::InvalidConfig(
                "spill buffer sizes must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            slab_capacity: Self::default_slab_capacity(),
            spill_dir: Self::default_spill_dir(),
            write_buffer_size: Self::default_buffer_size(),
            read_buffer_size: Self::default_buffer_size(),
        }
    }
}

/// Picks the root under which this process creates its spill files: a
/// `spillway` directory inside the first usable base among the working
/// directory, `/var/tmp` and the system temp dir. Each container then gets
/// its own temp file below that root.
fn resolve_spill_root() -> Result<PathBuf, SpillError> {
    let bases = [
        std::env::current_dir().ok(),
        Some(PathBuf::from("/var/tmp")),
        Some(std::env::temp_dir()),
    ];

    let mut rejected = Vec::new();
    for base in bases.into_iter().flatten() {
        let root = base.join("spillway");
        match std::fs::create_dir_all(&root).and_then(|()| accepts_files(&root)) {
            Ok(()) => {
                info!("Spill root: {}", root.display());
                return Ok(root);
            }
            Err(e) => rejected.push(format!("{}: {e}", root.display())),
        }
    }

    Err(SpillError::InvalidConfig(format!(
        "no usable spill root, tried {}",
        rejected.join("; ")
    )))
}

/// Creates and drops an anonymous file in `dir`.
fn accepts_files(dir: &Path) -> std::io::Result<()> {
    tempfile::tempfile_in(dir).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spill_dir_resolves() {
        let config = SpillConfig::default();
        assert!(!config.spill_dir.as_os_str().is_empty());
        assert_eq!(config.slab_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_spill_dir_preserved() {
        let config = SpillConfig::in_dir("/custom/path").with_slab_capacity(8);
        assert_eq!(config.spill_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.slab_capacity, 8);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut config = SpillConfig::in_dir("/tmp");
        config.read_buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(SpillError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_spill_root_accepts_files() {
        let root = resolve_spill_root().unwrap();
        assert!(root.ends_with("spillway"));
        assert!(accepts_files(&root).is_ok());
    }
}
