use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemError};

/// Subdirectory of the system temp dir shared by both sides.
pub static SHMEM_DIR_NAME: &str = "handoff_shmem";

/// Joins a prefix and a generation number in data file names.
pub const GENERATION_SEPARATOR: char = '_';

static DEFAULT_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| env::temp_dir().join(SHMEM_DIR_NAME));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub data_dir: PathBuf,
    /// Busy polls before the wait loop starts sleeping.
    pub spin_iterations: u32,
    pub poll_interval_us: u64,
    /// Wall-clock cadence at which an expired deadline is noticed.
    pub deadline_check_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            data_dir: DEFAULT_DATA_DIR.clone(),
            spin_iterations: 1_000,
            poll_interval_us: 50,
            deadline_check_ms: 1,
        }
    }
}

impl ShmemConfig {
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> ShmemConfig {
        ShmemConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn ensure_data_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(&self.data_dir)
    }

    pub fn control_path(&self, prefix: &str) -> PathBuf {
        self.data_dir.join(prefix)
    }

    pub fn data_path(&self, prefix: &str, generation: i32) -> PathBuf {
        self.data_dir.join(data_file_name(prefix, generation))
    }
}

pub fn data_file_name(prefix: &str, generation: i32) -> String {
    format!("{}{}{}", prefix, GENERATION_SEPARATOR, generation)
}

pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(ShmemError::InvalidName("name must be at least one character".into()));
    }
    if prefix.ends_with(GENERATION_SEPARATOR) {
        return Err(ShmemError::InvalidName(format!(
            "{:?} cannot end with {:?}",
            prefix, GENERATION_SEPARATOR
        )));
    }
    if prefix.contains(|c: char| c == '/' || c == '\\') {
        return Err(ShmemError::InvalidName(format!(
            "{:?} cannot contain a path separator",
            prefix
        )));
    }
    Ok(())
}

fn remove_matching<F>(cfg: &ShmemConfig, matches: F) -> Result<usize>
where
    F: Fn(&str) -> bool,
{
    let dir = cfg.ensure_data_dir()?;
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(v) => v,
            None => continue,
        };
        if !matches(name) || !entry.file_type()?.is_file() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            // The peer may have removed it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Removes every file in the data directory whose name starts with `prefix`.
pub fn delete_files(cfg: &ShmemConfig, prefix: &str) -> Result<usize> {
    let removed = remove_matching(cfg, |name| name.starts_with(prefix))?;
    tracing::debug!(prefix, removed, "deleted shared files");
    Ok(removed)
}

/// Removes the data files of every generation of `prefix`, leaving the
/// control file and files of other prefixes alone.
pub(crate) fn delete_generation_files(cfg: &ShmemConfig, prefix: &str) -> Result<usize> {
    remove_matching(cfg, |name| {
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(GENERATION_SEPARATOR))
            .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}
