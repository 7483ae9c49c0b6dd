//! Output inventory written after a pipeline finishes.
//!
//! Every `*.bp` directory under the pipeline working dir is listed with its
//! total size, and any `profiling.json` inside one is copied up to the
//! working dir under a flattened name.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Inventory file name inside the pipeline working dir.
pub const INVENTORY_FILE_NAME: &str = ".codar.adios_file_sizes.out.json";

const PROFILE_NAME: &str = "profiling.json";

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("path not under working dir: {0}")]
    PathNotInRoot(String),
}

pub type InventoryResult<T> = Result<T, InventoryError>;

/// What `write_inventory` found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Relative path of each output directory to its size in bytes, as a
    /// decimal string.
    pub sizes: BTreeMap<String, String>,
    /// Profiles copied into the working dir.
    pub profiles: Vec<PathBuf>,
}

/// Scan `working_dir`, copy profiles, and write the inventory file.
pub fn write_inventory(working_dir: &Path) -> InventoryResult<Inventory> {
    let mut inventory = Inventory::default();

    for entry in WalkDir::new(working_dir)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        if !entry.file_type().is_dir() || entry.path().extension().map_or(true, |ext| ext != "bp") {
            continue;
        }
        let path = entry.path();
        let rel_path = relative(working_dir, path)?;
        inventory
            .sizes
            .insert(rel_path.clone(), dir_size(path)?.to_string());

        let profile = path.join(PROFILE_NAME);
        if profile.is_file() {
            let flat = format!("{rel_path}/{PROFILE_NAME}").replace('/', "-");
            let dest = working_dir.join(flat);
            fs::copy(&profile, &dest)?;
            inventory.profiles.push(dest);
        }
    }

    let json = serde_json::to_string(&inventory.sizes)?;
    fs::write(working_dir.join(INVENTORY_FILE_NAME), json)?;
    Ok(inventory)
}

fn relative(root: &Path, path: &Path) -> InventoryResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| InventoryError::PathNotInRoot(path.display().to_string()))?;
    Ok(rel.to_string_lossy().into_owned())
}

fn dir_size(dir: &Path) -> InventoryResult<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
