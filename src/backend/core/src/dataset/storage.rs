//! On-disk dataset layout.
//!
//! ```text
//! <dataset root>/
//!   dataset/
//!     train.json  test.json  validation.json
//!     metadata.json            { "split_indices": {...}, "columns": [...] }
//! ```
//!
//! Writes go to `*.tmp` siblings first and are renamed into place only after
//! every file was written, so a failed save leaves the previous files intact.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::split::{SplitIndices, SplitName, Splits};
use super::DatasetSplits;
use crate::error::{ErrorCode, LabError, Result};

/// Sub-directory of a dataset root holding the split files.
pub const DATASET_DIR: &str = "dataset";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Original row positions of each split, when the dataset was partitioned here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_indices: Option<SplitIndices>,

    #[serde(default)]
    pub columns: Vec<String>,
}

pub fn dataset_dir(root: &Path) -> PathBuf {
    root.join(DATASET_DIR)
}

fn split_path(root: &Path, split: SplitName) -> PathBuf {
    dataset_dir(root).join(format!("{}.json", split.as_str()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Load the three splits of the dataset rooted at `root`.
pub fn load_dataset(root: &Path) -> Result<DatasetSplits> {
    Splits::<()>::default().try_map(|split, ()| {
        let path = split_path(root, split);
        let bytes = fs::read(&path).map_err(|e| {
            LabError::with_internal(
                ErrorCode::DatasetError,
                format!("Can not load dataset from path {}", root.display()),
                format!("{}: {}", path.display(), e),
            )
            .with_source(e)
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    })
}

/// Persist all three splits under `root`, replacing any previous files.
pub fn save_dataset(root: &Path, splits: &DatasetSplits) -> Result<()> {
    let dir = dataset_dir(root);
    fs::create_dir_all(&dir)?;

    let mut staged = Vec::with_capacity(3);
    for (split, frame) in splits.iter() {
        let path = split_path(root, split);
        let tmp = tmp_path(&path);
        let json = serde_json::to_vec(frame)?;
        if let Err(e) = fs::write(&tmp, json) {
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e.into());
        }
        staged.push((tmp, path));
    }
    for (tmp, path) in staged {
        fs::rename(&tmp, &path)?;
    }

    debug!(
        path = %dir.display(),
        train_rows = splits.train.n_rows(),
        test_rows = splits.test.n_rows(),
        validation_rows = splits.validation.n_rows(),
        "Dataset saved"
    );
    Ok(())
}

/// Read `metadata.json`; a missing or empty file is an error.
pub fn read_metadata(root: &Path) -> Result<DatasetMetadata> {
    let path = dataset_dir(root).join(METADATA_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) | Err(_) => {
            return Err(LabError::new(
                ErrorCode::SplitMetadataMissing,
                format!("Dataset splits file is missing: {}", path.display()),
            ))
        }
    };
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn write_metadata(root: &Path, metadata: &DatasetMetadata) -> Result<()> {
    let dir = dataset_dir(root);
    fs::create_dir_all(&dir)?;
    let path = dir.join(METADATA_FILE);
    let tmp = tmp_path(&path);
    fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}
