use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::domain::{Satellite, Scene};
use crate::error::CatalogError;
use crate::geometry::TileKey;

pub const CAPABILITIES_FILE: &str = "tilemapresource.xml";

/// On-disk TMS pyramid rooted at the output directory.
///
/// Layout: `{root}/{scene_id}/{z}/{x}/{y}.png`, a capabilities document per
/// scene directory and a service description `{root}/{scene_id}.xml`.
#[derive(Debug, Clone)]
pub struct TmsCache {
    root: Utf8PathBuf,
}

impl TmsCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, CatalogError> {
        BaseDirs::new()
            .and_then(|dirs| {
                let root = dirs.home_dir().join(".cache").join("catalog-tms").join("tms");
                Utf8PathBuf::from_path_buf(root).ok()
            })
            .ok_or_else(|| {
                CatalogError::Filesystem("unable to resolve cache directory".to_string())
            })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn scene_dir(&self, scene_id: &str) -> Result<Utf8PathBuf, CatalogError> {
        validate_scene_id(scene_id)?;
        Ok(self.root.join(scene_id))
    }

    pub fn tile_path(&self, scene_id: &str, key: &TileKey) -> Result<Utf8PathBuf, CatalogError> {
        Ok(self
            .scene_dir(scene_id)?
            .join(key.z.to_string())
            .join(key.x.to_string())
            .join(format!("{}.png", key.y)))
    }

    pub fn capabilities_path(&self, scene_id: &str) -> Result<Utf8PathBuf, CatalogError> {
        Ok(self.scene_dir(scene_id)?.join(CAPABILITIES_FILE))
    }

    pub fn service_xml_path(&self, scene_id: &str) -> Result<Utf8PathBuf, CatalogError> {
        validate_scene_id(scene_id)?;
        Ok(self.root.join(format!("{scene_id}.xml")))
    }

    pub fn ensure_root(&self) -> Result<(), CatalogError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| CatalogError::Filesystem(format!("{}: {err}", self.root)))
    }

    /// Temp file beside `path`; persisted with [`TmsCache::persist`].
    pub fn temp_for(path: &Utf8Path) -> Result<NamedTempFile, CatalogError> {
        let parent = path
            .parent()
            .ok_or_else(|| CatalogError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(".catalog-tms")
            .suffix(".part")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))
    }

    pub fn persist(temp: NamedTempFile, path: &Utf8Path) -> Result<(), CatalogError> {
        temp.persist(path.as_std_path())
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CatalogError> {
        let mut temp = Self::temp_for(path)?;
        temp.write_all(content)
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        Self::persist(temp, path)
    }

    pub fn size_bytes(&self) -> Result<u64, CatalogError> {
        if !self.root.as_std_path().exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        for path in walk_dir(self.root.as_std_path())? {
            if path.is_file() {
                total += fs::metadata(&path)
                    .map_err(|err| CatalogError::Filesystem(err.to_string()))?
                    .len();
            }
        }
        Ok(total)
    }

    /// Scene ids with a directory under the root, sorted.
    pub fn scene_ids(&self) -> Result<Vec<String>, CatalogError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in read_dir(self.root.as_std_path())? {
            if entry.is_dir() {
                if let Some(name) = entry.file_name().and_then(|name| name.to_str()) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes scene directories and service descriptions under the root.
    pub fn clear(&self) -> Result<ClearReport, CatalogError> {
        let mut report = ClearReport::default();
        if !self.root.as_std_path().exists() {
            return Ok(report);
        }
        for entry in read_dir(self.root.as_std_path())? {
            if entry.is_dir() {
                fs::remove_dir_all(&entry)
                    .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
                report.scene_dirs += 1;
            } else if entry.extension().map(|ext| ext == "xml").unwrap_or(false) {
                fs::remove_file(&entry)
                    .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
                report.service_files += 1;
            }
        }
        debug!(
            root = %self.root,
            dirs = report.scene_dirs,
            files = report.service_files,
            "cache cleared"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub scene_dirs: usize,
    pub service_files: usize,
}

/// Scene ids become directory names; anything that could escape the root is refused.
pub fn validate_scene_id(scene_id: &str) -> Result<(), CatalogError> {
    let valid = !scene_id.is_empty()
        && scene_id != "."
        && scene_id != ".."
        && scene_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidSceneId(scene_id.to_string()))
    }
}

/// Search result saved between `search` and `materialize`/`verify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneCatalog {
    pub satellite: Satellite,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub scenes: Vec<Scene>,
}

impl SceneCatalog {
    pub fn load(path: &Utf8Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| CatalogError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| CatalogError::Filesystem(format!("{path}: {err}")))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CatalogError> {
        let content = serde_json::to_vec_pretty(self)
            .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
        TmsCache::write_bytes_atomic(path, &content)
    }
}

fn read_dir(root: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let entries = fs::read_dir(root).map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    entries
        .map(|entry| {
            entry
                .map(|entry| entry.path())
                .map_err(|err| CatalogError::Filesystem(err.to_string()))
        })
        .collect()
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for path in read_dir(&path)? {
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
