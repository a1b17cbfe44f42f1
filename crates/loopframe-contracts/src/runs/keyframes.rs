use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const KEYFRAME_MANIFEST_FILE: &str = "keyframes.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyframeAsset {
    pub label: String,
    pub path: PathBuf,
}

/// Ordered `label -> file` map; insertion order is scene order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyframeAssetMap {
    assets: IndexMap<String, PathBuf>,
}

impl KeyframeAssetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels are unique; a second insert for the same label is refused.
    pub fn insert(&mut self, label: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let label = label.into();
        if self.assets.contains_key(&label) {
            bail!("keyframe label '{label}' already recorded");
        }
        self.assets.insert(label, path.into());
        Ok(())
    }

    pub fn get(&self, label: &str) -> Option<&Path> {
        self.assets.get(label).map(PathBuf::as_path)
    }

    pub fn get_index(&self, index: usize) -> Option<(&str, &Path)> {
        self.assets
            .get_index(index)
            .map(|(label, path)| (label.as_str(), path.as_path()))
    }

    pub fn labels(&self) -> Vec<String> {
        self.assets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.assets
            .iter()
            .map(|(label, path)| (label.as_str(), path.as_path()))
    }

    pub fn to_assets(&self) -> Vec<KeyframeAsset> {
        self.iter()
            .map(|(label, path)| KeyframeAsset {
                label: label.to_string(),
                path: path.to_path_buf(),
            })
            .collect()
    }

    pub fn write_manifest(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.to_assets())?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load_manifest(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let rows: Vec<KeyframeAsset> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid keyframe manifest {}", path.display()))?;
        let mut map = Self::new();
        for row in rows {
            map.insert(row.label, row.path)?;
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_scene_order_and_refuses_duplicates() -> anyhow::Result<()> {
        let mut map = KeyframeAssetMap::new();
        map.insert("A", "/tmp/keyframe_A.png")?;
        map.insert("B", "/tmp/keyframe_B.png")?;
        assert!(map.insert("A", "/tmp/other.png").is_err());

        assert_eq!(map.labels(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(map.get("A"), Some(Path::new("/tmp/keyframe_A.png")));
        assert_eq!(map.get_index(1).map(|(label, _)| label), Some("B"));
        Ok(())
    }

    #[test]
    fn manifest_round_trip_preserves_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let manifest = temp.path().join(KEYFRAME_MANIFEST_FILE);
        let mut map = KeyframeAssetMap::new();
        for label in ["C", "A", "B"] {
            map.insert(label, temp.path().join(format!("keyframe_{label}.png")))?;
        }
        map.write_manifest(&manifest)?;

        let loaded = KeyframeAssetMap::load_manifest(&manifest)?;
        assert_eq!(loaded, map);
        assert_eq!(loaded.labels(), vec!["C", "A", "B"]);
        Ok(())
    }
}
