use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One scene of the choreography loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_number: u32,
    pub action_description: String,
    pub audio_prompt: String,
    pub start_pose_description: String,
    pub end_pose_description: String,
}

/// Complete plan produced by the planning service.
///
/// Only the global descriptions and each scene's start pose feed keyframe
/// synthesis; the remaining fields travel through to clip instructions and
/// reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenePlan {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backend_tags: Vec<String>,
    pub character_leader_desc: String,
    pub character_follower_desc: String,
    pub setting_desc: String,
    pub scenes: Vec<Scene>,
}

impl ScenePlan {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let plan: ScenePlan =
            serde_json::from_str(raw.trim()).context("scene plan is not valid plan JSON")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading plan {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("invalid plan {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scenes.is_empty() {
            bail!("plan '{}' has no scenes", self.title);
        }
        for (idx, scene) in self.scenes.iter().enumerate() {
            if scene.start_pose_description.trim().is_empty() {
                bail!("scene {} has an empty start pose description", idx + 1);
            }
        }
        Ok(())
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Filesystem-safe slug of the title, e.g. `"Tango: Night!"` -> `"tango-night"`.
    pub fn title_slug(&self) -> String {
        let kept: String = self
            .title
            .chars()
            .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace() || *ch == '-' || *ch == '_')
            .collect::<String>()
            .trim()
            .to_lowercase();
        let mut slug = String::with_capacity(kept.len());
        let mut pending_dash = false;
        for ch in kept.chars() {
            if ch.is_whitespace() || ch == '-' {
                pending_dash = true;
                continue;
            }
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        }
        if slug.is_empty() {
            "untitled".to_string()
        } else {
            slug
        }
    }
}
