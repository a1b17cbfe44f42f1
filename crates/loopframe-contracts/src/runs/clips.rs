use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::plan::ScenePlan;
use crate::runs::keyframes::KeyframeAssetMap;

pub const CLIP_INSTRUCTIONS_FILE: &str = "clip_instructions.json";

/// One video clip to render between two consecutive keyframes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopClip {
    pub scene: u32,
    pub start_image: PathBuf,
    pub end_image: PathBuf,
    pub prompt: String,
    pub audio: String,
}

/// Pairs keyframes `[first..last]` with `[second..last, first]` so the
/// final clip returns to the opening frame.
pub fn build_loop_clips(plan: &ScenePlan, assets: &KeyframeAssetMap) -> Result<Vec<LoopClip>> {
    let count = assets.len();
    if count == 0 {
        bail!("no keyframes to pair");
    }
    if count > plan.scenes.len() {
        bail!(
            "{count} keyframes but the plan only has {} scenes",
            plan.scenes.len()
        );
    }

    let mut clips = Vec::with_capacity(count);
    for (idx, scene) in plan.scenes.iter().take(count).enumerate() {
        let (_, start) = assets
            .get_index(idx)
            .with_context(|| format!("missing keyframe {idx}"))?;
        let (_, end) = assets
            .get_index((idx + 1) % count)
            .with_context(|| format!("missing keyframe {}", (idx + 1) % count))?;
        clips.push(LoopClip {
            scene: idx as u32 + 1,
            start_image: start.to_path_buf(),
            end_image: end.to_path_buf(),
            prompt: scene.action_description.clone(),
            audio: scene.audio_prompt.clone(),
        });
    }
    Ok(clips)
}

pub fn write_loop_clips(path: &Path, clips: &[LoopClip]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(clips)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::sample_plan;

    fn asset_map(labels: &[&str]) -> anyhow::Result<KeyframeAssetMap> {
        let mut map = KeyframeAssetMap::new();
        for label in labels {
            map.insert(*label, format!("/run/keyframe_{label}.png"))?;
        }
        Ok(map)
    }

    #[test]
    fn four_keyframes_close_the_loop_on_the_first() -> anyhow::Result<()> {
        let plan = sample_plan(4);
        let clips = build_loop_clips(&plan, &asset_map(&["A", "B", "C", "D"])?)?;

        assert_eq!(clips.len(), 4);
        assert_eq!(clips[0].start_image, PathBuf::from("/run/keyframe_A.png"));
        assert_eq!(clips[0].end_image, PathBuf::from("/run/keyframe_B.png"));
        assert_eq!(clips[3].start_image, PathBuf::from("/run/keyframe_D.png"));
        assert_eq!(clips[3].end_image, PathBuf::from("/run/keyframe_A.png"));
        assert_eq!(clips[3].scene, 4);
        assert_eq!(clips[2].prompt, "Action 3");
        assert_eq!(clips[2].audio, "Audio 3");
        Ok(())
    }

    #[test]
    fn single_keyframe_loops_onto_itself() -> anyhow::Result<()> {
        let clips = build_loop_clips(&sample_plan(1), &asset_map(&["A"])?)?;
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].start_image, clips[0].end_image);
        Ok(())
    }

    #[test]
    fn rejects_empty_or_oversized_maps() -> anyhow::Result<()> {
        let plan = sample_plan(2);
        assert!(build_loop_clips(&plan, &KeyframeAssetMap::new()).is_err());
        assert!(build_loop_clips(&plan, &asset_map(&["A", "B", "C"])?).is_err());
        Ok(())
    }

    #[test]
    fn write_loop_clips_emits_json_array() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(CLIP_INSTRUCTIONS_FILE);
        let clips = build_loop_clips(&sample_plan(2), &asset_map(&["A", "B"])?)?;
        write_loop_clips(&path, &clips)?;

        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed[1]["end_image"], "/run/keyframe_A.png");
        Ok(())
    }
}
