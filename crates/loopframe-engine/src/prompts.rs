use loopframe_contracts::assets::{AssetLoader, ANCHOR_TEMPLATE, EDIT_TEMPLATE};
use loopframe_contracts::plan::{Scene, ScenePlan};

use crate::error::{error_chain_text, KeyframeError};
use crate::variety::instruction_for;

/// Appended to the anchor prompt when a reference pose is attached.
pub const REFERENCE_POSE_INSTRUCTION: &str = "IMPORTANT: Use the attached reference image as a guide for: \
framing/composition, position/pose, body positions and camera angle only. \
Apply the character descriptions and setting from the text above; do not copy \
the people, outfits or background of the reference image.";

/// Named, pre-formatted prompt text. The synthesizer never reads template
/// files itself.
pub trait TemplateSource {
    fn render(&self, name: &str, vars: &[(&str, &str)]) -> anyhow::Result<String>;
}

impl TemplateSource for AssetLoader {
    fn render(&self, name: &str, vars: &[(&str, &str)]) -> anyhow::Result<String> {
        self.load_formatted(name, vars)
    }
}

/// Every prompt a run needs, rendered up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub anchor: String,
    /// `edits[i - 1]` drives scene `i`.
    pub edits: Vec<String>,
}

impl PromptSet {
    pub fn render(
        source: &dyn TemplateSource,
        plan: &ScenePlan,
        scene_count: usize,
        variety: u8,
    ) -> Result<Self, KeyframeError> {
        let first = plan
            .scenes
            .first()
            .ok_or_else(|| KeyframeError::invalid_plan("plan has no scenes"))?;
        let anchor = anchor_prompt(source, plan, first)?;
        let edits = plan
            .scenes
            .iter()
            .take(scene_count)
            .skip(1)
            .map(|scene| edit_prompt(source, scene, variety))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { anchor, edits })
    }

    pub fn edit_for(&self, scene: usize) -> Option<&str> {
        scene
            .checked_sub(1)
            .and_then(|idx| self.edits.get(idx))
            .map(String::as_str)
    }
}

pub fn anchor_prompt(
    source: &dyn TemplateSource,
    plan: &ScenePlan,
    first: &Scene,
) -> Result<String, KeyframeError> {
    source
        .render(
            ANCHOR_TEMPLATE,
            &[
                ("setting_desc", plan.setting_desc.as_str()),
                ("character_leader_desc", plan.character_leader_desc.as_str()),
                (
                    "character_follower_desc",
                    plan.character_follower_desc.as_str(),
                ),
                ("action", first.start_pose_description.as_str()),
            ],
        )
        .map_err(|err| KeyframeError::asset_load(error_chain_text(&err, 400)))
}

pub fn edit_prompt(
    source: &dyn TemplateSource,
    scene: &Scene,
    variety: u8,
) -> Result<String, KeyframeError> {
    source
        .render(
            EDIT_TEMPLATE,
            &[
                ("pose_description", scene.start_pose_description.as_str()),
                ("variety_instruction", instruction_for(variety)),
            ],
        )
        .map_err(|err| KeyframeError::asset_load(error_chain_text(&err, 400)))
}

pub fn with_reference_instruction(anchor: &str) -> String {
    format!("{anchor}\n\n{REFERENCE_POSE_INSTRUCTION}")
}
