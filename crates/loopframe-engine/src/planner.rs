use std::time::Duration;

use anyhow::{bail, Context, Result};
use loopframe_contracts::assets::{AssetLoader, DIRECTOR_TEMPLATE};
use loopframe_contracts::plan::ScenePlan;
use serde_json::{json, Map, Value};

use crate::config::EngineSettings;
use crate::gemini::{response_text, GeminiClient};
use crate::prompts::TemplateSource;

pub const LEADER_OUTFIT_FILE: &str = "leader_outfit.txt";
pub const FOLLOWER_OUTFIT_FILE: &str = "follower_outfit.txt";
pub const SETTING_FILE: &str = "setting.txt";

/// Produces a scene plan from a free-form dance description.
pub trait ScenePlanner {
    fn plan(&self, user_input: &str) -> Result<ScenePlan>;
}

/// Optional fixed outfits and setting the director must honor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorBrief {
    pub leader_outfit: Option<String>,
    pub follower_outfit: Option<String>,
    pub setting: Option<String>,
}

impl DirectorBrief {
    pub fn load(loader: &AssetLoader) -> Self {
        Self {
            leader_outfit: loader.load_optional(LEADER_OUTFIT_FILE),
            follower_outfit: loader.load_optional(FOLLOWER_OUTFIT_FILE),
            setting: loader.load_optional(SETTING_FILE),
        }
    }

    pub fn outfit_instructions(&self) -> String {
        match (self.leader_outfit.as_deref(), self.follower_outfit.as_deref()) {
            (Some(leader), Some(follower)) => format!(
                "Use these EXACT character descriptions:\n- Leader: {leader}\n- Follower: {follower}"
            ),
            (Some(leader), None) => format!(
                "Use this EXACT description for the leader:\n- Leader: {leader}\n\
                 Design a matching, complementary outfit for the follower."
            ),
            (None, Some(follower)) => format!(
                "Use this EXACT description for the follower:\n- Follower: {follower}\n\
                 Design a matching, complementary outfit for the leader."
            ),
            (None, None) => "You have full creative freedom for both character outfits. \
                             Design elegant, cinematic outfits that match the dance style."
                .to_string(),
        }
    }

    pub fn setting_instructions(&self) -> String {
        match self.setting.as_deref() {
            Some(setting) => format!(
                "Use this EXACT setting/scene description:\n- Setting: {setting}\n\
                 Ensure all scenes take place in this environment."
            ),
            None => "You have full creative freedom for the setting/scene. Design an elegant, \
                     cinematic environment that matches the dance style (e.g., ballroom, \
                     rooftop terrace, Spanish plaza)."
                .to_string(),
        }
    }

    pub fn system_instruction(&self, source: &dyn TemplateSource) -> Result<String> {
        let outfit = self.outfit_instructions();
        let setting = self.setting_instructions();
        source.render(
            DIRECTOR_TEMPLATE,
            &[
                ("outfit_instructions", outfit.as_str()),
                ("setting_instructions", setting.as_str()),
            ],
        )
    }
}

pub struct GeminiPlanner {
    client: GeminiClient,
    model: String,
    system_instruction: String,
    timeout: Duration,
}

impl GeminiPlanner {
    pub fn new(
        client: GeminiClient,
        model: impl Into<String>,
        system_instruction: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_instruction: system_instruction.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &EngineSettings, loader: &AssetLoader) -> Result<Self> {
        let system_instruction = DirectorBrief::load(loader)
            .system_instruction(loader)
            .context("failed to build director system instruction")?;
        Ok(Self::new(
            GeminiClient::new(&settings.api_base, settings.api_key.clone()),
            settings.text_model.clone(),
            system_instruction,
            settings.request_timeout,
        ))
    }

    pub fn build_payload(&self, user_input: &str) -> Value {
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseMimeType".to_string(),
            Value::String("application/json".to_string()),
        );
        if self.model.contains("gemini-3") {
            generation_config.insert("temperature".to_string(), json!(1.0));
            generation_config.insert("thinkingConfig".to_string(), json!({ "includeThoughts": true }));
        }
        json!({
            "systemInstruction": { "parts": [{ "text": self.system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_input }] }],
            "generationConfig": Value::Object(generation_config),
        })
    }
}

impl ScenePlanner for GeminiPlanner {
    fn plan(&self, user_input: &str) -> Result<ScenePlan> {
        if user_input.trim().is_empty() {
            bail!("plan input is empty");
        }
        let payload = self.build_payload(user_input);
        let response = self
            .client
            .generate_content(&self.model, &payload, self.timeout)
            .context("scene planning request failed")?;
        let text = response_text(&response);
        if text.trim().is_empty() {
            bail!("scene planner returned no text");
        }
        ScenePlan::from_json_str(strip_code_fence(&text))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
