use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::gemini::DEFAULT_API_BASE;
use crate::variety::MAX_VARIETY;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_PROMPTS_DIR: &str = "prompts";
pub const DEFAULT_OUTPUT_DIR: &str = "Output";
pub const DEFAULT_VARIETY: u8 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_S: u64 = 90;
const MIN_REQUEST_TIMEOUT_S: u64 = 15;
const MAX_REQUEST_TIMEOUT_S: u64 = 300;

/// Engine settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub image_model: String,
    pub text_model: String,
    pub prompts_dir: PathBuf,
    pub output_dir: PathBuf,
    pub variety: u8,
    pub request_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Builds settings from any key lookup; values are expected trimmed
    /// and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let variety = lookup("SCENE_VARIETY")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(|value| value.clamp(0, i64::from(MAX_VARIETY)) as u8)
            .unwrap_or(DEFAULT_VARIETY);
        let timeout_s = lookup("LOOPFRAME_REQUEST_TIMEOUT")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|value| {
                (value.round() as u64).clamp(MIN_REQUEST_TIMEOUT_S, MAX_REQUEST_TIMEOUT_S)
            })
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S);

        Self {
            api_key: lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")),
            api_base: lookup("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            image_model: lookup("LOOPFRAME_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            text_model: lookup("LOOPFRAME_TEXT_MODEL")
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            prompts_dir: lookup("LOOPFRAME_PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPTS_DIR)),
            output_dir: lookup("LOOPFRAME_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            variety,
            request_timeout: Duration::from_secs(timeout_s),
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
