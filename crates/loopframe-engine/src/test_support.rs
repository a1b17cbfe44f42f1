use std::sync::Mutex;

use anyhow::{bail, Result};
use loopframe_contracts::plan::{Scene, ScenePlan};

use crate::extract::{InlinePayload, ResponsePart, ServiceResponse};
use crate::service::{ImageService, ImageServiceRequest};
use crate::session::Turn;

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub(crate) fn sample_plan(scenes: usize) -> ScenePlan {
    ScenePlan {
        title: "Test Plan".to_string(),
        description: "A test plan description".to_string(),
        backend_tags: vec!["dance".to_string()],
        character_leader_desc: "Leader".to_string(),
        character_follower_desc: "Follower".to_string(),
        setting_desc: "A studio".to_string(),
        scenes: (0..scenes)
            .map(|idx| Scene {
                scene_number: idx as u32 + 1,
                action_description: format!("Action {}", idx + 1),
                audio_prompt: format!("Audio {}", idx + 1),
                start_pose_description: format!("Pose {}", pose_letter(idx)),
                end_pose_description: format!("Pose {}", pose_letter((idx + 1) % scenes.max(1))),
            })
            .collect(),
    }
}

fn pose_letter(idx: usize) -> char {
    (b'A' + (idx % 26) as u8) as char
}

pub(crate) fn png_bytes(len: usize, tag: u8) -> Vec<u8> {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(len.max(PNG_MAGIC.len()), tag);
    bytes
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub model: String,
    pub turns: Vec<Turn>,
    pub aspect_ratio: Option<String>,
}

/// Returns a fixed 2 KiB PNG per call and records every request.
pub(crate) struct RecordingService {
    calls: Mutex<Vec<RecordedCall>>,
    fail_on_call: Option<usize>,
    text_only: bool,
}

impl RecordingService {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on_call: None,
            text_only: false,
        }
    }

    /// Fails the n-th call (1-based).
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new()
        }
    }

    pub fn text_only() -> Self {
        Self {
            text_only: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

impl ImageService for RecordingService {
    fn name(&self) -> &str {
        "recording"
    }

    fn generate(&self, request: &ImageServiceRequest<'_>) -> Result<ServiceResponse> {
        let call_number = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| anyhow::anyhow!("recording lock poisoned"))?;
            calls.push(RecordedCall {
                model: request.model.to_string(),
                turns: request.turns.to_vec(),
                aspect_ratio: request.aspect_ratio.map(str::to_string),
            });
            calls.len()
        };
        if self.fail_on_call == Some(call_number) {
            bail!("simulated outage on call {call_number}");
        }
        if self.text_only {
            return Ok(ServiceResponse::new(vec![ResponsePart::text("no image today")]));
        }
        Ok(ServiceResponse::new(vec![
            ResponsePart::text(format!("frame {call_number}")),
            ResponsePart::inline(
                Some("image/png"),
                InlinePayload::Raw(png_bytes(2048, call_number as u8)),
            ),
        ]))
    }
}
