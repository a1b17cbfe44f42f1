//! Keyframe synthesis state machine.
//!
//! A run walks the plan's scenes in order. Scene 0 is the anchor and may
//! carry a reference pose. Scene 1 rebuilds the history from the plain
//! anchor prompt and the anchor reply so the reference image never reaches
//! later frames. Every later scene appends one edit turn to that history.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use loopframe_contracts::events::{EventPayload, EventWriter};
use loopframe_contracts::plan::ScenePlan;
use loopframe_contracts::runs::keyframes::KeyframeAssetMap;
use loopframe_contracts::runs::summary::RunSummary;
use serde_json::{json, Value};

use crate::config::EngineSettings;
use crate::error::{error_chain_text, KeyframeError, KeyframeErrorKind};
use crate::extract::{extract_image, to_model_turn, SizePolicy};
use crate::persist::persist_keyframe;
use crate::poses::{ReferencePose, ReferencePosePool};
use crate::prompts::{with_reference_instruction, PromptSet, TemplateSource};
use crate::service::{ImageService, ImageServiceRequest};
use crate::session::{Part, Session, Turn};

pub const KEYFRAME_LABELS: [&str; 8] = ["A", "B", "C", "D", "E", "F", "G", "H"];
pub const MAX_KEYFRAMES: usize = KEYFRAME_LABELS.len();
pub const DEFAULT_ASPECT_RATIO: &str = "9:16";

pub fn keyframe_label(index: usize) -> Option<&'static str> {
    KEYFRAME_LABELS.get(index).copied()
}

/// How the session is shaped before a scene's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthStep {
    Anchor,
    ResetEdit,
    AppendEdit,
}

impl SynthStep {
    pub fn for_scene(index: usize) -> Self {
        match index {
            0 => Self::Anchor,
            1 => Self::ResetEdit,
            _ => Self::AppendEdit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anchor => "anchor",
            Self::ResetEdit => "reset_edit",
            Self::AppendEdit => "append_edit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthState {
    Idle,
    GeneratingAnchor,
    GeneratingEdit(usize),
    Complete,
    Failed,
}

impl SynthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::GeneratingAnchor => "generating_anchor",
            Self::GeneratingEdit(_) => "generating_edit",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn for_scene(index: usize) -> Self {
        if index == 0 {
            Self::GeneratingAnchor
        } else {
            Self::GeneratingEdit(index)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOptions {
    pub model: String,
    pub variety: u8,
    /// Index into the reference pose pool; `None` runs unseeded.
    pub reference_pose_index: Option<usize>,
    pub aspect_ratio: Option<String>,
    pub timeout: Duration,
    pub size_policy: SizePolicy,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl SynthesisOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            model: settings.image_model.clone(),
            variety: settings.variety,
            reference_pose_index: Some(0),
            aspect_ratio: Some(DEFAULT_ASPECT_RATIO.to_string()),
            timeout: settings.request_timeout,
            size_policy: SizePolicy::Warn,
        }
    }
}

/// Cooperative stop signal, checked between scenes only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum SynthEvent<'a> {
    StateChanged {
        state: SynthState,
    },
    PromptSent {
        scene: usize,
        label: &'a str,
        step: SynthStep,
        turns: usize,
        reference_attached: bool,
    },
    KeyframeSaved {
        scene: usize,
        label: &'a str,
        path: &'a Path,
        bytes: usize,
        mime_type: &'a str,
    },
    Warning {
        scene: Option<usize>,
        message: &'a str,
    },
    Finished {
        outcome: &'a SynthesisOutcome,
    },
}

pub trait SynthesisObserver {
    fn on_event(&self, event: &SynthEvent<'_>);

    /// First failure the observer hit while recording events, if any.
    fn journal_error(&self) -> Option<String> {
        None
    }
}

/// Writes synthesis progress to the run journal.
///
/// A failed append does not stop the run. The first failure is kept and
/// reported through [`SynthesisObserver::journal_error`], which the
/// synthesizer turns into an outcome warning.
#[derive(Debug, Clone)]
pub struct EventLogObserver {
    writer: EventWriter,
    first_error: Arc<Mutex<Option<String>>>,
}

impl EventLogObserver {
    pub fn new(writer: EventWriter) -> Self {
        Self {
            writer,
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    fn emit(&self, event_type: &str, value: Value) {
        let payload = match value {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = self.writer.emit(event_type, payload) {
            if let Ok(mut slot) = self.first_error.lock() {
                if slot.is_none() {
                    *slot = Some(format!(
                        "event journal {} not written: {}",
                        self.writer.path().display(),
                        error_chain_text(&err, 300)
                    ));
                }
            }
        }
    }
}

impl SynthesisObserver for EventLogObserver {
    fn journal_error(&self) -> Option<String> {
        self.first_error.lock().ok().and_then(|slot| slot.clone())
    }

    fn on_event(&self, event: &SynthEvent<'_>) {
        match event {
            SynthEvent::StateChanged { state } => {
                let scene = match state {
                    SynthState::GeneratingAnchor => Some(0),
                    SynthState::GeneratingEdit(scene) => Some(*scene),
                    _ => None,
                };
                self.emit(
                    "synthesis_state",
                    json!({ "state": state.as_str(), "scene": scene }),
                );
            }
            SynthEvent::PromptSent {
                scene,
                label,
                step,
                turns,
                reference_attached,
            } => self.emit(
                "keyframe_prompt",
                json!({
                    "scene": scene,
                    "label": label,
                    "step": step.as_str(),
                    "turns": turns,
                    "reference_attached": reference_attached,
                }),
            ),
            SynthEvent::KeyframeSaved {
                scene,
                label,
                path,
                bytes,
                mime_type,
            } => self.emit(
                "keyframe_saved",
                json!({
                    "scene": scene,
                    "label": label,
                    "path": path.to_string_lossy(),
                    "size_bytes": bytes,
                    "mime_type": mime_type,
                }),
            ),
            SynthEvent::Warning { scene, message } => self.emit(
                "synthesis_warning",
                json!({ "scene": scene, "message": message }),
            ),
            SynthEvent::Finished { outcome } => self.emit(
                "synthesis_finished",
                json!({
                    "state": outcome.state.as_str(),
                    "keyframes": outcome.assets.labels(),
                    "service_calls": outcome.service_calls,
                    "warnings": outcome.warnings.len(),
                    "error": outcome.error.as_ref().map(ToString::to_string),
                    "error_kind": outcome.error.as_ref().map(|err| err.kind().as_str()),
                }),
            ),
        }
    }
}

/// Result of one run. A failed run still carries every keyframe that was
/// persisted before the failure.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub state: SynthState,
    pub assets: KeyframeAssetMap,
    pub warnings: Vec<String>,
    pub error: Option<KeyframeError>,
    pub service_calls: usize,
    pub started_at: String,
    pub finished_at: String,
}

impl SynthesisOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == SynthState::Complete
    }

    pub fn status(&self) -> &'static str {
        match (&self.error, self.state) {
            (_, SynthState::Complete) => "complete",
            (Some(err), _) if err.kind() == KeyframeErrorKind::Cancelled => "cancelled",
            _ => "failed",
        }
    }

    pub fn into_result(self) -> Result<KeyframeAssetMap, KeyframeError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.assets),
        }
    }

    pub fn to_summary(&self, run_id: &str, scene_count: usize) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            status: self.status().to_string(),
            scene_count: scene_count as u64,
            keyframes: self.assets.to_assets(),
            warnings: self.warnings.clone(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

struct RunProgress {
    state: SynthState,
    assets: KeyframeAssetMap,
    warnings: Vec<String>,
    service_calls: usize,
}

pub struct KeyframeSynthesizer<'a> {
    service: &'a dyn ImageService,
    templates: &'a dyn TemplateSource,
    poses: ReferencePosePool,
    options: SynthesisOptions,
    observer: Option<&'a dyn SynthesisObserver>,
    cancel: CancelFlag,
}

impl<'a> KeyframeSynthesizer<'a> {
    pub fn new(
        service: &'a dyn ImageService,
        templates: &'a dyn TemplateSource,
        options: SynthesisOptions,
    ) -> Self {
        Self {
            service,
            templates,
            poses: ReferencePosePool::empty(),
            options,
            observer: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_poses(mut self, poses: ReferencePosePool) -> Self {
        self.poses = poses;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn SynthesisObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SynthesisOptions {
        &self.options
    }

    /// Generates one keyframe per scene into `target_dir`. Never panics
    /// on service or filesystem failures; those end the run as `Failed`.
    pub fn run(&self, plan: &ScenePlan, target_dir: &Path) -> SynthesisOutcome {
        let started_at = now_utc_iso();
        let mut progress = RunProgress {
            state: SynthState::Idle,
            assets: KeyframeAssetMap::new(),
            warnings: Vec::new(),
            service_calls: 0,
        };

        let error = self.drive(plan, target_dir, &mut progress).err();
        let terminal = if error.is_some() {
            SynthState::Failed
        } else {
            SynthState::Complete
        };
        self.transition(&mut progress, terminal);
        if let Some(message) = self.observer.and_then(|observer| observer.journal_error()) {
            push_unique_warning(&mut progress.warnings, message);
        }

        let outcome = SynthesisOutcome {
            state: progress.state,
            assets: progress.assets,
            warnings: progress.warnings,
            error,
            service_calls: progress.service_calls,
            started_at,
            finished_at: now_utc_iso(),
        };
        self.notify(&SynthEvent::Finished { outcome: &outcome });
        outcome
    }

    fn drive(
        &self,
        plan: &ScenePlan,
        target_dir: &Path,
        progress: &mut RunProgress,
    ) -> Result<(), KeyframeError> {
        if plan.scenes.is_empty() {
            return Err(KeyframeError::invalid_plan(format!(
                "plan '{}' has no scenes",
                plan.title
            )));
        }
        let scene_count = plan.scenes.len().min(MAX_KEYFRAMES);
        if plan.scenes.len() > MAX_KEYFRAMES {
            self.warn(
                progress,
                None,
                format!(
                    "plan has {} scenes; only the first {MAX_KEYFRAMES} get keyframes",
                    plan.scenes.len()
                ),
            );
        }

        let prompts = PromptSet::render(self.templates, plan, scene_count, self.options.variety)?;
        let reference = self
            .options
            .reference_pose_index
            .and_then(|index| self.poses.select(index));

        let mut session = Session::new();
        let mut anchor_reply: Option<Turn> = None;

        for scene in 0..scene_count {
            if self.cancel.is_cancelled() {
                return Err(KeyframeError::cancelled(format!(
                    "run cancelled after {} of {scene_count} keyframes",
                    progress.assets.len()
                )));
            }
            let label = KEYFRAME_LABELS[scene];
            let step = SynthStep::for_scene(scene);
            self.transition(progress, SynthState::for_scene(scene));

            let reference_attached = self
                .prepare_session(&mut session, step, scene, &prompts, reference, anchor_reply.as_ref())
                .map_err(|err| err.with_scene(scene, label))?;
            self.notify(&SynthEvent::PromptSent {
                scene,
                label,
                step,
                turns: session.len(),
                reference_attached,
            });

            let reply = self
                .generate_scene(&mut session, scene, label, target_dir, progress)
                .map_err(|err| err.with_scene(scene, label))?;
            if step == SynthStep::Anchor {
                anchor_reply = Some(reply);
            }
        }
        Ok(())
    }

    /// Shapes the session for `step` and returns whether a reference pose
    /// was attached.
    fn prepare_session(
        &self,
        session: &mut Session,
        step: SynthStep,
        scene: usize,
        prompts: &PromptSet,
        reference: Option<&ReferencePose>,
        anchor_reply: Option<&Turn>,
    ) -> Result<bool, KeyframeError> {
        match step {
            SynthStep::Anchor => {
                let turn = match reference {
                    Some(pose) => Turn::user(vec![
                        Part::text(with_reference_instruction(&prompts.anchor)),
                        Part::image(pose.mime_type.clone(), pose.bytes.clone()),
                    ]),
                    None => Turn::user(vec![Part::text(prompts.anchor.clone())]),
                };
                session.push(turn)?;
                Ok(reference.is_some())
            }
            SynthStep::ResetEdit => {
                let anchor_reply = anchor_reply
                    .cloned()
                    .ok_or_else(|| KeyframeError::sequence("anchor reply missing before first edit"))?;
                session.reset();
                session.push(Turn::user(vec![Part::text(prompts.anchor.clone())]))?;
                session.push(anchor_reply)?;
                session.push(Turn::user(vec![Part::text(edit_text(prompts, scene)?)]))?;
                Ok(false)
            }
            SynthStep::AppendEdit => {
                session.push(Turn::user(vec![Part::text(edit_text(prompts, scene)?)]))?;
                Ok(false)
            }
        }
    }

    /// One request, extract, persist cycle. Returns the model turn that was
    /// appended to the session.
    fn generate_scene(
        &self,
        session: &mut Session,
        scene: usize,
        label: &str,
        target_dir: &Path,
        progress: &mut RunProgress,
    ) -> Result<Turn, KeyframeError> {
        let request = ImageServiceRequest {
            model: &self.options.model,
            turns: session.turns(),
            aspect_ratio: self.options.aspect_ratio.as_deref(),
            timeout: self.options.timeout,
        };
        progress.service_calls += 1;
        let response = self
            .service
            .generate(&request)
            .map_err(|err| KeyframeError::service_call(error_chain_text(&err, 600)))?;

        let image = extract_image(&response, self.options.size_policy)?;
        if let Some(warning) = image.warning.as_deref() {
            self.warn(progress, Some(scene), format!("keyframe {label}: {warning}"));
        }
        let path = persist_keyframe(&image.bytes, label, Some(&image.mime_type), target_dir)?;
        progress
            .assets
            .insert(label, path.clone())
            .map_err(|err| KeyframeError::sequence(err.to_string()))?;
        self.notify(&SynthEvent::KeyframeSaved {
            scene,
            label,
            path: &path,
            bytes: image.bytes.len(),
            mime_type: &image.mime_type,
        });

        let reply = to_model_turn(&response)?;
        session.push(reply.clone())?;
        Ok(reply)
    }

    fn transition(&self, progress: &mut RunProgress, state: SynthState) {
        progress.state = state;
        self.notify(&SynthEvent::StateChanged { state });
    }

    fn warn(&self, progress: &mut RunProgress, scene: Option<usize>, message: String) {
        if push_unique_warning(&mut progress.warnings, message.clone()) {
            self.notify(&SynthEvent::Warning {
                scene,
                message: &message,
            });
        }
    }

    fn notify(&self, event: &SynthEvent<'_>) {
        if let Some(observer) = self.observer {
            observer.on_event(event);
        }
    }
}

fn edit_text(prompts: &PromptSet, scene: usize) -> Result<String, KeyframeError> {
    prompts
        .edit_for(scene)
        .map(str::to_string)
        .ok_or_else(|| KeyframeError::sequence(format!("no edit prompt rendered for scene {scene}")))
}

/// Returns whether the message was new.
fn push_unique_warning(warnings: &mut Vec<String>, message: String) -> bool {
    if message.trim().is_empty() || warnings.iter().any(|existing| existing == &message) {
        return false;
    }
    warnings.push(message);
    true
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
