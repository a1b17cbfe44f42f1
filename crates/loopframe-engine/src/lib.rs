pub mod config;
pub mod error;
pub mod extract;
pub mod gemini;
pub mod persist;
pub mod planner;
pub mod poses;
pub mod prompts;
pub mod service;
pub mod session;
pub mod synth;
pub mod variety;

#[cfg(test)]
mod test_support;

pub use config::{non_empty_env, EngineSettings};
pub use error::{error_chain_text, KeyframeError, KeyframeErrorKind};
pub use extract::{extract_image, ExtractedImage, ServiceResponse, SizePolicy};
pub use persist::persist_keyframe;
pub use planner::{DirectorBrief, GeminiPlanner, ScenePlanner};
pub use poses::{ReferencePose, ReferencePosePool};
pub use prompts::TemplateSource;
pub use service::{
    default_service_registry, DryrunImageService, GeminiImageService, ImageService,
    ImageServiceRegistry, ImageServiceRequest,
};
pub use session::{Part, Role, Session, Turn};
pub use synth::{
    CancelFlag, EventLogObserver, KeyframeSynthesizer, SynthEvent, SynthState, SynthStep,
    SynthesisObserver, SynthesisOptions, SynthesisOutcome,
};
pub use variety::{instruction_for, VarietyBand};
