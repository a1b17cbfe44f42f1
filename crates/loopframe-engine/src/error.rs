use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyframeErrorKind {
    /// Template or reference pose unreadable; raised before the first call.
    AssetLoad,
    /// Plan cannot drive a run (no scenes).
    InvalidPlan,
    /// Transport, HTTP status or timeout failure from the image service.
    ServiceCall,
    /// Response carried no usable image part.
    NoImagePayload,
    /// Keyframe could not be written.
    Persist,
    /// Session turns appended out of order.
    Sequence,
    /// Run stopped between scenes on request.
    Cancelled,
}

impl KeyframeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssetLoad => "asset_load",
            Self::InvalidPlan => "invalid_plan",
            Self::ServiceCall => "service_call",
            Self::NoImagePayload => "no_image_payload",
            Self::Persist => "persist",
            Self::Sequence => "sequence",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyframeError {
    kind: KeyframeErrorKind,
    scene: Option<usize>,
    label: Option<String>,
    message: String,
}

impl KeyframeError {
    pub fn new(kind: KeyframeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            scene: None,
            label: None,
            message: message.into(),
        }
    }

    pub fn asset_load(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::AssetLoad, message)
    }

    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::InvalidPlan, message)
    }

    pub fn service_call(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::ServiceCall, message)
    }

    pub fn no_image_payload(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::NoImagePayload, message)
    }

    pub fn persist(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::Persist, message)
    }

    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::Sequence, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(KeyframeErrorKind::Cancelled, message)
    }

    pub fn with_scene(mut self, scene: usize, label: &str) -> Self {
        self.scene = Some(scene);
        self.label = Some(label.to_string());
        self
    }

    pub fn kind(&self) -> KeyframeErrorKind {
        self.kind
    }

    pub fn scene(&self) -> Option<usize> {
        self.scene
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for KeyframeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.scene, self.label.as_deref()) {
            (Some(scene), Some(label)) => write!(
                f,
                "{} error at scene {} (keyframe {}): {}",
                self.kind.as_str(),
                scene + 1,
                label,
                self.message
            ),
            _ => write!(f, "{} error: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for KeyframeError {}

/// Flattens an error chain into one line, skipping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn display_names_scene_and_label_when_known() {
        let err = KeyframeError::service_call("timeout").with_scene(2, "C");
        assert_eq!(err.to_string(), "service_call error at scene 3 (keyframe C): timeout");
        assert_eq!(err.kind(), KeyframeErrorKind::ServiceCall);
        assert_eq!(err.label(), Some("C"));

        let bare = KeyframeError::asset_load("missing keyframe_edit.txt");
        assert_eq!(bare.to_string(), "asset_load error: missing keyframe_edit.txt");
    }

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("Gemini request failed")
            .unwrap_err();
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: connection reset"
        );
        assert!(error_chain_text(&err, 10).ends_with('…'));
    }
}
