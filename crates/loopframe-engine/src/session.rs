use crate::error::KeyframeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Requester turn (prompts and input images).
    User,
    /// Responder turn (the service's reply).
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartBody {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub body: PartBody,
    /// Opaque token issued by the service; replayed verbatim in history.
    pub thought_signature: Option<String>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: PartBody::Text(text.into()),
            thought_signature: None,
        }
    }

    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            body: PartBody::Image {
                mime_type: mime_type.into(),
                data,
            },
            thought_signature: None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            PartBody::Text(text) => Some(text),
            PartBody::Image { .. } => None,
        }
    }

    pub fn as_image(&self) -> Option<&[u8]> {
        match &self.body {
            PartBody::Image { data, .. } => Some(data),
            PartBody::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    parts: Vec<Part>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.parts.iter().filter(|part| part.as_image().is_some()).count()
    }
}

/// Turn history for one synthesis run. Turns alternate user/model and
/// always open with a user turn; appended turns are never edited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    turns: Vec<Turn>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) -> Result<(), KeyframeError> {
        let expected = match self.turns.last() {
            None | Some(Turn { role: Role::Model, .. }) => Role::User,
            Some(Turn { role: Role::User, .. }) => Role::Model,
        };
        if turn.role != expected {
            return Err(KeyframeError::sequence(format!(
                "expected a {} turn at position {}, got {}",
                expected.as_str(),
                self.turns.len(),
                turn.role.as_str()
            )));
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Drops every turn. Used when the history is rebuilt without the
    /// reference pose.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn contains_image(&self, bytes: &[u8]) -> bool {
        self.turns
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .any(|part| part.as_image() == Some(bytes))
    }

    pub fn user_image_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|turn| turn.role == Role::User)
            .map(Turn::image_count)
            .sum()
    }
}
