use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

const BUILTIN_ANCHOR_TEMPLATE: &str = include_str!("../resources/keyframe_anchor.txt");
const BUILTIN_EDIT_TEMPLATE: &str = include_str!("../resources/keyframe_edit.txt");
const BUILTIN_DIRECTOR_TEMPLATE: &str = include_str!("../resources/director_system.txt");

pub const ANCHOR_TEMPLATE: &str = "keyframe_anchor.txt";
pub const EDIT_TEMPLATE: &str = "keyframe_edit.txt";
pub const DIRECTOR_TEMPLATE: &str = "director_system.txt";
pub const REFERENCE_POSE_STEM: &str = "reference_pose";

const NUMBERED_IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "jpe"];
const SINGLE_IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A seed image for the first keyframe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePose {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Loads prompt templates and reference images from a single root
/// directory. Names that resolve outside the root are rejected.
#[derive(Debug, Clone)]
pub struct AssetLoader {
    root: PathBuf,
}

impl AssetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.trim().is_empty() {
            bail!("asset name is empty");
        }
        let requested = Path::new(name);
        let mut relative = PathBuf::new();
        for component in requested.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        bail!("asset path traversal blocked: {name}");
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("absolute asset path blocked: {name}");
                }
            }
        }

        let target = self.root.join(&relative);
        // Symlinks can still point outside; compare canonical forms when both exist.
        if let (Ok(root), Ok(resolved)) = (self.root.canonicalize(), target.canonicalize()) {
            if !resolved.starts_with(&root) {
                bail!(
                    "asset path traversal blocked: {name} (resolved to {})",
                    resolved.display()
                );
            }
            return Ok(resolved);
        }
        Ok(target)
    }

    /// Reads a text asset, falling back to the built-in copy of the stock
    /// templates when the root does not override them.
    pub fn load_text(&self, name: &str) -> Result<String> {
        let path = self.resolve(name)?;
        if path.is_file() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            return Ok(raw.trim().to_string());
        }
        if let Some(builtin) = builtin_template(name) {
            return Ok(builtin.trim().to_string());
        }
        bail!("prompt file not found: {}", path.display())
    }

    pub fn load_formatted(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self.load_text(name)?;
        format_template(&template, vars).with_context(|| format!("failed formatting {name}"))
    }

    /// Missing, empty and rejected assets all read as `None`.
    pub fn load_optional(&self, name: &str) -> Option<String> {
        let path = self.resolve(name).ok()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn load_optional_image(&self, name: &str) -> Option<ReferencePose> {
        let mut path = self.resolve(name).ok()?;
        if !path.is_file() {
            if Path::new(name).extension().is_some() {
                return None;
            }
            path = SINGLE_IMAGE_EXTENSIONS
                .iter()
                .filter_map(|ext| self.resolve(&format!("{name}.{ext}")).ok())
                .find(|candidate| candidate.is_file())?;
        }
        read_image(&path)
    }

    /// Loads `<pattern>_*.{png,jpg,jpeg,jpe}` sorted by file name.
    pub fn load_numbered_images(&self, pattern: &str) -> Result<Vec<ReferencePose>> {
        if pattern.contains('/') || pattern.contains('\\') {
            bail!("image pattern must not contain path separators: {pattern}");
        }
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let prefix = format!("{pattern}_");
        let mut matches: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            let ext = path
                .extension()
                .and_then(|value| value.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            if file_name.starts_with(&prefix)
                && NUMBERED_IMAGE_EXTENSIONS.contains(&ext.as_str())
                && path.is_file()
            {
                matches.insert(file_name.to_string(), path);
            }
        }

        Ok(matches.values().filter_map(|path| read_image(path)).collect())
    }

    /// Numbered `reference_pose_*` images, else a single `reference_pose`
    /// image, else nothing.
    pub fn load_reference_poses(&self) -> Result<Vec<ReferencePose>> {
        let poses = self.load_numbered_images(REFERENCE_POSE_STEM)?;
        if !poses.is_empty() {
            return Ok(poses);
        }
        Ok(self
            .load_optional_image(REFERENCE_POSE_STEM)
            .into_iter()
            .collect())
    }
}

/// Substitutes `{key}` placeholders. `{{` and `}}` produce literal braces;
/// unknown keys and stray braces are errors.
pub fn format_template(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    key.push(next);
                }
                if !closed {
                    bail!("unterminated placeholder '{{{key}'");
                }
                let Some((_, value)) = vars.iter().find(|(name, _)| *name == key.trim()) else {
                    bail!("unknown placeholder '{{{key}}}'");
                };
                out.push_str(value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => bail!("single '}}' encountered in template"),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" | "jpe" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn read_image(path: &Path) -> Option<ReferencePose> {
    let mime_type = mime_for_path(path)?;
    let bytes = std::fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Some(ReferencePose {
        bytes,
        mime_type: mime_type.to_string(),
    })
}

fn builtin_template(name: &str) -> Option<&'static str> {
    match name {
        ANCHOR_TEMPLATE => Some(BUILTIN_ANCHOR_TEMPLATE),
        EDIT_TEMPLATE => Some(BUILTIN_EDIT_TEMPLATE),
        DIRECTOR_TEMPLATE => Some(BUILTIN_DIRECTOR_TEMPLATE),
        _ => None,
    }
}
