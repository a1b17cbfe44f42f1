use std::fs;
use std::path::{Path, PathBuf};

use crate::error::KeyframeError;

pub const KEYFRAME_FILE_STEM: &str = "keyframe";

/// Extension for a keyframe file; unknown or missing MIME types fall back
/// to png.
pub fn extension_for_mime(mime: Option<&str>) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
    }
    "png"
}

pub fn keyframe_file_name(label: &str, mime: Option<&str>) -> String {
    format!("{KEYFRAME_FILE_STEM}_{label}.{}", extension_for_mime(mime))
}

/// Writes `bytes` to `<dir>/keyframe_<label>.<ext>` and returns the path.
/// The directory is created when missing; an existing file is replaced.
pub fn persist_keyframe(
    bytes: &[u8],
    label: &str,
    mime: Option<&str>,
    dir: &Path,
) -> Result<PathBuf, KeyframeError> {
    if label.trim().is_empty() {
        return Err(KeyframeError::persist("keyframe label is empty"));
    }
    fs::create_dir_all(dir).map_err(|err| {
        KeyframeError::persist(format!("failed to create {}: {err}", dir.display()))
    })?;
    let path = dir.join(keyframe_file_name(label, mime));
    fs::write(&path, bytes).map_err(|err| {
        KeyframeError::persist(format!("failed to write {}: {err}", path.display()))
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyframeErrorKind;

    #[test]
    fn writes_labelled_file_with_exact_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("run");
        let bytes = vec![5u8; 4096];

        let path = persist_keyframe(&bytes, "C", Some("image/png"), &dir)?;
        assert_eq!(path, dir.join("keyframe_C.png"));
        assert_eq!(fs::read(&path)?, bytes);
        Ok(())
    }

    #[test]
    fn extension_follows_mime() {
        assert_eq!(keyframe_file_name("A", Some("image/jpeg")), "keyframe_A.jpg");
        assert_eq!(keyframe_file_name("B", Some("image/webp")), "keyframe_B.webp");
        assert_eq!(keyframe_file_name("D", None), "keyframe_D.png");
    }

    #[test]
    fn unwritable_target_is_a_persist_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"file")?;

        let err = persist_keyframe(&[1, 2, 3], "A", None, &blocker).unwrap_err();
        assert_eq!(err.kind(), KeyframeErrorKind::Persist);
        Ok(())
    }
}
