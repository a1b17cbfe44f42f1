use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use loopframe_contracts::plan::ScenePlan;
use loopframe_contracts::runs::keyframes::{KeyframeAssetMap, KEYFRAME_MANIFEST_FILE};
use loopframe_contracts::runs::summary::{read_summary, SUMMARY_FILE};

use crate::PLAN_FILE;

pub const CONTACT_SHEET_FILE: &str = "contact_sheet.html";
const THUMBNAIL_DIM: u32 = 320;

/// Renders a self-contained HTML contact sheet for a run directory and
/// returns the number of keyframe cards written.
pub fn export_html(run_dir: &Path, out_path: &Path) -> Result<usize> {
    let assets = KeyframeAssetMap::load_manifest(&run_dir.join(KEYFRAME_MANIFEST_FILE))
        .with_context(|| format!("{} is not a keyframe run", run_dir.display()))?;
    let plan = ScenePlan::load(&run_dir.join(PLAN_FILE)).ok();
    let summary = read_summary(&run_dir.join(SUMMARY_FILE)).ok();

    let mut cards = String::new();
    for (idx, (label, path)) in assets.iter().enumerate() {
        let scene = plan.as_ref().and_then(|plan| plan.scenes.get(idx));
        let pose = scene
            .map(|scene| scene.start_pose_description.as_str())
            .unwrap_or_default();
        let action = scene
            .map(|scene| scene.action_description.as_str())
            .unwrap_or_default();
        let thumb = match thumbnail_data_url(&resolve_keyframe_path(run_dir, path)) {
            Some(src) => format!("<img src='{src}' alt='keyframe {}'>", escape_html(label)),
            None => "<span class='missing'>image unavailable</span>".to_string(),
        };
        cards.push_str(&format!(
            "<div class='card'><div class='thumb'>{thumb}</div><div class='meta'><div class='label'>Keyframe {label}</div><div class='pose'>{pose}</div><div class='action'>{action}</div></div></div>",
            label = escape_html(label),
            pose = escape_html(pose),
            action = escape_html(action),
        ));
    }

    let title = plan
        .as_ref()
        .map(|plan| plan.title.as_str())
        .unwrap_or("Loopframe run");
    let status = summary
        .as_ref()
        .map(|summary| summary.status.as_str())
        .unwrap_or("unknown");
    let html_doc = format!(
        "<!doctype html>\n<html>\n<head>\n  <meta charset='utf-8'>\n  <title>{title}</title>\n  <style>\n    body {{ font-family: Arial, sans-serif; background: #f6f6f6; margin: 0; padding: 20px; }}\n    .grid {{ display: grid; grid-template-columns: repeat(auto-fill, minmax(200px, 1fr)); gap: 16px; }}\n    .card {{ background: white; border-radius: 10px; overflow: hidden; box-shadow: 0 2px 8px rgba(0,0,0,0.08); }}\n    .thumb {{ width: 100%; height: 340px; background: #eee; display: flex; align-items: center; justify-content: center; }}\n    .thumb img {{ max-width: 100%; max-height: 100%; }}\n    .meta {{ padding: 10px; }}\n    .label {{ font-weight: bold; font-size: 12px; color: #444; }}\n    .pose {{ font-size: 13px; margin: 8px 0; }}\n    .action {{ font-size: 12px; color: #666; }}\n    .missing {{ font-size: 12px; color: #a00; }}\n  </style>\n</head>\n<body>\n  <h1>{title}</h1>\n  <p>Status: {status}</p>\n  <div class='grid'>\n    {cards}\n  </div>\n</body>\n</html>\n",
        title = escape_html(title),
        status = escape_html(status),
    );

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, html_doc)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    Ok(assets.len())
}

/// Manifest paths are recorded as written; a moved run directory still
/// resolves by file name.
fn resolve_keyframe_path(run_dir: &Path, recorded: &Path) -> PathBuf {
    if recorded.is_file() {
        return recorded.to_path_buf();
    }
    match recorded.file_name() {
        Some(name) => run_dir.join(name),
        None => recorded.to_path_buf(),
    }
}

fn thumbnail_data_url(path: &Path) -> Option<String> {
    let image = image::open(path).ok()?;
    let resized = image
        .resize(THUMBNAIL_DIM, THUMBNAIL_DIM, FilterType::Triangle)
        .to_rgb8();
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 85);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized))
        .ok()?;
    Some(format!("data:image/jpeg;base64,{}", BASE64.encode(&bytes)))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use loopframe_contracts::plan::Scene;

    use super::*;

    fn plan_with_caption(action: &str) -> ScenePlan {
        ScenePlan {
            title: "Tango <Night>".to_string(),
            description: String::new(),
            backend_tags: Vec::new(),
            character_leader_desc: "Leader".to_string(),
            character_follower_desc: "Follower".to_string(),
            setting_desc: "Milonga".to_string(),
            scenes: vec![
                Scene {
                    scene_number: 1,
                    action_description: action.to_string(),
                    audio_prompt: "Bandoneon".to_string(),
                    start_pose_description: "Embrace".to_string(),
                    end_pose_description: "Ocho".to_string(),
                },
                Scene {
                    scene_number: 2,
                    action_description: "Ocho forward".to_string(),
                    audio_prompt: "Strings".to_string(),
                    start_pose_description: "Ocho".to_string(),
                    end_pose_description: "Embrace".to_string(),
                },
            ],
        }
    }

    #[test]
    fn export_embeds_thumbnails_and_escaped_captions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let run_dir = temp.path().join("run");
        fs::create_dir_all(&run_dir)?;
        let mut assets = KeyframeAssetMap::new();
        for label in ["A", "B"] {
            let path = run_dir.join(format!("keyframe_{label}.png"));
            RgbImage::from_pixel(90, 160, Rgb([10, 120, 200])).save(&path)?;
            assets.insert(label, path)?;
        }
        assets.write_manifest(&run_dir.join(KEYFRAME_MANIFEST_FILE))?;
        plan_with_caption("Walk & <turn>").write(&run_dir.join(PLAN_FILE))?;

        let out = run_dir.join(CONTACT_SHEET_FILE);
        assert_eq!(export_html(&run_dir, &out)?, 2);

        let html = fs::read_to_string(&out)?;
        assert_eq!(html.matches("data:image/jpeg;base64,").count(), 2);
        assert!(html.contains("Walk &amp; &lt;turn&gt;"));
        assert!(html.contains("<title>Tango &lt;Night&gt;</title>"));
        assert!(html.contains("Status: unknown"));
        Ok(())
    }

    #[test]
    fn missing_images_render_a_placeholder() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut assets = KeyframeAssetMap::new();
        assets.insert("A", temp.path().join("gone.png"))?;
        assets.write_manifest(&temp.path().join(KEYFRAME_MANIFEST_FILE))?;

        let out = temp.path().join("sheet.html");
        export_html(temp.path(), &out)?;
        assert!(fs::read_to_string(&out)?.contains("image unavailable"));
        Ok(())
    }

    #[test]
    fn export_requires_a_keyframe_manifest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let err = export_html(temp.path(), &temp.path().join("out.html")).unwrap_err();
        assert!(err.to_string().contains("not a keyframe run"));
        Ok(())
    }

    #[test]
    fn escape_html_covers_quotes() {
        assert_eq!(escape_html("a'b\"c"), "a&#x27;b&quot;c");
    }
}
