use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::EngineSettings;
use crate::extract::{InlinePayload, ResponsePart, ServiceResponse};
use crate::gemini::{parse_response, turn_to_content, GeminiClient};
use crate::session::{Role, Turn};

/// One call to an image-generation service. A plain prompt is a single
/// user turn.
#[derive(Debug, Clone, Copy)]
pub struct ImageServiceRequest<'a> {
    pub model: &'a str,
    pub turns: &'a [Turn],
    pub aspect_ratio: Option<&'a str>,
    pub timeout: Duration,
}

impl ImageServiceRequest<'_> {
    pub fn last_user_text(&self) -> String {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role() == Role::User)
            .map(Turn::text)
            .unwrap_or_default()
    }
}

pub trait ImageService: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ImageServiceRequest<'_>) -> Result<ServiceResponse>;
}

#[derive(Default)]
pub struct ImageServiceRegistry {
    services: BTreeMap<String, Box<dyn ImageService>>,
}

impl ImageServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: ImageService + 'static>(&mut self, service: S) {
        self.services
            .insert(service.name().to_string(), Box::new(service));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageService> {
        self.services.get(name).map(|service| service.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

pub fn default_service_registry(settings: &EngineSettings) -> ImageServiceRegistry {
    let mut registry = ImageServiceRegistry::new();
    registry.register(DryrunImageService);
    registry.register(GeminiImageService::from_settings(settings));
    registry
}

pub struct GeminiImageService {
    client: GeminiClient,
}

impl GeminiImageService {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(GeminiClient::new(
            &settings.api_base,
            settings.api_key.clone(),
        ))
    }

    pub fn build_payload(request: &ImageServiceRequest<'_>) -> Value {
        let contents: Vec<Value> = request.turns.iter().map(turn_to_content).collect();
        let mut generation_config = Map::new();
        generation_config.insert(
            "responseModalities".to_string(),
            json!(["TEXT", "IMAGE"]),
        );
        if let Some(ratio) = request
            .aspect_ratio
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            generation_config.insert("imageConfig".to_string(), json!({ "aspectRatio": ratio }));
        }
        json!({
            "contents": contents,
            "generationConfig": Value::Object(generation_config),
        })
    }
}

impl ImageService for GeminiImageService {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ImageServiceRequest<'_>) -> Result<ServiceResponse> {
        let payload = Self::build_payload(request);
        let response = self
            .client
            .generate_content(request.model, &payload, request.timeout)?;
        Ok(parse_response(&response))
    }
}

const DRYRUN_WIDTH: u32 = 144;
const DRYRUN_HEIGHT: u32 = 256;

/// Offline service that paints a deterministic PNG per prompt.
pub struct DryrunImageService;

impl ImageService for DryrunImageService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ImageServiceRequest<'_>) -> Result<ServiceResponse> {
        let prompt = request.last_user_text();
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update((request.turns.len() as u64).to_be_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let bytes = render_dryrun_png(&digest)?;
        Ok(ServiceResponse::new(vec![
            ResponsePart::text(format!("dryrun keyframe {}", hex::encode(&digest[..4]))),
            ResponsePart::inline(Some("image/png"), InlinePayload::Raw(bytes)),
        ]))
    }
}

fn render_dryrun_png(digest: &[u8; 32]) -> Result<Vec<u8>> {
    let (r, g, b) = (digest[0], digest[1], digest[2]);
    let mut noise = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]) | 1;
    let mut image = RgbImage::new(DRYRUN_WIDTH, DRYRUN_HEIGHT);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        // xorshift32 grain keeps the PNG from compressing below the size check.
        noise ^= noise << 13;
        noise ^= noise >> 17;
        noise ^= noise << 5;
        let grain = (noise & 0x1f) as u8;
        let shade = (y * 255 / DRYRUN_HEIGHT) as u8;
        *pixel = Rgb([
            r.wrapping_add(shade / 2).wrapping_add(grain),
            g.wrapping_add((x * 255 / DRYRUN_WIDTH) as u8 / 2),
            b.wrapping_sub(shade / 3).wrapping_add(grain / 2),
        ]);
    }
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .context("failed to encode dryrun keyframe")?;
    Ok(out)
}
