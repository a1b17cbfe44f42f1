use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::KeyframeError;
use crate::session::{Part, PartBody, Turn};

/// Images below this size are treated as likely corrupt.
pub const MIN_IMAGE_BYTES: usize = 1024;

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Binary payload as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlinePayload {
    Raw(Vec<u8>),
    Base64(String),
}

impl InlinePayload {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Raw(bytes) => bytes.is_empty(),
            Self::Base64(text) => text.trim().is_empty(),
        }
    }

    /// Raw bytes of the payload. Raw payloads that are really base64 text
    /// of an image are decoded as well.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeyframeError> {
        match self {
            Self::Base64(text) => BASE64.decode(text.trim().as_bytes()).map_err(|err| {
                KeyframeError::no_image_payload(format!("image base64 decode failed: {err}"))
            }),
            Self::Raw(bytes) => {
                if image::guess_format(bytes).is_err() && looks_like_base64(bytes) {
                    if let Ok(decoded) = BASE64.decode(bytes) {
                        if image::guess_format(&decoded).is_ok() {
                            return Ok(decoded);
                        }
                    }
                }
                Ok(bytes.clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePartBody {
    Text(String),
    Inline {
        mime_type: Option<String>,
        payload: InlinePayload,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePart {
    pub body: ResponsePartBody,
    pub thought_signature: Option<String>,
}

impl ResponsePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: ResponsePartBody::Text(text.into()),
            thought_signature: None,
        }
    }

    pub fn inline(mime_type: Option<&str>, payload: InlinePayload) -> Self {
        Self {
            body: ResponsePartBody::Inline {
                mime_type: mime_type.map(str::to_string),
                payload,
            },
            thought_signature: None,
        }
    }
}

/// Reply from the image service, normalized from its wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceResponse {
    pub parts: Vec<ResponsePart>,
    pub finish_reason: Option<String>,
}

impl ServiceResponse {
    pub fn new(parts: Vec<ResponsePart>) -> Self {
        Self {
            parts,
            finish_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePolicy {
    /// Undersized images are kept and reported as a warning.
    #[default]
    Warn,
    /// Undersized images fail extraction.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub warning: Option<String>,
}

/// A part with no declared mime type is sniffed later; a declared
/// non-image type is skipped.
fn declares_image(mime_type: Option<&str>) -> bool {
    match mime_type.map(str::trim) {
        None | Some("") => true,
        Some(mime) => mime.to_ascii_lowercase().starts_with("image/"),
    }
}

/// Returns the first non-empty image part of `response`, as raw bytes.
pub fn extract_image(
    response: &ServiceResponse,
    policy: SizePolicy,
) -> Result<ExtractedImage, KeyframeError> {
    let found = response.parts.iter().find_map(|part| match &part.body {
        ResponsePartBody::Inline { mime_type, payload }
            if !payload.is_empty() && declares_image(mime_type.as_deref()) =>
        {
            Some((mime_type.as_deref(), payload))
        }
        _ => None,
    });
    let Some((declared_mime, payload)) = found else {
        let reason = response
            .finish_reason
            .as_deref()
            .map(|reason| format!(" (finish reason: {reason})"))
            .unwrap_or_default();
        return Err(KeyframeError::no_image_payload(format!(
            "response had {} part(s) but none carried image data{reason}",
            response.parts.len()
        )));
    };

    let bytes = payload.to_bytes()?;
    let mime_type = resolve_mime(declared_mime, &bytes);
    let warning = if bytes.len() < MIN_IMAGE_BYTES {
        let message = format!(
            "image is unusually small ({} bytes, expected at least {MIN_IMAGE_BYTES})",
            bytes.len()
        );
        if policy == SizePolicy::Reject {
            return Err(KeyframeError::no_image_payload(message));
        }
        Some(message)
    } else {
        None
    };

    Ok(ExtractedImage {
        bytes,
        mime_type,
        warning,
    })
}

/// Converts a service reply into the model turn appended to the session.
pub fn to_model_turn(response: &ServiceResponse) -> Result<Turn, KeyframeError> {
    let mut parts = Vec::with_capacity(response.parts.len());
    for part in &response.parts {
        let body = match &part.body {
            ResponsePartBody::Text(text) => PartBody::Text(text.clone()),
            ResponsePartBody::Inline { mime_type, payload } => {
                if payload.is_empty() {
                    continue;
                }
                let data = payload.to_bytes()?;
                PartBody::Image {
                    mime_type: resolve_mime(mime_type.as_deref(), &data),
                    data,
                }
            }
        };
        parts.push(Part {
            body,
            thought_signature: part.thought_signature.clone(),
        });
    }
    Ok(Turn::model(parts))
}

fn resolve_mime(declared: Option<&str>, bytes: &[u8]) -> String {
    if let Some(mime) = declared.map(str::trim).filter(|value| !value.is_empty()) {
        return mime.to_string();
    }
    image::guess_format(bytes)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| DEFAULT_IMAGE_MIME.to_string())
}

fn looks_like_base64(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes.len() % 4 == 0
        && bytes
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'='))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyframeErrorKind;
    use crate::session::Role;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn fake_png(len: usize) -> Vec<u8> {
        let mut bytes = PNG_MAGIC.to_vec();
        bytes.extend((0..len.saturating_sub(PNG_MAGIC.len())).map(|idx| (idx % 251) as u8));
        bytes
    }

    #[test]
    fn text_only_response_has_no_image_payload() {
        let response = ServiceResponse::new(vec![ResponsePart::text("I cannot draw that.")]);
        let err = extract_image(&response, SizePolicy::Warn).unwrap_err();
        assert_eq!(err.kind(), KeyframeErrorKind::NoImagePayload);
    }

    #[test]
    fn finish_reason_is_reported_when_no_image_arrives() {
        let mut response = ServiceResponse::new(Vec::new());
        response.finish_reason = Some("SAFETY".to_string());
        let err = extract_image(&response, SizePolicy::Warn).unwrap_err();
        assert!(err.message().contains("SAFETY"));
    }

    #[test]
    fn large_image_part_round_trips_unchanged() -> anyhow::Result<()> {
        let bytes = fake_png(10 * 1024);
        let response = ServiceResponse::new(vec![
            ResponsePart::text("Here is the frame."),
            ResponsePart::inline(Some("image/png"), InlinePayload::Raw(bytes.clone())),
        ]);
        let image = extract_image(&response, SizePolicy::Reject)?;
        assert_eq!(image.bytes, bytes);
        assert_eq!(image.mime_type, "image/png");
        assert!(image.warning.is_none());
        Ok(())
    }

    #[test]
    fn small_image_warns_or_fails_by_policy() -> anyhow::Result<()> {
        let bytes = fake_png(600);
        let response = ServiceResponse::new(vec![ResponsePart::inline(
            Some("image/png"),
            InlinePayload::Raw(bytes.clone()),
        )]);

        let image = extract_image(&response, SizePolicy::Warn)?;
        assert_eq!(image.bytes, bytes);
        assert!(image.warning.as_deref().unwrap_or("").contains("600 bytes"));

        let err = extract_image(&response, SizePolicy::Reject).unwrap_err();
        assert_eq!(err.kind(), KeyframeErrorKind::NoImagePayload);
        Ok(())
    }

    #[test]
    fn base64_payloads_are_normalized_to_raw_bytes() -> anyhow::Result<()> {
        let bytes = fake_png(2048);
        let encoded = BASE64.encode(&bytes);
        let text_payload = ServiceResponse::new(vec![ResponsePart::inline(
            None,
            InlinePayload::Base64(encoded.clone()),
        )]);
        let image = extract_image(&text_payload, SizePolicy::Warn)?;
        assert_eq!(image.bytes, bytes);
        assert_eq!(image.mime_type, "image/png");

        let ascii_bytes = ServiceResponse::new(vec![ResponsePart::inline(
            Some("image/png"),
            InlinePayload::Raw(encoded.into_bytes()),
        )]);
        assert_eq!(extract_image(&ascii_bytes, SizePolicy::Warn)?.bytes, bytes);
        Ok(())
    }

    #[test]
    fn first_non_empty_image_part_wins() -> anyhow::Result<()> {
        let response = ServiceResponse::new(vec![
            ResponsePart::inline(Some("image/png"), InlinePayload::Raw(Vec::new())),
            ResponsePart::inline(Some("image/jpeg"), InlinePayload::Raw(vec![1; 2048])),
            ResponsePart::inline(Some("image/png"), InlinePayload::Raw(vec![2; 2048])),
        ]);
        let image = extract_image(&response, SizePolicy::Warn)?;
        assert_eq!(image.bytes[0], 1);
        assert_eq!(image.mime_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn invalid_base64_is_a_payload_error() {
        let response = ServiceResponse::new(vec![ResponsePart::inline(
            Some("image/png"),
            InlinePayload::Base64("not base64 !!".to_string()),
        )]);
        let err = extract_image(&response, SizePolicy::Warn).unwrap_err();
        assert_eq!(err.kind(), KeyframeErrorKind::NoImagePayload);
    }

    #[test]
    fn model_turn_keeps_text_images_and_signatures() -> anyhow::Result<()> {
        let bytes = fake_png(2048);
        let mut image_part =
            ResponsePart::inline(None, InlinePayload::Base64(BASE64.encode(&bytes)));
        image_part.thought_signature = Some("sig-1".to_string());
        let response = ServiceResponse::new(vec![ResponsePart::text("done"), image_part]);

        let turn = to_model_turn(&response)?;
        assert_eq!(turn.role(), Role::Model);
        assert_eq!(turn.parts().len(), 2);
        assert_eq!(turn.parts()[1].as_image(), Some(bytes.as_slice()));
        assert_eq!(turn.parts()[1].thought_signature.as_deref(), Some("sig-1"));
        Ok(())
    }

    #[test]
    fn non_image_inline_parts_are_skipped() -> anyhow::Result<()> {
        let bytes = fake_png(4096);
        let response = ServiceResponse::new(vec![
            ResponsePart::inline(Some("audio/wav"), InlinePayload::Raw(vec![7; 4096])),
            ResponsePart::inline(Some("application/json"), InlinePayload::Raw(b"{}".to_vec())),
            ResponsePart::inline(Some("IMAGE/PNG"), InlinePayload::Raw(bytes.clone())),
        ]);
        let image = extract_image(&response, SizePolicy::Reject)?;
        assert_eq!(image.bytes, bytes);

        let audio_only = ServiceResponse::new(vec![ResponsePart::inline(
            Some("audio/wav"),
            InlinePayload::Raw(vec![7; 4096]),
        )]);
        let err = extract_image(&audio_only, SizePolicy::Warn).unwrap_err();
        assert_eq!(err.kind(), KeyframeErrorKind::NoImagePayload);
        Ok(())
    }
}
