use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tutor_contracts::conversation::{Conversation, Role};

use super::Generator;
use crate::config::first_non_empty_env;
use crate::error::GenerationError;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 600;
const VISION_MAX_DIM: u32 = 1024;
const JPEG_QUALITY: u8 = 90;

/// Generator backed by the OpenAI Responses API. The blocking client is
/// shared across sessions.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    http: HttpClient,
    api_base: String,
    api_key: String,
    model: String,
    max_output_tokens: u64,
}

impl OpenAiGenerator {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        let model = model.into();
        let model = if model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            model.trim().to_string()
        };
        Ok(Self {
            http,
            api_base: normalize_api_base(&api_base.into()),
            api_key: api_key.into(),
            model,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        })
    }

    pub fn from_env(model: &str, timeout: Duration) -> Result<Self> {
        let api_key = first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"])
            .context("missing OPENAI_API_KEY (or OPENAI_API_KEY_BACKUP)")?;
        let api_base = first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::new(api_base, api_key, model, timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        format!("{}/responses", self.api_base)
    }
}

impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(
        &self,
        conversation: &Conversation,
        image: &DynamicImage,
    ) -> Result<String, GenerationError> {
        let image_url = vision_data_url(image, VISION_MAX_DIM)?;
        let payload = build_responses_payload(
            &self.model,
            conversation,
            &image_url,
            self.max_output_tokens,
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    GenerationError::failed("openai request timed out")
                } else {
                    GenerationError::Unavailable(format!("openai request failed: {err}"))
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let snippet = body.chars().take(300).collect::<String>();
            return Err(GenerationError::failed(format!(
                "openai returned {status}: {snippet}"
            )));
        }

        let parsed: Value = response
            .json()
            .map_err(|err| GenerationError::failed(format!("invalid openai response: {err}")))?;
        let text = extract_output_text(&parsed);
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyCompletion);
        }
        Ok(text)
    }
}

fn normalize_api_base(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }
    if let Ok(parsed) = reqwest::Url::parse(&base) {
        if parsed.path().trim().is_empty() || parsed.path() == "/" {
            base = format!("{base}/v1");
        }
    }
    base.trim_end_matches('/').to_string()
}

fn build_responses_payload(
    model: &str,
    conversation: &Conversation,
    image_url: &str,
    max_output_tokens: u64,
) -> Value {
    let input = conversation
        .messages()
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::Student => "user",
                Role::Tutor => "assistant",
            };
            if message.attaches_image {
                json!({
                    "role": role,
                    "content": [
                        {"type": "input_text", "text": message.content},
                        {"type": "input_image", "image_url": image_url},
                    ],
                })
            } else {
                json!({"role": role, "content": message.content})
            }
        })
        .collect::<Vec<Value>>();
    json!({
        "model": model,
        "input": input,
        "max_output_tokens": max_output_tokens,
    })
}

/// Flattens alpha onto white, downsizes to fit `max_dim` and encodes JPEG.
fn vision_data_url(image: &DynamicImage, max_dim: u32) -> Result<String, GenerationError> {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }

    let dim = max_dim.max(128);
    let prepared = if flattened.width() > dim || flattened.height() > dim {
        DynamicImage::ImageRgb8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8()
    } else {
        flattened
    };

    let mut bytes = Vec::new();
    prepared
        .write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY))
        .map_err(|err| GenerationError::failed(format!("failed to encode image: {err}")))?;
    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(bytes)))
}

fn extract_output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
    }

    let mut parts: Vec<String> = Vec::new();
    let rows = response
        .get("output")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        if matches!(kind, "output_text" | "text") {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
            continue;
        }
        if kind != "message" {
            continue;
        }
        let content = obj
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for chunk in content {
            let chunk_kind = chunk.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(chunk_kind, "output_text" | "text") {
                continue;
            }
            if let Some(text) = chunk.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
        }
    }
    parts.join("\n")
}
