use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_IMAGE_STORED: &str = "image stored, history reset";

pub const ERROR_NO_IMAGE: &str = "no image available";
pub const ERROR_INVALID_REQUEST: &str = "invalid request";
pub const ERROR_PROCESSING_FAILED: &str = "processing failed";
pub const ERROR_DECODE_FAILED: &str = "image decode failed";
pub const ERROR_ALREADY_PENDING: &str = "generation already in progress";

/// Inbound frame as sent by the client. Both fields are optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InboundFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    ImageUpdate(String),
    Question(String),
    Invalid,
}

/// Image wins over question: a frame carrying a non-empty image only updates
/// the image, even when the payload is blank and fails to decode.
pub fn classify(frame: InboundFrame) -> FrameKind {
    if let Some(image) = frame.image.filter(|value| !value.is_empty()) {
        return FrameKind::ImageUpdate(image);
    }
    if let Some(question) = frame
        .question
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return FrameKind::Question(question);
    }
    FrameKind::Invalid
}

/// Parses and classifies raw frame text. Anything that is not a JSON object
/// with string-or-absent `question`/`image` fields is `Invalid`.
pub fn parse_frame(raw: &str) -> FrameKind {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        _ => return FrameKind::Invalid,
    };
    match serde_json::from_value::<InboundFrame>(value) {
        Ok(frame) => classify(frame),
        Err(_) => FrameKind::Invalid,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundFrame {
    Answer(String),
    Status(String),
    Error(String),
}

impl OutboundFrame {
    pub fn answer(text: impl Into<String>) -> Self {
        Self::Answer(text.into())
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::Status(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error(text.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(raw) => raw,
            Err(_) => format!("{{\"error\":\"{ERROR_PROCESSING_FAILED}\"}}"),
        }
    }
}
