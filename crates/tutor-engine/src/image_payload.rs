use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use sha2::{Digest, Sha256};

use crate::error::DecodeError;

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub byte_len: usize,
    pub sha256: String,
}

/// Decodes a base64 image payload, with or without a `data:<mime>;base64,`
/// prefix. Nothing is decoded when the payload exceeds `max_bytes`.
pub fn decode_image_payload(payload: &str, max_bytes: usize) -> Result<DecodedImage, DecodeError> {
    let encoded = strip_data_url_prefix(payload.trim());
    let compact: String = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(DecodeError::Empty);
    }

    let estimated = compact.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(3) {
        return Err(DecodeError::TooLarge {
            size: estimated,
            limit: max_bytes,
        });
    }

    let bytes = BASE64.decode(compact.as_bytes())?;
    if bytes.len() > max_bytes {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let image = image::load_from_memory(&bytes)?;
    Ok(DecodedImage {
        image,
        byte_len: bytes.len(),
        sha256: hex::encode(Sha256::digest(&bytes)),
    })
}

fn strip_data_url_prefix(payload: &str) -> &str {
    if !payload.starts_with("data:") {
        return payload;
    }
    match payload.split_once(',') {
        Some((header, body)) if header.ends_with(";base64") => body,
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::png_base64;

    #[test]
    fn decodes_plain_and_data_url_payloads_identically() {
        let payload = png_base64(4, 3);
        let plain = decode_image_payload(&payload, 1 << 20).unwrap();
        let data_url =
            decode_image_payload(&format!("data:image/png;base64,{payload}"), 1 << 20).unwrap();

        assert_eq!(plain.image.width(), 4);
        assert_eq!(plain.image.height(), 3);
        assert_eq!(plain.sha256, data_url.sha256);
        assert_eq!(plain.byte_len, data_url.byte_len);
        assert_eq!(plain.sha256.len(), 64);
    }

    #[test]
    fn tolerates_line_wrapped_base64() {
        let payload = png_base64(2, 2);
        let wrapped = payload
            .as_bytes()
            .chunks(16)
            .map(|chunk| String::from_utf8_lossy(chunk).to_string())
            .collect::<Vec<String>>()
            .join("\n");
        assert!(decode_image_payload(&wrapped, 1 << 20).is_ok());
    }

    #[test]
    fn rejects_bad_base64() {
        let err = decode_image_payload("not base64 at all!!", 1 << 20).unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)), "{err:?}");
    }

    #[test]
    fn rejects_valid_base64_that_is_not_an_image() {
        let payload = BASE64.encode(b"definitely not a png");
        let err = decode_image_payload(&payload, 1 << 20).unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)), "{err:?}");
    }

    #[test]
    fn rejects_oversized_payload_before_decoding() {
        let payload = BASE64.encode(vec![0u8; 4096]);
        let err = decode_image_payload(&payload, 1024).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { limit: 1024, .. }), "{err:?}");
    }

    #[test]
    fn rejects_blank_payload() {
        assert!(matches!(
            decode_image_payload("data:image/png;base64,", 1024),
            Err(DecodeError::Empty)
        ));
    }
}
