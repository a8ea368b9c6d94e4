//! Frame decoding.
//!
//! Inbound frames arrive in one of two forms:
//!
//! - An encoded string: a data URI (`data:image/jpeg;base64,<payload>`) or bare
//!   base64 of an encoded image file.
//! - A pre-decoded pixel buffer: `{width, height, pixels}` with `pixels` being
//!   base64 of packed RGB8 bytes.
//!
//! `FrameDecoder` turns either into an `RgbImage` at the fixed target
//! resolution. Decoding has no side effects beyond the returned image.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resampling filter for resizing to the target resolution.
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("decoded image has zero size")]
    ZeroSize,
    #[error("pixel buffer length mismatch: expected {expected} bytes, got {actual}")]
    PixelLength { expected: usize, actual: usize },
}

/// Packed RGB8 pixels, base64-encoded for transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: String,
}

/// A frame as received from a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameInput {
    Encoded(String),
    Pixels(PixelBuffer),
}

impl FrameInput {
    /// Wrap raw RGB8 bytes as a pixel-buffer frame.
    pub fn from_rgb(width: u32, height: u32, rgb: &[u8]) -> Self {
        FrameInput::Pixels(PixelBuffer {
            width,
            height,
            pixels: STANDARD.encode(rgb),
        })
    }

    /// Wrap an encoded image file (JPEG, PNG) as a data URI frame.
    pub fn data_uri(mime: &str, bytes: &[u8]) -> Self {
        FrameInput::Encoded(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
    }

    /// True when the client sent nothing usable (treated as a missing field).
    pub fn is_empty(&self) -> bool {
        match self {
            FrameInput::Encoded(s) => s.trim().is_empty(),
            FrameInput::Pixels(p) => p.pixels.is_empty(),
        }
    }
}

/// Decodes client frames into RGB images at the target resolution.
#[derive(Clone, Copy, Debug)]
pub struct FrameDecoder {
    target_width: u32,
    target_height: u32,
}

impl FrameDecoder {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    pub fn decode(&self, input: &FrameInput) -> Result<RgbImage, DecodeError> {
        let image = match input {
            FrameInput::Encoded(text) => decode_encoded(text)?,
            FrameInput::Pixels(buffer) => decode_pixels(buffer)?,
        };
        if image.width() == 0 || image.height() == 0 {
            return Err(DecodeError::ZeroSize);
        }
        if image.dimensions() == (self.target_width, self.target_height) {
            return Ok(image);
        }
        Ok(imageops::resize(
            &image,
            self.target_width,
            self.target_height,
            RESIZE_FILTER,
        ))
    }
}

fn decode_encoded(text: &str) -> Result<RgbImage, DecodeError> {
    let payload = strip_data_uri(text.trim())?;
    let bytes = STANDARD.decode(payload)?;
    if bytes.is_empty() {
        return Err(DecodeError::MalformedPayload("empty image payload".into()));
    }
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// Split a data URI into its payload, validating the encoding tag.
///
/// Strings without a `data:` prefix are taken as bare base64.
fn strip_data_uri(text: &str) -> Result<&str, DecodeError> {
    let Some(rest) = text.strip_prefix("data:") else {
        if text.contains(',') {
            return Err(DecodeError::MalformedPayload(
                "payload has a ',' delimiter but no 'data:' tag".into(),
            ));
        }
        return Ok(text);
    };
    let (tag, payload) = rest
        .split_once(',')
        .ok_or_else(|| DecodeError::MalformedPayload("data URI has no ',' delimiter".into()))?;

    let mut parts = tag.split(';');
    let mime = parts.next().unwrap_or_default().trim();
    let is_base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));
    if !is_base64 {
        return Err(DecodeError::UnsupportedEncoding(format!(
            "data URI '{}' is not base64",
            tag
        )));
    }
    if !mime.is_empty() {
        if !mime.to_ascii_lowercase().starts_with("image/") {
            return Err(DecodeError::UnsupportedEncoding(format!(
                "media type '{}' is not an image",
                mime
            )));
        }
        if ImageFormat::from_mime_type(mime).is_none() {
            return Err(DecodeError::UnsupportedEncoding(format!(
                "image type '{}' is not supported",
                mime
            )));
        }
    }
    Ok(payload)
}

fn decode_pixels(buffer: &PixelBuffer) -> Result<RgbImage, DecodeError> {
    if buffer.width == 0 || buffer.height == 0 {
        return Err(DecodeError::ZeroSize);
    }
    let bytes = STANDARD.decode(buffer.pixels.trim())?;
    let expected = (buffer.width as usize)
        .checked_mul(buffer.height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| DecodeError::MalformedPayload("pixel buffer dimensions overflow".into()))?;
    if bytes.len() != expected {
        return Err(DecodeError::PixelLength {
            expected,
            actual: bytes.len(),
        });
    }
    RgbImage::from_raw(buffer.width, buffer.height, bytes).ok_or(DecodeError::PixelLength {
        expected,
        actual: 0,
    })
}

/// Encode an image as a JPEG data URI.
pub fn encode_jpeg_data_uri(image: &RgbImage) -> anyhow::Result<String> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Jpeg)?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        STANDARD.encode(bytes.into_inner())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn data_uri_is_decoded_and_resized() {
        let decoder = FrameDecoder::new(32, 24);
        let input = FrameInput::data_uri("image/png", &png_bytes(64, 64));
        let img = decoder.decode(&input).unwrap();
        assert_eq!(img.dimensions(), (32, 24));
        assert_eq!(img.get_pixel(16, 12).0[0], 200);
    }

    #[test]
    fn bare_base64_is_accepted() {
        let decoder = FrameDecoder::new(8, 8);
        let input = FrameInput::Encoded(STANDARD.encode(png_bytes(8, 8)));
        assert_eq!(decoder.decode(&input).unwrap().dimensions(), (8, 8));
    }

    #[test]
    fn corrupt_payload_is_an_image_error() {
        let decoder = FrameDecoder::new(8, 8);
        let input = FrameInput::data_uri("image/jpeg", b"definitely not a jpeg");
        assert!(matches!(decoder.decode(&input), Err(DecodeError::Image(_))));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let decoder = FrameDecoder::new(8, 8);
        let input = FrameInput::Encoded("data:image/png;base64,@@@@".into());
        assert!(matches!(
            decoder.decode(&input),
            Err(DecodeError::InvalidBase64(_))
        ));
    }

    #[test]
    fn non_base64_and_non_image_tags_are_unsupported() {
        let decoder = FrameDecoder::new(8, 8);
        for uri in [
            "data:image/png,rawdata",
            "data:text/plain;base64,aGVsbG8=",
            "data:image/x-made-up;base64,aGVsbG8=",
        ] {
            let err = decoder.decode(&FrameInput::Encoded(uri.into())).unwrap_err();
            assert!(
                matches!(err, DecodeError::UnsupportedEncoding(_)),
                "{uri}: {err}"
            );
        }
    }

    #[test]
    fn data_uri_without_delimiter_is_malformed() {
        let decoder = FrameDecoder::new(8, 8);
        let err = decoder
            .decode(&FrameInput::Encoded("data:image/png;base64".into()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn pixel_buffer_round_trips_through_resize() {
        let decoder = FrameDecoder::new(4, 2);
        let rgb = vec![255u8; 8 * 4 * 3];
        let img = decoder.decode(&FrameInput::from_rgb(8, 4, &rgb)).unwrap();
        assert_eq!(img.dimensions(), (4, 2));
        assert_eq!(img.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn pixel_buffer_length_and_zero_size_are_checked() {
        let decoder = FrameDecoder::new(4, 4);
        let short = FrameInput::from_rgb(4, 4, &[0u8; 10]);
        assert!(matches!(
            decoder.decode(&short),
            Err(DecodeError::PixelLength {
                expected: 48,
                actual: 10
            })
        ));
        let zero = FrameInput::from_rgb(0, 4, &[]);
        assert!(matches!(decoder.decode(&zero), Err(DecodeError::ZeroSize)));
    }

    #[test]
    fn wire_form_is_untagged() {
        let s: FrameInput = serde_json::from_str(r#""data:image/png;base64,AAAA""#).unwrap();
        assert!(matches!(s, FrameInput::Encoded(_)));
        let p: FrameInput =
            serde_json::from_str(r#"{"width":1,"height":1,"pixels":"AAAA"}"#).unwrap();
        assert!(matches!(p, FrameInput::Pixels(_)));
        assert!(FrameInput::Encoded("  ".into()).is_empty());
    }
}
