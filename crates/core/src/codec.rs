//! Upload decoding and response encoding.
//!
//! Uploads are decoded into interleaved RGB8; results go back out as
//! lossless PNG wrapped in a `data:image/png;base64,` URL so the client can
//! render the payload directly.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, RgbImage};

use crate::error::EnhanceError;

pub const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Decoded pixel buffer, interleaved RGB8. Channel order is preserved from
/// the source encoding; no colorspace conversion happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawImage {
    pub fn dimensions(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Decode uploaded bytes (PNG/JPEG) into RGB8. A decode failure is an
/// inference-stage error per the request lifecycle, not a validation one:
/// the payload looked like an image but could not be read.
pub fn decode_image(bytes: &[u8]) -> Result<RawImage, EnhanceError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| EnhanceError::Inference(format!("could not decode image: {e}")))?;

    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    Ok(RawImage {
        data: rgb.into_raw(),
        width,
        height,
    })
}

/// Encode RGB8 pixels as lossless PNG.
pub fn encode_png(image: &RawImage) -> Result<Vec<u8>, EnhanceError> {
    let rgb = RgbImage::from_raw(image.width, image.height, image.data.clone()).ok_or_else(
        || {
            EnhanceError::Encoding(format!(
                "pixel buffer length {} does not match {}x{}",
                image.data.len(),
                image.width,
                image.height
            ))
        },
    )?;

    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| EnhanceError::Encoding(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}

/// Wrap PNG bytes in a renderable data URL.
pub fn to_data_url(png_bytes: &[u8]) -> String {
    format!("{DATA_URL_PREFIX}{}", STANDARD.encode(png_bytes))
}
