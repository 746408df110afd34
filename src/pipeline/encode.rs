//! Image encoding: `DynamicImage` → base64 PNG wrapped in `ImageData`.
//!
//! Vision endpoints (Ollama, vLLM, OpenAI-compatible servers) take images as
//! base64 payloads inside the JSON request. PNG keeps glyph edges intact;
//! JPEG ringing around small print costs recognition accuracy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode one prepared view as a PNG attachment with `detail: "high"`.
pub fn encode_image(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} view → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Encode every view in order.
pub fn encode_all(views: &[DynamicImage]) -> Result<Vec<ImageData>, image::ImageError> {
    views.iter().map(encode_image).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn encodes_rgb_view_as_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 8, Rgb([0, 0, 0])));
        let data = encode_image(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let bytes = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn encode_all_keeps_order() {
        let views = vec![
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)),
            DynamicImage::ImageRgb8(RgbImage::new(8, 8)),
        ];
        assert_eq!(encode_all(&views).unwrap().len(), 2);
    }
}
