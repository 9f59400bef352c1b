//! Image encoding for model requests.
//!
//! Rasterised PDF pages are PNG-encoded once, in the extraction worker, and
//! travel as bytes from then on. Each backend wraps those bytes the way its
//! transport expects: a temp file for the local runtime, a base64 data URL
//! for OpenAI-compatible endpoints, an [`ImageData`] for `edgequake-llm`.
//!
//! PNG rather than JPEG because it is lossless; compression artefacts on
//! rendered text hurt recognition more than the larger payload does.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// `data:<mime>;base64,<payload>` for JSON request bodies.
pub fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Wrap image bytes for an `edgequake-llm` provider.
///
/// `detail: "high"` lets GPT-4-class models tile the full image instead of
/// reading a single low-resolution overview.
pub fn image_data(mime_type: &str, bytes: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(bytes), mime_type).with_detail("high")
}

/// File extension matching a MIME type, for temp files handed to tools that
/// sniff by name.
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert!(png.starts_with(b"\x89PNG"));
    }

    #[test]
    fn data_url_shape() {
        let url = data_url("image/jpeg", b"abc");
        assert_eq!(url, "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn image_data_is_base64() {
        let data = image_data("image/png", b"\x89PNG");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, b"\x89PNG");
    }

    #[test]
    fn mime_extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }
}
