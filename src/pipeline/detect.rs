//! File-type dispatch: decide whether an upload is a PDF or a single image.
//!
//! The extension decides first, matching what users expect from the file
//! name. Files with no recognised extension fall back to magic bytes, so a
//! `scan` downloaded without a suffix still works. Anything else is an
//! [`JobError::UnsupportedFileType`] for that file only.

use crate::error::JobError;
use crate::output::JobKind;
use image::ImageFormat;

/// Extensions accepted as single-page images.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "webp", "bmp", "tiff", "tif"];

/// The detected kind plus the MIME type sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedType {
    pub kind: JobKind,
    pub mime_type: &'static str,
}

/// Classify an upload by extension, then by content.
pub fn detect(filename: &str, bytes: &[u8]) -> Result<DetectedType, JobError> {
    let extension = extension_of(filename);

    match extension.as_deref() {
        Some("pdf") => Ok(pdf()),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Ok(DetectedType {
            kind: JobKind::Image,
            mime_type: sniff_image(bytes).unwrap_or_else(|| mime_for_extension(ext)),
        }),
        Some(ext) => Err(JobError::UnsupportedFileType {
            filename: filename.to_string(),
            extension: ext.to_string(),
        }),
        None if bytes.starts_with(b"%PDF") => Ok(pdf()),
        None => match sniff_image(bytes) {
            Some(mime_type) => Ok(DetectedType {
                kind: JobKind::Image,
                mime_type,
            }),
            None => Err(JobError::UnsupportedFileType {
                filename: filename.to_string(),
                extension: String::new(),
            }),
        },
    }
}

fn pdf() -> DetectedType {
    DetectedType {
        kind: JobKind::Pdf,
        mime_type: "application/pdf",
    }
}

fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/tiff",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF\xE0\0\x10JFIF\0";

    #[test]
    fn pdf_by_extension() {
        let t = detect("Report.PDF", b"%PDF-1.7").unwrap();
        assert_eq!(t.kind, JobKind::Pdf);
    }

    #[test]
    fn image_extensions() {
        for name in ["a.png", "a.jpg", "a.JPEG", "a.webp", "a.bmp", "a.tiff"] {
            assert_eq!(detect(name, b"").unwrap().kind, JobKind::Image, "{name}");
        }
    }

    #[test]
    fn image_mime_prefers_content() {
        // A PNG mislabelled as .jpg is still sent as PNG.
        let t = detect("photo.jpg", PNG_MAGIC).unwrap();
        assert_eq!(t.mime_type, "image/png");
        let t = detect("photo.jpg", b"garbage").unwrap();
        assert_eq!(t.mime_type, "image/jpeg");
    }

    #[test]
    fn unsupported_extension() {
        let err = detect("notes.docx", b"PK").unwrap_err();
        assert!(matches!(err, JobError::UnsupportedFileType { ref extension, .. } if extension == "docx"));
    }

    #[test]
    fn no_extension_falls_back_to_magic() {
        assert_eq!(detect("scan", b"%PDF-1.4").unwrap().kind, JobKind::Pdf);
        let t = detect("photo", JPEG_MAGIC).unwrap();
        assert_eq!((t.kind, t.mime_type), (JobKind::Image, "image/jpeg"));
        assert!(detect("blob", b"hello").is_err());
    }
}
