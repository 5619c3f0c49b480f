//! Supported upload formats, detected from magic bytes.

use image::ImageFormat;
use serde::Serialize;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Gif,
    Webp,
}

impl DocumentFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Tiff => "image/tiff",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }

    pub fn is_pdf(self) -> bool {
        self == Self::Pdf
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence {
            "application/pdf" => Some(Self::Pdf),
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/tiff" => Some(Self::Tiff),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF-") {
            return Some(Self::Pdf);
        }
        match image::guess_format(bytes).ok()? {
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Tiff => Some(Self::Tiff),
            ImageFormat::Gif => Some(Self::Gif),
            ImageFormat::WebP => Some(Self::Webp),
            _ => None,
        }
    }

    /// Decide the format from the bytes, cross-checked against the declared
    /// mime type. The bytes win when both name a supported format, since
    /// browsers routinely mislabel `.jpg` as `image/png` and vice versa.
    /// `application/octet-stream` and an empty mime defer to sniffing.
    pub fn detect(bytes: &[u8], declared_mime: &str) -> Result<Self, ServiceError> {
        let declared = declared_mime.trim();
        let generic = declared.is_empty() || declared.starts_with("application/octet-stream");

        if !generic && Self::from_mime(declared).is_none() {
            return Err(ServiceError::UnsupportedFormat(format!(
                "mime type {declared:?} is not a supported document type"
            )));
        }

        Self::sniff(bytes).ok_or_else(|| {
            ServiceError::UnsupportedFormat(format!(
                "content ({} bytes, declared {declared:?}) is not a PDF or supported image",
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

    #[test]
    fn test_detects_by_magic() {
        assert_eq!(
            DocumentFormat::detect(b"%PDF-1.7\n...", "application/pdf").unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(DocumentFormat::detect(PNG, "image/png").unwrap(), DocumentFormat::Png);
        assert_eq!(DocumentFormat::detect(JPEG, "").unwrap(), DocumentFormat::Jpeg);
    }

    #[test]
    fn test_bytes_win_over_mislabelled_image_mime() {
        assert_eq!(DocumentFormat::detect(JPEG, "image/png").unwrap(), DocumentFormat::Jpeg);
    }

    #[test]
    fn test_rejects_unsupported_mime() {
        let err = DocumentFormat::detect(PNG, "application/msword").unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedFormat(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejects_unrecognized_bytes() {
        let err = DocumentFormat::detect(b"just some text", "image/png").unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedFormat(_)));
        assert!(DocumentFormat::detect(b"", "application/octet-stream").is_err());
    }
}
