use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Image formats every backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
        }
    }

    /// Nova's `image.format` value.
    pub fn short_name(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    /// Detect the format from magic bytes. Callers label images
    /// inconsistently, so the declared type is never trusted.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(PNG) {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    /// Sniff a base64 payload, decoding only as much as the signatures need.
    /// Unrecognised or undecodable data is treated as JPEG.
    pub fn sniff_base64(data: &str) -> Self {
        let data = strip_data_url(data);
        let head: String = data
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .take(16)
            .collect();
        let decoded = STANDARD
            .decode(head.as_bytes())
            .or_else(|_| STANDARD.decode(data.trim()))
            .unwrap_or_default();
        Self::sniff(&decoded).unwrap_or(ImageFormat::Jpeg)
    }
}

/// Drop a `data:image/...;base64,` prefix if the caller sent a data URL.
pub fn strip_data_url(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, payload)) = data.split_once(',') {
            return payload;
        }
    }
    data
}
