//! Small pure helpers for media payloads: magic-byte MIME sniffing,
//! `data:` URL parsing and base64 round-trips.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Sniff an image media type from the payload's magic bytes.
///
/// Recognizes the formats the providers accept: PNG, JPEG, GIF and WebP.
pub fn sniff_image_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }

    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }

    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }

    // RIFF container with a WEBP chunk type.
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }

    None
}

/// A parsed `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Parse a `data:<media-type>;base64,<payload>` URL.
///
/// Plain (non-base64) payloads are accepted as UTF-8 text. A missing media
/// type defaults to `text/plain` per RFC 2397.
pub fn parse_data_url(url: &str) -> Option<DataUrl> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;

    let (media_type, is_base64) = match header.strip_suffix(";base64") {
        Some(media_type) => (media_type, true),
        None => (header, false),
    };

    let media_type = if media_type.is_empty() {
        "text/plain".to_string()
    } else {
        // Parameters like ;charset=utf-8 are irrelevant downstream.
        media_type
            .split(';')
            .next()
            .unwrap_or(media_type)
            .to_string()
    };

    let bytes = if is_base64 {
        decode_base64(payload).ok()?
    } else {
        payload.as_bytes().to_vec()
    };

    Some(DataUrl { media_type, bytes })
}

/// Render bytes as a `data:` URL for providers that only accept URLs.
pub fn to_data_url(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", encode_base64(bytes))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn sniffs_common_image_formats() {
        assert_eq!(sniff_image_media_type(PNG_HEADER), Some("image/png"));
        assert_eq!(
            sniff_image_media_type(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some("image/jpeg")
        );
        assert_eq!(sniff_image_media_type(b"GIF89a..."), Some("image/gif"));
        assert_eq!(
            sniff_image_media_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            Some("image/webp")
        );
        assert_eq!(sniff_image_media_type(b"plain text"), None);
        assert_eq!(sniff_image_media_type(b""), None);
    }

    #[test]
    fn parses_base64_data_url() {
        let url = to_data_url("image/png", PNG_HEADER);
        let parsed = parse_data_url(&url).unwrap();

        assert_eq!(parsed.media_type, "image/png");
        assert_eq!(parsed.bytes, PNG_HEADER);
    }

    #[test]
    fn parses_plain_data_url_with_parameters() {
        let parsed = parse_data_url("data:text/plain;charset=utf-8,hello").unwrap();

        assert_eq!(parsed.media_type, "text/plain");
        assert_eq!(parsed.bytes, b"hello");
    }

    #[test]
    fn missing_media_type_defaults_to_text_plain() {
        let parsed = parse_data_url("data:,hi").unwrap();
        assert_eq!(parsed.media_type, "text/plain");
    }

    #[test]
    fn rejects_non_data_urls() {
        assert!(parse_data_url("https://example.com/a.png").is_none());
        assert!(parse_data_url("data:image/png;base64").is_none());
    }

    #[test]
    fn base64_round_trip() {
        let bytes = b"\x00\x01binary\xFF";
        assert_eq!(decode_base64(&encode_base64(bytes)).unwrap(), bytes);
    }
}
