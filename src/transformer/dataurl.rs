//! Data-URL parsing for image payloads crossing provider formats.
//!
//! Format: `data:[<mediatype>][;base64],<data>`

/// A parsed data URL.
#[derive(Debug, Clone, PartialEq)]
pub struct DataUrl {
    pub media_type: String,
    pub data: String,
    pub is_base64: bool,
}

/// Parse a data URL; `None` for anything else.
pub fn parse_data_url(url: &str) -> Option<DataUrl> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;

    let mut header_parts = header.split(';');
    let mut media_type = header_parts.next().unwrap_or("").to_string();
    if media_type.is_empty() {
        // RFC 2397 default
        media_type = "text/plain".to_string();
    }
    let is_base64 = header_parts.any(|p| p.trim() == "base64");

    Some(DataUrl {
        media_type,
        data: data.to_string(),
        is_base64,
    })
}

/// The raw data portion of a data URL; non-data URLs pass through unchanged.
pub fn extract_base64(url: &str) -> &str {
    if !url.starts_with("data:") {
        return url;
    }
    match url.split_once(',') {
        Some((_, data)) => data,
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base64_image() {
        let parsed = parse_data_url("data:image/png;base64,iVBORw0KGgo").unwrap();
        assert_eq!(parsed.media_type, "image/png");
        assert_eq!(parsed.data, "iVBORw0KGgo");
        assert!(parsed.is_base64);
    }

    #[test]
    fn test_parse_plain_data_url() {
        let parsed = parse_data_url("data:,Hello%20World").unwrap();
        assert_eq!(parsed.media_type, "text/plain");
        assert!(!parsed.is_base64);
    }

    #[test]
    fn test_parse_rejects_non_data_urls() {
        assert!(parse_data_url("https://example.com/a.png").is_none());
        assert!(parse_data_url("data:no-comma").is_none());
    }

    #[test]
    fn test_extract_base64() {
        assert_eq!(extract_base64("data:image/png;base64,abc"), "abc");
        assert_eq!(
            extract_base64("https://example.com/a.png"),
            "https://example.com/a.png"
        );
    }
}
