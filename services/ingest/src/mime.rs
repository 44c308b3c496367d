//! Mime type resolution for uploads.
//!
//! Precedence is fixed: a usable explicit hint wins, then the payload's magic
//! bytes, then `application/octet-stream`. Resolution happens once, here, so
//! the storage side never depends on a sniffing library.

/// Generic binary type used when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Resolve the mime type to publish for an upload
pub fn resolve_mime_type(hint: Option<&str>, payload: &[u8]) -> String {
    if let Some(explicit) = hint.and_then(normalize_hint) {
        return explicit;
    }

    sniff(payload)
        .map(str::to_string)
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Mime type from the payload's magic bytes, if recognizable
pub fn sniff(payload: &[u8]) -> Option<&'static str> {
    infer::get(payload).map(|kind| kind.mime_type())
}

/// Normalize a caller-supplied hint.
///
/// Returns `None` for blank, generic or syntactically invalid values.
/// Parameters (`; charset=...`) are dropped and the result is lowercased.
pub fn normalize_hint(hint: &str) -> Option<String> {
    let essence = hint.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

    let (kind, subtype) = essence.split_once('/')?;
    if !is_token(kind) || !is_token(subtype) {
        return None;
    }
    if essence == OCTET_STREAM {
        return None;
    }

    Some(essence)
}

fn is_token(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 16, b'J', b'F', b'I', b'F'];

    #[test]
    fn test_explicit_hint_wins_over_sniffing() {
        assert_eq!(resolve_mime_type(Some("image/webp"), PNG), "image/webp");
    }

    #[test]
    fn test_hint_is_normalized() {
        assert_eq!(
            normalize_hint(" Image/PNG; charset=binary "),
            Some("image/png".to_string())
        );
        assert_eq!(normalize_hint("image/svg+xml"), Some("image/svg+xml".to_string()));
    }

    #[test]
    fn test_generic_or_invalid_hint_falls_back_to_sniffing() {
        assert_eq!(resolve_mime_type(Some(OCTET_STREAM), PNG), "image/png");
        assert_eq!(resolve_mime_type(Some(""), JPEG), "image/jpeg");
        assert_eq!(resolve_mime_type(Some("png"), PNG), "image/png");
        assert_eq!(resolve_mime_type(Some("image/"), PNG), "image/png");
        assert_eq!(resolve_mime_type(None, PNG), "image/png");
    }

    #[test]
    fn test_unrecognized_payload_is_octet_stream() {
        assert_eq!(resolve_mime_type(None, b"just some text"), OCTET_STREAM);
        assert_eq!(sniff(b"just some text"), None);
    }
}
