//! TUS 1.0.0 header conventions
//!
//! `Upload-Metadata` is a comma-separated list of `key value` pairs where the
//! value is base64 encoded and may be omitted. Keys must be unique, non-empty
//! and free of spaces and commas.

use crate::{Metadata, Result, TuskError, UploadInfo};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,expiration,termination";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_TUS_VERSION: &str = "Tus-Version";
pub const HEADER_TUS_EXTENSION: &str = "Tus-Extension";
pub const HEADER_TUS_MAX_SIZE: &str = "Tus-Max-Size";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_EXPIRES: &str = "Upload-Expires";

/// Parse an `Upload-Metadata` header value
pub fn parse_metadata_header(header: &str) -> Result<Metadata> {
    let mut metadata = Metadata::new();

    if header.trim().is_empty() {
        return Ok(metadata);
    }

    for pair in header.split(',') {
        let pair = pair.trim();
        let mut parts = pair.split(' ').filter(|p| !p.is_empty());

        let key = parts
            .next()
            .ok_or_else(|| TuskError::Validation("empty metadata entry".to_string()))?;
        let encoded = parts.next();

        if parts.next().is_some() {
            return Err(TuskError::Validation(format!(
                "metadata entry '{}' has more than one value",
                key
            )));
        }

        let value = match encoded {
            Some(encoded) => {
                let bytes = STANDARD.decode(encoded).map_err(|e| {
                    TuskError::Validation(format!("metadata value for '{}' is not base64: {}", key, e))
                })?;
                String::from_utf8(bytes).map_err(|_| {
                    TuskError::Validation(format!("metadata value for '{}' is not UTF-8", key))
                })?
            }
            None => String::new(),
        };

        if metadata.insert(key.to_string(), value).is_some() {
            return Err(TuskError::Validation(format!("duplicate metadata key '{}'", key)));
        }
    }

    Ok(metadata)
}

/// Encode metadata as an `Upload-Metadata` header value (keys in sorted order)
pub fn encode_metadata_header(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{} {}", key, STANDARD.encode(value.as_bytes()))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse an `Upload-Length` header value
///
/// Returned signed so callers can report non-positive lengths as validation
/// failures instead of parse failures.
pub fn parse_upload_length(header: &str) -> Result<i64> {
    header
        .trim()
        .parse::<i64>()
        .map_err(|_| TuskError::Validation(format!("invalid {} '{}'", HEADER_UPLOAD_LENGTH, header)))
}

/// Parse an `Upload-Offset` header value
pub fn parse_upload_offset(header: &str) -> Result<u64> {
    header
        .trim()
        .parse::<u64>()
        .map_err(|_| TuskError::Validation(format!("invalid {} '{}'", HEADER_UPLOAD_OFFSET, header)))
}

/// Check the `Tus-Resumable` header a client sent
pub fn check_resumable(header: Option<&str>) -> Result<()> {
    match header {
        Some(v) if v.trim() == TUS_VERSION => Ok(()),
        Some(v) => Err(TuskError::Validation(format!(
            "unsupported {} version '{}'",
            HEADER_TUS_RESUMABLE, v
        ))),
        None => Err(TuskError::Validation(format!("missing {} header", HEADER_TUS_RESUMABLE))),
    }
}

/// Headers advertising server capabilities, as sent in reply to `OPTIONS`
pub fn capability_headers(max_size: u64) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_TUS_RESUMABLE, TUS_VERSION.to_string()),
        (HEADER_TUS_VERSION, TUS_VERSION.to_string()),
        (HEADER_TUS_EXTENSION, TUS_EXTENSIONS.to_string()),
        (HEADER_TUS_MAX_SIZE, max_size.to_string()),
    ]
}

/// Headers describing an upload, as sent in reply to `HEAD`
///
/// `Upload-Metadata` is omitted when empty and `Upload-Expires` when the
/// upload never expires.
pub fn status_headers(info: &UploadInfo) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (HEADER_TUS_RESUMABLE, TUS_VERSION.to_string()),
        (HEADER_UPLOAD_OFFSET, info.offset.to_string()),
        (HEADER_UPLOAD_LENGTH, info.size.to_string()),
    ];
    if !info.metadata.is_empty() {
        headers.push((HEADER_UPLOAD_METADATA, encode_metadata_header(&info.metadata)));
    }
    if let Some(expires_at) = info.expires_at {
        headers.push((
            HEADER_UPLOAD_EXPIRES,
            expires_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        ));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_header() {
        // "filename" -> "world_domination_plan.pdf", "is_confidential" has no value
        let header = "filename d29ybGRfZG9taW5hdGlvbl9wbGFuLnBkZg==,is_confidential";
        let metadata = parse_metadata_header(header).unwrap();
        assert_eq!(metadata.get("filename").unwrap(), "world_domination_plan.pdf");
        assert_eq!(metadata.get("is_confidential").unwrap(), "");
    }

    #[test]
    fn test_parse_tolerates_whitespace_around_pairs() {
        let metadata = parse_metadata_header(" title dGVzdA== , semester Nw==").unwrap();
        assert_eq!(metadata.get("title").unwrap(), "test");
        assert_eq!(metadata.get("semester").unwrap(), "7");
    }

    #[test]
    fn test_parse_empty_header() {
        assert!(parse_metadata_header("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_metadata_header("title not*base64").is_err());
        assert!(parse_metadata_header("a YQ==,a Yg==").is_err());
        assert!(parse_metadata_header("a YQ== extra").is_err());
        assert!(parse_metadata_header("a YQ==,,b Yg==").is_err());
        // 0xff is not valid UTF-8
        assert!(parse_metadata_header("a /w==").is_err());
    }

    #[test]
    fn test_encode_is_sorted() {
        let mut metadata = Metadata::new();
        metadata.insert("title".into(), "test".into());
        metadata.insert("flag".into(), String::new());
        assert_eq!(encode_metadata_header(&metadata), "flag,title dGVzdA==");
    }

    #[test]
    fn test_upload_length_and_offset() {
        assert_eq!(parse_upload_length("1024").unwrap(), 1024);
        assert_eq!(parse_upload_length("-5").unwrap(), -5);
        assert!(parse_upload_length("ten").is_err());
        assert_eq!(parse_upload_offset(" 42 ").unwrap(), 42);
        assert!(parse_upload_offset("-1").is_err());
    }

    #[test]
    fn test_capability_headers() {
        let headers = capability_headers(1024);
        assert!(headers.contains(&(HEADER_TUS_VERSION, "1.0.0".to_string())));
        assert!(headers.contains(&(HEADER_TUS_MAX_SIZE, "1024".to_string())));
        assert!(headers.contains(&(HEADER_TUS_EXTENSION, TUS_EXTENSIONS.to_string())));
    }

    #[test]
    fn test_status_headers() {
        use chrono::TimeZone;

        let id = crate::UploadId::new("h1").unwrap();
        let mut info = UploadInfo::new(id, 100, Metadata::new());
        info.offset = 40;

        let headers = status_headers(&info);
        assert!(headers.contains(&(HEADER_UPLOAD_OFFSET, "40".to_string())));
        assert!(headers.contains(&(HEADER_UPLOAD_LENGTH, "100".to_string())));
        assert!(headers.iter().all(|(name, _)| *name != HEADER_UPLOAD_METADATA));
        assert!(headers.iter().all(|(name, _)| *name != HEADER_UPLOAD_EXPIRES));

        info.metadata.insert("filename".into(), "a.pdf".into());
        info.expires_at = Some(chrono::Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap());
        let headers = status_headers(&info);
        assert!(headers.contains(&(HEADER_UPLOAD_METADATA, "filename YS5wZGY=".to_string())));
        assert!(headers.contains(&(HEADER_UPLOAD_EXPIRES, "Tue, 05 Mar 2024 14:07:09 GMT".to_string())));
    }

    #[test]
    fn test_check_resumable() {
        assert!(check_resumable(Some("1.0.0")).is_ok());
        assert!(check_resumable(Some("0.2.2")).is_err());
        assert!(check_resumable(None).is_err());
    }
}
