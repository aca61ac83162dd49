//! Multipart framing for single-file firmware uploads.
//!
//! A browser or `curl -F` upload of one file looks like this on the wire:
//!
//! ```text
//! --<token>\r\n                                  opening boundary line
//! Content-Disposition: form-data; ...\r\n        part headers
//! Content-Type: application/octet-stream\r\n
//! \r\n                                           end of header block
//! <payload bytes>
//! \r\n--<token>--\r\n                            closing boundary
//! ```
//!
//! The checks here run once per session. The payload length is derived from
//! the declared content length ([`FramingBounds`]) so the payload itself is
//! never scanned for boundary text; binary images may contain anything.

use crate::error::{Error, Result};

/// Line terminator used by multipart framing.
pub const CRLF: &[u8] = b"\r\n";

/// Marker ending the per-part header block.
pub const HEADER_END: &[u8] = b"\r\n\r\n";

/// Prefix turning a boundary token into a delimiter.
pub const DELIMITER_PREFIX: &[u8] = b"--";

/// Control bytes around the closing delimiter (CRLF before and after).
pub const CLOSING_CONTROL_LEN: usize = 4;

/// Maximum boundary token length (RFC 2046).
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Extract the boundary token from a `multipart/form-data` content type.
///
/// The parameter name is matched case-insensitively, the value keeps its
/// case and may be quoted.
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';');
    let media_type = params.next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return Err(Error::InvalidArgument(format!(
            "expected multipart/form-data, got '{media_type}'"
        )));
    }

    for param in params {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        let token = value.trim().trim_matches('"');
        validate_token(token)?;
        return Ok(token.to_string());
    }

    Err(Error::InvalidArgument(
        "no boundary in Content-Type".into(),
    ))
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_BOUNDARY_LEN {
        return Err(Error::InvalidArgument(format!(
            "boundary length must be 1..={MAX_BOUNDARY_LEN}, got {}",
            token.len()
        )));
    }
    if !token.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(Error::InvalidArgument(
            "boundary contains non-printable characters".into(),
        ));
    }
    Ok(())
}

/// Build the delimiter line `--<token>\r\n` that opens the part.
pub fn opening_line(token: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(DELIMITER_PREFIX.len() + token.len() + CRLF.len());
    line.extend_from_slice(DELIMITER_PREFIX);
    line.extend_from_slice(token.as_bytes());
    line.extend_from_slice(CRLF);
    line
}

/// Build the closing frame `\r\n--<token>--\r\n` that ends the body.
pub fn closing_frame(token: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(token.len() + 2 * DELIMITER_PREFIX.len() + CLOSING_CONTROL_LEN);
    frame.extend_from_slice(CRLF);
    frame.extend_from_slice(DELIMITER_PREFIX);
    frame.extend_from_slice(token.as_bytes());
    frame.extend_from_slice(DELIMITER_PREFIX);
    frame.extend_from_slice(CRLF);
    frame
}

/// Check that `buf` starts with the opening boundary line.
///
/// Returns the number of bytes the line occupies.
pub fn check_opening(buf: &[u8], token: &str) -> Result<usize> {
    let expected = opening_line(token);
    if buf.len() < expected.len() {
        return Err(Error::InvalidArgument(format!(
            "opening boundary needs {} bytes, only {} read",
            expected.len(),
            buf.len()
        )));
    }
    if !buf.starts_with(&expected) {
        return Err(Error::InvalidArgument(
            "body does not start with the declared boundary".into(),
        ));
    }
    Ok(expected.len())
}

/// Find the end of the part header block.
///
/// Returns the number of bytes up to and including the blank line.
pub fn find_header_end(buf: &[u8]) -> Result<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|pos| pos + HEADER_END.len())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "end of part headers not found in {} bytes",
                buf.len()
            ))
        })
}

/// Check that `buf` is exactly the closing frame.
pub fn check_closing(buf: &[u8], token: &str) -> Result<usize> {
    let expected = closing_frame(token);
    if buf != expected.as_slice() {
        return Err(Error::TransferFailure(format!(
            "closing boundary mismatch ({} trailing bytes)",
            buf.len()
        )));
    }
    Ok(expected.len())
}

/// Framing lengths derived once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingBounds {
    /// Length of the delimiter `--<token>`.
    pub boundary_length: usize,
    /// Length of the closing delimiter `--<token>--`.
    pub final_boundary_length: usize,
    /// Payload bytes between the header block and the closing frame.
    pub payload_size: usize,
}

impl FramingBounds {
    /// Derive the payload size from the bytes left after the header block.
    ///
    /// Fails with `NotFound` when no payload byte remains.
    pub fn compute(bytes_remaining: usize, token: &str) -> Result<Self> {
        let boundary_length = DELIMITER_PREFIX.len() + token.len();
        let final_boundary_length = boundary_length + DELIMITER_PREFIX.len();
        let trailer = final_boundary_length + CLOSING_CONTROL_LEN;

        match bytes_remaining.checked_sub(trailer) {
            Some(payload_size) if payload_size > 0 => Ok(Self {
                boundary_length,
                final_boundary_length,
                payload_size,
            }),
            _ => Err(Error::NotFound(format!(
                "no file in upload ({bytes_remaining} bytes left, closing frame takes {trailer})"
            ))),
        }
    }

    /// Length of the closing frame including control bytes.
    pub fn trailer_len(&self) -> usize {
        self.final_boundary_length + CLOSING_CONTROL_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_from_content_type() {
        let token = boundary_from_content_type(
            "multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZu0gW",
        )
        .unwrap();
        assert_eq!(token, "----WebKitFormBoundary7MA4YWxkTrZu0gW");

        let token =
            boundary_from_content_type(r#"Multipart/Form-Data; charset=utf-8; BOUNDARY="q b""#)
                .unwrap();
        assert_eq!(token, "q b");
    }

    #[test]
    fn test_boundary_from_content_type_rejects() {
        assert!(matches!(
            boundary_from_content_type("application/octet-stream"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(boundary_from_content_type("multipart/form-data").is_err());
        assert!(boundary_from_content_type("multipart/form-data; boundary=").is_err());
        let long = format!("multipart/form-data; boundary={}", "a".repeat(71));
        assert!(boundary_from_content_type(&long).is_err());
    }

    #[test]
    fn test_check_opening() {
        let body = b"--XYZ\r\nContent-Disposition: form-data\r\n\r\n";
        assert_eq!(check_opening(body, "XYZ").unwrap(), 7);
        assert!(matches!(
            check_opening(body, "ABC"),
            Err(Error::InvalidArgument(_))
        ));
        // Short read cannot hold the line.
        assert!(check_opening(b"--XY", "XYZ").is_err());
        // Missing line terminator.
        assert!(check_opening(b"--XYZ--\r\n", "XYZ").is_err());
    }

    #[test]
    fn test_find_header_end() {
        let headers = b"Content-Disposition: form-data; name=\"f\"\r\nContent-Type: x\r\n\r\nDATA";
        let end = find_header_end(headers).unwrap();
        assert_eq!(&headers[end..], b"DATA");
        assert!(matches!(
            find_header_end(b"Content-Type: x\r\n"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_check_closing() {
        assert_eq!(check_closing(b"\r\n--XYZ--\r\n", "XYZ").unwrap(), 11);

        let good = closing_frame("XYZ");
        for i in 0..good.len() {
            let mut bad = good.clone();
            bad[i] ^= 0x20;
            assert!(
                matches!(check_closing(&bad, "XYZ"), Err(Error::TransferFailure(_))),
                "corrupted byte {i} must be rejected"
            );
        }
        assert!(check_closing(&good[..good.len() - 1], "XYZ").is_err());
    }

    #[test]
    fn test_framing_bounds() {
        let bounds = FramingBounds::compute(911, "XYZ").unwrap();
        assert_eq!(bounds.boundary_length, 5);
        assert_eq!(bounds.final_boundary_length, 7);
        assert_eq!(bounds.trailer_len(), 11);
        assert_eq!(bounds.payload_size, 900);
    }

    #[test]
    fn test_framing_bounds_no_file() {
        assert!(matches!(
            FramingBounds::compute(11, "XYZ"),
            Err(Error::NotFound(_))
        ));
        // Fewer bytes than the closing frame itself.
        assert!(matches!(
            FramingBounds::compute(3, "XYZ"),
            Err(Error::NotFound(_))
        ));
    }
}
