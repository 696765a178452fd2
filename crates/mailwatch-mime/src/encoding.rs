//! Transfer-encoding and charset decode primitives.
//!
//! Base64 and Quoted-Printable (RFC 2045) decoding to raw bytes, plus
//! charset conversion through `encoding_rs`. These are the only fallible
//! decoders; everything above them degrades instead of erroring.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use encoding_rs::Encoding;

use crate::error::{Error, Result};

/// Decodes Base64 input, tolerating embedded whitespace and line breaks.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64 after whitespace
/// removal.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(cleaned).map_err(Into::into)
}

/// Decodes Quoted-Printable input (RFC 2045) to raw bytes.
///
/// Handles soft line breaks (`=` before CRLF or LF). Charset conversion is
/// a separate step; see [`decode_charset`].
///
/// # Errors
///
/// Returns an error on a truncated or non-hex escape sequence.
pub fn decode_quoted_printable(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        // Soft line break: "=\r\n" or "=\n".
        if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        let hex = bytes
            .get(i + 1..i + 3)
            .ok_or_else(|| Error::InvalidEncoding("truncated escape".to_string()))?;
        let hex = std::str::from_utf8(hex)
            .map_err(|_| Error::InvalidEncoding("non-ASCII escape".to_string()))?;
        let byte = u8::from_str_radix(hex, 16)
            .map_err(|e| Error::InvalidEncoding(format!("bad hex escape: {e}")))?;
        out.push(byte);
        i += 3;
    }

    Ok(out)
}

/// Converts bytes in the named charset to a `String`.
///
/// UTF-8 and every charset `encoding_rs` knows decode properly; an unknown
/// label falls back to lossy UTF-8 so bytes always come through.
#[must_use]
pub fn decode_charset(bytes: &[u8], charset: &str) -> String {
    Encoding::for_label(charset.as_bytes()).map_or_else(
        || String::from_utf8_lossy(bytes).into_owned(),
        |encoding| {
            let (text, _, _) = encoding.decode(bytes);
            text.into_owned()
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base64_with_line_breaks() {
        let decoded = decode_base64("SGVs\r\nbG8s\nIFdvcmxkIQ==").unwrap();
        assert_eq!(decoded, b"Hello, World!");
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(decode_base64("not base64!!!").is_err());
    }

    #[test]
    fn quoted_printable_basic() {
        assert_eq!(
            decode_quoted_printable("H=C3=A9llo").unwrap(),
            "Héllo".as_bytes()
        );
    }

    #[test]
    fn quoted_printable_soft_break() {
        assert_eq!(
            decode_quoted_printable("Hello=\r\nWorld").unwrap(),
            b"HelloWorld"
        );
        assert_eq!(decode_quoted_printable("Hello=\nWorld").unwrap(), b"HelloWorld");
    }

    #[test]
    fn quoted_printable_truncated_escape() {
        assert!(decode_quoted_printable("oops=4").is_err());
        assert!(decode_quoted_printable("oops=ZZ-").is_err());
    }

    #[test]
    fn charset_utf8() {
        assert_eq!(decode_charset("héllo".as_bytes(), "utf-8"), "héllo");
    }

    #[test]
    fn charset_latin1() {
        assert_eq!(decode_charset(&[0x68, 0xE9, 0x6C], "iso-8859-1"), "hél");
    }

    #[test]
    fn unknown_charset_is_lossy_passthrough() {
        assert_eq!(decode_charset(b"plain", "x-no-such-charset"), "plain");
    }
}
