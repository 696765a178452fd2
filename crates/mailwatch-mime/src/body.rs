//! Body extraction: multipart traversal and transfer-decoding.
//!
//! `parse_body` is deliberately infallible. Real mail is full of spec
//! violations, and a sync engine is better served by a partial body than
//! by an error, so every decode failure degrades to passthrough.

use crate::encoding::{decode_base64, decode_charset, decode_quoted_printable};
use crate::header::Headers;

/// Attachment descriptor extracted during body traversal.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentInfo {
    /// Filename from the disposition or type parameters.
    pub filename: String,
    /// Size of the (decoded, when decodable) part body in bytes.
    pub size_bytes: u32,
    /// Lowercased `type/subtype`.
    pub content_type: String,
}

/// Decoded message body.
#[derive(Debug, Clone, Default)]
pub struct ParsedBody {
    /// Concatenated text/plain content.
    pub text: String,
    /// First text/html part, when present.
    pub html: Option<String>,
    /// Attachments in part order.
    pub attachments: Vec<AttachmentInfo>,
}

/// Transfer encoding of a part (RFC 2045).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferEncoding {
    Identity,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            _ => Self::Identity,
        }
    }
}

/// Parses a complete raw message (headers plus body) into text, HTML, and
/// attachment placeholders. Never fails.
#[must_use]
pub fn parse_body(raw: &[u8]) -> ParsedBody {
    let mut out = ParsedBody::default();
    let (headers, body) = split_message(raw);
    walk(&headers, body, &mut out);
    out
}

fn walk(headers: &Headers, body: &[u8], out: &mut ParsedBody) {
    let content_type = headers.get("Content-Type").unwrap_or("text/plain");
    let (essence, params) = parse_content_type(content_type);

    if essence.starts_with("multipart/") {
        let Some(boundary) = param(&params, "boundary") else {
            // No boundary: treat the whole body as text rather than drop it.
            append_text(out, &decode_text(headers, body, &params));
            return;
        };
        for part in split_parts(body, boundary) {
            let (part_headers, part_body) = split_message(part);
            walk(&part_headers, part_body, out);
        }
        return;
    }

    match essence.as_str() {
        "text/plain" => append_text(out, &decode_text(headers, body, &params)),
        "text/html" => {
            if out.html.is_none() {
                out.html = Some(decode_text(headers, body, &params));
            }
        }
        _ => out.attachments.push(attachment_info(headers, body, &essence, &params)),
    }
}

fn append_text(out: &mut ParsedBody, text: &str) {
    if !out.text.is_empty() {
        out.text.push('\n');
    }
    out.text.push_str(text);
}

fn decode_text(headers: &Headers, body: &[u8], type_params: &[(String, String)]) -> String {
    let bytes = decode_transfer(headers, body);
    let charset = param(type_params, "charset").unwrap_or("utf-8");
    decode_charset(&bytes, charset)
}

/// Decodes the part body per its Content-Transfer-Encoding, passing the
/// raw bytes through when decoding fails.
fn decode_transfer(headers: &Headers, body: &[u8]) -> Vec<u8> {
    let encoding = headers
        .get("Content-Transfer-Encoding")
        .map_or(TransferEncoding::Identity, TransferEncoding::parse);
    match encoding {
        TransferEncoding::Identity => body.to_vec(),
        TransferEncoding::Base64 => {
            decode_base64(&String::from_utf8_lossy(body)).unwrap_or_else(|_| body.to_vec())
        }
        TransferEncoding::QuotedPrintable => decode_quoted_printable(&String::from_utf8_lossy(body))
            .unwrap_or_else(|_| body.to_vec()),
    }
}

fn attachment_info(
    headers: &Headers,
    body: &[u8],
    essence: &str,
    type_params: &[(String, String)],
) -> AttachmentInfo {
    let disposition_params = headers
        .get("Content-Disposition")
        .map(|v| parse_content_type(v).1)
        .unwrap_or_default();

    let filename = param(&disposition_params, "filename")
        .or_else(|| param(type_params, "name"))
        .unwrap_or("attachment")
        .to_string();

    let decoded = decode_transfer(headers, body);
    AttachmentInfo {
        filename,
        size_bytes: u32::try_from(decoded.len()).unwrap_or(u32::MAX),
        content_type: essence.to_string(),
    }
}

/// Splits a raw message at the first blank line into headers and body.
fn split_message(raw: &[u8]) -> (Headers, &[u8]) {
    let split = find_blank_line(raw);
    match split {
        Some((header_end, body_start)) => {
            (Headers::parse(&raw[..header_end]), &raw[body_start..])
        }
        // No blank line: the whole thing is headers with an empty body.
        None => (Headers::parse(raw), &[][..]),
    }
}

fn find_blank_line(raw: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    find(raw, b"\n\n").map(|pos| (pos, pos + 2))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a multipart body on its boundary, yielding the raw parts
/// (headers included) between the opening and closing delimiters.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{boundary}");
    let delim = delim.as_bytes();

    let mut parts = Vec::new();
    let mut cursor = body;
    let mut in_part: Option<usize> = None;
    let mut offset = 0;

    while let Some(pos) = find(cursor, delim) {
        let line_start = offset + pos;
        if let Some(start) = in_part {
            // A part ends just before the delimiter line (and its CRLF).
            let mut end = line_start;
            if end >= 2 && body[end - 2..end] == *b"\r\n" {
                end -= 2;
            } else if end >= 1 && body[end - 1] == b'\n' {
                end -= 1;
            }
            if end > start {
                parts.push(&body[start..end]);
            }
        }

        let after = line_start + delim.len();
        if body[after..].starts_with(b"--") {
            // Closing delimiter.
            break;
        }
        // Skip the delimiter's own line ending.
        let mut start = after;
        if body[start..].starts_with(b"\r\n") {
            start += 2;
        } else if body[start..].starts_with(b"\n") {
            start += 1;
        }
        in_part = Some(start);
        offset = start;
        cursor = &body[start..];
    }

    parts
}

/// Parses `type/subtype; key=value; ...`, lowercasing the essence and the
/// parameter keys and stripping quotes from values.
fn parse_content_type(value: &str) -> (String, Vec<(String, String)>) {
    let mut segments = value.split(';');
    let essence = segments
        .next()
        .unwrap_or("text/plain")
        .trim()
        .to_ascii_lowercase();
    let params = segments
        .filter_map(|seg| {
            let (key, val) = seg.split_once('=')?;
            let val = val.trim().trim_matches('"').to_string();
            Some((key.trim().to_ascii_lowercase(), val))
        })
        .collect();
    (essence, params)
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
