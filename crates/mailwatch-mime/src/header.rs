//! Header parsing: unfolding, RFC 2047 decoding, and the summary fields.

use chrono::{DateTime, Utc};

use crate::encoding::{decode_base64, decode_charset, decode_quoted_printable};

/// Ordered header collection with case-insensitive lookup.
///
/// Folded continuation lines (RFC 5322 §2.2.3) are joined during parsing.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Parses a raw header block. Lines without a colon are ignored.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut entries: Vec<(String, String)> = Vec::new();

        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = entries.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim_start());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                entries.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Self(entries)
    }

    /// Returns the first value for `name`, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true when no headers were parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A sender or recipient: optional display name plus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// Display name, RFC 2047-decoded, without surrounding quotes.
    pub name: Option<String>,
    /// Bare address.
    pub address: String,
}

impl Mailbox {
    /// Parses `Name <addr>`, `"Name" <addr>`, or a bare address.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if let Some(open) = input.rfind('<') {
            let address = input[open + 1..]
                .trim_end_matches('>')
                .trim()
                .to_string();
            let name = decode_header_word(input[..open].trim())
                .trim_matches('"')
                .trim()
                .to_string();
            let name = (!name.is_empty()).then_some(name);
            return Self { name, address };
        }
        Self {
            name: None,
            address: input.to_string(),
        }
    }
}

/// The summary fields distilled from a message header block.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    /// Sender, when a From header was present and parseable.
    pub from: Option<Mailbox>,
    /// Recipients from the To header.
    pub to: Vec<Mailbox>,
    /// Decoded subject; empty string when absent.
    pub subject: String,
    /// Date header, falling back to the current time when unparseable.
    pub date: DateTime<Utc>,
    /// Message-ID without angle brackets.
    pub message_id: Option<String>,
}

/// Parses the raw header block of a message into summary fields.
///
/// Never fails: missing headers yield empty or fallback values.
#[must_use]
pub fn parse_header_block(raw: &[u8]) -> HeaderBlock {
    let headers = Headers::parse(raw);

    let from = headers.get("From").map(Mailbox::parse);
    let to = headers
        .get("To")
        .map(|v| v.split(',').map(Mailbox::parse).collect())
        .unwrap_or_default();
    let subject = headers
        .get("Subject")
        .map(decode_header_word)
        .unwrap_or_default();
    let date = headers
        .get("Date")
        .and_then(parse_date)
        .unwrap_or_else(Utc::now);
    let message_id = headers
        .get("Message-ID")
        .map(|v| v.trim_matches(['<', '>']).to_string());

    HeaderBlock {
        from,
        to,
        subject,
        date,
        message_id,
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    // Strip a trailing comment like "(UTC)" that some senders append.
    let cleaned = value
        .find('(')
        .map_or(value, |pos| &value[..pos])
        .trim();
    DateTime::parse_from_rfc2822(cleaned)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decodes RFC 2047 encoded words anywhere in a header value.
///
/// Each `=?charset?Q|B?text?=` token is decoded independently; whitespace
/// between adjacent encoded words is dropped per the RFC. Malformed tokens
/// pass through verbatim; this function never fails.
#[must_use]
pub fn decode_header_word(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    let mut last_was_encoded = false;

    while let Some(start) = rest.find("=?") {
        let literal = &rest[..start];
        if let Some((decoded, consumed)) = parse_encoded_word(&rest[start..]) {
            // Whitespace between two encoded words is transparent.
            if !(last_was_encoded && literal.chars().all(char::is_whitespace)) {
                out.push_str(literal);
            }
            out.push_str(&decoded);
            last_was_encoded = true;
            rest = &rest[start + consumed..];
        } else {
            out.push_str(&rest[..start + 2]);
            last_was_encoded = false;
            rest = &rest[start + 2..];
        }
    }
    out.push_str(rest);
    out
}

/// Parses one encoded word at the start of `s` (which begins with `=?`),
/// returning the decoded text and how many bytes were consumed.
fn parse_encoded_word(s: &str) -> Option<(String, usize)> {
    let body = s.get(2..)?;
    let charset_end = body.find('?')?;
    let charset = &body[..charset_end];

    let after_charset = &body[charset_end + 1..];
    let mut chars = after_charset.chars();
    let encoding = chars.next()?;
    if chars.next() != Some('?') {
        return None;
    }

    let encoded = &after_charset[2..];
    let text_end = encoded.find("?=")?;
    let text = &encoded[..text_end];

    let bytes = match encoding.to_ascii_uppercase() {
        'B' => decode_base64(text).ok()?,
        'Q' => decode_quoted_printable(&text.replace('_', " ")).ok()?,
        _ => return None,
    };

    let consumed = 2 + charset_end + 1 + 2 + text_end + 2;
    Some((decode_charset(&bytes, charset), consumed))
}
