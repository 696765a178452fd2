//! BODYSTRUCTURE interpretation.
//!
//! The full RFC 3501 grammar carries far more than the sync engine needs;
//! this module reads the parenthesized form into a generic node tree and
//! distills the fields that matter for attachment detection: content type,
//! disposition, filename, size, and child parts.

use super::Cursor;
use crate::{Error, Result};

/// Simplified view of a message body structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyStructure {
    /// Lowercased `type/subtype`, e.g. `text/plain` or `multipart/mixed`.
    pub content_type: String,
    /// Lowercased disposition (`attachment`, `inline`), when present.
    pub disposition: Option<String>,
    /// Filename from the disposition or body parameters, when present.
    pub filename: Option<String>,
    /// Part size in bytes; absent for multipart containers.
    pub size_bytes: Option<u32>,
    /// Child parts, in part-number order (1-based on the wire).
    pub parts: Vec<BodyStructure>,
}

impl BodyStructure {
    /// Returns true when this part or any descendant looks like an
    /// attachment: an explicit `attachment` disposition, or a named
    /// non-text, non-multipart part.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        if self.disposition.as_deref() == Some("attachment") {
            return true;
        }
        if self.filename.is_some()
            && !self.content_type.starts_with("text/")
            && !self.content_type.starts_with("multipart/")
        {
            return true;
        }
        self.parts.iter().any(Self::has_attachments)
    }
}

/// Generic s-expression node from the wire.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    List(Vec<Node>),
    Str(String),
    Num(u32),
    Nil,
}

pub(crate) fn parse(cur: &mut Cursor<'_>) -> Result<BodyStructure> {
    let node = read_node(cur)?;
    interpret(&node)
}

fn read_node(cur: &mut Cursor<'_>) -> Result<Node> {
    cur.skip_space();
    match cur.peek() {
        Some(b'(') => {
            cur.bump();
            let mut items = Vec::new();
            loop {
                cur.skip_space();
                if cur.eat(b')') {
                    break;
                }
                if cur.at_line_end() {
                    return Err(Error::Protocol("unterminated body structure".to_string()));
                }
                items.push(read_node(cur)?);
            }
            Ok(Node::List(items))
        }
        Some(b'"') => Ok(Node::Str(cur.read_quoted()?)),
        Some(b'{') => {
            let bytes = cur.read_literal()?;
            Ok(Node::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        _ => {
            let atom = cur.read_atom()?;
            if atom.eq_ignore_ascii_case("NIL") {
                Ok(Node::Nil)
            } else if let Ok(n) = atom.parse::<u32>() {
                Ok(Node::Num(n))
            } else {
                Ok(Node::Str(atom.to_string()))
            }
        }
    }
}

fn interpret(node: &Node) -> Result<BodyStructure> {
    let Node::List(items) = node else {
        return Err(Error::Protocol("body structure is not a list".to_string()));
    };

    // Multipart: one or more nested lists, then the subtype string.
    if matches!(items.first(), Some(Node::List(_))) {
        let mut parts = Vec::new();
        let mut idx = 0;
        while let Some(Node::List(_)) = items.get(idx) {
            parts.push(interpret(&items[idx])?);
            idx += 1;
        }
        let subtype = match items.get(idx) {
            Some(Node::Str(s)) => s.to_ascii_lowercase(),
            _ => "mixed".to_string(),
        };
        let (disposition, filename) = find_disposition(&items[idx..]);
        return Ok(BodyStructure {
            content_type: format!("multipart/{subtype}"),
            disposition,
            filename,
            size_bytes: None,
            parts,
        });
    }

    // Single part: type, subtype, params, id, description, encoding, size,
    // then type-specific and extension fields.
    let media_type = str_at(items, 0).unwrap_or("application");
    let subtype = str_at(items, 1).unwrap_or("octet-stream");
    let content_type = format!(
        "{}/{}",
        media_type.to_ascii_lowercase(),
        subtype.to_ascii_lowercase()
    );

    let size_bytes = items.get(6).and_then(|n| match n {
        Node::Num(n) => Some(*n),
        _ => None,
    });

    // Filename can live in the body params ("name") or the disposition
    // params ("filename"); the latter wins.
    let mut filename = items
        .get(2)
        .and_then(|n| param_value(n, "name"))
        .map(ToString::to_string);
    let (disposition, disp_filename) = find_disposition(&items[3..]);
    if disp_filename.is_some() {
        filename = disp_filename;
    }

    Ok(BodyStructure {
        content_type,
        disposition,
        filename,
        size_bytes,
        parts: Vec::new(),
    })
}

/// Scans extension fields for a disposition pair `("attachment" (params))`.
///
/// Positions vary with the media type, so a shape-based scan is more robust
/// than fixed indexing against servers that omit optional fields.
fn find_disposition(items: &[Node]) -> (Option<String>, Option<String>) {
    for item in items {
        let Node::List(pair) = item else { continue };
        let Some(Node::Str(dispo)) = pair.first() else {
            continue;
        };
        let dispo = dispo.to_ascii_lowercase();
        if dispo != "attachment" && dispo != "inline" {
            continue;
        }
        let filename = pair
            .get(1)
            .and_then(|p| param_value(p, "filename"))
            .map(ToString::to_string);
        return (Some(dispo), filename);
    }
    (None, None)
}

/// Looks up a key in an alternating key/value parameter list.
fn param_value<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    let Node::List(kv) = node else { return None };
    for pair in kv.chunks(2) {
        if let [Node::Str(k), Node::Str(v)] = pair {
            if k.eq_ignore_ascii_case(key) {
                return Some(v);
            }
        }
    }
    None
}

fn str_at<'a>(items: &'a [Node], idx: usize) -> Option<&'a str> {
    match items.get(idx) {
        Some(Node::Str(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse_str(s: &str) -> BodyStructure {
        let mut cur = Cursor::new(s.as_bytes());
        parse(&mut cur).unwrap()
    }

    #[test]
    fn simple_text_part() {
        let bs = parse_str(r#"("TEXT" "PLAIN" ("CHARSET" "US-ASCII") NIL NIL "7BIT" 2279 48)"#);
        assert_eq!(bs.content_type, "text/plain");
        assert_eq!(bs.size_bytes, Some(2279));
        assert!(bs.parts.is_empty());
        assert!(!bs.has_attachments());
    }

    #[test]
    fn multipart_mixed_with_attachment() {
        let bs = parse_str(
            r#"(("TEXT" "PLAIN" ("CHARSET" "UTF-8") NIL NIL "7BIT" 119 4 NIL NIL NIL)("APPLICATION" "PDF" ("NAME" "report.pdf") NIL NIL "BASE64" 53248 NIL ("ATTACHMENT" ("FILENAME" "report.pdf")) NIL) "MIXED" ("BOUNDARY" "xyz") NIL NIL)"#,
        );
        assert_eq!(bs.content_type, "multipart/mixed");
        assert_eq!(bs.parts.len(), 2);
        assert_eq!(bs.parts[1].content_type, "application/pdf");
        assert_eq!(bs.parts[1].disposition.as_deref(), Some("attachment"));
        assert_eq!(bs.parts[1].filename.as_deref(), Some("report.pdf"));
        assert!(bs.has_attachments());
    }

    #[test]
    fn multipart_alternative_has_no_attachments() {
        let bs = parse_str(
            r#"(("TEXT" "PLAIN" ("CHARSET" "UTF-8") NIL NIL "QUOTED-PRINTABLE" 403 10 NIL NIL NIL)("TEXT" "HTML" ("CHARSET" "UTF-8") NIL NIL "QUOTED-PRINTABLE" 1234 30 NIL NIL NIL) "ALTERNATIVE" ("BOUNDARY" "b1") NIL NIL)"#,
        );
        assert_eq!(bs.content_type, "multipart/alternative");
        assert_eq!(bs.parts.len(), 2);
        assert!(!bs.has_attachments());
    }

    #[test]
    fn name_param_fallback() {
        let bs = parse_str(r#"("IMAGE" "PNG" ("NAME" "chart.png") NIL NIL "BASE64" 9000)"#);
        assert_eq!(bs.filename.as_deref(), Some("chart.png"));
        assert!(bs.has_attachments());
    }

    #[test]
    fn nested_multipart() {
        let bs = parse_str(
            r#"((("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1)("TEXT" "HTML" NIL NIL NIL "7BIT" 20 1) "ALTERNATIVE" NIL NIL NIL)("APPLICATION" "ZIP" ("NAME" "data.zip") NIL NIL "BASE64" 100 NIL ("ATTACHMENT" ("FILENAME" "data.zip")) NIL) "MIXED" NIL NIL NIL)"#,
        );
        assert_eq!(bs.parts.len(), 2);
        assert_eq!(bs.parts[0].content_type, "multipart/alternative");
        assert_eq!(bs.parts[0].parts.len(), 2);
        assert!(bs.has_attachments());
    }
}
