//! IMAP response parser.
//!
//! Sans-I/O: operates on complete response buffers produced by the framed
//! stream (one logical line plus any embedded literals).

mod bodystructure;

pub use bodystructure::BodyStructure;

use crate::types::{Capability, Flag, Flags};
use crate::{Error, Result};

/// Tagged response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed.
    Ok,
    /// Command failed.
    No,
    /// Command was malformed or invalid in this state.
    Bad,
    /// Server is closing the connection.
    Bye,
}

/// Response code carried in square brackets after a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// Number of the first unseen message.
    Unseen(u32),
    /// Predicted next UID.
    UidNext(u32),
    /// UIDVALIDITY of the mailbox.
    UidValidity(u32),
    /// Mailbox opened read-only.
    ReadOnly,
    /// Mailbox opened read-write.
    ReadWrite,
    /// Capability list embedded in a greeting or login reply.
    Capability(Vec<Capability>),
    /// Any other code, kept verbatim.
    Other(String),
}

/// A single FETCH data item.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    /// Message UID.
    Uid(u32),
    /// Message flags.
    Flags(Flags),
    /// RFC822.SIZE in bytes.
    Rfc822Size(u32),
    /// INTERNALDATE as the server sent it.
    InternalDate(String),
    /// BODY[section] data.
    Body {
        /// Section specifier (empty string for the whole message).
        section: String,
        /// Body bytes; `None` when the server sent NIL.
        data: Option<Vec<u8>>,
    },
    /// BODYSTRUCTURE tree.
    BodyStructure(BodyStructure),
}

/// Untagged response data.
#[derive(Debug, Clone, PartialEq)]
pub enum UntaggedResponse {
    /// `* OK [code] text`
    Ok {
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// `* NO text`
    No {
        /// Human-readable text.
        text: String,
    },
    /// `* BAD text`
    Bad {
        /// Human-readable text.
        text: String,
    },
    /// `* BYE text`
    Bye {
        /// Human-readable text.
        text: String,
    },
    /// `* CAPABILITY ...`
    Capability(Vec<Capability>),
    /// `* n EXISTS`
    Exists(u32),
    /// `* n RECENT`
    Recent(u32),
    /// `* n EXPUNGE`
    Expunge(u32),
    /// `* FLAGS (...)`
    Flags(Flags),
    /// `* SEARCH n n n` (UIDs when the command was UID SEARCH).
    Search(Vec<u32>),
    /// `* n FETCH (...)`
    Fetch {
        /// Message sequence number.
        seq: u32,
        /// Fetch data items.
        items: Vec<FetchItem>,
    },
}

/// A parsed server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Tagged completion response.
    Tagged {
        /// Command tag.
        tag: String,
        /// Completion status.
        status: Status,
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// Untagged (`*`) response.
    Untagged(UntaggedResponse),
    /// Continuation request (`+`).
    Continuation {
        /// Text after the `+`.
        text: String,
    },
}

/// Parses a complete response buffer.
///
/// # Errors
///
/// Returns `Error::Protocol` when the buffer does not form a recognizable
/// IMAP response.
pub fn parse(bytes: &[u8]) -> Result<Response> {
    let mut cur = Cursor::new(bytes);

    if cur.eat(b'+') {
        cur.skip_space();
        return Ok(Response::Continuation {
            text: cur.rest_text(),
        });
    }

    if cur.eat(b'*') {
        cur.skip_space();
        return parse_untagged(&mut cur).map(Response::Untagged);
    }

    // Tagged response.
    let tag = cur.read_atom()?.to_string();
    cur.skip_space();
    let status = parse_status(cur.read_atom()?)?;
    cur.skip_space();
    let code = parse_optional_code(&mut cur)?;
    Ok(Response::Tagged {
        tag,
        status,
        code,
        text: cur.rest_text(),
    })
}

fn parse_status(atom: &str) -> Result<Status> {
    match atom.to_ascii_uppercase().as_str() {
        "OK" => Ok(Status::Ok),
        "NO" => Ok(Status::No),
        "BAD" => Ok(Status::Bad),
        "BYE" => Ok(Status::Bye),
        other => Err(Error::Protocol(format!("unknown status: {other}"))),
    }
}

fn parse_untagged(cur: &mut Cursor<'_>) -> Result<UntaggedResponse> {
    if cur.peek().is_some_and(|b| b.is_ascii_digit()) {
        let n = cur.read_number()?;
        cur.skip_space();
        let word = cur.read_atom()?.to_ascii_uppercase();
        return match word.as_str() {
            "EXISTS" => Ok(UntaggedResponse::Exists(n)),
            "RECENT" => Ok(UntaggedResponse::Recent(n)),
            "EXPUNGE" => Ok(UntaggedResponse::Expunge(n)),
            "FETCH" => {
                cur.skip_space();
                let items = parse_fetch_items(cur)?;
                Ok(UntaggedResponse::Fetch { seq: n, items })
            }
            other => Err(Error::Protocol(format!(
                "unknown numbered response: {other}"
            ))),
        };
    }

    let word = cur.read_atom()?.to_ascii_uppercase();
    cur.skip_space();
    match word.as_str() {
        "OK" | "PREAUTH" => {
            let code = parse_optional_code(cur)?;
            Ok(UntaggedResponse::Ok {
                code,
                text: cur.rest_text(),
            })
        }
        "NO" => Ok(UntaggedResponse::No {
            text: cur.rest_text(),
        }),
        "BAD" => Ok(UntaggedResponse::Bad {
            text: cur.rest_text(),
        }),
        "BYE" => Ok(UntaggedResponse::Bye {
            text: cur.rest_text(),
        }),
        "CAPABILITY" => {
            let mut caps = Vec::new();
            loop {
                cur.skip_space();
                if cur.at_line_end() {
                    break;
                }
                caps.push(Capability::parse(cur.read_atom()?));
            }
            Ok(UntaggedResponse::Capability(caps))
        }
        "SEARCH" => {
            let mut ids = Vec::new();
            loop {
                cur.skip_space();
                if cur.at_line_end() {
                    break;
                }
                ids.push(cur.read_number()?);
            }
            Ok(UntaggedResponse::Search(ids))
        }
        "FLAGS" => {
            let flags = parse_flag_list(cur)?;
            Ok(UntaggedResponse::Flags(flags))
        }
        other => Err(Error::Protocol(format!("unknown untagged: {other}"))),
    }
}

fn parse_optional_code(cur: &mut Cursor<'_>) -> Result<Option<ResponseCode>> {
    if !cur.eat(b'[') {
        return Ok(None);
    }
    let word = cur.read_atom()?.to_ascii_uppercase();
    let code = match word.as_str() {
        "UNSEEN" => {
            cur.skip_space();
            ResponseCode::Unseen(cur.read_number()?)
        }
        "UIDNEXT" => {
            cur.skip_space();
            ResponseCode::UidNext(cur.read_number()?)
        }
        "UIDVALIDITY" => {
            cur.skip_space();
            ResponseCode::UidValidity(cur.read_number()?)
        }
        "READ-ONLY" => ResponseCode::ReadOnly,
        "READ-WRITE" => ResponseCode::ReadWrite,
        "CAPABILITY" => {
            let mut caps = Vec::new();
            loop {
                cur.skip_space();
                if cur.peek() == Some(b']') {
                    break;
                }
                caps.push(Capability::parse(cur.read_atom()?));
            }
            ResponseCode::Capability(caps)
        }
        _ => {
            // Keep the whole bracketed text verbatim; we don't act on it.
            let mut text = word;
            while cur.peek() != Some(b']') && !cur.at_line_end() {
                if let Some(b) = cur.bump() {
                    text.push(b as char);
                }
            }
            ResponseCode::Other(text)
        }
    };
    // Skip to and past the closing bracket.
    while cur.peek() != Some(b']') && !cur.at_line_end() {
        cur.bump();
    }
    cur.eat(b']');
    cur.skip_space();
    Ok(Some(code))
}

fn parse_flag_list(cur: &mut Cursor<'_>) -> Result<Flags> {
    if !cur.eat(b'(') {
        return Err(Error::Protocol("expected flag list".to_string()));
    }
    let mut flags = Vec::new();
    loop {
        cur.skip_space();
        if cur.eat(b')') {
            break;
        }
        flags.push(Flag::parse(cur.read_atom()?));
    }
    Ok(Flags::from_vec(flags))
}

fn parse_fetch_items(cur: &mut Cursor<'_>) -> Result<Vec<FetchItem>> {
    if !cur.eat(b'(') {
        return Err(Error::Protocol("expected fetch item list".to_string()));
    }
    let mut items = Vec::new();
    loop {
        cur.skip_space();
        if cur.eat(b')') {
            break;
        }
        if cur.at_line_end() {
            return Err(Error::Protocol("unterminated fetch list".to_string()));
        }

        let name = cur.read_atom()?.to_ascii_uppercase();
        match name.as_str() {
            "UID" => {
                cur.skip_space();
                items.push(FetchItem::Uid(cur.read_number()?));
            }
            "RFC822.SIZE" => {
                cur.skip_space();
                items.push(FetchItem::Rfc822Size(cur.read_number()?));
            }
            "FLAGS" => {
                cur.skip_space();
                items.push(FetchItem::Flags(parse_flag_list(cur)?));
            }
            "INTERNALDATE" => {
                cur.skip_space();
                items.push(FetchItem::InternalDate(cur.read_quoted()?));
            }
            "BODYSTRUCTURE" => {
                cur.skip_space();
                items.push(FetchItem::BodyStructure(bodystructure::parse(cur)?));
            }
            "BODY" => {
                if cur.peek() == Some(b'[') {
                    let section = cur.read_section()?;
                    // Optional <origin> for partial fetches; we never issue
                    // them but tolerate the syntax.
                    if cur.peek() == Some(b'<') {
                        while cur.peek() != Some(b'>') && !cur.at_line_end() {
                            cur.bump();
                        }
                        cur.eat(b'>');
                    }
                    cur.skip_space();
                    let data = cur.read_nstring()?;
                    items.push(FetchItem::Body { section, data });
                } else {
                    // Bare BODY is the non-extensible structure form.
                    cur.skip_space();
                    items.push(FetchItem::BodyStructure(bodystructure::parse(cur)?));
                }
            }
            _ => {
                // Unknown item: skip its value so the rest still parses.
                cur.skip_space();
                cur.skip_value()?;
            }
        }
    }
    Ok(items)
}

/// Byte cursor over a response buffer.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    pub(crate) fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn skip_space(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    pub(crate) fn at_line_end(&self) -> bool {
        matches!(self.peek(), None | Some(b'\r' | b'\n'))
    }

    /// Remaining bytes as lossy text, trailing CRLF stripped.
    fn rest_text(&self) -> String {
        let rest = &self.buf[self.pos..];
        let rest = rest.strip_suffix(b"\r\n").unwrap_or(rest);
        String::from_utf8_lossy(rest).into_owned()
    }

    pub(crate) fn read_atom(&mut self) -> Result<&'a str> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(
                b,
                b' ' | b'(' | b')' | b'[' | b']' | b'{' | b'"' | b'\r' | b'\n'
            ) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Error::Protocol("expected atom".to_string()));
        }
        std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| Error::Protocol("non-UTF-8 atom".to_string()))
    }

    pub(crate) fn read_number(&mut self) -> Result<u32> {
        let atom = self.read_atom()?;
        atom.parse()
            .map_err(|_| Error::Protocol(format!("expected number, got {atom}")))
    }

    pub(crate) fn read_quoted(&mut self) -> Result<String> {
        if !self.eat(b'"') {
            return Err(Error::Protocol("expected quoted string".to_string()));
        }
        let mut out = Vec::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => {
                    if let Some(b) = self.bump() {
                        out.push(b);
                    }
                }
                Some(b) => out.push(b),
                None => return Err(Error::Protocol("unterminated quoted string".to_string())),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Reads a `{n}\r\n<bytes>` literal at the cursor.
    pub(crate) fn read_literal(&mut self) -> Result<Vec<u8>> {
        if !self.eat(b'{') {
            return Err(Error::Protocol("expected literal".to_string()));
        }
        let mut len: usize = 0;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                len = len * 10 + usize::from(b - b'0');
                self.pos += 1;
            } else {
                break;
            }
        }
        self.eat(b'+');
        if !self.eat(b'}') {
            return Err(Error::Protocol("malformed literal header".to_string()));
        }
        self.eat(b'\r');
        self.eat(b'\n');
        if self.pos + len > self.buf.len() {
            return Err(Error::Protocol("literal exceeds buffer".to_string()));
        }
        let data = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(data)
    }

    /// Reads NIL, a quoted string, or a literal.
    pub(crate) fn read_nstring(&mut self) -> Result<Option<Vec<u8>>> {
        match self.peek() {
            Some(b'"') => Ok(Some(self.read_quoted()?.into_bytes())),
            Some(b'{') => Ok(Some(self.read_literal()?)),
            _ => {
                let atom = self.read_atom()?;
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(None)
                } else {
                    Ok(Some(atom.as_bytes().to_vec()))
                }
            }
        }
    }

    /// Reads a `[...]` section specifier, returning the inner text.
    pub(crate) fn read_section(&mut self) -> Result<String> {
        if !self.eat(b'[') {
            return Err(Error::Protocol("expected section".to_string()));
        }
        let start = self.pos;
        let mut depth = 0u32;
        while let Some(b) = self.peek() {
            match b {
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b']' if depth == 0 => {
                    let text = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
                    self.pos += 1;
                    return Ok(text);
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(Error::Protocol("unterminated section".to_string()))
    }

    /// Skips one value of any shape (atom, quoted, literal, or paren list).
    pub(crate) fn skip_value(&mut self) -> Result<()> {
        match self.peek() {
            Some(b'(') => {
                let mut depth = 0u32;
                while let Some(b) = self.bump() {
                    match b {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                return Ok(());
                            }
                        }
                        b'"' => {
                            // Quoted strings may contain parens.
                            while let Some(q) = self.bump() {
                                match q {
                                    b'\\' => {
                                        self.bump();
                                    }
                                    b'"' => break,
                                    _ => {}
                                }
                            }
                        }
                        b'{' => {
                            self.pos -= 1;
                            self.read_literal()?;
                        }
                        _ => {}
                    }
                }
                Err(Error::Protocol("unterminated list".to_string()))
            }
            Some(b'"') => self.read_quoted().map(|_| ()),
            Some(b'{') => self.read_literal().map(|_| ()),
            _ => self.read_atom().map(|_| ()),
        }
    }
}
