//! Buffered framing over the raw stream.
//!
//! IMAP responses are CRLF-terminated lines that may end in a literal
//! announcement `{n}` followed by `n` raw bytes and more line data. A
//! "response" here is one such logical unit, literals included.

#![allow(clippy::missing_errors_doc)]

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

const READ_BUFFER_SIZE: usize = 8192;

/// Ceiling on a single line, to bound memory against a hostile server.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Ceiling on a single literal. Covers any plausible message body.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Line- and literal-aware reader/writer for one IMAP connection.
#[derive(Debug)]
pub struct FramedStream<S> {
    reader: BufReader<S>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream in a framed reader.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, stream),
        }
    }

    /// Reads one complete response, following literal announcements.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        loop {
            let line_start = response.len();
            self.read_line_into(&mut response).await?;

            match literal_length(&response[line_start..]) {
                Some(len) if len > MAX_LITERAL_SIZE => {
                    return Err(Error::Protocol(format!(
                        "literal of {len} bytes exceeds limit"
                    )));
                }
                Some(len) => {
                    let start = response.len();
                    response.resize(start + len, 0);
                    self.reader.read_exact(&mut response[start..]).await?;
                    // The line after the literal continues the same response.
                }
                None => return Ok(response),
            }
        }
    }

    /// Reads responses until the one tagged with `tag`, returning all of
    /// them with the tagged response last.
    pub async fn read_until_tagged(&mut self, tag: &str) -> Result<Vec<Vec<u8>>> {
        let mut responses = Vec::new();
        loop {
            let response = self.read_response().await?;
            let tagged = response.starts_with(tag.as_bytes())
                && response.get(tag.len()) == Some(&b' ');
            responses.push(response);
            if tagged {
                return Ok(responses);
            }
        }
    }

    /// Writes a serialized command and flushes.
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Returns a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    async fn read_line_into(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            if let Some(nl) = buf.iter().position(|&b| b == b'\n') {
                out.extend_from_slice(&buf[..=nl]);
                self.reader.consume(nl + 1);
                return Ok(());
            }
            let len = buf.len();
            out.extend_from_slice(buf);
            self.reader.consume(len);
            if out.len() - start > MAX_LINE_LENGTH {
                return Err(Error::Protocol("response line too long".to_string()));
            }
        }
    }
}

/// Returns the announced literal length when `line` ends with `{n}\r\n`
/// (or the non-synchronizing `{n+}\r\n`).
fn literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);
    let open = line.iter().rposition(|&b| b == b'{')?;
    std::str::from_utf8(&line[open + 1..]).ok()?.parse().ok()
}
