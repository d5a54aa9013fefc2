//! Splitting multi-statement migration scripts.
//!
//! A migration script is read as a byte stream and cut into statements at
//! every `;` that is neither inside a `$$`-quoted function body nor inside a
//! line comment. The reader is consumed in fixed-size chunks, and the result
//! does not depend on where the chunk boundaries fall.
//!
//! Known limitations:
//! - comment openers (`--`, `//`) are recognized anywhere outside a function
//!   body, including inside string literals
//! - `/* */` comments and tagged dollar quotes (`$tag$`) are not understood
//! - text after the last `;` is dropped rather than executed

use crate::error::Error;
use std::borrow::Cow;
use std::io::{self, Read};

/// Read chunk size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Token replaced by [`SplitConfig::replacement`] in every emitted statement.
pub const SCHEMA_PLACEHOLDER: &str = "<SCHEMA_NAME>";

/// Settings for a single [`split`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitConfig {
    /// Number of bytes requested from the reader per read.
    pub buffer_size: usize,
    /// Substituted for [`SCHEMA_PLACEHOLDER`]. `None` or an empty string disables substitution.
    pub replacement: Option<String>,
    /// Emit `TRACE` events for every chunk and statement.
    pub trace: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            replacement: None,
            trace: false,
        }
    }
}

impl SplitConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = Some(replacement.into());
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

/// Replace every [`SCHEMA_PLACEHOLDER`] in `statement` with `replacement`.
pub fn replace_placeholder<'a>(statement: &'a str, replacement: &str) -> Cow<'a, str> {
    if replacement.is_empty() || !statement.contains(SCHEMA_PLACEHOLDER) {
        Cow::Borrowed(statement)
    } else {
        Cow::Owned(statement.replace(SCHEMA_PLACEHOLDER, replacement))
    }
}

/// A statement cut from a script, remembering where each of its characters came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    text: String,
    /// Byte offset in the source script of every character of `text`.
    origins: Vec<usize>,
}

impl Statement {
    /// The whole of `script` as one statement, with the placeholder replaced when
    /// `replacement` is set.
    pub fn whole(script: &str, replacement: Option<&str>) -> Self {
        let origins: Vec<usize> = (0..script.len()).collect();
        Self::build(script, &origins, replacement)
    }

    /// `byte_origins` holds the source offset of every byte of `text`. Every
    /// character of a substituted placeholder maps to where the placeholder began.
    fn build(text: &str, byte_origins: &[usize], replacement: Option<&str>) -> Self {
        let replacement = replacement.filter(|r| !r.is_empty());
        let mut out = String::with_capacity(text.len());
        let mut origins = Vec::with_capacity(text.len());

        let mut at = 0;
        while let Some(ch) = text[at..].chars().next() {
            let origin = byte_origins.get(at).copied().unwrap_or(at);
            match replacement {
                Some(replacement) if text[at..].starts_with(SCHEMA_PLACEHOLDER) => {
                    out.push_str(replacement);
                    origins.extend(std::iter::repeat(origin).take(replacement.chars().count()));
                    at += SCHEMA_PLACEHOLDER.len();
                }
                _ => {
                    out.push(ch);
                    origins.push(origin);
                    at += ch.len_utf8();
                }
            }
        }
        Self { text: out, origins }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte offset in the source script of the character at the 1-based
    /// character position `pos` of this statement.
    pub fn source_offset(&self, pos: usize) -> Option<usize> {
        self.origins.get(pos.checked_sub(1)?).copied()
    }
}

impl AsRef<str> for Statement {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Split the script read from `reader` and hand each complete statement to `handler`, in order.
///
/// Statements keep their terminating `;` and any whitespace that preceded them.
/// The first handler failure stops the pass and is returned as [`Error::Statement`].
/// Read failures are returned as [`Error::Io`] without further wrapping.
pub fn split<R, F>(reader: R, config: &SplitConfig, mut handler: F) -> Result<(), Error>
where
    R: Read,
    F: FnMut(&str) -> Result<(), Error>,
{
    split_statements(reader, config, |statement| handler(statement.as_str()))
}

/// Like [`split`], but hands out [`Statement`]s that can translate a position
/// back into the source script.
pub fn split_statements<R, F>(mut reader: R, config: &SplitConfig, mut handler: F) -> Result<(), Error>
where
    R: Read,
    F: FnMut(&Statement) -> Result<(), Error>,
{
    let mut parser = Parser::new(config);
    // The parser needs one byte of lookahead, so a chunk must hold at least two.
    let mut chunk = vec![0u8; config.buffer_size.max(2)];
    let mut pending: Vec<u8> = Vec::with_capacity(chunk.len() + 1);
    let mut offset = 0usize;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        pending.extend_from_slice(&chunk[..n]);
        if config.trace {
            tracing::trace!(offset, read = n, carried = pending.len() - n, "splitter chunk");
        }

        let consumed = parser.feed(&pending, offset, false, &mut handler)?;
        offset += consumed;
        pending.drain(..consumed);
    }

    parser.feed(&pending, offset, true, &mut handler)?;
    parser.finish();
    Ok(())
}

/// Collect every statement of the script read from `reader`.
pub fn statements<R: Read>(reader: R, config: &SplitConfig) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    split(reader, config, |statement| {
        out.push(statement.to_string());
        Ok(())
    })?;
    Ok(out)
}

struct Parser<'c> {
    config: &'c SplitConfig,
    /// Inside a line comment; cleared by the next newline.
    discard: bool,
    /// Between a pair of `$$` markers; `;` is literal here.
    in_function_body: bool,
    accum: Vec<u8>,
    /// Source offset of every byte in `accum`.
    origins: Vec<usize>,
}

impl<'c> Parser<'c> {
    fn new(config: &'c SplitConfig) -> Self {
        Self {
            config,
            discard: false,
            in_function_body: false,
            accum: Vec::with_capacity(2048),
            origins: Vec::with_capacity(2048),
        }
    }

    fn keep(&mut self, byte: u8, origin: usize) {
        self.accum.push(byte);
        self.origins.push(origin);
    }

    /// Process `buf`, which starts at byte `base` of the script, returning how many
    /// bytes were consumed. Unless `eof` is set, the final byte is left for the
    /// next call since its lookahead is unknown.
    fn feed<F>(&mut self, buf: &[u8], base: usize, eof: bool, handler: &mut F) -> Result<usize, Error>
    where
        F: FnMut(&Statement) -> Result<(), Error>,
    {
        let mut i = 0;
        while i < buf.len() {
            let next = buf.get(i + 1).copied();
            if next.is_none() && !eof {
                break;
            }
            let ch = buf[i];
            let at = base + i;

            if !self.in_function_body
                && !self.discard
                && matches!((ch, next), (b'-', Some(b'-')) | (b'/', Some(b'/')))
            {
                self.discard = true;
            }

            match ch {
                b'$' if next == Some(b'$') && !self.discard => {
                    self.keep(b'$', at);
                    self.keep(b'$', at + 1);
                    self.in_function_body = !self.in_function_body;
                    i += 1;
                }
                b';' if self.in_function_body => self.keep(ch, at),
                b';' if self.discard => {}
                b';' => {
                    self.keep(ch, at);
                    self.emit(handler)?;
                }
                b'\n' => {
                    if self.in_function_body || !self.discard {
                        self.keep(ch, at);
                    }
                    self.discard = false;
                }
                _ if self.discard => {}
                _ => self.keep(ch, at),
            }
            i += 1;
        }
        Ok(i)
    }

    fn emit<F>(&mut self, handler: &mut F) -> Result<(), Error>
    where
        F: FnMut(&Statement) -> Result<(), Error>,
    {
        let text = std::str::from_utf8(&self.accum)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let statement = Statement::build(text, &self.origins, self.config.replacement.as_deref());
        if self.config.trace {
            tracing::trace!(statement = %statement, "splitter statement");
        }

        let result = handler(&statement).map_err(|source| Error::Statement {
            statement: statement.text,
            source: Box::new(source),
        });
        self.accum.clear();
        self.origins.clear();
        result
    }

    fn finish(self) {
        let rest = String::from_utf8_lossy(&self.accum);
        if !rest.trim().is_empty() {
            tracing::debug!(
                fragment = %rest.trim(),
                "dropping trailing text without a terminating ';'"
            );
        }
    }
}
