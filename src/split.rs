//! Streaming separator for concatenated top-level JSON values.
//!
//! A [`Splitter`] owns a growable read buffer over an async byte source and
//! emits borrowed byte ranges, each spanning exactly one complete top-level
//! JSON object or array. Value interiors are not parsed: only the bracket
//! nesting and string/escape state needed for correct framing is tracked,
//! guarded by configurable limits so a hostile peer cannot force unbounded
//! state.
//!
//! Framing violations are fatal: a malformed JSON-RPC peer cannot be
//! meaningfully resynchronized, so the connection is torn down instead.

use std::io;

use bytes::BytesMut;
use n0_error::stack_error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::scan::{Scanner, StringScan};

/// Default limit on `{` and on `[` nesting.
pub const DEFAULT_MAX_DEPTH: usize = 20;
/// Default limit on the byte length of a single string.
pub const DEFAULT_MAX_STRING_LEN: usize = 999_999;
/// Default limit on `[` occurrences within one top-level value.
pub const DEFAULT_MAX_ARRAY_COUNT: usize = 9_999;
/// Default limit on root-level `{` occurrences within one top-level value.
pub const DEFAULT_MAX_ROOT_OBJECTS: usize = 9_999;

const DEFAULT_INITIAL_CAPACITY: usize = 16 * 1024;
const DEFAULT_MAX_READ_CHUNK: usize = 4 * 1024;

/// Limits enforced while scanning a single top-level value.
///
/// Exceeding any of them is a fatal framing error for the stream.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum nesting of `{` and of `[` at any point.
    pub max_depth: usize,
    /// Maximum bytes inside one string, escapes and closing quote included.
    pub max_string_len: usize,
    /// Maximum total `[` occurrences, nested arrays included.
    pub max_array_count: usize,
    /// Maximum `{` occurrences at root level.
    pub max_root_objects: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_array_count: DEFAULT_MAX_ARRAY_COUNT,
            max_root_objects: DEFAULT_MAX_ROOT_OBJECTS,
        }
    }
}

/// Configuration for a [`Splitter`].
#[derive(Debug, Clone)]
pub struct SplitterOpts {
    /// Starting capacity of the read buffer.
    pub initial_capacity: usize,
    /// Upper bound on bytes requested per source read; also the free headroom
    /// ensured before each read.
    pub max_read_chunk: usize,
    /// Scan limits.
    pub limits: Limits,
}

impl Default for SplitterOpts {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_read_chunk: DEFAULT_MAX_READ_CHUNK,
            limits: Limits::default(),
        }
    }
}

/// Result of attempting to locate one complete value in the pending bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextValue {
    /// `buffer[start..=end]` holds exactly one value, delimiters included.
    Complete { start: usize, end: usize },
    /// More bytes are needed; `start` is where scanning resumes (the start of
    /// the partial value, or the end of the buffer if only whitespace is
    /// pending).
    Incomplete { start: usize },
}

/// Fatal framing, policy, and transport errors of a [`Splitter`].
#[stack_error(derive)]
#[non_exhaustive]
pub enum SplitError {
    /// A `}` or `]` appeared with no matching opener.
    #[error("invalid JSON: unmatched closing bracket at position {position}")]
    UnmatchedBracket { position: usize },

    /// A byte that cannot start a value appeared between values.
    #[error("invalid JSON: unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { character: char, position: usize },

    /// Object nesting exceeded the configured depth limit.
    #[error("object exceeds maximum depth of {max}")]
    ObjectDepth { max: usize },

    /// Array nesting exceeded the configured depth limit.
    #[error("array exceeds maximum depth of {max}")]
    ArrayDepth { max: usize },

    /// A string ran past the configured length limit.
    #[error("string exceeds maximum length of {max}")]
    StringLength { max: usize },

    /// Too many arrays were opened within one top-level value.
    #[error("array length exceeds maximum of {max}")]
    ArrayCount { max: usize },

    /// Too many root-level objects were opened within one top-level value.
    #[error("object count exceeds maximum of {max}")]
    RootObjectCount { max: usize },

    /// The source read failed.
    #[error("failed to read from source")]
    Read {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Writing an emitted value to the peer failed.
    #[error("failed to write value to peer")]
    Write {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Streaming JSON value separator over an async byte source.
///
/// The buffer holds at most one partially scanned value plus unread trailing
/// bytes: every emission consumes the value and any whitespace before it, so
/// pending bytes always start at offset zero. Capacity grows as needed and is
/// effectively bounded by the configured [`Limits`].
pub struct Splitter<R> {
    source: R,
    buffer: BytesMut,
    max_read_chunk: usize,
    limits: Limits,
    scanner: Scanner,
}

impl<R: AsyncRead + Unpin> Splitter<R> {
    /// Creates a splitter with default options.
    pub fn new(source: R) -> Self {
        Self::with_opts(source, SplitterOpts::default())
    }

    /// Creates a splitter with the given options.
    pub fn with_opts(source: R, opts: SplitterOpts) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(opts.initial_capacity),
            max_read_chunk: opts.max_read_chunk.max(1),
            limits: opts.limits,
            scanner: Scanner::new(),
        }
    }

    /// Returns the pending (not yet emitted) bytes.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..]
    }

    /// Returns the current buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Reads up to `max_read_chunk` more bytes from the source, growing the
    /// buffer when headroom runs short. Returns `Ok(0)` at EOF.
    pub async fn read(&mut self) -> io::Result<usize> {
        self.buffer.reserve(self.max_read_chunk);
        let n = (&mut self.source)
            .take(self.max_read_chunk as u64)
            .read_buf(&mut self.buffer)
            .await?;
        Ok(n)
    }

    /// Attempts to locate one complete top-level value in the pending bytes.
    ///
    /// No scanning state persists between calls: a partial value is re-scanned
    /// from its start once more bytes have arrived.
    pub fn next_value(&self) -> Result<NextValue, SplitError> {
        let buf = &self.buffer[..];
        let limits = &self.limits;

        let start = self.scanner.skip_whitespace(buf);
        if start == buf.len() {
            return Ok(NextValue::Incomplete { start });
        }
        match buf[start] {
            b'{' | b'[' => {}
            b'}' | b']' => return Err(SplitError::UnmatchedBracket { position: start }),
            c => {
                return Err(SplitError::UnexpectedCharacter {
                    character: c as char,
                    position: start,
                });
            }
        }

        let mut object_depth = 0usize;
        let mut array_depth = 0usize;
        let mut root_objects = 0usize;
        let mut array_count = 0usize;
        let mut i = start;
        loop {
            let Some((off, c)) = self.scanner.find_structural(&buf[i..]) else {
                return Ok(NextValue::Incomplete { start });
            };
            let at = i + off;
            match c {
                b'"' => {
                    // Scan the string body, re-entering after each escape pair.
                    let mut p = at + 1;
                    let mut string_len = 0usize;
                    loop {
                        match self.scanner.scan_string(&buf[p..], limits.max_string_len - string_len) {
                            StringScan::Overflow => {
                                return Err(SplitError::StringLength {
                                    max: limits.max_string_len,
                                });
                            }
                            StringScan::NeedMore => return Ok(NextValue::Incomplete { start }),
                            StringScan::Closed { next } => {
                                p += next;
                                break;
                            }
                            StringScan::Escape { next } => {
                                string_len += next;
                                // The escaped byte counts against the limit too.
                                if string_len + 1 > limits.max_string_len {
                                    return Err(SplitError::StringLength {
                                        max: limits.max_string_len,
                                    });
                                }
                                string_len += 1;
                                if p + next >= buf.len() {
                                    // Escape introducer at the buffer edge.
                                    return Ok(NextValue::Incomplete { start });
                                }
                                p += next + 1;
                            }
                        }
                    }
                    i = p;
                }
                b'{' => {
                    object_depth += 1;
                    if object_depth > limits.max_depth {
                        return Err(SplitError::ObjectDepth {
                            max: limits.max_depth,
                        });
                    }
                    if object_depth == 1 && array_depth == 0 {
                        root_objects += 1;
                        if root_objects > limits.max_root_objects {
                            return Err(SplitError::RootObjectCount {
                                max: limits.max_root_objects,
                            });
                        }
                    }
                    i = at + 1;
                }
                b'[' => {
                    array_depth += 1;
                    if array_depth > limits.max_depth {
                        return Err(SplitError::ArrayDepth {
                            max: limits.max_depth,
                        });
                    }
                    array_count += 1;
                    if array_count > limits.max_array_count {
                        return Err(SplitError::ArrayCount {
                            max: limits.max_array_count,
                        });
                    }
                    i = at + 1;
                }
                b'}' => {
                    if object_depth == 0 {
                        return Err(SplitError::UnmatchedBracket { position: at });
                    }
                    object_depth -= 1;
                    if object_depth == 0 && array_depth == 0 {
                        return Ok(NextValue::Complete { start, end: at });
                    }
                    i = at + 1;
                }
                b']' => {
                    if array_depth == 0 {
                        return Err(SplitError::UnmatchedBracket { position: at });
                    }
                    array_depth -= 1;
                    if object_depth == 0 && array_depth == 0 {
                        return Ok(NextValue::Complete { start, end: at });
                    }
                    i = at + 1;
                }
                _ => unreachable!("find_structural only reports {{ }} [ ] \""),
            }
        }
    }

    /// Drops `len` bytes from the front of the buffer after an emission.
    pub fn consume(&mut self, len: usize) {
        let _ = self.buffer.split_to(len);
    }

    /// Drives read/scan/emit until EOF, a fatal error, or cancellation.
    ///
    /// `on_value` borrows each emitted range for the duration of the call;
    /// consumers that outlive it must copy. At EOF the splitter makes one
    /// final sweep for values completed by the last bytes and then returns
    /// `Ok(())`. Cancellation also returns `Ok(())`, at the next read or
    /// emit suspension point.
    pub async fn decode_all<F>(
        &mut self,
        mut on_value: F,
        cancel: &CancellationToken,
    ) -> Result<(), SplitError>
    where
        F: AsyncFnMut(&[u8]) -> io::Result<()>,
    {
        loop {
            if self.emit_complete(&mut on_value, cancel).await? {
                return Ok(());
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.read() => res.map_err(|source| SplitError::Read { source })?,
            };
            if n == 0 {
                // EOF: drain any already-complete trailing value.
                self.emit_complete(&mut on_value, cancel).await?;
                return Ok(());
            }
        }
    }

    /// Emits every complete value currently in the buffer. Returns `true` if
    /// cancellation was observed.
    async fn emit_complete<F>(
        &mut self,
        on_value: &mut F,
        cancel: &CancellationToken,
    ) -> Result<bool, SplitError>
    where
        F: AsyncFnMut(&[u8]) -> io::Result<()>,
    {
        while !self.buffer.is_empty() {
            match self.next_value()? {
                NextValue::Complete { start, end } => {
                    let value = &self.buffer[start..=end];
                    let res = tokio::select! {
                        _ = cancel.cancelled() => return Ok(true),
                        res = on_value(value) => res,
                    };
                    res.map_err(|source| SplitError::Write { source })?;
                    self.consume(end + 1);
                }
                NextValue::Incomplete { .. } => break,
            }
        }
        Ok(false)
    }
}
