use crate::transcript::{Line, Transcript};
use bytes::BytesMut;
use std::borrow::Cow;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// A number of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumBytes(usize);

impl NumBytes {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn bytes(&self) -> usize {
        self.0
    }
}

pub trait NumBytesExt {
    fn bytes(self) -> NumBytes;

    fn kilobytes(self) -> NumBytes;

    fn megabytes(self) -> NumBytes;
}

impl NumBytesExt for usize {
    fn bytes(self) -> NumBytes {
        NumBytes(self)
    }

    fn kilobytes(self) -> NumBytes {
        NumBytes(self * 1024)
    }

    fn megabytes(self) -> NumBytes {
        NumBytes(self * 1024 * 1024)
    }
}

/// What to do with the part of a line exceeding [LineParsingOptions::max_line_length].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOverflowBehavior {
    /// Keep the first `max_line_length` bytes and discard everything up to the next newline.
    DropAdditionalData,

    /// Emit every `max_line_length` bytes as a separate, non-terminated line.
    /// Concatenating the pieces yields the original line.
    EmitAdditionalAsNewLines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParsingOptions {
    /// Maximum length of a single line in bytes. `0` means no limit.
    ///
    /// default: 16 kb
    pub max_line_length: NumBytes,

    /// default: [LineOverflowBehavior::EmitAdditionalAsNewLines], which loses no data.
    pub overflow_behavior: LineOverflowBehavior,

    /// Emit a not yet terminated line once no more output arrived for this long.
    ///
    /// Interactive programs commonly print their prompt without a trailing newline. Without this,
    /// the prompt would only be seen once the next line of output completes it.
    /// `None` splits strictly on newlines.
    ///
    /// default: 100 ms
    pub partial_line_flush: Option<Duration>,

    /// The size of the buffer used for individual reads from the stream.
    ///
    /// default: 16 kb
    pub chunk_size: NumBytes,
}

impl Default for LineParsingOptions {
    fn default() -> Self {
        Self {
            max_line_length: 16.kilobytes(),
            overflow_behavior: LineOverflowBehavior::EmitAdditionalAsNewLines,
            partial_line_flush: Some(Duration::from_millis(100)),
            chunk_size: 16.kilobytes(),
        }
    }
}

/// Holds the not-yet-completed line between reads.
pub(crate) struct LineSplitter {
    line_buffer: BytesMut,
    options: LineParsingOptions,
    truncated: bool,
}

impl LineSplitter {
    pub(crate) fn new(options: LineParsingOptions) -> Self {
        Self {
            line_buffer: BytesMut::new(),
            options,
            truncated: false,
        }
    }

    /// Iterates over all lines completed by `chunk`.
    pub(crate) fn lines<'a>(&'a mut self, chunk: &'a [u8]) -> LineReader<'a> {
        LineReader {
            chunk,
            splitter: self,
        }
    }

    /// Whether an unterminated line could be flushed early.
    ///
    /// A truncated line is never flushed early. Its tail is still being discarded up to the next
    /// newline, and flushing would let that tail resurface as a line of its own.
    pub(crate) fn has_partial(&self) -> bool {
        !self.line_buffer.is_empty() && !self.truncated
    }

    /// Takes whatever was buffered as a non-terminated line.
    pub(crate) fn flush_partial(&mut self) -> Option<Line> {
        match self.line_buffer.is_empty() {
            true => None,
            false => Some(self.finish(false)),
        }
    }

    fn is_full(&self) -> bool {
        let limit = self.options.max_line_length.bytes();
        limit != 0 && self.line_buffer.len() >= limit
    }

    fn remaining_room(&self) -> usize {
        match self.options.max_line_length.bytes() {
            0 => usize::MAX,
            limit => limit.saturating_sub(self.line_buffer.len()),
        }
    }

    fn finish(&mut self, terminated: bool) -> Line {
        let raw = self.line_buffer.split().freeze();
        let mut text = String::from_utf8_lossy(&raw).into_owned();
        if terminated && text.ends_with('\r') {
            text.pop();
        }
        if self.truncated {
            tracing::debug!(
                max_line_length = self.options.max_line_length.bytes(),
                "Dropped data exceeding the maximum line length"
            );
            self.truncated = false;
        }
        Line::new(text, terminated)
    }
}

/// Conceptually, this iterator appends the given byte slice to the current line buffer, which may
/// already hold some previously written data.
/// The resulting view of data is split by newlines (`\n`). Every completed line is yielded.
/// The remainder of the chunk, not completed with a newline character, stays in the line buffer.
pub(crate) struct LineReader<'a> {
    chunk: &'a [u8],
    splitter: &'a mut LineSplitter,
}

impl Iterator for LineReader<'_> {
    type Item = Line;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.chunk.is_empty() {
                return None;
            }

            if self.splitter.is_full() && self.chunk[0] != b'\n' {
                match self.splitter.options.overflow_behavior {
                    LineOverflowBehavior::EmitAdditionalAsNewLines => {
                        return Some(self.splitter.finish(false));
                    }
                    LineOverflowBehavior::DropAdditionalData => {
                        self.splitter.truncated = true;
                        match self.chunk.iter().position(|b| *b == b'\n') {
                            // Keep the newline, it completes the truncated line below.
                            Some(pos) => self.chunk = &self.chunk[pos..],
                            None => {
                                self.chunk = &[];
                                return None;
                            }
                        }
                    }
                }
            }

            match self.chunk.iter().position(|b| *b == b'\n') {
                Some(0) => {
                    self.chunk = &self.chunk[1..];
                    return Some(self.splitter.finish(true));
                }
                newline => {
                    let segment_end = newline.unwrap_or(self.chunk.len());
                    let take = usize::min(segment_end, self.splitter.remaining_room());
                    let (consumed, rest) = self.chunk.split_at(take);
                    self.splitter.line_buffer.extend_from_slice(consumed);
                    self.chunk = rest;
                }
            }
        }
    }
}

/// Starts a task reading `stream` until EOF, forwarding every line to `sender` and recording it
/// in `transcript`.
///
/// Read errors end the stream, they are never raised. The unbounded `sender` never applies
/// backpressure, so a slow consumer cannot stall the process writing its output.
pub(crate) fn spawn_pump<R: AsyncRead + Unpin + Send + 'static>(
    process_name: Cow<'static, str>,
    stream: R,
    sender: UnboundedSender<Line>,
    transcript: Transcript,
    options: LineParsingOptions,
) -> JoinHandle<()> {
    tokio::spawn(pump(process_name, stream, sender, transcript, options))
}

async fn pump<R: AsyncRead + Unpin>(
    process_name: Cow<'static, str>,
    mut stream: R,
    sender: UnboundedSender<Line>,
    transcript: Transcript,
    options: LineParsingOptions,
) {
    let forward = |line: Line| {
        transcript.push(line.clone());
        // A dropped receiver only means nobody awaits output anymore.
        // We keep reading so that the transcript stays complete.
        let _ = sender.send(line);
    };

    let chunk_size = usize::max(options.chunk_size.bytes(), 1);
    let mut splitter = LineSplitter::new(options);
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.clear();
        buf.reserve(chunk_size);

        let read = match options.partial_line_flush {
            Some(flush_after) if splitter.has_partial() => {
                // `read_buf` is cancel safe: on timeout, no data was read.
                match tokio::time::timeout(flush_after, stream.read_buf(&mut buf)).await {
                    Ok(read) => read,
                    Err(_elapsed) => {
                        if let Some(partial) = splitter.flush_partial() {
                            forward(partial);
                        }
                        continue;
                    }
                }
            }
            _ => stream.read_buf(&mut buf).await,
        };

        match read {
            Ok(0) => break,
            Ok(_bytes_read) => {
                for line in splitter.lines(&buf) {
                    forward(line);
                }
            }
            Err(err) => {
                tracing::debug!(
                    process = %process_name,
                    error = %err,
                    "Could not read from output stream, treating it as closed"
                );
                break;
            }
        }
    }

    if let Some(rest) = splitter.flush_partial() {
        forward(rest);
    }
    tracing::debug!(process = %process_name, "Output stream reached EOF");
}
