//! Builtin I/O channels
//!
//! Turns raw descriptors into the channels a builtin works with:
//!
//! - [`InputStream`] - demand-driven byte chunks read from a descriptor
//! - [`Segments`] - delimiter-separated text on top of an input stream
//! - [`BuiltinInput`] - the single-consumption input side of a builtin
//! - [`BuiltinOutput`] - an ordered, flushable text sink
//!
//! Pipes the channel owns outright are driven by the readiness reactor.
//! Anything else (regular files, terminals, descriptors shared with other
//! stages or processes) is read and written on the blocking pool through
//! `tokio::fs::File`.

use std::io;
use std::os::fd::BorrowedFd;

use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing::warn;

use crate::error::ChannelError;
use crate::fd::{classify, duplicate, DescriptorKind};

/// How a channel should drive its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// Register pipes with the reactor. This sets `O_NONBLOCK` on the open
    /// file description, which every copy of the descriptor shares.
    Reactor,
    /// Always use the blocking pool. Required for any descriptor another
    /// stage, process or library may also hold.
    Blocking,
}

// ============================================================================
// Input
// ============================================================================

/// A lazy, single-pass sequence of byte chunks.
///
/// Nothing is read until [`next_chunk`](Self::next_chunk) asks for it, so a
/// slow consumer applies backpressure to the writer on the other end.
pub struct InputStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    finished: bool,
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("chunk_size", &self.chunk_size)
            .field("finished", &self.finished)
            .finish()
    }
}

impl InputStream {
    /// Open a stream over a duplicate of `fd`.
    pub(crate) fn open(
        fd: BorrowedFd<'_>,
        registration: Registration,
        chunk_size: usize,
    ) -> io::Result<Self> {
        let (owned, kind) = classify(duplicate(fd)?)?;
        let reader: Box<dyn AsyncRead + Send + Unpin> =
            if kind == DescriptorKind::Fifo && registration == Registration::Reactor {
                Box::new(pipe::Receiver::from_owned_fd(owned)?)
            } else {
                Box::new(tokio::fs::File::from_std(std::fs::File::from(owned)))
            };
        Ok(Self::from_reader(reader, chunk_size))
    }

    /// Wrap any async reader.
    pub fn from_reader(reader: Box<dyn AsyncRead + Send + Unpin>, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            finished: false,
        }
    }

    /// The next chunk, or `None` at end-of-stream.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            match self.reader.read(&mut chunk).await {
                Ok(0) => {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(n) => {
                    chunk.truncate(n);
                    return Ok(Some(chunk));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }

    /// Read everything that remains.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut contents = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            contents.extend_from_slice(&chunk);
        }
        Ok(contents)
    }

    /// Split into segments ending in `delimiter`.
    pub fn segments(self, delimiter: char) -> Segments {
        Segments::new(self, delimiter)
    }

    /// Chunks as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
        stream::unfold(self, |mut input| async move {
            match input.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), input)),
                Ok(None) => None,
                Err(error) => {
                    input.finished = true;
                    Some((Err(error), input))
                }
            }
        })
    }
}

/// Delimiter-separated text segments of an input stream.
///
/// The delimiter is not included. A final segment without a trailing
/// delimiter is yielded if it is not empty. Invalid UTF-8 is replaced.
#[derive(Debug)]
pub struct Segments {
    input: InputStream,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    scanned: usize,
    exhausted: bool,
}

impl Segments {
    fn new(input: InputStream, delimiter: char) -> Self {
        let mut encoded = [0u8; 4];
        Self {
            input,
            delimiter: delimiter.encode_utf8(&mut encoded).as_bytes().to_vec(),
            buffer: Vec::new(),
            scanned: 0,
            exhausted: false,
        }
    }

    /// The next segment, or `None` once the input is exhausted.
    pub async fn next_segment(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(position) = self.find_delimiter() {
                let segment: Vec<u8> = self.buffer.drain(..position + self.delimiter.len()).collect();
                self.scanned = 0;
                return Ok(Some(decode(&segment[..position])));
            }
            if self.exhausted {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(decode(&rest)));
            }
            match self.input.next_chunk().await? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => self.exhausted = true,
            }
        }
    }

    /// Collect every remaining segment.
    pub async fn collect(mut self) -> io::Result<Vec<String>> {
        let mut segments = Vec::new();
        while let Some(segment) = self.next_segment().await? {
            segments.push(segment);
        }
        Ok(segments)
    }

    /// Segments as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<String>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut segments = state?;
            match segments.next_segment().await {
                Ok(Some(segment)) => Some((Ok(segment), Some(segments))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let len = self.delimiter.len();
        let start = self.scanned;
        let found = self.buffer[start..]
            .windows(len)
            .position(|window| window == self.delimiter.as_slice())
            .map(|offset| start + offset);
        if found.is_none() {
            // A partial delimiter may straddle the next chunk.
            self.scanned = self.buffer.len().saturating_sub(len - 1);
        }
        found
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// The input side of a builtin. Can be consumed once.
#[derive(Debug)]
pub struct BuiltinInput {
    stream: Option<InputStream>,
}

impl BuiltinInput {
    pub(crate) fn new(stream: InputStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    /// Take the raw chunk stream.
    pub fn chunks(&mut self) -> Result<InputStream, ChannelError> {
        self.stream.take().ok_or(ChannelError::InputAlreadyConsumed)
    }

    /// Take the input as segments ending in `delimiter`.
    pub fn segments(&mut self, delimiter: char) -> Result<Segments, ChannelError> {
        Ok(self.chunks()?.segments(delimiter))
    }

    /// Take the input as lines.
    pub fn lines(&mut self) -> Result<Segments, ChannelError> {
        self.segments('\n')
    }

    /// Consume the whole input as text.
    pub async fn read_to_string(&mut self) -> Result<String, ChannelError> {
        let bytes = self.chunks()?.read_to_end().await?;
        Ok(decode(&bytes))
    }

    /// Whether the input has already been taken.
    pub fn is_consumed(&self) -> bool {
        self.stream.is_none()
    }
}

// ============================================================================
// Output
// ============================================================================

/// An append-only text sink.
///
/// [`write`](Self::write) queues text in issuing order; [`flush`](Self::flush)
/// returns once everything queued has been handed to the OS.
pub struct BuiltinOutput {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    pending: Vec<u8>,
}

impl std::fmt::Debug for BuiltinOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinOutput")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl BuiltinOutput {
    /// Open a sink over a duplicate of `fd`.
    pub(crate) fn open(fd: BorrowedFd<'_>, registration: Registration) -> io::Result<Self> {
        let (owned, kind) = classify(duplicate(fd)?)?;
        let writer: Box<dyn AsyncWrite + Send + Unpin> =
            if kind == DescriptorKind::Fifo && registration == Registration::Reactor {
                Box::new(pipe::Sender::from_owned_fd(owned)?)
            } else {
                Box::new(tokio::fs::File::from_std(std::fs::File::from(owned)))
            };
        Ok(Self::from_writer(writer))
    }

    /// Wrap any async writer.
    pub fn from_writer(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            writer,
            pending: Vec::new(),
        }
    }

    /// Queue `text` for writing.
    pub fn write(&mut self, text: &str) {
        self.pending.extend_from_slice(text.as_bytes());
    }

    /// Queue raw bytes for writing.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Write everything queued so far.
    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.writer.write_all(&pending).await?;
        }
        self.writer.flush().await
    }

    /// Queue `text` and flush.
    pub async fn write_all(&mut self, text: &str) -> io::Result<()> {
        self.write(text);
        self.flush().await
    }

    /// Queue `line` plus a newline and flush.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write(line);
        self.write("\n");
        self.flush().await
    }
}

impl Drop for BuiltinOutput {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(bytes = %self.pending.len(), "channel.output dropped unflushed data");
        }
    }
}

/// The three channels a builtin runs with.
#[derive(Debug)]
pub struct Channels {
    pub input: BuiltinInput,
    pub output: BuiltinOutput,
    pub error: BuiltinOutput,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    fn input_of(bytes: &'static [u8], chunk_size: usize) -> InputStream {
        InputStream::from_reader(Box::new(bytes), chunk_size)
    }

    #[tokio::test]
    async fn test_segments_yield_remainder() {
        let segments = input_of(b"1;2\n3;4;not", 3).segments(';');
        assert_eq!(
            segments.collect().await.unwrap(),
            vec!["1", "2\n3", "4", "not"]
        );
    }

    #[tokio::test]
    async fn test_segments_skip_empty_remainder() {
        let segments = input_of(b"a\nb\n", 1).segments('\n');
        assert_eq!(segments.collect().await.unwrap(), vec!["a", "b"]);

        let empty = input_of(b"", 8).segments('\n');
        assert!(empty.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multibyte_delimiter_across_chunks() {
        let segments = input_of("x→y→".as_bytes(), 1).segments('→');
        assert_eq!(segments.collect().await.unwrap(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_segment_stream() {
        let lines: Vec<String> = input_of(b"one\ntwo", 2)
            .segments('\n')
            .into_stream()
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_input_consumed_once() {
        let mut input = BuiltinInput::new(input_of(b"data", 8));
        assert_eq!(input.read_to_string().await.unwrap(), "data");
        assert!(input.is_consumed());
        assert!(matches!(
            input.lines(),
            Err(ChannelError::InputAlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn test_output_writes_in_order() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut output = BuiltinOutput::from_writer(Box::new(client));
        output.write("a");
        output.write("b");
        output.write_line("c").await.unwrap();
        drop(output);

        let mut received = String::new();
        server.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "abc\n");
    }

    #[tokio::test]
    async fn test_pipe_channels_round_trip() {
        let pipe = crate::fd::Pipe::new().unwrap();
        let mut output =
            BuiltinOutput::open(std::os::fd::AsFd::as_fd(&pipe.write_end), Registration::Reactor)
                .unwrap();
        let input =
            InputStream::open(std::os::fd::AsFd::as_fd(&pipe.read_end), Registration::Reactor, 4)
                .unwrap();
        drop(pipe);

        output.write_all("alpha\nbeta\n").await.unwrap();
        drop(output);
        assert_eq!(
            input.segments('\n').collect().await.unwrap(),
            vec!["alpha", "beta"]
        );
    }
}
