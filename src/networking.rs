use std::io;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use log::debug;
use crate::error::ChatError;
use crate::messages::Message;
use crate::{CHUNK_SIZE, MAX_FRAME_LEN};

/// Newline framing bounded at `MAX_FRAME_LEN`.
///
/// Wraps [`LinesCodec`] so that a bad line is an item rather than a stream
/// error: an oversized line (skipped up to its `\n`) or one that is not UTF-8
/// comes out as `Err(ChatError::Protocol)` and decoding carries on with the
/// next line. Only real I/O failures end the stream.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec { lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN) }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Result<String, ChatError>>, io::Error> {
    match result {
        Ok(line) => Ok(line.map(Ok)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(ChatError::Protocol(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_LEN
        ))))),
        Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
            Ok(Some(Err(ChatError::Protocol("frame is not valid UTF-8".into()))))
        }
        Err(LinesCodecError::Io(e)) => Err(e),
    }
}

impl Decoder for FrameCodec {
    type Item = Result<String, ChatError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        classify(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        classify(self.lines.decode_eof(buf))
    }
}

/// Reads newline-delimited frames from any async byte stream.
pub struct FrameReader<R> {
    frames: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            frames: FramedRead::with_capacity(reader, FrameCodec::new(), CHUNK_SIZE),
        }
    }

    /// Next raw line. `Ok(None)` on EOF; empty and undecodable lines are skipped.
    pub async fn next_line(&mut self) -> Result<Option<String>, ChatError> {
        while let Some(frame) = self.frames.next().await {
            match frame? {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => return Ok(Some(line)),
                Err(e) => debug!("Dropping frame: {}", e),
            }
        }
        Ok(None)
    }

    /// Next well-formed envelope. Malformed frames are logged and dropped,
    /// they never end the stream.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ChatError> {
        while let Some(line) = self.next_line().await? {
            match Message::from_line(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => debug!("Dropping malformed frame: {}", e),
            }
        }
        Ok(None)
    }
}

/// Write one pre-serialized line and flush it.
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, line: &str) -> Result<(), ChatError> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and write one envelope. Frames the peer would discard as
/// oversized are refused before anything is written.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, message: &Message) -> Result<(), ChatError> {
    let line = message.to_line()?;
    check_frame_len(&line, MAX_FRAME_LEN)?;
    write_line(writer, &line).await
}

/// `line` includes its terminator; `limit` bounds the content before it.
pub fn check_frame_len(line: &str, limit: usize) -> Result<(), ChatError> {
    let content = line.strip_suffix('\n').unwrap_or(line);
    if content.len() > limit {
        return Err(ChatError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            content.len(),
            limit
        )));
    }
    Ok(())
}
