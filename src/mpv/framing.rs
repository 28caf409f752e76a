//! Line framing for the IPC stream.
//!
//! Every newline-terminated line is one JSON value. Empty lines are skipped;
//! lines that fail to decode or exceed the length limit are logged and
//! dropped, so a corrupt line never ends the stream.

use std::borrow::Cow;

use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

/// Longest line accepted from the player. Longer lines are discarded.
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Decode one line. `None` for blank or malformed lines.
///
/// mpv passes non-UTF-8 file names through as raw bytes; those are replaced
/// rather than failing the whole message.
pub fn decode_line(line: &[u8]) -> Option<Value> {
  if line.iter().all(u8::is_ascii_whitespace) {
    return None;
  }

  let text = String::from_utf8_lossy(line);
  if let Cow::Owned(_) = text {
    log::debug!("MPV message contained invalid UTF-8");
  }

  match serde_json::from_str(&text) {
    Ok(value) => Some(value),
    Err(e) => {
      log::warn!("Failed to parse MPV message: {} - {}", e, text.trim());
      None
    }
  }
}

#[derive(Debug, PartialEq)]
enum Frame {
  Line(BytesMut),
  /// A line longer than the limit was skipped.
  Oversized,
}

/// Splits raw bytes on `\n`. Content is never inspected here, so no line
/// can put the framed reader into its terminal error state.
struct LineSplitter {
  max_length: usize,
  /// Bytes already searched for a newline.
  next_index: usize,
  /// Inside an over-long line; drop bytes until its newline.
  discarding: bool,
}

impl LineSplitter {
  fn new(max_length: usize) -> Self {
    Self {
      max_length,
      next_index: 0,
      discarding: false,
    }
  }
}

impl Decoder for LineSplitter {
  type Item = Frame;
  type Error = std::io::Error;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
    let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');

    match newline {
      Some(offset) => {
        let end = self.next_index + offset;
        self.next_index = 0;
        if self.discarding {
          self.discarding = false;
          buf.advance(end + 1);
          return Ok(Some(Frame::Oversized));
        }
        let mut line = buf.split_to(end + 1);
        line.truncate(end);
        if end > self.max_length {
          return Ok(Some(Frame::Oversized));
        }
        Ok(Some(Frame::Line(line)))
      }
      None if self.discarding || buf.len() > self.max_length => {
        self.discarding = true;
        self.next_index = 0;
        buf.clear();
        Ok(None)
      }
      None => {
        self.next_index = buf.len();
        Ok(None)
      }
    }
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
    if let Some(frame) = self.decode(buf)? {
      return Ok(Some(frame));
    }
    self.next_index = 0;
    if self.discarding {
      self.discarding = false;
      buf.clear();
      return Ok(Some(Frame::Oversized));
    }
    if buf.is_empty() {
      return Ok(None);
    }
    // Last line without a trailing newline.
    Ok(Some(Frame::Line(buf.split_to(buf.len()))))
  }
}

/// Lazy stream of decoded JSON values read from an IPC connection.
pub struct MessageStream<R> {
  frames: FramedRead<R, LineSplitter>,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
  pub fn new(reader: R) -> Self {
    Self::with_max_length(reader, MAX_LINE_LENGTH)
  }

  fn with_max_length(reader: R, max_length: usize) -> Self {
    Self {
      frames: FramedRead::new(reader, LineSplitter::new(max_length)),
    }
  }

  /// Next decoded value, or `Ok(None)` once the peer has closed the stream.
  /// Errors are read failures of the underlying connection only.
  pub async fn next_message(&mut self) -> std::io::Result<Option<Value>> {
    loop {
      match self.frames.next().await {
        None => return Ok(None),
        Some(Ok(Frame::Line(line))) => {
          if let Some(value) = decode_line(&line) {
            return Ok(Some(value));
          }
        }
        Some(Ok(Frame::Oversized)) => {
          log::warn!("Discarding MPV message longer than {} bytes", self.frames.decoder().max_length);
        }
        Some(Err(e)) => return Err(e),
      }
    }
  }
}
