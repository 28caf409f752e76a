//! Seek completion detection.
//!
//! mpv announces the start of a seek but not its end. The end is inferred from
//! the next `playback-restart`, watched on a dedicated secondary connection so
//! the primary event path is not blocked.

use tokio::io::AsyncRead;

use super::framing::MessageStream;
use super::ipc::open_endpoint;
use super::protocol::{InboundMessage, MpvEvent};

/// Default number of messages inspected before a seek observation gives up.
pub const DEFAULT_SEEK_POLL_LIMIT: u32 = 20;

/// Result of one seek observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekOutcome {
  /// `playback-restart` arrived.
  Completed,
  /// The track list changed mid-seek.
  TrackChanged,
  /// The message ceiling was reached without a `playback-restart`.
  TimedOut,
  /// A newer seek or a teardown replaced this observation.
  Cancelled,
  /// The secondary connection could not be opened or ended early.
  ChannelFailed(String),
}

/// Watch `endpoint` on a fresh connection until the seek resolves.
///
/// The secondary connection is closed before this returns.
pub async fn observe_seek(endpoint: &str, poll_limit: u32) -> SeekOutcome {
  match open_endpoint(endpoint).await {
    Ok((reader, writer)) => {
      let outcome = watch(reader, poll_limit).await;
      drop(writer);
      outcome
    }
    Err(e) => SeekOutcome::ChannelFailed(e.to_string()),
  }
}

async fn watch<R: AsyncRead + Unpin>(reader: R, poll_limit: u32) -> SeekOutcome {
  let mut stream = MessageStream::new(reader);
  let mut received = 0u32;

  loop {
    let value = match stream.next_message().await {
      Ok(Some(value)) => value,
      Ok(None) => return SeekOutcome::ChannelFailed("connection closed".to_string()),
      Err(e) => return SeekOutcome::ChannelFailed(e.to_string()),
    };
    received += 1;

    match InboundMessage::from_value(value) {
      Ok(InboundMessage::Event(MpvEvent::PlaybackRestart)) => return SeekOutcome::Completed,
      Ok(InboundMessage::Event(MpvEvent::TracksChanged)) => return SeekOutcome::TrackChanged,
      _ => {}
    }

    if received >= poll_limit {
      return SeekOutcome::TimedOut;
    }
  }
}
