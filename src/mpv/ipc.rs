//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections, line framing and
//! request/response correlation. Unsolicited messages are forwarded as
//! [`IpcSignal`]s; the final signal on every connection is `Closed`.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::correlator::{Correlator, StaleRequest};
use super::framing::MessageStream;
use super::protocol::{MpvCommand, RawEvent};
use super::router;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(#[from] std::io::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("MPV error: {0}")]
  CommandFailed(String),
  #[error("Connection lost while waiting for a reply")]
  ConnectionLost,
  #[error("Disconnected")]
  Disconnected,
}

/// Lifecycle of one transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
}

impl ConnectionState {
  /// Allowed moves: Disconnected -> Connecting -> Connected -> Disconnected,
  /// plus Connecting -> Disconnected for a failed attempt.
  pub fn can_transition_to(self, next: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
      (self, next),
      (Disconnected, Connecting) | (Connecting, Connected) | (Connecting, Disconnected) | (Connected, Disconnected)
    )
  }
}

fn transition(state: &Mutex<ConnectionState>, next: ConnectionState) {
  let mut current = state.lock();
  if current.can_transition_to(next) {
    log::debug!("IPC connection state: {:?} -> {:?}", *current, next);
    *current = next;
  } else if *current != next {
    log::warn!("Ignoring IPC state change {:?} -> {:?}", *current, next);
  }
}

/// Signal delivered to the consumer of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum IpcSignal {
  Event(RawEvent),
  /// Connection ended. Sent exactly once, always last.
  Closed,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open one raw connection to the IPC endpoint.
#[cfg(windows)]
pub async fn open_endpoint(path: &str) -> Result<(BoxedReader, BoxedWriter), IpcError> {
  use tokio::net::windows::named_pipe::ClientOptions;

  let client = ClientOptions::new()
    .open(path)
    .map_err(|e| IpcError::ConnectionFailed(format!("Failed to open pipe: {}", e)))?;

  let (reader, writer) = tokio::io::split(client);
  Ok((Box::new(reader), Box::new(writer)))
}

/// Open one raw connection to the IPC endpoint.
#[cfg(not(windows))]
pub async fn open_endpoint(path: &str) -> Result<(BoxedReader, BoxedWriter), IpcError> {
  use tokio::net::UnixStream;

  let stream = UnixStream::connect(path)
    .await
    .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

  let (reader, writer) = stream.into_split();
  Ok((Box::new(reader), Box::new(writer)))
}

/// Writer channel message.
enum WriteMessage {
  Line(Vec<u8>),
  Close,
}

/// MPV IPC connection. Terminal once closed; reconnecting means a new handle.
pub struct MpvIpc {
  correlator: Arc<Correlator>,
  state: Arc<Mutex<ConnectionState>>,
  write_tx: Sender<WriteMessage>,
  signal_rx: Receiver<IpcSignal>,
  shutdown: CancellationToken,
  _reader_handle: JoinHandle<()>,
  _writer_handle: JoinHandle<()>,
}

impl MpvIpc {
  /// Connect to MPV IPC socket/pipe, retrying with linear backoff.
  pub async fn connect(path: &str, retry_count: u32, retry_delay: Duration) -> Result<Self, IpcError> {
    let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
    let mut last_error = None;

    for attempt in 0..retry_count.max(1) {
      if attempt > 0 {
        tokio::time::sleep(retry_delay * (attempt + 1)).await;
      }

      transition(&state, ConnectionState::Connecting);
      match open_endpoint(path).await {
        Ok((reader, writer)) => {
          transition(&state, ConnectionState::Connected);
          log::info!("MPV IPC connected to {}", path);
          return Ok(Self::setup(reader, writer, state));
        }
        Err(e) => {
          log::debug!("IPC connect attempt {} failed: {}", attempt + 1, e);
          transition(&state, ConnectionState::Disconnected);
          last_error = Some(e);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| IpcError::ConnectionFailed("Unknown error".into())))
  }

  fn setup(reader: BoxedReader, writer: BoxedWriter, state: Arc<Mutex<ConnectionState>>) -> Self {
    let correlator = Arc::new(Correlator::new());
    let shutdown = CancellationToken::new();

    let (signal_tx, signal_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let reader_handle = tokio::spawn(Self::reader_loop(
      reader,
      correlator.clone(),
      state.clone(),
      signal_tx,
      shutdown.clone(),
    ));
    let writer_handle = tokio::spawn(Self::writer_loop(writer, write_rx, shutdown.clone()));

    Self {
      correlator,
      state,
      write_tx,
      signal_rx,
      shutdown,
      _reader_handle: reader_handle,
      _writer_handle: writer_handle,
    }
  }

  async fn reader_loop(
    reader: BoxedReader,
    correlator: Arc<Correlator>,
    state: Arc<Mutex<ConnectionState>>,
    signal_tx: Sender<IpcSignal>,
    shutdown: CancellationToken,
  ) {
    log::debug!("MPV IPC reader loop started");
    let mut stream = MessageStream::new(reader);

    loop {
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
          log::info!("MPV IPC connection closed locally");
          break;
        }
        message = stream.next_message() => match message {
          Ok(Some(value)) => {
            if let Some(event) = router::route(value, &correlator) {
              let _ = signal_tx.send(IpcSignal::Event(event)).await;
            }
          }
          Ok(None) => {
            log::info!("MPV IPC connection closed");
            break;
          }
          Err(e) => {
            log::error!("MPV IPC read error: {}", e);
            break;
          }
        }
      }
    }

    let failed = correlator.fail_all();
    if failed > 0 {
      log::warn!("Failed {} pending MPV request(s): connection lost", failed);
    }
    transition(&state, ConnectionState::Disconnected);
    shutdown.cancel();
    let _ = signal_tx.send(IpcSignal::Closed).await;
    signal_tx.close();
  }

  async fn writer_loop(mut writer: BoxedWriter, write_rx: Receiver<WriteMessage>, shutdown: CancellationToken) {
    log::debug!("MPV IPC writer loop started");

    loop {
      let msg = tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        msg = write_rx.recv() => match msg {
          Ok(msg) => msg,
          Err(_) => break,
        },
      };

      match msg {
        WriteMessage::Line(mut data) => {
          data.push(b'\n');
          if let Err(e) = writer.write_all(&data).await {
            log::error!("MPV IPC write error: {}", e);
            break;
          }
          if let Err(e) = writer.flush().await {
            log::error!("MPV IPC flush error: {}", e);
            break;
          }
          log::trace!("MPV command written to socket");
        }
        WriteMessage::Close => {
          log::debug!("MPV IPC writer closing");
          break;
        }
      }
    }

    write_rx.close();
    let _ = writer.shutdown().await;
    shutdown.cancel();
  }

  /// Send a command and wait for its reply payload.
  ///
  /// Resolves when the matching reply arrives or fails with `ConnectionLost`
  /// when the connection goes away first.
  pub async fn send_command(&self, cmd: MpvCommand) -> Result<Value, IpcError> {
    let (request_id, rx) = self.correlator.register(cmd.verb())?;

    let line = match cmd.to_line(request_id) {
      Ok(line) => line,
      Err(e) => {
        self.correlator.cancel(request_id);
        return Err(IpcError::WriteFailed(e.into()));
      }
    };
    log::debug!("Sending MPV command: {}", line);

    if self
      .write_tx
      .send(WriteMessage::Line(line.into_bytes()))
      .await
      .is_err()
    {
      self.correlator.cancel(request_id);
      return Err(IpcError::Disconnected);
    }

    rx.await.unwrap_or(Err(IpcError::ConnectionLost))
  }

  /// Like [`send_command`](Self::send_command) but gives up after `timeout`.
  ///
  /// The request stays pending until a reply or teardown clears it; a late
  /// reply is dropped.
  pub async fn send_command_timeout(&self, cmd: MpvCommand, timeout: Duration) -> Result<Value, IpcError> {
    match tokio::time::timeout(timeout, self.send_command(cmd)).await {
      Ok(result) => result,
      Err(_) => {
        log::error!("MPV command timeout after {:?}", timeout);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Receiver for unsolicited events and the final `Closed` signal.
  pub fn signals(&self) -> Receiver<IpcSignal> {
    self.signal_rx.clone()
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.lock()
  }

  pub fn is_closed(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  pub fn pending_count(&self) -> usize {
    self.correlator.pending_count()
  }

  pub fn stale_requests(&self, older_than: Duration) -> Vec<StaleRequest> {
    self.correlator.stale_requests(older_than)
  }

  /// Close the connection. Pending requests fail with `ConnectionLost`.
  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
    self.shutdown.cancel();
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
