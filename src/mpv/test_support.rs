//! In-process stand-in for an mpv IPC server, used by unit tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How the fake player answers one command.
pub enum Reply {
  Data(Value),
  Error(String),
  Silent,
}

type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// Listens on a Unix socket in a temp dir and hands out accepted connections.
pub struct FakePlayer {
  _dir: tempfile::TempDir,
  path: PathBuf,
  accepted: mpsc::UnboundedReceiver<FakeConnection>,
}

/// Server side of one accepted connection.
pub struct FakeConnection {
  requests: Mutex<mpsc::UnboundedReceiver<Value>>,
  push_tx: mpsc::UnboundedSender<String>,
  closed: CancellationToken,
  peer_gone: CancellationToken,
}

impl FakePlayer {
  /// Bind a socket; `respond` receives the `command` array of every request.
  pub fn spawn<F>(respond: F) -> Self
  where
    F: Fn(&Value) -> Reply + Send + Sync + 'static,
  {
    let dir = tempfile::Builder::new()
      .prefix("mpv")
      .tempdir_in("/tmp")
      .expect("temp dir");
    let path = dir.path().join("mpv.sock");
    let listener = UnixListener::bind(&path).expect("bind fake mpv socket");
    let responder: Responder = Arc::new(respond);
    let (accepted_tx, accepted) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        let (reader, mut writer) = stream.into_split();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
        let closed = CancellationToken::new();
        let peer_gone = CancellationToken::new();

        let reply_tx = push_tx.clone();
        let responder = responder.clone();
        let reader_closed = closed.clone();
        let reader_peer_gone = peer_gone.clone();
        tokio::spawn(async move {
          let mut lines = BufReader::new(reader).lines();
          loop {
            let line = tokio::select! {
              _ = reader_closed.cancelled() => break,
              line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else {
              reader_peer_gone.cancel();
              break;
            };
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
              continue;
            };
            let id = request["request_id"].clone();
            let reply = match responder(&request["command"]) {
              Reply::Data(data) => Some(json!({"request_id": id, "error": "success", "data": data})),
              Reply::Error(error) => Some(json!({"request_id": id, "error": error})),
              Reply::Silent => None,
            };
            let _ = request_tx.send(request);
            if let Some(reply) = reply {
              let _ = reply_tx.send(reply.to_string());
            }
          }
        });

        let writer_closed = closed.clone();
        tokio::spawn(async move {
          loop {
            let line = tokio::select! {
              _ = writer_closed.cancelled() => break,
              line = push_rx.recv() => line,
            };
            let Some(line) = line else { break };
            if writer.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
              break;
            }
          }
          let _ = writer.shutdown().await;
        });

        let connection = FakeConnection {
          requests: Mutex::new(request_rx),
          push_tx,
          closed,
          peer_gone,
        };
        if accepted_tx.send(connection).is_err() {
          break;
        }
      }
    });

    Self {
      _dir: dir,
      path,
      accepted,
    }
  }

  pub fn path(&self) -> &str {
    self.path.to_str().expect("utf-8 socket path")
  }

  /// Next accepted connection, in accept order.
  pub async fn accept(&mut self) -> FakeConnection {
    tokio::time::timeout(Duration::from_secs(5), self.accepted.recv())
      .await
      .expect("timed out waiting for a connection")
      .expect("listener stopped")
  }
}

impl FakeConnection {
  /// Send one raw line to the client.
  pub fn push(&self, line: &str) {
    let _ = self.push_tx.send(line.to_string());
  }

  /// Next request the client sent.
  pub async fn next_request(&self) -> Value {
    let mut requests = self.requests.lock().await;
    tokio::time::timeout(Duration::from_secs(5), requests.recv())
      .await
      .expect("timed out waiting for a request")
      .expect("connection closed")
  }

  /// Wait until the client closes its side of the connection.
  pub async fn wait_closed(&self) {
    tokio::time::timeout(Duration::from_secs(5), self.peer_gone.cancelled())
      .await
      .expect("client never closed the connection");
  }

  /// Close the connection from the player side.
  pub fn disconnect(&self) {
    self.closed.cancel();
  }
}
