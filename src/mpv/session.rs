//! Per-connection event loop.
//!
//! One task owns the translator state, consumes transport signals and seek
//! outcomes in order, and publishes semantic events. It ends when the player
//! process exits; every resource it started is released on the way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::events::{Effect, EventTranslator, PlayerEvent};
use super::ipc::{IpcError, IpcSignal, MpvIpc};
use super::protocol::{MpvCommand, TIME_POS_PROPERTY};
use super::seek::{observe_seek, SeekOutcome};

/// Settings a session needs from the player configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
  pub endpoint: String,
  pub seek_poll_limit: u32,
  pub time_update: Duration,
  pub command_timeout: Option<Duration>,
}

/// Everything a session starts. Dropping it stops the poller, abandons any
/// seek observation and closes the transport.
struct SessionResources {
  ipc: Arc<MpvIpc>,
  poller: CancellationToken,
  seek: Option<CancellationToken>,
}

impl Drop for SessionResources {
  fn drop(&mut self) {
    self.poller.cancel();
    if let Some(seek) = self.seek.take() {
      seek.cancel();
    }
    self.ipc.close();
  }
}

fn publish(events: &broadcast::Sender<PlayerEvent>, event: PlayerEvent) {
  log::debug!("Player event: {:?}", event);
  if events.send(event).is_err() {
    log::trace!("No subscribers for player event");
  }
}

/// Run the event loop for one connected player until its process exits.
///
/// Returns the exit code (`None` = killed by a signal).
pub async fn run_session(
  ipc: Arc<MpvIpc>,
  mut exit_rx: oneshot::Receiver<Option<i32>>,
  events: broadcast::Sender<PlayerEvent>,
  options: SessionOptions,
) -> Option<i32> {
  let signals = ipc.signals();
  let mut translator = EventTranslator::new();
  let (seek_tx, mut seek_rx) = mpsc::unbounded_channel::<(u64, SeekOutcome)>();
  let mut resources = SessionResources {
    ipc: ipc.clone(),
    poller: CancellationToken::new(),
    seek: None,
  };

  spawn_position_poller(
    ipc.clone(),
    events.clone(),
    options.time_update,
    options.command_timeout,
    resources.poller.clone(),
  );

  let mut transport_open = true;
  let code = loop {
    tokio::select! {
      biased;
      signal = signals.recv(), if transport_open => match signal {
        Ok(IpcSignal::Event(raw)) => {
          for effect in translator.translate(raw) {
            match effect {
              Effect::Emit(event) => publish(&events, event),
              Effect::ObserveSeek { generation } => {
                let token = CancellationToken::new();
                if let Some(previous) = resources.seek.replace(token.clone()) {
                  previous.cancel();
                }
                spawn_seek_observer(
                  options.endpoint.clone(),
                  options.seek_poll_limit,
                  generation,
                  token,
                  seek_tx.clone(),
                );
              }
            }
          }
        }
        Ok(IpcSignal::Closed) | Err(_) => {
          log::warn!("MPV IPC connection closed; waiting for the process to exit");
          transport_open = false;
        }
      },
      Some((generation, outcome)) = seek_rx.recv() => {
        if let Some(event) = translator.complete_seek(generation, outcome) {
          publish(&events, event);
        }
      }
      code = &mut exit_rx => break code.unwrap_or(None),
    }
  };

  translator.reset();
  drop(resources);
  log::info!("MPV session ended (exit code {:?})", code);
  code
}

fn spawn_seek_observer(
  endpoint: String,
  poll_limit: u32,
  generation: u64,
  cancel: CancellationToken,
  outcome_tx: mpsc::UnboundedSender<(u64, SeekOutcome)>,
) {
  tokio::spawn(async move {
    let outcome = tokio::select! {
      _ = cancel.cancelled() => SeekOutcome::Cancelled,
      outcome = observe_seek(&endpoint, poll_limit) => outcome,
    };
    let _ = outcome_tx.send((generation, outcome));
  });
}

fn spawn_position_poller(
  ipc: Arc<MpvIpc>,
  events: broadcast::Sender<PlayerEvent>,
  interval: Duration,
  timeout: Option<Duration>,
  cancel: CancellationToken,
) {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }

      let cmd = MpvCommand::get_property(TIME_POS_PROPERTY);
      let result = match timeout {
        Some(timeout) => ipc.send_command_timeout(cmd, timeout).await,
        None => ipc.send_command(cmd).await,
      };
      match result {
        Ok(value) => {
          if let Some(position) = value.as_f64() {
            publish(&events, PlayerEvent::TimePosition(position));
          }
        }
        // Unavailable while idle.
        Err(IpcError::CommandFailed(_)) => {}
        Err(e) => {
          log::debug!("Position poll failed: {}", e);
          if ipc.is_closed() {
            break;
          }
        }
      }
    }
    log::debug!("Position poller stopped");
  });
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::mpv::events::{SeekRange, StatusChange};
  use crate::mpv::protocol::PropertyValue;
  use crate::mpv::test_support::{FakeConnection, FakePlayer, Reply};
  use serde_json::{json, Value};
  use tokio::task::JoinHandle;

  struct Harness {
    player: FakePlayer,
    primary: FakeConnection,
    events: broadcast::Receiver<PlayerEvent>,
    exit_tx: Option<oneshot::Sender<Option<i32>>>,
    ipc: Arc<MpvIpc>,
    task: JoinHandle<Option<i32>>,
  }

  async fn start(poll_limit: u32, respond: fn(&Value) -> Reply) -> Harness {
    let mut player = FakePlayer::spawn(respond);
    let ipc = Arc::new(
      MpvIpc::connect(player.path(), 3, Duration::from_millis(10))
        .await
        .unwrap(),
    );
    let primary = player.accept().await;
    let (events_tx, events) = broadcast::channel(64);
    let (exit_tx, exit_rx) = oneshot::channel();
    let options = SessionOptions {
      endpoint: player.path().to_string(),
      seek_poll_limit: poll_limit,
      time_update: Duration::from_secs(3600),
      command_timeout: None,
    };
    let task = tokio::spawn(run_session(ipc.clone(), exit_rx, events_tx, options));
    Harness {
      player,
      primary,
      events,
      exit_tx: Some(exit_tx),
      ipc,
      task,
    }
  }

  async fn next_event(events: &mut broadcast::Receiver<PlayerEvent>) -> PlayerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .expect("timed out waiting for a player event")
      .expect("event channel closed")
  }

  fn status(property: &str, value: f64) -> PlayerEvent {
    PlayerEvent::Status(StatusChange {
      property: property.to_string(),
      value: PropertyValue::Number(value),
    })
  }

  fn time_pos_line(value: f64) -> String {
    json!({"event": "property-change", "id": 1, "name": "time-pos", "data": value}).to_string()
  }

  fn ok(_: &Value) -> Reply {
    Reply::Data(Value::Null)
  }

  #[tokio::test]
  async fn seek_reports_start_and_end_positions() {
    let mut h = start(20, ok).await;

    h.primary.push(&time_pos_line(10.0));
    assert_eq!(next_event(&mut h.events).await, status("time-pos", 10.0));

    h.primary.push(r#"{"event":"seek"}"#);
    let secondary = h.player.accept().await;

    h.primary.push(&time_pos_line(15.0));
    assert_eq!(next_event(&mut h.events).await, status("time-pos", 15.0));

    secondary.push(r#"{"event":"playback-restart"}"#);
    assert_eq!(
      next_event(&mut h.events).await,
      PlayerEvent::Seek(SeekRange {
        start: Some(10.0),
        end: Some(15.0),
      })
    );
    secondary.wait_closed().await;

    // mpv's copy of the same playback-restart on the primary connection
    h.primary.push(r#"{"event":"playback-restart"}"#);
    h.primary.push(r#"{"event":"pause"}"#);
    assert_eq!(next_event(&mut h.events).await, PlayerEvent::Paused);
  }

  #[tokio::test]
  async fn seek_timeout_emits_nothing_and_clears_seeking() {
    let mut h = start(3, ok).await;

    h.primary.push(r#"{"event":"seek"}"#);
    let secondary = h.player.accept().await;
    for _ in 0..3 {
      secondary.push(r#"{"event":"audio-reconfig"}"#);
    }
    secondary.wait_closed().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.primary.push(r#"{"event":"playback-restart"}"#);
    assert_eq!(next_event(&mut h.events).await, PlayerEvent::Resumed);
  }

  #[tokio::test]
  async fn malformed_line_is_not_fatal() {
    let mut h = start(20, ok).await;

    h.primary.push("{\"event\": oops");
    h.primary.push(r#"{"event":"file-loaded"}"#);
    assert_eq!(next_event(&mut h.events).await, PlayerEvent::Started);
  }

  #[tokio::test]
  async fn async_error_reaches_subscribers() {
    let mut h = start(20, ok).await;

    h.primary.push(r#"{"error":"invalid parameter"}"#);
    match next_event(&mut h.events).await {
      PlayerEvent::Error(e) => assert_eq!(e.to_string(), "MPV error: invalid parameter"),
      other => panic!("Expected error event, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn process_exit_tears_down_transport() {
    let mut h = start(20, |_| Reply::Silent).await;

    let pending = {
      let ipc = h.ipc.clone();
      tokio::spawn(async move { ipc.send_command(MpvCommand::get_property("pause")).await })
    };
    h.primary.next_request().await;

    h.exit_tx.take().unwrap().send(Some(1)).unwrap();
    assert_eq!(h.task.await.unwrap(), Some(1));
    assert!(matches!(pending.await.unwrap(), Err(IpcError::ConnectionLost)));
    h.primary.wait_closed().await;
  }

  #[tokio::test]
  async fn position_poller_reports_time() {
    let mut player = FakePlayer::spawn(|command| {
      if command[0] == "get_property" {
        Reply::Data(json!(7.5))
      } else {
        Reply::Data(Value::Null)
      }
    });
    let ipc = Arc::new(
      MpvIpc::connect(player.path(), 3, Duration::from_millis(10))
        .await
        .unwrap(),
    );
    let _primary = player.accept().await;
    let (events_tx, mut events) = broadcast::channel(16);
    let (exit_tx, exit_rx) = oneshot::channel();
    let options = SessionOptions {
      endpoint: player.path().to_string(),
      seek_poll_limit: 20,
      time_update: Duration::from_millis(20),
      command_timeout: Some(Duration::from_secs(1)),
    };
    let task = tokio::spawn(run_session(ipc, exit_rx, events_tx, options));

    assert_eq!(next_event(&mut events).await, PlayerEvent::TimePosition(7.5));
    exit_tx.send(Some(0)).unwrap();
    assert_eq!(task.await.unwrap(), Some(0));
  }
}
