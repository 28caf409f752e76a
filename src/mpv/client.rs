//! High-level MPV client: process lifecycle, crash handling and commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::correlator::StaleRequest;
use super::events::{exit_event, PlayerError, PlayerEvent};
use super::ipc::{ConnectionState, IpcError, MpvIpc};
use super::process::{cleanup_ipc, default_ipc_path, spawn_mpv, watch_process, ExitKind, ProcessError, ProcessWatch};
use super::protocol::{MpvCommand, TIME_POS_PROPERTY};
use super::session::{run_session, SessionOptions};
use crate::config::PlayerConfig;

/// Observer id reserved for the position cache.
const TIME_POS_OBSERVER_ID: i64 = 1;

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum MpvError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("MPV did not become controllable: {0}")]
  StartFailed(String),
  #[error("MPV is already active ({0:?})")]
  AlreadyRunning(LifecycleState),
  #[error("MPV is not running")]
  NotRunning,
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

/// Process lifecycle: Stopped -> Starting -> Running -> (Stopping | Crashing) -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Stopped,
  Starting,
  Running,
  Stopping,
  Crashing,
}

/// Handles on the running player and its session.
struct ActiveSession {
  ipc: Arc<MpvIpc>,
  pid: Option<u32>,
  kill: CancellationToken,
  /// Cancelled once the exit of this session has been handled.
  done: CancellationToken,
}

/// Properties observed on behalf of the caller, re-observed after a restart.
struct ObservedProperties {
  next_id: i64,
  by_name: HashMap<String, i64>,
}

impl ObservedProperties {
  fn new() -> Self {
    Self {
      next_id: TIME_POS_OBSERVER_ID + 1,
      by_name: HashMap::new(),
    }
  }

  fn id_for(&mut self, name: &str) -> i64 {
    if let Some(id) = self.by_name.get(name) {
      return *id;
    }
    let id = self.next_id;
    self.next_id += 1;
    id
  }
}

/// Brings up a player process and an IPC connection to it.
trait Launcher: Send + Sync {
  fn launch(&self, config: PlayerConfig, endpoint: String) -> BoxFuture<'static, Result<(MpvIpc, ProcessWatch), MpvError>>;

  /// Remove what a stopped player left at `endpoint`.
  fn release(&self, endpoint: &str) {
    cleanup_ipc(endpoint);
  }
}

/// Spawns the mpv binary and waits for its IPC server.
struct SpawnMpv;

impl Launcher for SpawnMpv {
  fn launch(&self, config: PlayerConfig, endpoint: String) -> BoxFuture<'static, Result<(MpvIpc, ProcessWatch), MpvError>> {
    async move {
      // Cleanup any existing socket
      cleanup_ipc(&endpoint);

      let child = spawn_mpv(&config, &endpoint)?;
      let watch = watch_process(child);

      match MpvIpc::connect(&endpoint, config.connect_retries, config.connect_retry_delay()).await {
        Ok(ipc) => Ok::<_, MpvError>((ipc, watch)),
        Err(e) => {
          watch.kill.cancel();
          let _ = watch.exit_rx.await;
          cleanup_ipc(&endpoint);
          Err(MpvError::StartFailed(e.to_string()))
        }
      }
    }
    .boxed()
  }
}

/// High-level MPV client.
#[derive(Clone)]
pub struct MpvClient {
  config: Arc<Mutex<PlayerConfig>>,
  ipc_path: Arc<String>,
  lifecycle: Arc<Mutex<LifecycleState>>,
  running: Arc<AtomicBool>,
  active: Arc<Mutex<Option<ActiveSession>>>,
  observed: Arc<Mutex<ObservedProperties>>,
  events: broadcast::Sender<PlayerEvent>,
  launcher: Arc<dyn Launcher>,
}

impl MpvClient {
  /// Create a new MPV client. Nothing is spawned until [`start`](Self::start).
  pub fn new(config: PlayerConfig) -> Self {
    Self::with_launcher(config, Arc::new(SpawnMpv))
  }

  fn with_launcher(config: PlayerConfig, launcher: Arc<dyn Launcher>) -> Self {
    let ipc_path = config
      .socket_path
      .clone()
      .filter(|s| !s.trim().is_empty())
      .unwrap_or_else(default_ipc_path);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Self {
      config: Arc::new(Mutex::new(config)),
      ipc_path: Arc::new(ipc_path),
      lifecycle: Arc::new(Mutex::new(LifecycleState::Stopped)),
      running: Arc::new(AtomicBool::new(false)),
      active: Arc::new(Mutex::new(None)),
      observed: Arc::new(Mutex::new(ObservedProperties::new())),
      events,
      launcher,
    }
  }

  /// Replace the configuration (takes effect on next start; the IPC path is fixed).
  pub fn set_config(&self, config: PlayerConfig) {
    *self.config.lock() = config;
  }

  pub fn config(&self) -> PlayerConfig {
    self.config.lock().clone()
  }

  /// IPC endpoint used by this client.
  pub fn ipc_path(&self) -> &str {
    &self.ipc_path
  }

  /// Subscribe to player events.
  pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
    self.events.subscribe()
  }

  pub fn state(&self) -> LifecycleState {
    *self.lifecycle.lock()
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub fn connection_state(&self) -> ConnectionState {
    self
      .active
      .lock()
      .as_ref()
      .map(|active| active.ipc.state())
      .unwrap_or(ConnectionState::Disconnected)
  }

  /// Process id of the running player.
  pub fn pid(&self) -> Option<u32> {
    self.active.lock().as_ref().and_then(|active| active.pid)
  }

  /// Requests that have waited longer than `older_than` for a reply.
  pub fn stale_requests(&self, older_than: Duration) -> Vec<StaleRequest> {
    self
      .active
      .lock()
      .as_ref()
      .map(|active| active.ipc.stale_requests(older_than))
      .unwrap_or_default()
  }

  /// Commands still waiting for a reply.
  pub fn pending_requests(&self) -> usize {
    self
      .active
      .lock()
      .as_ref()
      .map(|active| active.ipc.pending_count())
      .unwrap_or(0)
  }

  fn set_state(&self, next: LifecycleState) {
    let mut state = self.lifecycle.lock();
    log::debug!("MPV lifecycle: {:?} -> {:?}", *state, next);
    *state = next;
  }

  fn publish(&self, event: PlayerEvent) {
    let _ = self.events.send(event);
  }

  /// Start MPV and connect to IPC.
  pub async fn start(&self) -> Result<(), MpvError> {
    let config = self.config.lock().clone();
    config.validate().map_err(MpvError::InvalidConfig)?;

    {
      let mut state = self.lifecycle.lock();
      if *state != LifecycleState::Stopped {
        return Err(MpvError::AlreadyRunning(*state));
      }
      log::debug!("MPV lifecycle: {:?} -> {:?}", *state, LifecycleState::Starting);
      *state = LifecycleState::Starting;
    }

    match self.launcher.launch(config.clone(), self.ipc_path.to_string()).await {
      Ok((ipc, watch)) => {
        self.attach(Arc::new(ipc), watch, &config).await;
        log::info!("MPV client connected");
        Ok(())
      }
      Err(e) => {
        log::error!("Failed to start MPV: {}", e);
        self.set_state(LifecycleState::Stopped);
        Err(e)
      }
    }
  }

  /// Wire a connected transport and a supervised process into a session.
  pub(super) async fn attach(&self, ipc: Arc<MpvIpc>, watch: ProcessWatch, config: &PlayerConfig) {
    let ProcessWatch { pid, exit_rx, kill } = watch;
    let done = CancellationToken::new();
    let options = SessionOptions {
      endpoint: self.ipc_path.to_string(),
      seek_poll_limit: config.seek_poll_limit,
      time_update: config.time_update_interval(),
      command_timeout: config.command_timeout(),
    };

    *self.active.lock() = Some(ActiveSession {
      ipc: ipc.clone(),
      pid,
      kill,
      done: done.clone(),
    });
    self.running.store(true, Ordering::SeqCst);
    self.set_state(LifecycleState::Running);

    let client = self.clone();
    let events = self.events.clone();
    tokio::spawn(async move {
      let code = run_session(ipc, exit_rx, events, options).await;
      client.handle_exit(code, done).await;
    });

    if let Err(e) = self
      .send(MpvCommand::observe_property(TIME_POS_OBSERVER_ID, TIME_POS_PROPERTY))
      .await
    {
      log::warn!("Failed to observe {}: {}", TIME_POS_PROPERTY, e);
    }

    let observed: Vec<(String, i64)> = self
      .observed
      .lock()
      .by_name
      .iter()
      .map(|(name, id)| (name.clone(), *id))
      .collect();
    for (name, id) in observed {
      if let Err(e) = self.send(MpvCommand::observe_property(id, &name)).await {
        log::warn!("Failed to re-observe {}: {}", name, e);
      }
    }
  }

  /// React to the player process going away. The session has already closed
  /// the transport, stopped the poller and failed pending requests.
  async fn handle_exit(&self, code: Option<i32>, done: CancellationToken) {
    let stop_requested = self.state() == LifecycleState::Stopping;
    let kind = ExitKind::classify(code, stop_requested);
    if kind == ExitKind::Crash {
      self.set_state(LifecycleState::Crashing);
    }

    self.active.lock().take();
    self.running.store(false, Ordering::SeqCst);
    self.launcher.release(&self.ipc_path);
    self.set_state(LifecycleState::Stopped);
    done.cancel();

    match kind {
      ExitKind::Clean => {
        log::info!("MPV was quit (exit code {:?})", code);
        self.publish(exit_event(kind));
      }
      ExitKind::Crash => {
        log::warn!("MPV exited unexpectedly (exit code {:?})", code);
        self.publish(exit_event(kind));

        if self.config.lock().auto_restart {
          log::info!("Restarting MPV after crash");
          match self.restart().await {
            Ok(()) => {
              log::info!("Restarted MPV after crash");
              self.publish(PlayerEvent::Crashed);
            }
            Err(e) => {
              log::error!("Error restarting MPV after crash: {}", e);
              self.publish(PlayerEvent::Error(PlayerError::RestartFailed(e.to_string())));
            }
          }
        }
      }
    }
  }

  fn restart(&self) -> BoxFuture<'static, Result<(), MpvError>> {
    let client = self.clone();
    async move { client.start().await }.boxed()
  }

  fn session_handles(&self) -> Option<(Arc<MpvIpc>, CancellationToken, CancellationToken)> {
    self
      .active
      .lock()
      .as_ref()
      .map(|active| (active.ipc.clone(), active.kill.clone(), active.done.clone()))
  }

  /// Quit MPV gracefully, killing it if it does not exit in time.
  pub async fn quit(&self) -> Result<(), MpvError> {
    let (ipc, kill, done) = self.session_handles().ok_or(MpvError::NotRunning)?;
    self.set_state(LifecycleState::Stopping);

    let timeout = self.config.lock().quit_timeout();
    match ipc.send_command_timeout(MpvCommand::quit(), timeout).await {
      Ok(_) | Err(IpcError::ConnectionLost) => {}
      Err(e) => log::debug!("quit command failed: {}", e),
    }

    if tokio::time::timeout(timeout, done.cancelled()).await.is_err() {
      log::warn!("MPV did not exit within {:?} after quit; killing it", timeout);
      kill.cancel();
      done.cancelled().await;
    }
    Ok(())
  }

  /// Kill MPV without asking it to quit.
  pub async fn stop(&self) {
    let Some((ipc, kill, done)) = self.session_handles() else {
      log::warn!("No MPV process to stop");
      return;
    };
    log::info!("stop() called - killing MPV");
    self.set_state(LifecycleState::Stopping);
    ipc.close();
    kill.cancel();
    done.cancelled().await;
    log::info!("MPV client stopped");
  }

  fn get_ipc(&self) -> Result<Arc<MpvIpc>, MpvError> {
    let guard = self.active.lock();
    guard
      .as_ref()
      .map(|active| active.ipc.clone())
      .ok_or(MpvError::NotRunning)
  }

  /// Send a command to MPV, applying the configured reply timeout.
  pub(crate) async fn send(&self, cmd: MpvCommand) -> Result<Value, MpvError> {
    let ipc = self.get_ipc()?;
    let timeout = self.config.lock().command_timeout();
    let data = match timeout {
      Some(timeout) => ipc.send_command_timeout(cmd, timeout).await?,
      None => ipc.send_command(cmd).await?,
    };
    Ok(data)
  }

  /// Issue an arbitrary command and return its reply payload.
  pub async fn command(&self, verb: &str, args: Vec<Value>) -> Result<Value, MpvError> {
    self.send(MpvCommand::new(verb, args)).await
  }

  /// Observe a property; changes arrive as [`PlayerEvent::Status`].
  pub async fn observe_property(&self, name: &str) -> Result<(), MpvError> {
    let id = self.observed.lock().id_for(name);
    self.send(MpvCommand::observe_property(id, name)).await?;
    self.observed.lock().by_name.insert(name.to_string(), id);
    Ok(())
  }

  /// Stop observing a property previously passed to `observe_property`.
  pub async fn unobserve_property(&self, name: &str) -> Result<(), MpvError> {
    let Some(id) = self.observed.lock().by_name.remove(name) else {
      log::debug!("Property {} is not observed", name);
      return Ok(());
    };
    self.send(MpvCommand::unobserve_property(id)).await?;
    Ok(())
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::mpv::test_support::{FakeConnection, FakePlayer, Reply};
  use serde_json::json;
  use tokio::sync::{mpsc, oneshot};

  /// Connects to a fake player and hands the test each session's exit sender.
  struct FakeLauncher {
    exits: mpsc::UnboundedSender<oneshot::Sender<Option<i32>>>,
  }

  impl Launcher for FakeLauncher {
    fn launch(&self, config: PlayerConfig, endpoint: String) -> BoxFuture<'static, Result<(MpvIpc, ProcessWatch), MpvError>> {
      let exits = self.exits.clone();
      async move {
        let ipc = MpvIpc::connect(&endpoint, config.connect_retries, config.connect_retry_delay())
          .await
          .map_err(|e| MpvError::StartFailed(e.to_string()))?;
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exits.send(exit_tx);
        let watch = ProcessWatch {
          pid: None,
          exit_rx,
          kill: CancellationToken::new(),
        };
        Ok::<_, MpvError>((ipc, watch))
      }
      .boxed()
    }

    // The fake socket outlives each session.
    fn release(&self, _endpoint: &str) {}
  }

  struct Attached {
    client: MpvClient,
    _player: FakePlayer,
    conn: FakeConnection,
    events: broadcast::Receiver<PlayerEvent>,
    exit_tx: oneshot::Sender<Option<i32>>,
    kill: CancellationToken,
  }

  fn test_config(path: &str, auto_restart: bool) -> PlayerConfig {
    PlayerConfig {
      socket_path: Some(path.to_string()),
      auto_restart,
      time_update: 3600,
      connect_retries: 2,
      connect_retry_delay_ms: 10,
      quit_timeout_ms: 200,
      ..PlayerConfig::default()
    }
  }

  async fn attached(auto_restart: bool) -> Attached {
    let mut player = FakePlayer::spawn(|command| match command[0].as_str() {
      Some("get_property") => Reply::Data(json!(12.0)),
      Some("bogus") => Reply::Error("invalid parameter".to_string()),
      _ => Reply::Data(Value::Null),
    });
    let config = test_config(player.path(), auto_restart);
    let ipc = MpvIpc::connect(player.path(), 2, Duration::from_millis(10))
      .await
      .unwrap();
    let conn = player.accept().await;

    let (exit_tx, exit_rx) = oneshot::channel();
    let kill = CancellationToken::new();
    let watch = ProcessWatch {
      pid: None,
      exit_rx,
      kill: kill.clone(),
    };

    let client = MpvClient::new(config.clone());
    let events = client.subscribe();
    client.attach(Arc::new(ipc), watch, &config).await;

    let observe = conn.next_request().await;
    assert_eq!(observe["command"], json!(["observe_property", 1, "time-pos"]));

    Attached {
      client,
      _player: player,
      conn,
      events,
      exit_tx,
      kill,
    }
  }

  async fn next_event(events: &mut broadcast::Receiver<PlayerEvent>) -> PlayerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .expect("timed out waiting for a player event")
      .expect("event channel closed")
  }

  async fn assert_quiet(events: &mut broadcast::Receiver<PlayerEvent>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
      events.try_recv(),
      Err(broadcast::error::TryRecvError::Empty)
    ));
  }

  #[tokio::test]
  async fn crash_without_restart_emits_crashed_once() {
    let mut a = attached(false).await;
    assert!(a.client.is_running());
    assert_eq!(a.client.state(), LifecycleState::Running);

    a.exit_tx.send(Some(1)).unwrap();
    assert_eq!(next_event(&mut a.events).await, PlayerEvent::Crashed);
    assert_quiet(&mut a.events).await;

    assert!(!a.client.is_running());
    assert_eq!(a.client.state(), LifecycleState::Stopped);
    assert_eq!(a.client.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
      a.client.command("get_property", vec![json!("pause")]).await,
      Err(MpvError::NotRunning)
    ));
  }

  #[tokio::test]
  async fn clean_exit_emits_quit_once() {
    let mut a = attached(false).await;

    a.exit_tx.send(Some(0)).unwrap();
    assert_eq!(next_event(&mut a.events).await, PlayerEvent::Quit);
    assert_quiet(&mut a.events).await;
    assert!(!a.client.is_running());
  }

  #[tokio::test]
  async fn crash_with_auto_restart_recovers() {
    let mut player = FakePlayer::spawn(|_| Reply::Data(Value::Null));
    let (exits_tx, mut exits) = mpsc::unbounded_channel();
    let client = MpvClient::with_launcher(
      test_config(player.path(), true),
      Arc::new(FakeLauncher { exits: exits_tx }),
    );
    let mut events = client.subscribe();

    client.start().await.unwrap();
    let first = player.accept().await;
    assert_eq!(first.next_request().await["command"], json!(["observe_property", 1, "time-pos"]));
    client.observe_property("volume").await.unwrap();
    assert_eq!(first.next_request().await["command"], json!(["observe_property", 2, "volume"]));

    exits.recv().await.unwrap().send(Some(1)).unwrap();
    assert_eq!(next_event(&mut events).await, PlayerEvent::Crashed);

    let second = player.accept().await;
    assert_eq!(second.next_request().await["command"], json!(["observe_property", 1, "time-pos"]));
    assert_eq!(second.next_request().await["command"], json!(["observe_property", 2, "volume"]));
    assert_eq!(next_event(&mut events).await, PlayerEvent::Crashed);
    assert_quiet(&mut events).await;

    assert!(client.is_running());
    assert_eq!(client.state(), LifecycleState::Running);
    // Keeps the restarted session alive until the end of the test.
    let _second_exit = exits.recv().await.unwrap();
  }

  #[tokio::test]
  async fn restart_failure_is_reported() {
    let mut a = attached(true).await;
    a.client.set_config(PlayerConfig {
      binary: Some("true".to_string()),
      ..a.client.config()
    });

    a.exit_tx.send(None).unwrap();
    assert_eq!(next_event(&mut a.events).await, PlayerEvent::Crashed);
    match next_event(&mut a.events).await {
      PlayerEvent::Error(PlayerError::RestartFailed(_)) => {}
      other => panic!("Expected restart failure, got {:?}", other),
    }
    assert!(!a.client.is_running());
    assert_eq!(a.client.state(), LifecycleState::Stopped);
  }

  #[tokio::test]
  async fn quit_waits_for_clean_exit() {
    let mut a = attached(false).await;
    let client = a.client.clone();
    let quitter = tokio::spawn(async move { client.quit().await });

    let request = a.conn.next_request().await;
    assert_eq!(request["command"], json!(["quit"]));
    a.exit_tx.send(Some(0)).unwrap();

    quitter.await.unwrap().unwrap();
    assert_eq!(next_event(&mut a.events).await, PlayerEvent::Quit);
    assert!(!a.client.is_running());
  }

  #[tokio::test]
  async fn quit_kills_unresponsive_player() {
    let mut a = attached(false).await;
    let exit_tx = a.exit_tx;
    let kill = a.kill.clone();
    tokio::spawn(async move {
      kill.cancelled().await;
      let _ = exit_tx.send(None);
    });

    a.client.quit().await.unwrap();
    assert_eq!(next_event(&mut a.events).await, PlayerEvent::Quit);
  }

  #[tokio::test]
  async fn commands_resolve_and_report_errors() {
    let a = attached(false).await;

    let value = a
      .client
      .command("get_property", vec![json!("time-pos")])
      .await
      .unwrap();
    assert_eq!(value, json!(12.0));

    match a.client.command("bogus", Vec::new()).await {
      Err(MpvError::Ipc(IpcError::CommandFailed(msg))) => assert_eq!(msg, "invalid parameter"),
      other => panic!("Expected command failure, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn observe_and_unobserve_by_name() {
    let a = attached(false).await;

    a.client.observe_property("volume").await.unwrap();
    let request = a.conn.next_request().await;
    assert_eq!(request["command"], json!(["observe_property", 2, "volume"]));

    a.client.observe_property("volume").await.unwrap();
    let request = a.conn.next_request().await;
    assert_eq!(request["command"], json!(["observe_property", 2, "volume"]));

    a.client.unobserve_property("volume").await.unwrap();
    let request = a.conn.next_request().await;
    assert_eq!(request["command"], json!(["unobserve_property", 2]));

    a.client.unobserve_property("volume").await.unwrap();
  }

  #[tokio::test]
  async fn start_fails_when_endpoint_never_appears() {
    let dir = tempfile::Builder::new().prefix("mpv").tempdir_in("/tmp").unwrap();
    let path = dir.path().join("never.sock");
    let config = PlayerConfig {
      binary: Some("true".to_string()),
      ..test_config(path.to_str().unwrap(), false)
    };
    let client = MpvClient::new(config);

    assert!(matches!(client.start().await, Err(MpvError::StartFailed(_))));
    assert!(!client.is_running());
    assert_eq!(client.state(), LifecycleState::Stopped);
  }

  #[tokio::test]
  async fn start_fails_for_missing_binary() {
    let config = PlayerConfig {
      binary: Some("/nonexistent/path/to/mpv".to_string()),
      ..test_config("/tmp/mpv-remote-missing-binary.sock", false)
    };
    let client = MpvClient::new(config);
    assert!(matches!(
      client.start().await,
      Err(MpvError::Process(ProcessError::SpawnFailed(_)))
    ));
    assert_eq!(client.state(), LifecycleState::Stopped);
  }

  #[tokio::test]
  async fn start_rejects_invalid_config() {
    let client = MpvClient::new(PlayerConfig {
      time_update: 0,
      ..PlayerConfig::default()
    });
    assert!(matches!(client.start().await, Err(MpvError::InvalidConfig(_))));
  }

  #[tokio::test]
  async fn quit_without_player_is_an_error() {
    let client = MpvClient::new(PlayerConfig::default());
    assert!(matches!(client.quit().await, Err(MpvError::NotRunning)));
  }
}
