//! MPV process detection, spawning and exit supervision.

use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::PlayerConfig;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// How the player process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
  Clean,
  Crash,
}

impl ExitKind {
  /// Exit code 0 is a clean quit. Any other code, or death by signal
  /// (`None`), is a crash unless a stop had been requested.
  pub fn classify(code: Option<i32>, stop_requested: bool) -> Self {
    match code {
      Some(0) => ExitKind::Clean,
      _ if stop_requested => ExitKind::Clean,
      _ => ExitKind::Crash,
    }
  }
}

/// Default IPC endpoint, unique per client so sessions never share a socket.
pub fn default_ipc_path() -> String {
  let name = format!("mpv-remote-{}", uuid::Uuid::new_v4().simple());
  #[cfg(windows)]
  {
    format!(r"\\.\pipe\{}", name)
  }
  #[cfg(not(windows))]
  {
    let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
    dir.join(format!("{}.sock", name)).to_string_lossy().into_owned()
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Command-line arguments for a controllable, headless-by-default player.
pub fn mpv_args(config: &PlayerConfig, ipc_path: &str) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", ipc_path),
    "--idle=yes".to_string(),
    "--no-terminal".to_string(),
    "--keep-open=no".to_string(),
  ];
  if config.audio_only {
    args.push("--no-video".to_string());
  }
  if config.force_window {
    args.push("--force-window=yes".to_string());
  }
  args.extend(config.extra_args.iter().cloned());
  args
}

/// Spawn MPV process with IPC server enabled.
pub fn spawn_mpv(config: &PlayerConfig, ipc_path: &str) -> Result<Child, ProcessError> {
  let mpv_exe = config
    .binary
    .as_ref()
    .filter(|s| !s.is_empty())
    .map(PathBuf::from)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  let args = mpv_args(config, ipc_path);
  log::info!("Spawning MPV: {:?} with IPC: {}", mpv_exe, ipc_path);
  log::debug!("MPV args: {:?}", args);

  let child = Command::new(&mpv_exe)
    .args(&args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()?;

  Ok(child)
}

/// Handle on a supervised player process.
pub struct ProcessWatch {
  pub pid: Option<u32>,
  /// Resolves with the exit code once the process is gone (`None` = signal).
  pub exit_rx: oneshot::Receiver<Option<i32>>,
  /// Cancel to kill the process.
  pub kill: CancellationToken,
}

/// Wait for `child` to exit in the background.
pub fn watch_process(mut child: Child) -> ProcessWatch {
  let pid = child.id();
  let (exit_tx, exit_rx) = oneshot::channel();
  let kill = CancellationToken::new();
  let kill_requested = kill.clone();

  tokio::spawn(async move {
    let status = tokio::select! {
      status = child.wait() => status,
      _ = kill_requested.cancelled() => {
        log::info!("Killing MPV process (pid: {:?})", pid);
        if let Err(e) = child.kill().await {
          log::error!("kill() failed: {}", e);
        }
        child.wait().await
      }
    };

    let code = match status {
      Ok(status) => {
        log::info!("MPV process exited with: {}", status);
        status.code()
      }
      Err(e) => {
        log::error!("wait() failed: {}", e);
        None
      }
    };
    let _ = exit_tx.send(code);
  });

  ProcessWatch { pid, exit_rx, kill }
}

/// Remove a stale socket file left by a previous player.
pub fn cleanup_ipc(path: &str) {
  #[cfg(not(windows))]
  {
    let _ = std::fs::remove_file(path);
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = path;
}
