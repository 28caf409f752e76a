//! Player configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one player session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub binary: Option<String>,

  /// IPC socket/pipe path (None = unique path per client).
  #[serde(default)]
  pub socket_path: Option<String>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Disable video output.
  #[serde(default)]
  pub audio_only: bool,

  /// Create a window even when nothing is playing.
  #[serde(default)]
  pub force_window: bool,

  /// Restart the player after a crash.
  #[serde(default = "default_auto_restart")]
  pub auto_restart: bool,

  /// Position reporting interval in seconds.
  #[serde(default = "default_time_update")]
  pub time_update: u64,

  /// Attempts made to reach the IPC endpoint after spawning.
  #[serde(default = "default_connect_retries")]
  pub connect_retries: u32,

  /// Base delay between connection attempts; grows linearly per attempt.
  #[serde(default = "default_connect_retry_delay_ms")]
  pub connect_retry_delay_ms: u64,

  /// Reply timeout for commands (None = wait for reply or disconnect).
  #[serde(default = "default_command_timeout_ms")]
  pub command_timeout_ms: Option<u64>,

  /// How long `quit()` waits for the process before killing it.
  #[serde(default = "default_quit_timeout_ms")]
  pub quit_timeout_ms: u64,

  /// Messages inspected on the seek observation connection before giving up.
  #[serde(default = "default_seek_poll_limit")]
  pub seek_poll_limit: u32,
}

fn default_auto_restart() -> bool {
  true
}

fn default_time_update() -> u64 {
  1
}

fn default_connect_retries() -> u32 {
  10
}

fn default_connect_retry_delay_ms() -> u64 {
  100
}

fn default_command_timeout_ms() -> Option<u64> {
  Some(5000)
}

fn default_quit_timeout_ms() -> u64 {
  3000
}

fn default_seek_poll_limit() -> u32 {
  crate::mpv::DEFAULT_SEEK_POLL_LIMIT
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      binary: None,
      socket_path: None,
      extra_args: Vec::new(),
      audio_only: false,
      force_window: false,
      auto_restart: default_auto_restart(),
      time_update: default_time_update(),
      connect_retries: default_connect_retries(),
      connect_retry_delay_ms: default_connect_retry_delay_ms(),
      command_timeout_ms: default_command_timeout_ms(),
      quit_timeout_ms: default_quit_timeout_ms(),
      seek_poll_limit: default_seek_poll_limit(),
    }
  }
}

impl PlayerConfig {
  /// Parse a JSON document; missing fields take their defaults.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.time_update < 1 || self.time_update > 3600 {
      return Err("Time update interval must be between 1 and 3600 seconds".to_string());
    }
    if self.connect_retries == 0 {
      return Err("At least one connection attempt is required".to_string());
    }
    if self.seek_poll_limit == 0 {
      return Err("Seek poll limit must be positive".to_string());
    }
    if self.command_timeout_ms == Some(0) {
      return Err("Command timeout must be positive".to_string());
    }
    if let Some(path) = &self.socket_path {
      if path.trim().is_empty() {
        return Err("Socket path cannot be empty".to_string());
      }
    }
    Ok(())
  }

  pub fn time_update_interval(&self) -> Duration {
    Duration::from_secs(self.time_update)
  }

  pub fn connect_retry_delay(&self) -> Duration {
    Duration::from_millis(self.connect_retry_delay_ms)
  }

  pub fn command_timeout(&self) -> Option<Duration> {
    self.command_timeout_ms.map(Duration::from_millis)
  }

  pub fn quit_timeout(&self) -> Duration {
    Duration::from_millis(self.quit_timeout_ms)
  }
}
