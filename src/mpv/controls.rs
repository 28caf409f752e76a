//! Playback helpers: one command per call, awaited until mpv replies.

use serde_json::Value;

use super::client::{MpvClient, MpvError};
use super::ipc::IpcError;
use super::protocol::{MpvCommand, PropertyValue, TIME_POS_PROPERTY};

/// How `seek` interprets its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
  #[default]
  Relative,
  Absolute,
  RelativePercent,
  AbsolutePercent,
}

impl SeekMode {
  fn as_str(self) -> &'static str {
    match self {
      SeekMode::Relative => "relative",
      SeekMode::Absolute => "absolute",
      SeekMode::RelativePercent => "relative-percent",
      SeekMode::AbsolutePercent => "absolute-percent",
    }
  }
}

impl MpvClient {
  /// Load a file or URL, replacing the current playlist or appending to it.
  pub async fn load(&self, url: &str, append: bool) -> Result<(), MpvError> {
    let mode = if append { "append-play" } else { "replace" };
    log::info!("Loading file: {} ({})", url, mode);
    self.send(MpvCommand::loadfile(url, mode)).await?;
    Ok(())
  }

  /// Load a file for playback with per-file options.
  /// Options like start position, audio/subtitle track are applied atomically with the file load.
  pub async fn load_with_options(
    &self,
    url: &str,
    start: Option<f64>,
    audio_track: Option<i64>,
    subtitle_track: Option<i64>,
  ) -> Result<(), MpvError> {
    let mut options = Vec::new();

    if let Some(start) = start.filter(|s| *s > 0.0) {
      options.push(format!("start={}", start));
    }
    if let Some(aid) = audio_track {
      options.push(format!("aid={}", aid));
    }
    match subtitle_track {
      Some(-1) => options.push("sid=no".to_string()),
      Some(sid) => options.push(format!("sid={}", sid)),
      None => {}
    }

    if options.is_empty() {
      return self.load(url, false).await;
    }
    let options = options.join(",");
    log::info!("Loading file: {} with options: {}", url, options);
    self
      .send(MpvCommand::loadfile_with_options(url, "replace", &options))
      .await?;
    Ok(())
  }

  pub async fn play(&self) -> Result<(), MpvError> {
    self.set_property("pause", Value::Bool(false)).await
  }

  /// Same as [`play`](Self::play).
  pub async fn resume(&self) -> Result<(), MpvError> {
    self.play().await
  }

  pub async fn pause(&self) -> Result<(), MpvError> {
    self.set_property("pause", Value::Bool(true)).await
  }

  pub async fn toggle_pause(&self) -> Result<(), MpvError> {
    self.cycle_property("pause").await
  }

  /// Stop playback and clear the playlist; the player stays alive and idle.
  pub async fn stop_playback(&self) -> Result<(), MpvError> {
    self.send(MpvCommand::stop()).await?;
    Ok(())
  }

  pub async fn seek(&self, seconds: f64, mode: SeekMode) -> Result<(), MpvError> {
    self.send(MpvCommand::seek(seconds, mode.as_str())).await?;
    Ok(())
  }

  /// Set volume (0-100).
  pub async fn set_volume(&self, volume: f64) -> Result<(), MpvError> {
    self.set_property("volume", volume.into()).await
  }

  /// Change volume by `delta`.
  pub async fn adjust_volume(&self, delta: f64) -> Result<(), MpvError> {
    self.send(MpvCommand::add("volume", delta)).await?;
    Ok(())
  }

  pub async fn mute(&self, muted: bool) -> Result<(), MpvError> {
    self.set_property("mute", Value::Bool(muted)).await
  }

  /// Get a property value.
  pub async fn get_property(&self, name: &str) -> Result<PropertyValue, MpvError> {
    let data = self.send(MpvCommand::get_property(name)).await?;
    Ok(PropertyValue::from(data))
  }

  pub async fn set_property(&self, name: &str, value: Value) -> Result<(), MpvError> {
    self.send(MpvCommand::set_property(name, value)).await?;
    Ok(())
  }

  pub async fn cycle_property(&self, name: &str) -> Result<(), MpvError> {
    self.send(MpvCommand::cycle(name)).await?;
    Ok(())
  }

  /// Current position in seconds, `None` while nothing is loaded.
  pub async fn time_position(&self) -> Result<Option<f64>, MpvError> {
    self.optional_number(TIME_POS_PROPERTY).await
  }

  /// Duration of the current file in seconds, `None` while nothing is loaded.
  pub async fn duration(&self) -> Result<Option<f64>, MpvError> {
    self.optional_number("duration").await
  }

  pub async fn is_paused(&self) -> Result<bool, MpvError> {
    Ok(self.get_property("pause").await?.as_bool().unwrap_or(true))
  }

  /// mpv answers "property unavailable" for playback properties while idle.
  async fn optional_number(&self, name: &str) -> Result<Option<f64>, MpvError> {
    match self.get_property(name).await {
      Ok(value) => Ok(value.as_f64()),
      Err(MpvError::Ipc(IpcError::CommandFailed(_))) => Ok(None),
      Err(e) => Err(e),
    }
  }

  pub async fn next(&self) -> Result<(), MpvError> {
    self.command("playlist-next", Vec::new()).await?;
    Ok(())
  }

  pub async fn prev(&self) -> Result<(), MpvError> {
    self.command("playlist-prev", Vec::new()).await?;
    Ok(())
  }

  pub async fn clear_playlist(&self) -> Result<(), MpvError> {
    self.command("playlist-clear", Vec::new()).await?;
    Ok(())
  }

  /// Select an audio track by id; `None` disables audio.
  pub async fn select_audio_track(&self, id: Option<i64>) -> Result<(), MpvError> {
    self.set_property("aid", track_value(id)).await
  }

  /// Select a subtitle track by id; `None` disables subtitles.
  pub async fn select_subtitles(&self, id: Option<i64>) -> Result<(), MpvError> {
    self.set_property("sid", track_value(id)).await
  }

  /// Show an OSD message.
  pub async fn show_text(&self, text: &str, duration_ms: u64) -> Result<(), MpvError> {
    self.send(MpvCommand::show_text(text, duration_ms)).await?;
    Ok(())
  }
}

fn track_value(id: Option<i64>) -> Value {
  match id {
    Some(id) => id.into(),
    None => "no".into(),
  }
}
