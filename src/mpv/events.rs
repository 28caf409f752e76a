//! Translation of raw mpv events into application-level player events.
//!
//! `playback-restart` means both "unpaused" and "seek finished". While a seek
//! observation is active it belongs to the seek detector; otherwise it is
//! reported as `Resumed`. mpv sends it to every client, so when the detector
//! sees it first the primary copy arriving afterwards is swallowed too.

use serde::Serialize;
use thiserror::Error;

use super::process::ExitKind;
use super::protocol::{MpvEvent, PropertyValue, RawEvent, TIME_POS_PROPERTY};
use super::seek::SeekOutcome;

/// Errors surfaced through [`PlayerEvent::Error`].
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum PlayerError {
  #[error("MPV error: {0}")]
  Asynchronous(String),
  #[error("Failed to restart MPV: {0}")]
  RestartFailed(String),
}

/// Why playback stopped, when mpv said so.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopDetails {
  pub reason: Option<String>,
  pub error: Option<String>,
}

/// Positions around a completed seek, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeekRange {
  pub start: Option<f64>,
  pub end: Option<f64>,
}

/// A property change reported by mpv.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
  pub property: String,
  pub value: PropertyValue,
}

/// Semantic events published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum PlayerEvent {
  /// A file finished loading.
  Started,
  /// Playback stopped; details present for `end-file` with a reason other than eof.
  Stopped(Option<StopDetails>),
  /// The current file reached its end.
  PlaybackFinished { reason: String },
  Paused,
  Resumed,
  Seek(SeekRange),
  Status(StatusChange),
  /// Periodic position report.
  TimePosition(f64),
  Crashed,
  Quit,
  Error(PlayerError),
}

/// Work the session must do for a translated event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
  Emit(PlayerEvent),
  /// Open a secondary connection and watch for the end of seek `generation`.
  ObserveSeek { generation: u64 },
}

#[derive(Debug, Clone, Copy)]
struct SeekObservation {
  generation: u64,
  start: Option<f64>,
  /// The primary connection already delivered this seek's `playback-restart`.
  restart_seen: bool,
}

/// Per-session translation state: cached position and the active seek.
#[derive(Debug, Default)]
pub struct EventTranslator {
  time_position: Option<f64>,
  seek: Option<SeekObservation>,
  seek_generation: u64,
  /// Swallow the next `playback-restart`; it belongs to a completed seek.
  absorb_restart: bool,
}

impl EventTranslator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_seeking(&self) -> bool {
    self.seek.is_some()
  }

  pub fn translate(&mut self, raw: RawEvent) -> Vec<Effect> {
    let event = match raw {
      RawEvent::Player(event) => event,
      RawEvent::AsyncError(error) => {
        return vec![Effect::Emit(PlayerEvent::Error(PlayerError::Asynchronous(error)))];
      }
    };

    match event {
      MpvEvent::Idle => vec![Effect::Emit(PlayerEvent::Stopped(None))],
      MpvEvent::EndFile {
        reason,
        file_error,
        error,
      } => {
        if reason.as_deref() == Some("eof") {
          vec![Effect::Emit(PlayerEvent::PlaybackFinished {
            reason: "eof".to_string(),
          })]
        } else {
          vec![Effect::Emit(PlayerEvent::Stopped(Some(StopDetails {
            reason,
            error: file_error.or(error),
          })))]
        }
      }
      MpvEvent::FileLoaded => vec![Effect::Emit(PlayerEvent::Started)],
      MpvEvent::Pause => vec![Effect::Emit(PlayerEvent::Paused)],
      MpvEvent::Unpause => vec![Effect::Emit(PlayerEvent::Resumed)],
      MpvEvent::PlaybackRestart => {
        if let Some(seek) = self.seek.as_mut() {
          log::trace!("playback-restart during seek left to the seek detector");
          seek.restart_seen = true;
          Vec::new()
        } else if self.absorb_restart {
          log::trace!("playback-restart already reported as a seek");
          self.absorb_restart = false;
          Vec::new()
        } else {
          vec![Effect::Emit(PlayerEvent::Resumed)]
        }
      }
      MpvEvent::Seek => {
        self.seek_generation += 1;
        if self.seek.is_some() {
          log::debug!("Seek started while another seek was being observed");
        }
        self.absorb_restart = false;
        self.seek = Some(SeekObservation {
          generation: self.seek_generation,
          start: self.time_position,
          restart_seen: false,
        });
        vec![Effect::ObserveSeek {
          generation: self.seek_generation,
        }]
      }
      MpvEvent::PropertyChange { name, data, .. } => {
        if name == TIME_POS_PROPERTY {
          self.time_position = data.as_f64();
        }
        vec![Effect::Emit(PlayerEvent::Status(StatusChange {
          property: name,
          value: PropertyValue::from(data),
        }))]
      }
      other => {
        log::debug!("Unhandled MPV event: {:?}", other);
        Vec::new()
      }
    }
  }

  /// Resolve seek observation `generation`. Only the current observation can
  /// emit `Seek` or clear the seeking state.
  pub fn complete_seek(&mut self, generation: u64, outcome: SeekOutcome) -> Option<PlayerEvent> {
    let current = match self.seek {
      Some(seek) if seek.generation == generation => seek,
      _ => {
        log::debug!("Ignoring stale seek observation {}: {:?}", generation, outcome);
        return None;
      }
    };
    self.seek = None;

    match outcome {
      SeekOutcome::Completed => {
        self.absorb_restart = !current.restart_seen;
        Some(PlayerEvent::Seek(SeekRange {
          start: current.start,
          end: self.time_position,
        }))
      }
      failed => {
        log::debug!("Seek observation {} failed: {:?}", generation, failed);
        None
      }
    }
  }

  /// Drop any seek in progress, e.g. when the session is torn down.
  pub fn reset(&mut self) {
    self.seek = None;
    self.absorb_restart = false;
  }
}

/// Event reported for a process exit.
pub fn exit_event(kind: ExitKind) -> PlayerEvent {
  match kind {
    ExitKind::Clean => PlayerEvent::Quit,
    ExitKind::Crash => PlayerEvent::Crashed,
  }
}
