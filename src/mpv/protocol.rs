//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property whose changes feed the cached playback position.
pub const TIME_POS_PROPERTY: &str = "time-pos";

/// Command sent to MPV via IPC.
///
/// The request id is assigned by the correlator when the command is issued,
/// so a command can be built before a connection exists.
#[derive(Debug, Clone, PartialEq)]
pub struct MpvCommand {
  pub command: Vec<Value>,
}

/// Wire shape of a command line.
#[derive(Serialize)]
struct WireCommand<'a> {
  command: &'a [Value],
  request_id: u64,
}

impl MpvCommand {
  /// Create a command from a verb and its arguments.
  pub fn new(verb: &str, args: Vec<Value>) -> Self {
    let mut command = Vec::with_capacity(args.len() + 1);
    command.push(Value::from(verb));
    command.extend(args);
    Self { command }
  }

  /// The command verb (first element).
  pub fn verb(&self) -> &str {
    self.command.first().and_then(Value::as_str).unwrap_or("")
  }

  /// Serialize as one IPC line (without the trailing newline).
  pub fn to_line(&self, request_id: u64) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireCommand {
      command: &self.command,
      request_id,
    })
  }

  /// Load a file for playback.
  pub fn loadfile(url: &str, mode: &str) -> Self {
    Self::new("loadfile", vec![url.into(), mode.into()])
  }

  /// Load a file with per-file options (e.g. "start=30,aid=2").
  pub fn loadfile_with_options(url: &str, mode: &str, options: &str) -> Self {
    Self::new("loadfile", vec![url.into(), mode.into(), options.into()])
  }

  /// Seek using one of mpv's seek modes ("relative", "absolute", ...).
  pub fn seek(time: f64, mode: &str) -> Self {
    Self::new("seek", vec![time.into(), mode.into()])
  }

  /// Set a property to any JSON value.
  pub fn set_property(name: &str, value: Value) -> Self {
    Self::new("set_property", vec![name.into(), value])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new("get_property", vec![name.into()])
  }

  /// Add to a numeric property.
  pub fn add(name: &str, value: f64) -> Self {
    Self::new("add", vec![name.into(), value.into()])
  }

  /// Cycle (toggle) a property.
  pub fn cycle(property: &str) -> Self {
    Self::new("cycle", vec![property.into()])
  }

  /// Observe a property for changes.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new("observe_property", vec![id.into(), name.into()])
  }

  /// Stop observing a property.
  pub fn unobserve_property(id: i64) -> Self {
    Self::new("unobserve_property", vec![id.into()])
  }

  /// Stop playback and clear the playlist.
  pub fn stop() -> Self {
    Self::new("stop", Vec::new())
  }

  /// Show an OSD message for the given duration.
  pub fn show_text(text: &str, duration_ms: u64) -> Self {
    Self::new("show-text", vec![text.into(), duration_ms.into()])
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self::new("quit", Vec::new())
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<Value>,
  /// Matching request ID.
  pub request_id: u64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Event sent by MPV, decoded once by its `event` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MpvEvent {
  Idle,
  StartFile,
  EndFile {
    /// "eof", "stop", "quit", "error", "redirect" or "unknown".
    reason: Option<String>,
    file_error: Option<String>,
    error: Option<String>,
  },
  FileLoaded,
  Seek,
  PlaybackRestart,
  Pause,
  Unpause,
  TracksChanged,
  PropertyChange {
    id: Option<i64>,
    name: String,
    #[serde(default)]
    data: Value,
  },
  ClientMessage {
    #[serde(default)]
    args: Vec<String>,
  },
  Shutdown,
  /// Any event kind this crate does not interpret.
  #[serde(other)]
  Other,
}

/// Raw event handed from the router to the event translator.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
  Player(MpvEvent),
  /// Player-originated error with no request attached.
  AsyncError(String),
}

/// Typed property values from MPV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Bool(bool),
  Number(f64),
  String(String),
  Null,
  Json(Value),
}

impl From<Value> for PropertyValue {
  fn from(value: Value) -> Self {
    match value {
      Value::Bool(b) => PropertyValue::Bool(b),
      Value::Number(n) => match n.as_f64() {
        Some(f) => PropertyValue::Number(f),
        None => PropertyValue::Json(Value::Number(n)),
      },
      Value::String(s) => PropertyValue::String(s),
      Value::Array(_) | Value::Object(_) => PropertyValue::Json(value),
      Value::Null => PropertyValue::Null,
    }
  }
}

impl PropertyValue {
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      PropertyValue::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      PropertyValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      PropertyValue::String(s) => Some(s),
      _ => None,
    }
  }
}

/// Message received from MPV IPC, classified once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
  /// Reply to a request we issued (non-zero `request_id`).
  Reply(MpvResponse),
  /// Unsolicited event with a declared kind.
  Event(MpvEvent),
  /// Error reported without a request to attach it to.
  AsyncError(String),
  /// Acknowledgement for a command sent without an id.
  Ack,
  /// Neither reply nor event.
  Unrecognized(Value),
}

impl InboundMessage {
  /// Classify a decoded JSON value.
  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    let request_id = value.get("request_id").and_then(Value::as_u64);
    let error = value
      .get("error")
      .and_then(Value::as_str)
      .map(str::to_string);

    if let Some(id) = request_id.filter(|id| *id != 0) {
      log::trace!("Classified reply for request_id={}", id);
      return Ok(InboundMessage::Reply(serde_json::from_value(value)?));
    }

    if let Some(kind) = value.get("event").and_then(Value::as_str) {
      let kind = kind.to_string();
      let event: MpvEvent = serde_json::from_value(value)?;
      if event == MpvEvent::Other {
        log::debug!("Unrecognized MPV event kind: {}", kind);
      }
      return Ok(InboundMessage::Event(event));
    }

    match error {
      Some(error) if error == "success" => Ok(InboundMessage::Ack),
      Some(error) => Ok(InboundMessage::AsyncError(error)),
      None => Ok(InboundMessage::Unrecognized(value)),
    }
  }
}
