//! Remote control for an external mpv player over its JSON IPC socket.
//!
//! [`MpvClient`] spawns mpv, keeps one IPC connection to it, correlates
//! command replies and turns raw mpv events into [`PlayerEvent`]s that any
//! number of subscribers can receive. Crashes are detected and, if configured,
//! the player is restarted with its property observers restored.

pub mod config;
mod mpv;

pub use config::PlayerConfig;
pub use mpv::{
  find_mpv, ConnectionState, IpcError, LifecycleState, MpvClient, MpvCommand, MpvError, MpvEvent, PlayerError,
  PlayerEvent, ProcessError, PropertyValue, SeekMode, SeekRange, StaleRequest, StatusChange, StopDetails,
  DEFAULT_SEEK_POLL_LIMIT, TIME_POS_PROPERTY,
};
