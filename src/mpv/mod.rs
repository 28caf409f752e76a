//! MPV IPC module - spawns and controls an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection, spawning and exit supervision
//! - `framing.rs` - Line framing of the IPC byte stream
//! - `protocol.rs` - JSON command/response/event types
//! - `correlator.rs` - Request ids and pending-reply bookkeeping
//! - `router.rs` - Reply vs. event classification
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets elsewhere)
//! - `events.rs` - Translation of raw events into player events
//! - `seek.rs` - Seek completion detection on a secondary connection
//! - `session.rs` - Per-connection event loop
//! - `client.rs` - High-level client: lifecycle, crash handling, commands
//! - `controls.rs` - Playback helpers on top of the client

mod client;
mod controls;
mod correlator;
mod events;
mod framing;
mod ipc;
mod process;
mod protocol;
mod router;
mod seek;
mod session;
#[cfg(all(test, unix))]
mod test_support;

pub use client::{LifecycleState, MpvClient, MpvError};
pub use controls::SeekMode;
pub use correlator::StaleRequest;
pub use events::{PlayerError, PlayerEvent, SeekRange, StatusChange, StopDetails};
pub use ipc::{ConnectionState, IpcError};
pub use process::{find_mpv, ProcessError};
pub use protocol::{MpvCommand, MpvEvent, PropertyValue, TIME_POS_PROPERTY};
pub use seek::DEFAULT_SEEK_POLL_LIMIT;
