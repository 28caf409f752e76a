//! Request/response correlation.
//!
//! Every issued command gets an id unique among pending requests and a
//! single-fulfillment slot. Replies resolve slots by id; teardown fails all of
//! them with `ConnectionLost`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use super::ipc::IpcError;
use super::protocol::MpvResponse;

/// Outcome delivered to the issuer of a command.
pub type CommandResult = Result<Value, IpcError>;

/// In-flight bookkeeping for one command.
struct PendingRequest {
  tx: oneshot::Sender<CommandResult>,
  verb: String,
  created_at: Instant,
}

struct CorrelatorState {
  next_id: u64,
  pending: HashMap<u64, PendingRequest>,
  closed: bool,
}

/// Pending request table for one connection.
pub struct Correlator {
  state: Mutex<CorrelatorState>,
}

/// A pending request that has been waiting longer than expected.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRequest {
  pub request_id: u64,
  pub verb: String,
  pub age: Duration,
}

impl Correlator {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(CorrelatorState {
        next_id: 1,
        pending: HashMap::new(),
        closed: false,
      }),
    }
  }

  /// Allocate an id and a completion slot for a new command.
  pub fn register(&self, verb: &str) -> Result<(u64, oneshot::Receiver<CommandResult>), IpcError> {
    let mut state = self.state.lock();
    if state.closed {
      return Err(IpcError::ConnectionLost);
    }

    let mut id = state.next_id;
    while id == 0 || state.pending.contains_key(&id) {
      id = id.wrapping_add(1);
    }
    state.next_id = id.wrapping_add(1);

    let (tx, rx) = oneshot::channel();
    state.pending.insert(
      id,
      PendingRequest {
        tx,
        verb: verb.to_string(),
        created_at: Instant::now(),
      },
    );
    Ok((id, rx))
  }

  /// Complete the slot matching a reply. Returns false for unknown ids.
  pub fn resolve(&self, response: MpvResponse) -> bool {
    let Some(request) = self.state.lock().pending.remove(&response.request_id) else {
      log::debug!(
        "Dropping reply for unknown request_id={}",
        response.request_id
      );
      return false;
    };

    let result = if response.is_success() {
      Ok(response.data.unwrap_or(Value::Null))
    } else {
      Err(IpcError::CommandFailed(response.error))
    };

    if request.tx.send(result).is_err() {
      log::debug!(
        "Caller for request_id={} ({}) went away before the reply",
        response.request_id,
        request.verb
      );
    }
    true
  }

  /// Forget a request whose line never reached the socket.
  pub fn cancel(&self, request_id: u64) {
    self.state.lock().pending.remove(&request_id);
  }

  /// Fail every pending request with `ConnectionLost` and refuse new ones.
  pub fn fail_all(&self) -> usize {
    let drained: Vec<(u64, PendingRequest)> = {
      let mut state = self.state.lock();
      state.closed = true;
      state.pending.drain().collect()
    };

    let count = drained.len();
    for (id, request) in drained {
      log::debug!("Failing request_id={} ({}): connection lost", id, request.verb);
      let _ = request.tx.send(Err(IpcError::ConnectionLost));
    }
    count
  }

  pub fn pending_count(&self) -> usize {
    self.state.lock().pending.len()
  }

  /// Requests pending for longer than `older_than`, oldest first.
  pub fn stale_requests(&self, older_than: Duration) -> Vec<StaleRequest> {
    let now = Instant::now();
    let mut stale: Vec<StaleRequest> = self
      .state
      .lock()
      .pending
      .iter()
      .map(|(id, request)| StaleRequest {
        request_id: *id,
        verb: request.verb.clone(),
        age: now.duration_since(request.created_at),
      })
      .filter(|request| request.age >= older_than)
      .collect();
    stale.sort_by(|a, b| b.age.cmp(&a.age));
    stale
  }
}

impl Default for Correlator {
  fn default() -> Self {
    Self::new()
  }
}
