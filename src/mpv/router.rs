//! Routes inbound messages to the correlator or the event translator.

use serde_json::Value;

use super::correlator::Correlator;
use super::protocol::{InboundMessage, RawEvent};

/// Route a decoded value. Replies are claimed by the correlator; everything
/// the application may want to see comes back as a `RawEvent`.
pub fn route(value: Value, correlator: &Correlator) -> Option<RawEvent> {
  let message = match InboundMessage::from_value(value) {
    Ok(message) => message,
    Err(e) => {
      log::warn!("Failed to decode MPV message: {}", e);
      return None;
    }
  };

  match message {
    InboundMessage::Reply(response) => {
      log::debug!("MPV reader: received response for request_id={}", response.request_id);
      correlator.resolve(response);
      None
    }
    InboundMessage::Event(event) => {
      log::trace!("MPV reader: received event {:?}", event);
      Some(RawEvent::Player(event))
    }
    InboundMessage::AsyncError(error) => {
      log::debug!("Asynchronous MPV error: {}", error);
      Some(RawEvent::AsyncError(error))
    }
    InboundMessage::Ack => {
      log::debug!("MPV acknowledged a command sent without request id");
      None
    }
    InboundMessage::Unrecognized(value) => {
      log::debug!("Received unhandled message structure: {}", value);
      Some(RawEvent::AsyncError(format!("unrecognized message: {}", value)))
    }
  }
}
