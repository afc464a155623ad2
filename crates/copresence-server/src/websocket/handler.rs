//! Inbound frame classification.

use axum::extract::ws::Message;
use copresence_core::{ClientCommand, PresenceError};

/// What the socket loop should do with one inbound frame.
#[derive(Debug)]
pub enum FrameAction {
    /// A decoded command for the session.
    Command(ClientCommand),
    /// Text that did not decode. Dropped after counting.
    Malformed(PresenceError),
    /// The client sent a close frame.
    Close,
    /// Ping or pong; only proves liveness.
    Liveness,
}

/// Decode a text payload.
pub fn decode_text(text: &str) -> FrameAction {
    match ClientCommand::parse(text) {
        Ok(cmd) => FrameAction::Command(cmd),
        Err(e) => FrameAction::Malformed(e),
    }
}

/// Classify a frame. Binary frames are accepted if they hold UTF-8 JSON.
pub fn classify(message: &Message) -> FrameAction {
    match message {
        Message::Text(text) => decode_text(text.as_str()),
        Message::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => decode_text(text),
            Err(_) => FrameAction::Malformed(PresenceError::MalformedInput(format!(
                "binary frame of {} bytes is not UTF-8",
                data.len()
            ))),
        },
        Message::Close(_) => FrameAction::Close,
        Message::Ping(_) | Message::Pong(_) => FrameAction::Liveness,
    }
}
