//! Defines the WebSocket message protocol between the room transport and the API server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voicedesk_core::{
    runtime::SessionOutput,
    session::{RoomEvent, SessionState},
};

/// Messages sent from the transport to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Joins a room with a previously issued session credential. This must be the first message.
    Join { credential: String, room: String },
    /// A speech-to-text result for the caller's audio.
    Transcription {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    TrackSubscribed { participant: String },
    TrackUnsubscribed { participant: String },
    /// The agent's last reply finished playing.
    PlaybackFinished,
    Reconnecting,
    Reconnected,
    /// The caller hung up.
    EndCall,
}

impl ClientMessage {
    /// Maps a post-join message onto the room event it represents.
    /// A repeated `join` has no event.
    pub fn into_room_event(self) -> Option<RoomEvent> {
        match self {
            ClientMessage::Join { .. } => None,
            ClientMessage::Transcription { text, is_final } => {
                Some(RoomEvent::Transcription { text, is_final })
            }
            ClientMessage::TrackSubscribed { participant } => {
                Some(RoomEvent::TrackSubscribed { participant })
            }
            ClientMessage::TrackUnsubscribed { participant } => {
                Some(RoomEvent::TrackUnsubscribed { participant })
            }
            ClientMessage::PlaybackFinished => Some(RoomEvent::PlaybackFinished),
            ClientMessage::Reconnecting => Some(RoomEvent::Reconnecting),
            ClientMessage::Reconnected => Some(RoomEvent::Reconnected),
            ClientMessage::EndCall => Some(RoomEvent::EndCall),
        }
    }
}

/// Messages sent from the server to the transport.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the join and names the session that now owns the room.
    Joined { room: String, session_id: Uuid },
    StateChanged { state: SessionState },
    /// Text for the agent to speak.
    Speak { text: String },
    /// Reports a fatal error to the client.
    Error { message: String },
    /// The session has ended; no further messages follow.
    Closed { summary_written: bool },
}

impl From<SessionOutput> for ServerMessage {
    fn from(output: SessionOutput) -> Self {
        match output {
            SessionOutput::StateChanged(state) => ServerMessage::StateChanged { state },
            SessionOutput::Speak(text) => ServerMessage::Speak { text },
            SessionOutput::Closed { summary_written } => ServerMessage::Closed { summary_written },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "transcription", "text": "hi"})).unwrap();
        assert_eq!(
            msg.into_room_event(),
            Some(RoomEvent::Transcription {
                text: "hi".to_string(),
                is_final: false
            })
        );

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "playback_finished"})).unwrap();
        assert_eq!(msg.into_room_event(), Some(RoomEvent::PlaybackFinished));
    }

    #[test]
    fn repeated_join_has_no_room_event() {
        let msg: ClientMessage = serde_json::from_value(
            json!({"type": "join", "credential": "t", "room": "assistant-room-u123"}),
        )
        .unwrap();
        assert_eq!(msg.into_room_event(), None);
    }

    #[test]
    fn outputs_serialize_with_type_tag() {
        let msg = ServerMessage::from(SessionOutput::StateChanged(SessionState::Listening));
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({"type": "state_changed", "state": "listening"})
        );

        let msg = ServerMessage::from(SessionOutput::Closed {
            summary_written: true,
        });
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({"type": "closed", "summary_written": true})
        );
    }
}
