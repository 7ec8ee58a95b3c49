//! Conversation Session State Machine
//!
//! A [`ConversationSession`] owns one conversation's lifecycle. Room events and
//! the results of awaited operations are fed in as [`SessionInput`]s through
//! [`ConversationSession::apply`], which is a pure transition function: it
//! updates the session and returns the [`Effect`]s the runtime must carry
//! out. Nothing here performs I/O, so every transition can be exercised
//! without a live transport.

use crate::{
    credential::CredentialClaims,
    error::ToolError,
    llm_client::{AgentReply, ContextEntry, ToolRequest},
    model::Utterance,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

/// Tool round-trips allowed per user turn: the initial one plus one more.
pub const MAX_TOOL_ROUNDS: u8 = 2;

/// Spoken when the tool budget for a turn is spent without a usable answer.
pub const FALLBACK_REPLY: &str = "I'm sorry, I wasn't able to complete that request. \
     Could you try asking in a different way?";

/// Spoken when the response generator itself fails.
pub const DEGRADED_REPLY: &str = "I'm sorry, I'm having trouble responding right now. \
     Please try again in a moment.";

/// Suggested wording handed to the generator when a transient tool error persists.
const TRANSIENT_HINT: &str = "I couldn't retrieve that right now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Joining,
    Listening,
    Thinking,
    ToolCall,
    Speaking,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Disconnected,
    EndOfCall,
    IdleTimeout,
}

/// Notifications from the real-time transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// The client joined the room with the given verified credential.
    JoinConfirmed(CredentialClaims),
    TrackSubscribed { participant: String },
    TrackUnsubscribed { participant: String },
    Transcription { text: String, is_final: bool },
    PlaybackFinished,
    Reconnecting,
    Reconnected,
    Disconnected,
    EndCall,
}

/// Transport conditions that are logged but do not change the turn state.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    TrackSubscribed { participant: String },
    TrackUnsubscribed { participant: String },
    Reconnecting,
    Reconnected,
}

/// Everything that can drive a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Joined(CredentialClaims),
    Utterance { text: String, is_final: bool },
    Reply(AgentReply),
    ReplyFailed(String),
    ToolResolved {
        call_id: String,
        outcome: Result<Value, ToolError>,
    },
    PlaybackFinished,
    Transport(TransportSignal),
    Close(CloseReason),
    SummaryFinished,
}

impl SessionInput {
    fn name(&self) -> &'static str {
        match self {
            SessionInput::Joined(_) => "joined",
            SessionInput::Utterance { .. } => "utterance",
            SessionInput::Reply(_) => "reply",
            SessionInput::ReplyFailed(_) => "reply_failed",
            SessionInput::ToolResolved { .. } => "tool_resolved",
            SessionInput::PlaybackFinished => "playback_finished",
            SessionInput::Transport(_) => "transport",
            SessionInput::Close(_) => "close",
            SessionInput::SummaryFinished => "summary_finished",
        }
    }
}

impl From<RoomEvent> for SessionInput {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::JoinConfirmed(claims) => SessionInput::Joined(claims),
            RoomEvent::TrackSubscribed { participant } => {
                SessionInput::Transport(TransportSignal::TrackSubscribed { participant })
            }
            RoomEvent::TrackUnsubscribed { participant } => {
                SessionInput::Transport(TransportSignal::TrackUnsubscribed { participant })
            }
            RoomEvent::Transcription { text, is_final } => SessionInput::Utterance { text, is_final },
            RoomEvent::PlaybackFinished => SessionInput::PlaybackFinished,
            RoomEvent::Reconnecting => SessionInput::Transport(TransportSignal::Reconnecting),
            RoomEvent::Reconnected => SessionInput::Transport(TransportSignal::Reconnected),
            RoomEvent::Disconnected => SessionInput::Close(CloseReason::Disconnected),
            RoomEvent::EndCall => SessionInput::Close(CloseReason::EndOfCall),
        }
    }
}

/// Work the runtime performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Load the subject's most recent interaction summary into the context.
    LoadPriorSummary,
    /// Ask the response generator for the next step.
    Generate { allow_tools: bool },
    Dispatch(ToolRequest),
    Speak(String),
    /// Summarise and persist the transcript, then report `SummaryFinished`.
    Summarize,
    /// Remove the session from the registry and release its resources.
    Release,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("credential is scoped to room '{actual}', session room is '{expected}'")]
    RoomMismatch { expected: String, actual: String },
    #[error("input '{input}' is not valid in state {state:?}")]
    Unexpected {
        state: SessionState,
        input: &'static str,
    },
    #[error("no outstanding tool call with id '{0}'")]
    UnknownCall(String),
}

/// The live unit of work for one room.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    session_id: Uuid,
    room_id: String,
    subject_id: Option<String>,
    participant_label: Option<String>,
    created_at: DateTime<Utc>,
    state: SessionState,
    close_reason: Option<CloseReason>,
    transcript: Vec<Utterance>,
    context: Vec<ContextEntry>,
    pending: VecDeque<String>,
    outstanding: HashMap<String, String>,
    tool_rounds: u8,
}

impl ConversationSession {
    pub fn new(room_id: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            session_id,
            room_id: room_id.into(),
            subject_id: None,
            participant_label: None,
            created_at: Utc::now(),
            state: SessionState::Joining,
            close_reason: None,
            transcript: Vec::new(),
            context: Vec::new(),
            pending: VecDeque::new(),
            outstanding: HashMap::new(),
            tool_rounds: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Bound from the join credential; `None` until joined.
    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    pub fn participant_label(&self) -> Option<&str> {
        self.participant_label.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn transcript(&self) -> &[Utterance] {
        &self.transcript
    }

    pub fn context(&self) -> &[ContextEntry] {
        &self.context
    }

    pub fn pending_utterances(&self) -> usize {
        self.pending.len()
    }

    pub fn has_outstanding_calls(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Places the previous session's summary ahead of the conversation.
    pub fn attach_prior_summary(&mut self, summary: impl Into<String>) {
        self.context.insert(0, ContextEntry::PriorSummary(summary.into()));
    }

    /// Applies one input. Effects are returned in the order they must run.
    pub fn apply(&mut self, input: SessionInput) -> Result<Vec<Effect>, TransitionError> {
        use SessionState::*;

        match (self.state, input) {
            (Closed, _) => Ok(Vec::new()),
            (Closing, SessionInput::SummaryFinished) => {
                self.state = Closed;
                Ok(vec![Effect::Release])
            }
            // In-flight results and late events after teardown began are dropped.
            (Closing, _) => Ok(Vec::new()),
            (_, SessionInput::Close(reason)) => Ok(self.begin_close(reason)),
            (_, SessionInput::Transport(_)) => Ok(Vec::new()),

            (Joining, SessionInput::Joined(claims)) => {
                if claims.room_id != self.room_id {
                    return Err(TransitionError::RoomMismatch {
                        expected: self.room_id.clone(),
                        actual: claims.room_id,
                    });
                }
                self.subject_id = Some(claims.subject_id);
                self.participant_label = Some(claims.participant_label);
                self.state = Listening;
                Ok(vec![Effect::LoadPriorSummary])
            }

            (Listening, SessionInput::Utterance { text, is_final }) => {
                if !is_final || text.trim().is_empty() {
                    return Ok(Vec::new());
                }
                Ok(self.begin_turn(text.trim().to_string()))
            }
            (Thinking | ToolCall | Speaking, SessionInput::Utterance { text, is_final }) => {
                if is_final && !text.trim().is_empty() {
                    self.pending.push_back(text.trim().to_string());
                }
                Ok(Vec::new())
            }

            (Thinking, SessionInput::Reply(AgentReply::Answer(text))) => {
                if text.trim().is_empty() {
                    Ok(self.speak(FALLBACK_REPLY.to_string()))
                } else {
                    Ok(self.speak(text))
                }
            }
            (Thinking, SessionInput::Reply(AgentReply::ToolCall(request))) => {
                if self.tool_rounds >= MAX_TOOL_ROUNDS {
                    return Ok(self.speak(FALLBACK_REPLY.to_string()));
                }
                self.tool_rounds += 1;
                self.outstanding
                    .insert(request.call_id.clone(), request.name.clone());
                self.context.push(ContextEntry::ToolCall(request.clone()));
                self.state = ToolCall;
                Ok(vec![Effect::Dispatch(request)])
            }
            (Thinking, SessionInput::ReplyFailed(_)) => Ok(self.speak(DEGRADED_REPLY.to_string())),

            (ToolCall, SessionInput::ToolResolved { call_id, outcome }) => {
                let Some(name) = self.outstanding.remove(&call_id) else {
                    return Err(TransitionError::UnknownCall(call_id));
                };
                let content = match outcome {
                    Ok(value) => value,
                    Err(e) => error_payload(&e),
                };
                self.context.push(ContextEntry::ToolResult {
                    call_id,
                    name,
                    content,
                });
                self.state = Thinking;
                Ok(vec![Effect::Generate {
                    allow_tools: self.tool_rounds < MAX_TOOL_ROUNDS,
                }])
            }

            (Speaking, SessionInput::PlaybackFinished) => match self.pending.pop_front() {
                Some(next) => Ok(self.begin_turn(next)),
                None => {
                    self.state = Listening;
                    Ok(Vec::new())
                }
            },
            // A duplicate or late playback notification is harmless.
            (Listening, SessionInput::PlaybackFinished) => Ok(Vec::new()),

            (state, input) => Err(TransitionError::Unexpected {
                state,
                input: input.name(),
            }),
        }
    }

    fn begin_turn(&mut self, text: String) -> Vec<Effect> {
        let utterance = Utterance::user(text);
        self.transcript.push(utterance.clone());
        self.context.push(ContextEntry::Utterance(utterance));
        self.tool_rounds = 0;
        self.state = SessionState::Thinking;
        vec![Effect::Generate { allow_tools: true }]
    }

    fn speak(&mut self, text: String) -> Vec<Effect> {
        let utterance = Utterance::agent(text.clone());
        self.transcript.push(utterance.clone());
        self.context.push(ContextEntry::Utterance(utterance));
        self.state = SessionState::Speaking;
        vec![Effect::Speak(text)]
    }

    fn begin_close(&mut self, reason: CloseReason) -> Vec<Effect> {
        self.close_reason = Some(reason);
        self.outstanding.clear();
        self.pending.clear();
        self.state = SessionState::Closing;
        let has_user_speech = self
            .transcript
            .iter()
            .any(|u| u.speaker == crate::model::Speaker::User);
        if self.subject_id.is_some() && has_user_speech {
            vec![Effect::Summarize]
        } else {
            self.state = SessionState::Closed;
            vec![Effect::Release]
        }
    }
}

fn error_payload(error: &ToolError) -> Value {
    let mut payload = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    });
    if error.is_transient() {
        payload["error"]["suggested_reply"] = Value::String(TRANSIENT_HINT.to_string());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credential::MediaGrants, error::RetrievalError};

    fn claims(room: &str) -> CredentialClaims {
        CredentialClaims {
            room_id: room.to_string(),
            subject_id: "u123".to_string(),
            participant_label: "Ada".to_string(),
            grants: MediaGrants {
                publish_audio: true,
                subscribe_audio: true,
            },
        }
    }

    fn listening() -> ConversationSession {
        let mut session = ConversationSession::new("assistant-room-u123", Uuid::new_v4());
        session
            .apply(SessionInput::Joined(claims("assistant-room-u123")))
            .unwrap();
        session
    }

    fn final_utterance(text: &str) -> SessionInput {
        SessionInput::Utterance {
            text: text.to_string(),
            is_final: true,
        }
    }

    fn tool_call(id: &str) -> SessionInput {
        SessionInput::Reply(AgentReply::ToolCall(ToolRequest {
            call_id: id.to_string(),
            name: "answer_from_company_kb".to_string(),
            arguments: json!({"query": "refund policy"}),
        }))
    }

    #[test]
    fn join_binds_subject_and_enters_listening() {
        let mut session = ConversationSession::new("assistant-room-u123", Uuid::new_v4());
        assert_eq!(session.state(), SessionState::Joining);

        let effects = session
            .apply(SessionInput::Joined(claims("assistant-room-u123")))
            .unwrap();

        assert_eq!(effects, vec![Effect::LoadPriorSummary]);
        assert_eq!(session.state(), SessionState::Listening);
        assert_eq!(session.subject_id(), Some("u123"));
        assert_eq!(session.participant_label(), Some("Ada"));
    }

    #[test]
    fn join_with_credential_for_another_room_is_rejected() {
        let mut session = ConversationSession::new("assistant-room-u123", Uuid::new_v4());
        let err = session
            .apply(SessionInput::Joined(claims("assistant-room-u999")))
            .unwrap_err();

        assert!(matches!(err, TransitionError::RoomMismatch { .. }));
        assert_eq!(session.state(), SessionState::Joining);
        assert!(session.subject_id().is_none());
    }

    #[test]
    fn blank_and_interim_utterances_are_discarded() {
        let mut session = listening();

        assert!(session.apply(final_utterance("   ")).unwrap().is_empty());
        assert!(
            session
                .apply(SessionInput::Utterance {
                    text: "what's your".to_string(),
                    is_final: false,
                })
                .unwrap()
                .is_empty()
        );
        assert_eq!(session.state(), SessionState::Listening);
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn final_utterance_starts_a_turn() {
        let mut session = listening();
        let effects = session
            .apply(final_utterance("  what's your refund policy? "))
            .unwrap();

        assert_eq!(effects, vec![Effect::Generate { allow_tools: true }]);
        assert_eq!(session.state(), SessionState::Thinking);
        assert_eq!(session.transcript()[0].text, "what's your refund policy?");
    }

    #[test]
    fn answer_is_spoken_then_listening_resumes() {
        let mut session = listening();
        session.apply(final_utterance("hello")).unwrap();

        let effects = session
            .apply(SessionInput::Reply(AgentReply::Answer("Hi there!".into())))
            .unwrap();
        assert_eq!(effects, vec![Effect::Speak("Hi there!".into())]);
        assert_eq!(session.state(), SessionState::Speaking);

        assert!(session.apply(SessionInput::PlaybackFinished).unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Listening);
        assert_eq!(session.transcript().len(), 2);
    }

    #[test]
    fn tool_result_returns_to_thinking() {
        let mut session = listening();
        session.apply(final_utterance("what's your refund policy?")).unwrap();

        let effects = session.apply(tool_call("call_1")).unwrap();
        assert!(matches!(effects.as_slice(), [Effect::Dispatch(r)] if r.call_id == "call_1"));
        assert_eq!(session.state(), SessionState::ToolCall);

        let effects = session
            .apply(SessionInput::ToolResolved {
                call_id: "call_1".into(),
                outcome: Ok(json!({"kind": "knowledge_matches", "matches": []})),
            })
            .unwrap();
        assert_eq!(effects, vec![Effect::Generate { allow_tools: true }]);
        assert_eq!(session.state(), SessionState::Thinking);
        assert!(matches!(
            session.context().last(),
            Some(ContextEntry::ToolResult { name, .. }) if name == "answer_from_company_kb"
        ));
    }

    #[test]
    fn tool_errors_are_surfaced_as_payloads() {
        let mut session = listening();
        session.apply(final_utterance("look up my account")).unwrap();
        session.apply(tool_call("call_1")).unwrap();

        session
            .apply(SessionInput::ToolResolved {
                call_id: "call_1".into(),
                outcome: Err(ToolError::Retrieval(RetrievalError::Timeout)),
            })
            .unwrap();

        let Some(ContextEntry::ToolResult { content, .. }) = session.context().last() else {
            panic!("expected a tool result entry");
        };
        assert_eq!(content["error"]["kind"], "timeout");
        assert_eq!(content["error"]["suggested_reply"], TRANSIENT_HINT);
    }

    #[test]
    fn tool_rounds_are_bounded_per_turn() {
        let mut session = listening();
        session.apply(final_utterance("what's your refund policy?")).unwrap();

        for (round, id) in ["call_1", "call_2"].into_iter().enumerate() {
            session.apply(tool_call(id)).unwrap();
            let effects = session
                .apply(SessionInput::ToolResolved {
                    call_id: id.into(),
                    outcome: Ok(json!({})),
                })
                .unwrap();
            let allow_tools = round == 0;
            assert_eq!(effects, vec![Effect::Generate { allow_tools }]);
        }

        let effects = session.apply(tool_call("call_3")).unwrap();
        assert_eq!(effects, vec![Effect::Speak(FALLBACK_REPLY.to_string())]);
        assert_eq!(session.state(), SessionState::Speaking);
    }

    #[test]
    fn tool_budget_resets_on_next_turn() {
        let mut session = listening();
        session.apply(final_utterance("first")).unwrap();
        session.apply(tool_call("call_1")).unwrap();
        session
            .apply(SessionInput::ToolResolved {
                call_id: "call_1".into(),
                outcome: Ok(json!({})),
            })
            .unwrap();
        session
            .apply(SessionInput::Reply(AgentReply::Answer("done".into())))
            .unwrap();
        session.apply(SessionInput::PlaybackFinished).unwrap();

        session.apply(final_utterance("second")).unwrap();
        let effects = session.apply(tool_call("call_2")).unwrap();
        assert!(matches!(effects.as_slice(), [Effect::Dispatch(_)]));
    }

    #[test]
    fn unknown_tool_result_is_rejected() {
        let mut session = listening();
        session.apply(final_utterance("hi")).unwrap();
        session.apply(tool_call("call_1")).unwrap();

        let err = session
            .apply(SessionInput::ToolResolved {
                call_id: "call_9".into(),
                outcome: Ok(json!({})),
            })
            .unwrap_err();
        assert_eq!(err, TransitionError::UnknownCall("call_9".into()));
        assert_eq!(session.state(), SessionState::ToolCall);
    }

    #[test]
    fn generator_failure_is_spoken_as_degraded_reply() {
        let mut session = listening();
        session.apply(final_utterance("hi")).unwrap();

        let effects = session
            .apply(SessionInput::ReplyFailed("timeout".into()))
            .unwrap();
        assert_eq!(effects, vec![Effect::Speak(DEGRADED_REPLY.to_string())]);
    }

    #[test]
    fn utterances_while_busy_are_queued_in_order() {
        let mut session = listening();
        session.apply(final_utterance("first")).unwrap();
        session.apply(final_utterance("second")).unwrap();
        session.apply(final_utterance("third")).unwrap();
        assert_eq!(session.pending_utterances(), 2);

        session
            .apply(SessionInput::Reply(AgentReply::Answer("one".into())))
            .unwrap();
        let effects = session.apply(SessionInput::PlaybackFinished).unwrap();

        assert_eq!(effects, vec![Effect::Generate { allow_tools: true }]);
        assert_eq!(session.state(), SessionState::Thinking);
        assert_eq!(session.transcript().last().unwrap().text, "second");
        assert_eq!(session.pending_utterances(), 1);
    }

    #[test]
    fn close_mid_tool_call_goes_to_closing_and_drops_late_results() {
        let mut session = listening();
        session.apply(final_utterance("please remember this")).unwrap();
        session.apply(tool_call("call_1")).unwrap();

        let effects = session
            .apply(SessionInput::Close(CloseReason::Disconnected))
            .unwrap();
        assert_eq!(effects, vec![Effect::Summarize]);
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.has_outstanding_calls());

        let late = session
            .apply(SessionInput::ToolResolved {
                call_id: "call_1".into(),
                outcome: Ok(json!({})),
            })
            .unwrap();
        assert!(late.is_empty());

        assert!(
            session
                .apply(SessionInput::Close(CloseReason::Disconnected))
                .unwrap()
                .is_empty()
        );

        let effects = session.apply(SessionInput::SummaryFinished).unwrap();
        assert_eq!(effects, vec![Effect::Release]);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Disconnected));
    }

    #[test]
    fn close_without_speech_skips_summary() {
        let mut session = listening();
        let effects = session
            .apply(SessionInput::Close(CloseReason::IdleTimeout))
            .unwrap();
        assert_eq!(effects, vec![Effect::Release]);
        assert_eq!(session.state(), SessionState::Closed);

        let mut never_joined = ConversationSession::new("room-a", Uuid::new_v4());
        let effects = never_joined
            .apply(SessionInput::Close(CloseReason::Disconnected))
            .unwrap();
        assert_eq!(effects, vec![Effect::Release]);
    }

    #[test]
    fn closed_session_ignores_everything() {
        let mut session = listening();
        session.apply(SessionInput::Close(CloseReason::EndOfCall)).unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        for input in [
            final_utterance("hello?"),
            SessionInput::Close(CloseReason::Disconnected),
            SessionInput::SummaryFinished,
        ] {
            assert!(session.apply(input).unwrap().is_empty());
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn transport_signals_do_not_change_state() {
        let mut session = listening();
        for event in [
            RoomEvent::TrackSubscribed {
                participant: "u123".into(),
            },
            RoomEvent::Reconnecting,
            RoomEvent::Reconnected,
        ] {
            assert!(session.apply(event.into()).unwrap().is_empty());
        }
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn reply_outside_thinking_is_unexpected() {
        let mut session = listening();
        let err = session
            .apply(SessionInput::Reply(AgentReply::Answer("hi".into())))
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Unexpected {
                state: SessionState::Listening,
                input: "reply",
            }
        );
    }

    #[test]
    fn prior_summary_leads_the_context() {
        let mut session = listening();
        session.apply(final_utterance("hi again")).unwrap();
        session.attach_prior_summary("Asked about a refund for order 42.");

        assert!(matches!(
            session.context().first(),
            Some(ContextEntry::PriorSummary(s)) if s.contains("order 42")
        ));
    }
}
