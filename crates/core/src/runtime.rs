//! Session Runtime
//!
//! Drives one [`ConversationSession`] as an independent task. Room events
//! arrive on an mpsc channel; every awaited operation (response generation,
//! tool dispatch, summary lookup) is raced against that channel so that a
//! disconnect is honored without waiting for the operation to finish. Other
//! events seen meanwhile are kept in arrival order and applied afterwards.

use crate::{
    error::ToolError,
    llm_client::{ResponseGenerator, ToolRequest},
    model::NewInteractionSummary,
    registry::SessionRegistry,
    session::{
        CloseReason, ConversationSession, Effect, RoomEvent, SessionInput, SessionState,
        TransitionError,
    },
    tools::{
        CallContext, SUMMARIZE_INTERACTION, SummaryLatch, SummaryStore, ToolDispatcher,
        ToolOutput, tool_specs,
    },
};
use chrono::{DateTime, Utc};
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;
const OUTPUT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Close after this long waiting on the room (joining, listening or
    /// awaiting playback) without progress.
    pub idle_timeout: Duration,
    pub response_timeout: Duration,
    pub summary_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            response_timeout: Duration::from_secs(30),
            summary_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionServices {
    pub generator: Arc<dyn ResponseGenerator>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub summaries: Arc<dyn SummaryStore>,
    pub registry: Arc<SessionRegistry>,
}

/// The registry's view of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub room_id: String,
    pub session_id: Uuid,
    pub subject_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub events: mpsc::Sender<RoomEvent>,
}

impl SessionHandle {
    /// Delivers a room event. Returns `false` once the session has stopped.
    pub async fn send(&self, event: RoomEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn end_call(&self) -> bool {
        self.send(RoomEvent::EndCall).await
    }
}

/// What the runtime asks the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    StateChanged(SessionState),
    Speak(String),
    Closed { summary_written: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub room_id: String,
    pub subject_id: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub summary_written: bool,
    pub utterances: usize,
}

pub struct SessionRuntime {
    session: ConversationSession,
    services: SessionServices,
    settings: SessionSettings,
    events: mpsc::Receiver<RoomEvent>,
    events_closed: bool,
    backlog: VecDeque<RoomEvent>,
    outputs: mpsc::Sender<SessionOutput>,
    latch: Arc<SummaryLatch>,
    idle_deadline: Instant,
    summary_written: bool,
}

enum Race<T> {
    Done(T),
    Event(Option<RoomEvent>),
}

impl SessionRuntime {
    /// Creates a runtime for `room_id` along with the handle to register and
    /// the stream of outputs for the transport.
    pub fn new(
        room_id: impl Into<String>,
        subject_id: Option<String>,
        services: SessionServices,
        settings: SessionSettings,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionOutput>) {
        let session = ConversationSession::new(room_id, Uuid::new_v4());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outputs_tx, outputs_rx) = mpsc::channel(OUTPUT_BUFFER);

        let handle = SessionHandle {
            room_id: session.room_id().to_string(),
            session_id: session.session_id(),
            subject_id,
            created_at: session.created_at(),
            events: events_tx,
        };
        let idle_deadline = Instant::now() + settings.idle_timeout;
        let runtime = Self {
            session,
            services,
            settings,
            events: events_rx,
            events_closed: false,
            backlog: VecDeque::new(),
            outputs: outputs_tx,
            latch: Arc::new(SummaryLatch::default()),
            idle_deadline,
            summary_written: false,
        };
        (runtime, handle, outputs_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id()
    }

    /// Runs the session until it reaches `Closed`.
    pub async fn run(mut self) -> SessionReport {
        info!("Session runtime started");
        while !self.session.state().is_terminal() {
            let input = self.next_input().await;
            self.drive(input).await;
        }
        info!(
            close_reason = ?self.session.close_reason(),
            summary_written = self.summary_written,
            "Session runtime finished"
        );
        SessionReport {
            session_id: self.session.session_id(),
            room_id: self.session.room_id().to_string(),
            subject_id: self.session.subject_id().map(str::to_string),
            close_reason: self.session.close_reason(),
            summary_written: self.summary_written,
            utterances: self.session.transcript().len(),
        }
    }

    async fn next_input(&mut self) -> SessionInput {
        if let Some(event) = self.backlog.pop_front() {
            return self.accept(event);
        }
        if self.events_closed {
            return SessionInput::Close(CloseReason::Disconnected);
        }
        let race = tokio::select! {
            event = self.events.recv() => Race::Event(event),
            _ = sleep_until(self.idle_deadline) => Race::Done(()),
        };
        match race {
            Race::Done(()) => {
                info!("Idle timeout reached");
                SessionInput::Close(CloseReason::IdleTimeout)
            }
            Race::Event(None) => {
                self.events_closed = true;
                SessionInput::Close(CloseReason::Disconnected)
            }
            Race::Event(Some(event)) => self.accept(event),
        }
    }

    fn accept(&mut self, event: RoomEvent) -> SessionInput {
        if matches!(event, RoomEvent::Transcription { is_final: true, .. }) {
            self.reset_idle_deadline();
        }
        event.into()
    }

    /// Applies `input` and every follow-up input its effects produce.
    async fn drive(&mut self, input: SessionInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            let before = self.session.state();
            let effects = match self.session.apply(input) {
                Ok(effects) => effects,
                Err(e @ TransitionError::RoomMismatch { .. }) => {
                    warn!(error = %e, "Join rejected; closing session");
                    queue.push_back(SessionInput::Close(CloseReason::Disconnected));
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring input");
                    continue;
                }
            };
            let after = self.session.state();
            if before != after {
                self.on_state_change(after).await;
            }
            for effect in effects {
                if let Some(next) = self.perform(effect).await {
                    let closing = matches!(next, SessionInput::Close(_));
                    queue.push_back(next);
                    if closing {
                        break;
                    }
                }
            }
        }
    }

    async fn on_state_change(&mut self, state: SessionState) {
        debug!(?state, "Session state changed");
        if matches!(state, SessionState::Listening | SessionState::Speaking) {
            self.reset_idle_deadline();
        }
        self.emit(SessionOutput::StateChanged(state)).await;
    }

    fn reset_idle_deadline(&mut self) {
        self.idle_deadline = Instant::now() + self.settings.idle_timeout;
    }

    async fn perform(&mut self, effect: Effect) -> Option<SessionInput> {
        match effect {
            Effect::LoadPriorSummary => self.load_prior_summary().await,
            Effect::Generate { allow_tools } => Some(self.generate(allow_tools).await),
            Effect::Dispatch(request) => Some(self.dispatch(request).await),
            Effect::Speak(text) => {
                self.emit(SessionOutput::Speak(text)).await;
                None
            }
            Effect::Summarize => {
                if self.write_summary().await {
                    self.summary_written = true;
                }
                Some(SessionInput::SummaryFinished)
            }
            Effect::Release => {
                self.services
                    .registry
                    .unregister_if(self.session.room_id(), self.session.session_id())
                    .await;
                self.emit(SessionOutput::Closed {
                    summary_written: self.summary_written,
                })
                .await;
                None
            }
        }
    }

    async fn load_prior_summary(&mut self) -> Option<SessionInput> {
        let subject_id = self.session.subject_id()?.to_string();
        let summaries = self.services.summaries.clone();
        let lookup = timeout(self.settings.response_timeout, async move {
            summaries.latest_summary(&subject_id).await
        });
        match self.await_or_close(lookup).await {
            Ok(Ok(Ok(Some(prior)))) => {
                info!(summary_id = %prior.id, "Loaded prior interaction summary");
                self.session.attach_prior_summary(prior.summary);
                None
            }
            Ok(Ok(Ok(None))) => None,
            Ok(Ok(Err(e))) => {
                warn!(error = ?e, "Failed to load prior interaction summary");
                None
            }
            Ok(Err(_)) => {
                warn!("Timed out loading prior interaction summary");
                None
            }
            Err(reason) => Some(SessionInput::Close(reason)),
        }
    }

    async fn generate(&mut self, allow_tools: bool) -> SessionInput {
        let generator = self.services.generator.clone();
        let context = self.session.context().to_vec();
        let tools = if allow_tools { tool_specs() } else { Vec::new() };
        let request = timeout(self.settings.response_timeout, async move {
            generator.respond(&context, &tools).await
        });

        match self.await_or_close(request).await {
            Ok(Ok(Ok(reply))) => SessionInput::Reply(reply),
            Ok(Ok(Err(e))) => {
                error!(error = ?e, "Response generation failed");
                SessionInput::ReplyFailed(e.to_string())
            }
            Ok(Err(_)) => {
                warn!("Response generation timed out");
                SessionInput::ReplyFailed("response generation timed out".to_string())
            }
            Err(reason) => SessionInput::Close(reason),
        }
    }

    async fn dispatch(&mut self, request: ToolRequest) -> SessionInput {
        let dispatcher = self.services.dispatcher.clone();
        let ctx = self.call_context();
        let name = request.name.clone();
        let arguments = request.arguments.clone();
        let mut task = tokio::spawn(async move {
            dispatch_with_retry(&dispatcher, &ctx, &name, &arguments).await
        });

        let joined = match self.await_or_close(&mut task).await {
            Ok(joined) => joined,
            Err(reason) => {
                if request.name == SUMMARIZE_INTERACTION {
                    info!(tool = %request.name, "Detaching in-flight summary write");
                } else {
                    info!(tool = %request.name, "Aborting in-flight tool call");
                    task.abort();
                }
                return SessionInput::Close(reason);
            }
        };

        let outcome = match joined {
            Ok(Ok(output)) => {
                if matches!(output, ToolOutput::SummarySaved { .. }) {
                    self.summary_written = true;
                }
                serde_json::to_value(&output).map_err(|e| ToolError::Backend(e.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!(error = ?e, tool = %request.name, "Tool task failed");
                Err(ToolError::Backend("tool task failed".to_string()))
            }
        };
        SessionInput::ToolResolved {
            call_id: request.call_id,
            outcome,
        }
    }

    fn call_context(&self) -> CallContext {
        CallContext {
            subject_id: self.session.subject_id().unwrap_or_default().to_string(),
            session_id: self.session.session_id(),
            room_id: self.session.room_id().to_string(),
            summary_latch: self.latch.clone(),
        }
    }

    /// Summarises the transcript and persists it, at most once per session.
    ///
    /// The latch claim is confirmed only by a successful save. Saves are
    /// idempotent per session, so retrying after a timed-out save that did
    /// land returns the stored row.
    async fn write_summary(&mut self) -> bool {
        let Some(subject_id) = self.session.subject_id().map(str::to_string) else {
            return false;
        };
        let latch = self.latch.clone();
        let Some(claim) = latch.claim() else {
            info!("Interaction summary already recorded during the session");
            return false;
        };

        let summary = match timeout(
            self.settings.summary_timeout,
            self.services.generator.summarize(self.session.transcript()),
        )
        .await
        {
            Ok(Ok(summary)) if !summary.trim().is_empty() => summary,
            Ok(Ok(_)) => {
                warn!("Summarisation returned no text; skipping interaction summary");
                return false;
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Summarisation failed");
                return false;
            }
            Err(_) => {
                error!("Summarisation timed out");
                return false;
            }
        };

        let record = NewInteractionSummary {
            user_id: subject_id,
            session_id: Some(self.session.session_id().to_string()),
            summary,
        };
        for attempt in 1..=2 {
            let save = self.services.summaries.save_summary(record.clone());
            match timeout(self.settings.summary_timeout, save).await {
                Ok(Ok(saved)) => {
                    info!(summary_id = %saved.id, "Interaction summary saved at teardown");
                    claim.confirm();
                    return true;
                }
                Ok(Err(e)) => warn!(error = ?e, attempt, "Failed to save interaction summary"),
                Err(_) => warn!(attempt, "Saving interaction summary timed out"),
            }
        }
        error!("Giving up on interaction summary after retry");
        false
    }

    /// Awaits `operation` while still consuming room events. Events that do
    /// not close the session are deferred to the backlog; a close abandons
    /// the operation and returns the reason.
    async fn await_or_close<F, T>(&mut self, operation: F) -> Result<T, CloseReason>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(operation);
        loop {
            let race = tokio::select! {
                out = &mut operation => Race::Done(out),
                event = self.events.recv(), if !self.events_closed => Race::Event(event),
            };
            match race {
                Race::Done(out) => return Ok(out),
                Race::Event(None) => {
                    self.events_closed = true;
                    return Err(CloseReason::Disconnected);
                }
                Race::Event(Some(event)) => match event {
                    RoomEvent::Disconnected => return Err(CloseReason::Disconnected),
                    RoomEvent::EndCall => return Err(CloseReason::EndOfCall),
                    event => self.backlog.push_back(event),
                },
            }
        }
    }

    async fn emit(&self, output: SessionOutput) {
        if self.outputs.send(output).await.is_err() {
            debug!("Transport stopped listening for session output");
        }
    }
}

async fn dispatch_with_retry(
    dispatcher: &ToolDispatcher,
    ctx: &CallContext,
    name: &str,
    arguments: &serde_json::Value,
) -> Result<ToolOutput, ToolError> {
    match dispatcher.dispatch(ctx, name, arguments).await {
        Err(e) if e.is_transient() => {
            warn!(tool = %name, error = %e, "Retrying tool call once");
            dispatcher.dispatch(ctx, name, arguments).await
        }
        other => other,
    }
}
