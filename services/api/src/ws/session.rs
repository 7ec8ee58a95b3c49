//! Manages the WebSocket connection lifecycle for a room session.
//!
//! The socket carries the room transport's events in and the session's
//! outputs back out. A connection owns at most one session runtime, keyed in
//! the registry by room.

use super::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use anyhow::{Result, anyhow, ensure};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument, warn};
use voicedesk_core::{
    credential::CredentialClaims,
    runtime::{SessionHandle, SessionOutput, SessionRuntime},
    session::RoomEvent,
};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "ws_connection", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id: u32 = rand::random();
    tracing::Span::current().record("connection_id", connection_id);
    info!("New WebSocket connection. Awaiting join...");

    let (socket_tx, socket_rx) = socket.split();
    if let Err(e) = run_bridge(state, socket_tx, socket_rx).await {
        error!(error = ?e, "Room connection terminated with error.");
    }
    info!("WebSocket connection closed.");
}

/// Bridges one transport connection to a session runtime.
///
/// The first message must be a `join` carrying a credential for the named
/// room. Once joined, client messages become room events and session outputs
/// become server messages until the session reports `closed`.
pub(crate) async fn run_bridge<S, R>(state: Arc<AppState>, mut sink: S, mut stream: R) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Into<anyhow::Error>,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (credential, room) = match await_join(&mut stream).await {
        Ok(Some(join)) => join,
        Ok(None) => {
            info!("Client disconnected before joining.");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "Session join failed");
            send_msg(&mut sink, ServerMessage::Error { message: e.to_string() }).await?;
            return Ok(());
        }
    };

    let claims = match authorize_join(&state, &credential, &room) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, room = %room, "Join rejected");
            send_msg(&mut sink, ServerMessage::Error { message: e.to_string() }).await?;
            return Ok(());
        }
    };

    let (runtime, handle, mut outputs) = SessionRuntime::new(
        claims.room_id.clone(),
        Some(claims.subject_id.clone()),
        state.services.clone(),
        state.session_settings.clone(),
    );
    if let Err(e) = state.registry.register(handle.clone()).await {
        send_msg(&mut sink, ServerMessage::Error { message: e.to_string() }).await?;
        return Ok(());
    }

    let session_id = handle.session_id;
    let session_span =
        tracing::info_span!("session_runtime", room_id = %claims.room_id, %session_id);
    let runtime_task = tokio::spawn(runtime.run().instrument(session_span));

    handle.send(RoomEvent::JoinConfirmed(claims.clone())).await;
    send_msg(
        &mut sink,
        ServerMessage::Joined {
            room: claims.room_id.clone(),
            session_id,
        },
    )
    .await?;

    relay(&handle, &mut outputs, &mut sink, &mut stream).await;

    match runtime_task.await {
        Ok(report) => info!(
            summary_written = report.summary_written,
            utterances = report.utterances,
            "Room session finished."
        ),
        Err(e) => {
            error!(error = ?e, "Session runtime task failed.");
            state
                .registry
                .unregister_if(&claims.room_id, session_id)
                .await;
        }
    }
    Ok(())
}

/// Moves client events into the session and session outputs out to the
/// client until the session reports `closed` or stops.
///
/// Client events wait in `pending` until the event channel has room, so a
/// busy session never stalls the output side.
async fn relay<S, R>(
    handle: &SessionHandle,
    outputs: &mut mpsc::Receiver<SessionOutput>,
    sink: &mut S,
    stream: &mut R,
) where
    S: Sink<Message> + Unpin,
    S::Error: Into<anyhow::Error>,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut client_open = true;
    let mut pending: VecDeque<RoomEvent> = VecDeque::new();
    loop {
        tokio::select! {
            incoming = stream.next(), if client_open && pending.is_empty() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => match msg.into_room_event() {
                        Some(event) => pending.push_back(event),
                        None => warn!("Ignoring repeated join."),
                    },
                    Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client left the room.");
                    client_open = false;
                    pending.push_back(RoomEvent::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving from client WebSocket.");
                    client_open = false;
                    pending.push_back(RoomEvent::Disconnected);
                }
            },
            permit = handle.events.reserve(), if !pending.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(event) = pending.pop_front() {
                        permit.send(event);
                    }
                }
                // The runtime is gone; its outputs end the loop.
                Err(_) => pending.clear(),
            },
            output = outputs.recv() => match output {
                Some(output) => {
                    let closed = matches!(output, SessionOutput::Closed { .. });
                    if client_open {
                        if let Err(e) = send_msg(sink, output.into()).await {
                            warn!(error = ?e, "Failed to deliver session output; treating as disconnect.");
                            client_open = false;
                            pending.push_back(RoomEvent::Disconnected);
                        }
                    }
                    if closed {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Waits for the opening `join`. Returns `None` if the client leaves first.
async fn await_join<R>(stream: &mut R) -> Result<Option<(String, String)>>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                return match serde_json::from_str::<ClientMessage>(&text)? {
                    ClientMessage::Join { credential, room } => Ok(Some((credential, room))),
                    _ => Err(anyhow!("First message must be `join`")),
                };
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(None),
            Message::Binary(_) => return Err(anyhow!("First message was not a text `join` message.")),
        }
    }
    Ok(None)
}

fn authorize_join(state: &AppState, credential: &str, room: &str) -> Result<CredentialClaims> {
    let claims = state.issuer.verify_credential(credential)?;
    ensure!(
        claims.room_id == room,
        "credential was issued for room '{}', not '{}'",
        claims.room_id,
        room
    );
    Ok(claims)
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<S>(sink: &mut S, msg: ServerMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Into<anyhow::Error>,
{
    let serialized = serde_json::to_string(&msg)?;
    sink.send(Message::Text(serialized.into()))
        .await
        .map_err(Into::into)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture};
    use futures_util::{sink, stream};
    use serde_json::{Value, json};
    use std::{convert::Infallible, time::Duration};
    use tokio::time::{Instant, timeout, timeout_at};
    use uuid::Uuid;
    use voicedesk_core::session::SessionState;

    const ROOM: &str = "assistant-room-u123";

    async fn credential(fixture: &Fixture, room: &str) -> String {
        fixture
            .state
            .issuer
            .issue(&test_support::assertion("u123", 600), room, None)
            .await
            .unwrap()
            .token
    }

    fn text(value: Value) -> Result<Message, axum::Error> {
        Ok(Message::Text(value.to_string().into()))
    }

    fn decode(msg: &Message) -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    async fn next_of_type(rx: &mut mpsc::UnboundedReceiver<Message>, kind: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let msg = timeout_at(deadline, rx.recv())
                .await
                .unwrap_or_else(|_| panic!("no `{kind}` message arrived"))
                .expect("bridge stopped sending");
            let value = decode(&msg);
            if value["type"] == kind {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn joined_room_answers_and_summarizes_on_end_call() {
        let fixture = test_support::fixture();
        let token = credential(&fixture, ROOM).await;

        let (client_tx, client_rx) = mpsc::unbounded_channel::<Result<Message, axum::Error>>();
        let (server_tx, mut server_rx) = mpsc::unbounded_channel::<Message>();
        let incoming = Box::pin(stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        }));
        let outgoing = Box::pin(sink::unfold(server_tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, Infallible>(tx)
        }));
        let bridge = tokio::spawn(run_bridge(fixture.state.clone(), outgoing, incoming));

        client_tx
            .send(text(json!({"type": "join", "credential": token, "room": ROOM})))
            .unwrap();
        let joined = next_of_type(&mut server_rx, "joined").await;
        assert_eq!(joined["room"], ROOM);
        assert!(fixture.state.registry.lookup(ROOM).await.is_some());

        client_tx
            .send(text(json!({"type": "transcription", "text": "hello there", "is_final": true})))
            .unwrap();
        let speak = next_of_type(&mut server_rx, "speak").await;
        assert_eq!(speak["text"], "You said: hello there");

        client_tx
            .send(text(json!({"type": "playback_finished"})))
            .unwrap();
        client_tx.send(text(json!({"type": "end_call"}))).unwrap();

        let closed = next_of_type(&mut server_rx, "closed").await;
        assert_eq!(closed["summary_written"], true);
        timeout(Duration::from_secs(5), bridge)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(fixture.summaries.count().await, 1);
        assert!(fixture.state.registry.lookup(ROOM).await.is_none());
    }

    #[tokio::test]
    async fn credential_for_another_room_is_rejected() {
        let fixture = test_support::fixture();
        let token = credential(&fixture, "assistant-room-other").await;
        let mut sent: Vec<Message> = Vec::new();

        run_bridge(
            fixture.state.clone(),
            &mut sent,
            stream::iter(vec![text(json!({"type": "join", "credential": token, "room": ROOM}))]),
        )
        .await
        .unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0])["type"], "error");
        assert!(fixture.state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn second_connection_to_an_occupied_room_is_refused() {
        let fixture = test_support::fixture();
        let (_runtime, handle, _outputs) = SessionRuntime::new(
            ROOM,
            Some("u123".to_string()),
            fixture.state.services.clone(),
            fixture.state.session_settings.clone(),
        );
        fixture.state.registry.register(handle.clone()).await.unwrap();
        let token = credential(&fixture, ROOM).await;
        let mut sent: Vec<Message> = Vec::new();

        run_bridge(
            fixture.state.clone(),
            &mut sent,
            stream::iter(vec![text(json!({"type": "join", "credential": token, "room": ROOM}))]),
        )
        .await
        .unwrap();

        let reply = decode(&sent[0]);
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().contains(ROOM));
        let current = fixture.state.registry.lookup(ROOM).await.unwrap();
        assert_eq!(current.session_id, handle.session_id);
    }

    #[tokio::test]
    async fn first_message_must_be_join() {
        let fixture = test_support::fixture();
        let mut sent: Vec<Message> = Vec::new();

        run_bridge(
            fixture.state.clone(),
            &mut sent,
            stream::iter(vec![text(json!({"type": "end_call"}))]),
        )
        .await
        .unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0])["message"], "First message must be `join`");
        assert!(fixture.state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn busy_session_does_not_stall_outputs() {
        // A session that never reads its events while emitting more outputs
        // than either channel holds.
        let (events_tx, _events_rx) = mpsc::channel(1);
        let handle = SessionHandle {
            room_id: ROOM.to_string(),
            session_id: Uuid::new_v4(),
            subject_id: None,
            created_at: chrono::Utc::now(),
            events: events_tx,
        };
        let (outputs_tx, mut outputs) = mpsc::channel(2);
        let session = tokio::spawn(async move {
            for _ in 0..32 {
                outputs_tx
                    .send(SessionOutput::StateChanged(SessionState::Speaking))
                    .await
                    .unwrap();
            }
            outputs_tx
                .send(SessionOutput::Closed { summary_written: false })
                .await
                .unwrap();
        });

        let transcriptions = (0..16).map(|i| {
            text(json!({"type": "transcription", "text": format!("line {i}"), "is_final": true}))
        });
        let mut incoming = stream::iter(transcriptions).chain(stream::pending());
        let mut sent: Vec<Message> = Vec::new();

        timeout(
            Duration::from_secs(5),
            relay(&handle, &mut outputs, &mut sent, &mut incoming),
        )
        .await
        .expect("outputs must keep flowing while the event channel is full");
        session.await.unwrap();

        assert_eq!(sent.len(), 33);
        assert_eq!(decode(sent.last().unwrap())["type"], "closed");
    }
}
