//! WebSocket handler: one task per connection relaying frames.
//!
//! DESIGN
//! ======
//! The upgrade handler authenticates first and answers 401 without
//! upgrading if the credential does not resolve. An admitted connection
//! gets a handle in the relay and a bounded outbound channel, then enters a
//! `select!` loop:
//! - inbound client frames -> decode + dispatch by event name
//! - frames fanned out by the relay -> forward to the client
//!
//! Handlers validate, call the relay, and return an `Outcome` describing
//! what the sender alone should get back. Everything room-scoped is fanned
//! out by the relay itself, inside its lock, so handlers never broadcast.
//!
//! LIFECYCLE
//! =========
//! 1. Authenticate -> upgrade -> admit -> send `session:connected`
//! 2. Client sends frames -> dispatch -> handler returns Outcome
//! 3. Close or transport error -> relay disconnect (leaves every room,
//!    emits `canvas:userLeft` where the user has no other tab left)

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use frames::events::{
    CANVAS_ACTIVE_USERS, CANVAS_DRAW, CANVAS_JOIN, CANVAS_LEAVE, CANVAS_PROVIDE_SYNC, CANVAS_REQUEST_ACTIVE_USERS,
    CANVAS_REQUEST_SYNC, CANVAS_SAVE_SNAPSHOT, CANVAS_USER_MOVEMENT, GATEWAY_ERROR, JOIN_COMMUNITY, JOIN_ROOM,
    KEY_CANVAS_DATA, KEY_CAPACITY, KEY_COMMUNITY_ID, KEY_HANDLE_ID, KEY_POSITION, KEY_RECOVERING, KEY_ROOM_ID,
    KEY_USER, KEY_USER_ID, KEY_USERS, LEAVE_COMMUNITY, LEAVE_ROOM, SESSION_CONNECTED,
};
use frames::{
    CodecError, Cursor, Data, DrawEvent, FRAME_MESSAGE, Frame, PresenceUser, RoomFamily, RoomId, Status, decode_frame,
    decode_json, encode_frame, encode_json, now_ms,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::services::auth::{self, AuthError};
use crate::services::registry::ConnectionHandle;
use crate::services::relay::{EventKind, RelayError};
use crate::services::session::Identity;
use crate::state::AppState;

const KEY_CHAT_ID: &str = "chatId";

// =============================================================================
// OUTCOME
// =============================================================================

/// What the sender receives for its request. Room fan-out has already
/// happened inside the relay by the time a handler returns.
#[derive(Debug)]
enum Outcome {
    /// Nothing. Used for relayed events, whose echo is the confirmation.
    Silent,
    /// Empty done.
    Done,
    /// Done carrying data.
    DoneWith(Data),
    /// A differently named event answering the request.
    Answer(&'static str, Data),
}

/// Wire encoding negotiated at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    Binary,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = auth::extract_credential(&params, &headers);
    let identity = match auth::authenticate(state.identities.as_ref(), credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e @ AuthError::Unauthenticated(_)) => {
            info!(error = %e, "ws: admission rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
        Err(e) => {
            error!(error = %e, "ws: credential validation failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "credential validation error").into_response();
        }
    };

    let encoding = match params.get("encoding").map(String::as_str) {
        Some("binary") => Encoding::Binary,
        _ => Encoding::Json,
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity, encoding))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity, encoding: Encoding) {
    // Per-connection channel for frames fanned out by the relay.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);
    let handle = state.relay.admit(identity, client_tx);

    if send_frame(&mut socket, encoding, &welcome_frame(&handle)).await.is_err() {
        state.relay.disconnect(&handle);
        return;
    }
    info!(handle_id = %handle.id, user_id = %handle.user_id(), ?encoding, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let decoded = match msg {
                    Message::Text(text) => decode_json(text.as_str()),
                    Message::Binary(bytes) => decode_frame(&bytes),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let replies = process_inbound(&state, &handle, decoded).await;
                if send_all(&mut socket, encoding, &replies).await.is_err() {
                    break;
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, encoding, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(report) = state.relay.disconnect(&handle) {
        info!(
            handle_id = %handle.id,
            rooms = report.rooms_left.len(),
            presence_left = report.presence_left.len(),
            connections = state.relay.connection_count(),
            "ws: client disconnected"
        );
    }
}

fn welcome_frame(handle: &ConnectionHandle) -> Frame {
    let identity = &handle.identity;
    Frame::request(SESSION_CONNECTED, Data::new())
        .with_data(KEY_HANDLE_ID, handle.id.to_string())
        .with_data(KEY_USER_ID, identity.user_id.to_string())
        .with_data("displayName", identity.display_name.clone())
        .with_data("avatarRef", identity.avatar_ref.clone().map_or(Value::Null, Value::String))
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Handle one decoded (or undecodable) inbound frame and return the frames
/// owed to the sender. Transport concerns stay in `run_ws` so tests can
/// drive dispatch directly.
async fn process_inbound(state: &AppState, handle: &ConnectionHandle, decoded: Result<Frame, CodecError>) -> Vec<Frame> {
    let req = match decoded {
        Ok(req) => req,
        Err(e) => {
            warn!(handle_id = %handle.id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request(GATEWAY_ERROR, Data::new()).with_data(FRAME_MESSAGE, format!("invalid frame: {e}"));
            return vec![err];
        }
    };

    if !is_high_volume(&req.syscall) {
        info!(handle_id = %handle.id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let result = match req.syscall.as_str() {
        JOIN_ROOM => handle_join(state, handle, &req, RoomFamily::Chat).await,
        LEAVE_ROOM => handle_leave(state, handle, &req, RoomFamily::Chat),
        JOIN_COMMUNITY => handle_join(state, handle, &req, RoomFamily::Community).await,
        LEAVE_COMMUNITY => handle_leave(state, handle, &req, RoomFamily::Community),
        CANVAS_JOIN => handle_canvas_join(state, handle, &req).await,
        CANVAS_LEAVE => handle_canvas_leave(state, handle, &req),
        CANVAS_REQUEST_ACTIVE_USERS => handle_active_users(state, handle, &req),
        CANVAS_USER_MOVEMENT => handle_cursor(state, handle, &req),
        CANVAS_DRAW => handle_draw(state, handle, &req),
        CANVAS_REQUEST_SYNC => handle_request_sync(state, handle, &req),
        CANVAS_PROVIDE_SYNC => handle_provide_sync(state, handle, &req),
        CANVAS_SAVE_SNAPSHOT => handle_save_snapshot(state, handle, &req),
        other => match EventKind::chat(other) {
            Some(kind) => handle_chat(state, handle, &req, kind),
            None => return vec![req.error(format!("unknown event: {other}"))],
        },
    };

    match result {
        Ok(Outcome::Silent) => vec![],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::DoneWith(data)) => vec![req.done_with(data)],
        Ok(Outcome::Answer(syscall, data)) => vec![req.answer(syscall, data)],
        Err(RelayError::DeadHandle(e)) => {
            debug!(handle_id = %handle.id, syscall = %req.syscall, error = %e, "ws: request raced disconnect; ignored");
            vec![]
        }
        Err(e) => vec![req.error_from(&e)],
    }
}

fn is_high_volume(syscall: &str) -> bool {
    matches!(syscall, CANVAS_USER_MOVEMENT | CANVAS_DRAW | CANVAS_JOIN)
}

// =============================================================================
// MEMBERSHIP HANDLERS
// =============================================================================

async fn handle_join(
    state: &AppState,
    handle: &ConnectionHandle,
    req: &Frame,
    family: RoomFamily,
) -> Result<Outcome, RelayError> {
    let room = room_arg(req, family)?;
    authorize(state, handle, &room).await?;
    state.relay.join(handle, &room)?;
    Ok(Outcome::Done)
}

fn handle_leave(
    state: &AppState,
    handle: &ConnectionHandle,
    req: &Frame,
    family: RoomFamily,
) -> Result<Outcome, RelayError> {
    let room = room_arg(req, family)?;
    state.relay.leave(handle, &room)?;
    Ok(Outcome::Done)
}

/// First join or heartbeat. Only the first join is acknowledged; the
/// acknowledgement says whether a recovery `canvas:sync` will follow.
async fn handle_canvas_join(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    if let Some(user) = req.data.get(KEY_USER) {
        let user: PresenceUser =
            serde_json::from_value(user.clone()).map_err(|e| RelayError::BadPayload(format!("user: {e}")))?;
        check_self(handle, user.user_id)?;
    }

    if !state.relay.is_member(handle, &room)? {
        authorize(state, handle, &room).await?;
    }
    let joined = state.relay.join(handle, &room)?;
    if !joined.newly_joined {
        debug!(handle_id = %handle.id, %room, presence = ?joined.presence, "ws: canvas heartbeat");
        return Ok(Outcome::Silent);
    }

    let mut data = Data::new();
    data.insert(KEY_ROOM_ID.into(), json!(room.key()));
    data.insert(KEY_RECOVERING.into(), json!(joined.room_was_empty));
    if joined.room_was_empty {
        state
            .snapshots
            .recover_for(state.relay.clone(), handle.id, room, req.clone());
    }
    Ok(Outcome::DoneWith(data))
}

fn handle_canvas_leave(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    if let Some(user_id) = req.data.get(KEY_USER_ID) {
        let user_id = serde_json::from_value(user_id.clone())
            .map_err(|e| RelayError::BadPayload(format!("{KEY_USER_ID}: {e}")))?;
        check_self(handle, user_id)?;
    }
    state.relay.leave(handle, &room)?;
    Ok(Outcome::Done)
}

/// The single membership authority for canvas and community rooms. Chat
/// rooms are authorized by the chat store that issues their ids.
async fn authorize(state: &AppState, handle: &ConnectionHandle, room: &RoomId) -> Result<(), RelayError> {
    match room.family() {
        RoomFamily::Chat => Ok(()),
        RoomFamily::Canvas | RoomFamily::Community => {
            if state
                .identities
                .is_community_member(handle.user_id(), room.key())
                .await?
            {
                Ok(())
            } else {
                info!(handle_id = %handle.id, %room, "ws: join refused; not a community member");
                Err(RelayError::Forbidden(room.clone()))
            }
        }
    }
}

// =============================================================================
// CANVAS HANDLERS
// =============================================================================

fn handle_active_users(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    require_member(state, handle, &room)?;

    let mut data = Data::new();
    data.insert(KEY_ROOM_ID.into(), json!(room.key()));
    data.insert(KEY_USERS.into(), json!(state.relay.active_users(&room)));
    data.insert(KEY_CAPACITY.into(), json!(state.config.canvas_room_capacity));
    Ok(Outcome::Answer(CANVAS_ACTIVE_USERS, data))
}

/// Cursor moves from a handle that is not (or no longer) joined are
/// dropped quietly; they are too frequent to answer with errors.
fn handle_cursor(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    let cursor: Cursor = req
        .data
        .get(KEY_POSITION)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .filter(|c: &Cursor| c.is_finite())
        .ok_or_else(|| RelayError::BadPayload(format!("{KEY_POSITION} must be {{x, y}}")))?;

    match state.relay.move_cursor_at(handle, &room, cursor, now_ms()) {
        Ok(_) => Ok(Outcome::Silent),
        Err(RelayError::NotJoined(room)) => {
            debug!(handle_id = %handle.id, %room, "ws: cursor for unjoined room dropped");
            Ok(Outcome::Silent)
        }
        Err(e) => Err(e),
    }
}

fn handle_draw(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    let draw: DrawEvent = serde_json::from_value(Value::Object(req.data.clone()))
        .map_err(|e| RelayError::BadPayload(format!("draw: {e}")))?;
    draw.validate()
        .map_err(|e| RelayError::BadPayload(e.to_string()))?;

    let Value::Object(payload) = json!(draw) else {
        return Err(RelayError::BadPayload("draw event did not serialize to an object".into()));
    };
    state.relay.publish(handle, &room, EventKind::Draw, payload)?;
    Ok(Outcome::Silent)
}

/// Ask peers for their raster, or fall back to the durable snapshot when
/// nobody else is in the room to answer.
fn handle_request_sync(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    require_member(state, handle, &room)?;

    if state.relay.peer_count(handle, &room) == 0 {
        state
            .snapshots
            .recover_for(state.relay.clone(), handle.id, room, req.clone());
    } else {
        state
            .relay
            .publish(handle, &room, EventKind::RequestSync, Data::new())?;
    }
    Ok(Outcome::Silent)
}

/// A peer's raster is relayed to the room as `canvas:sync` and, being a
/// converged state, queued for durable storage too.
fn handle_provide_sync(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    let raster = canvas_data(req)?;

    let mut payload = Data::new();
    payload.insert(KEY_CANVAS_DATA.into(), Value::String(raster.clone()));
    state.relay.publish(handle, &room, EventKind::Sync, payload)?;

    if let Err(e) = state.snapshots.schedule_put(&room, raster) {
        debug!(%room, error = %e, "ws: provided raster not queued for storage");
    }
    Ok(Outcome::Silent)
}

fn handle_save_snapshot(state: &AppState, handle: &ConnectionHandle, req: &Frame) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Canvas)?;
    require_member(state, handle, &room)?;
    let raster = canvas_data(req)?;
    state.snapshots.schedule_put(&room, raster)?;
    Ok(Outcome::Done)
}

// =============================================================================
// CHAT HANDLERS
// =============================================================================

fn handle_chat(state: &AppState, handle: &ConnectionHandle, req: &Frame, kind: EventKind) -> Result<Outcome, RelayError> {
    let room = room_arg(req, RoomFamily::Chat)?;
    let mut payload = req.data.clone();
    payload.remove(KEY_CHAT_ID);
    state.relay.publish(handle, &room, kind, payload)?;
    Ok(Outcome::Silent)
}

// =============================================================================
// HELPERS
// =============================================================================

/// Room named by the request: payload id first, then the frame's `room`.
fn room_arg(req: &Frame, family: RoomFamily) -> Result<RoomId, RelayError> {
    let keys: &[&str] = match family {
        RoomFamily::Chat => &[KEY_ROOM_ID, KEY_CHAT_ID],
        RoomFamily::Community => &[KEY_COMMUNITY_ID, KEY_ROOM_ID],
        RoomFamily::Canvas => &[KEY_ROOM_ID],
    };

    let raw = keys.iter().find_map(|k| req.data.get(*k).map(|v| (*k, v)));
    let raw = match raw {
        Some((_, Value::String(s))) => s.clone(),
        Some((_, Value::Number(n))) => n.to_string(),
        Some((key, _)) => return Err(RelayError::BadPayload(format!("{key} must be a string"))),
        None => match &req.room {
            Some(room) => room.clone(),
            None => return Err(RelayError::BadPayload(format!("{} required", keys[0]))),
        },
    };
    RoomId::parse_in(family, &raw).map_err(|e| RelayError::BadPayload(e.to_string()))
}

fn require_member(state: &AppState, handle: &ConnectionHandle, room: &RoomId) -> Result<(), RelayError> {
    if state.relay.is_member(handle, room)? {
        Ok(())
    } else {
        Err(RelayError::NotJoined(room.clone()))
    }
}

fn check_self(handle: &ConnectionHandle, user_id: uuid::Uuid) -> Result<(), RelayError> {
    if user_id == handle.user_id() {
        Ok(())
    } else {
        Err(RelayError::BadPayload("user does not match the authenticated session".into()))
    }
}

fn canvas_data(req: &Frame) -> Result<String, RelayError> {
    match req.str_field(KEY_CANVAS_DATA) {
        Some(raster) if !raster.is_empty() => Ok(raster.to_owned()),
        _ => Err(RelayError::BadPayload(format!("{KEY_CANVAS_DATA} required"))),
    }
}

async fn send_all(socket: &mut WebSocket, encoding: Encoding, frames: &[Frame]) -> Result<(), ()> {
    for frame in frames {
        send_frame(socket, encoding, frame).await?;
    }
    Ok(())
}

async fn send_frame(socket: &mut WebSocket, encoding: Encoding, frame: &Frame) -> Result<(), ()> {
    if frame.status == Status::Error {
        let code = frame.error_code().unwrap_or("-");
        let message = frame.str_field(FRAME_MESSAGE).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if !is_high_volume(&frame.syscall) {
        debug!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }

    let msg = match encoding {
        Encoding::Json => Message::Text(encode_json(frame).into()),
        Encoding::Binary => Message::Binary(encode_frame(frame).into()),
    };
    socket.send(msg).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
