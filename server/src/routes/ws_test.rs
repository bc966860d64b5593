use super::*;
use crate::state::test_helpers::{TestEnv, identity, test_env};
use frames::events::{CANVAS_SYNC, CANVAS_USER_JOINED, CANVAS_USER_LEFT, NEW_MESSAGE};
use tokio::time::{Duration, timeout};

fn connect(env: &TestEnv, name: &str) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(64);
    (env.state.relay.admit(identity(name), tx), rx)
}

fn member(env: &TestEnv, name: &str, community: &str) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
    let (handle, rx) = connect(env, name);
    env.identities.grant(handle.user_id(), community);
    (handle, rx)
}

fn obj(value: Value) -> Data {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

async fn send(env: &TestEnv, handle: &ConnectionHandle, syscall: &str, data: Value) -> Vec<Frame> {
    process_inbound(&env.state, handle, Ok(Frame::request(syscall, obj(data)))).await
}

async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("relay receive timed out")
        .expect("relay channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(timeout(Duration::from_millis(80), rx.recv()).await.is_err(), "expected no relayed frame");
}

fn single(frames: Vec<Frame>) -> Frame {
    assert_eq!(frames.len(), 1, "expected exactly one reply, got {frames:?}");
    frames.into_iter().next().unwrap()
}

/// Join canvas 42 and swallow the recovery `canvas:sync` if one is sent.
async fn join_canvas(env: &TestEnv, handle: &ConnectionHandle, rx: &mut mpsc::Receiver<Frame>) {
    let reply = single(send(env, handle, CANVAS_JOIN, json!({"roomId": "42"})).await);
    assert_eq!(reply.status, Status::Done);
    while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx.recv()).await {}
}

// =============================================================================
// ADMISSION
// =============================================================================

#[test]
fn welcome_frame_carries_identity() {
    let env_identity = identity("Ada");
    let (tx, _rx) = mpsc::channel(1);
    let relay = crate::services::relay::Relay::new();
    let handle = relay.admit(env_identity.clone(), tx);

    let welcome = welcome_frame(&handle);
    assert_eq!(welcome.syscall, SESSION_CONNECTED);
    assert_eq!(welcome.str_field(KEY_HANDLE_ID), Some(handle.id.to_string().as_str()));
    assert_eq!(welcome.str_field(KEY_USER_ID), Some(env_identity.user_id.to_string().as_str()));
    assert_eq!(welcome.str_field("displayName"), Some("Ada"));
    assert_eq!(welcome.data["avatarRef"], Value::Null);
}

#[tokio::test]
async fn undecodable_frame_gets_gateway_error() {
    let env = test_env();
    let (handle, _rx) = connect(&env, "Ada");
    let reply = single(process_inbound(&env.state, &handle, decode_json("{not json")).await);
    assert_eq!(reply.syscall, GATEWAY_ERROR);
    assert!(reply.str_field(FRAME_MESSAGE).unwrap().starts_with("invalid frame"));
}

#[tokio::test]
async fn unknown_event_is_rejected() {
    let env = test_env();
    let (handle, _rx) = connect(&env, "Ada");
    let reply = single(send(&env, &handle, "canvas:teleport", json!({})).await);
    assert_eq!(reply.status, Status::Error);
    assert!(reply.parent_id.is_some());
}

// =============================================================================
// CANVAS MEMBERSHIP
// =============================================================================

#[tokio::test]
async fn canvas_join_requires_community_membership() {
    let env = test_env();
    let (handle, _rx) = connect(&env, "Ada");

    let reply = single(send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42"})).await);
    assert_eq!(reply.error_code(), Some("E_FORBIDDEN"));
    assert!(!env.state.relay.is_member(&handle, &RoomId::canvas("42")).unwrap());

    env.identities.grant(handle.user_id(), "42");
    let reply = single(send(&env, &handle, CANVAS_JOIN, json!({"roomId": "canvas:42"})).await);
    assert_eq!(reply.status, Status::Done);
}

#[tokio::test]
async fn membership_lookup_failure_is_retryable() {
    let env = test_env();
    let (handle, _rx) = connect(&env, "Ada");
    env.identities.set_unavailable(true);

    let reply = single(send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42"})).await);
    assert_eq!(reply.error_code(), Some("E_IDENTITY_LOOKUP"));
    assert_eq!(reply.data["retryable"], true);
}

#[tokio::test]
async fn canvas_join_rejects_spoofed_user() {
    let env = test_env();
    let (handle, _rx) = member(&env, "Ada", "42");
    let spoof = json!({"userId": uuid::Uuid::new_v4(), "displayName": "Mallory"});

    let reply = single(send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42", "user": spoof})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
}

#[tokio::test]
async fn first_joiner_gets_explicit_no_snapshot() {
    let env = test_env();
    let (handle, mut rx) = member(&env, "Ada", "42");

    let reply = single(send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42", "user": handle.identity.presence()})).await);
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data[KEY_RECOVERING], json!(true));

    let sync = recv(&mut rx).await;
    assert_eq!(sync.syscall, CANVAS_SYNC);
    assert_eq!(sync.data[KEY_CANVAS_DATA], Value::Null);
    assert_eq!(sync.parent_id.as_deref(), reply.parent_id.as_deref());
}

#[tokio::test]
async fn first_joiner_gets_durable_snapshot() {
    let env = test_env();
    env.snapshots.seed(&RoomId::canvas("42"), "data:image/png;base64,AAAA", 99);
    let (handle, mut rx) = member(&env, "Ada", "42");

    send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42"})).await;
    let sync = recv(&mut rx).await;
    assert_eq!(sync.data[KEY_CANVAS_DATA], "data:image/png;base64,AAAA");
    assert_eq!(sync.data["updatedAt"], 99);
}

#[tokio::test]
async fn snapshot_read_failure_reaches_joiner_as_error() {
    let env = test_env();
    env.snapshots.fail_reads(true);
    let (handle, mut rx) = member(&env, "Ada", "42");

    send(&env, &handle, CANVAS_JOIN, json!({"roomId": "42"})).await;
    let err = recv(&mut rx).await;
    assert_eq!(err.syscall, CANVAS_SYNC);
    assert_eq!(err.error_code(), Some("E_SNAPSHOT_UNAVAILABLE"));
}

#[tokio::test]
async fn later_joiner_triggers_presence_not_recovery() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;

    let reply = single(send(&env, &bob, CANVAS_JOIN, json!({"roomId": "42"})).await);
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data[KEY_RECOVERING], json!(false));

    let joined = recv(&mut rx_ada).await;
    assert_eq!(joined.syscall, CANVAS_USER_JOINED);
    assert_eq!(joined.data[KEY_USER]["displayName"], "Bob");
    assert_no_frame(&mut rx_bob).await;
}

#[tokio::test]
async fn heartbeat_join_is_not_acknowledged() {
    let env = test_env();
    let (ada, mut rx) = member(&env, "Ada", "42");
    join_canvas(&env, &ada, &mut rx).await;

    let replies = send(&env, &ada, CANVAS_JOIN, json!({"roomId": "42"})).await;
    assert!(replies.is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn active_users_lists_roster_with_capacity() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;

    let reply = single(send(&env, &bob, CANVAS_REQUEST_ACTIVE_USERS, json!({"roomId": "42"})).await);
    assert_eq!(reply.syscall, CANVAS_ACTIVE_USERS);
    assert_eq!(reply.status, Status::Request);
    let names: Vec<&str> = reply.data[KEY_USERS]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["displayName"].as_str())
        .collect();
    assert_eq!(names, vec!["Ada", "Bob"]);
    assert_eq!(reply.data[KEY_CAPACITY], 10);
}

#[tokio::test]
async fn active_users_requires_membership() {
    let env = test_env();
    let (ada, _rx) = member(&env, "Ada", "42");
    let reply = single(send(&env, &ada, CANVAS_REQUEST_ACTIVE_USERS, json!({"roomId": "42"})).await);
    assert_eq!(reply.error_code(), Some("E_NOT_JOINED"));
}

#[tokio::test]
async fn canvas_leave_notifies_peers() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    let reply = single(send(&env, &bob, CANVAS_LEAVE, json!({"roomId": "42", "userId": bob.user_id()})).await);
    assert_eq!(reply.status, Status::Done);
    let left = recv(&mut rx_ada).await;
    assert_eq!(left.syscall, CANVAS_USER_LEFT);
    assert_eq!(left.data[KEY_USER_ID], json!(bob.user_id()));
}

// =============================================================================
// CANVAS EVENTS
// =============================================================================

#[tokio::test]
async fn draw_reaches_all_members() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    let draw = json!({"roomId": "42", "type": "line", "x0": 0, "y0": 0, "x1": 10, "y1": 10, "color": "#000"});
    assert!(send(&env, &ada, CANVAS_DRAW, draw).await.is_empty());

    let got = recv(&mut rx_bob).await;
    assert_eq!(got.syscall, CANVAS_DRAW);
    assert_eq!(got.data["type"], "line");
    assert_eq!(got.data[KEY_ROOM_ID], "42");
    let echo = recv(&mut rx_ada).await;
    assert_eq!(echo.from.as_deref(), Some(ada.id.to_string().as_str()));
}

#[tokio::test]
async fn invalid_draw_is_rejected_to_sender_only() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    let reply = single(send(&env, &ada, CANVAS_DRAW, json!({"roomId": "42", "type": "rectangle", "x0": 1})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
    let reply = single(send(&env, &ada, CANVAS_DRAW, json!({"roomId": "42", "type": "spray"})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
    assert_no_frame(&mut rx_bob).await;
}

#[tokio::test]
async fn draw_without_join_is_not_joined() {
    let env = test_env();
    let (ada, _rx) = member(&env, "Ada", "42");
    let reply = single(send(&env, &ada, CANVAS_DRAW, json!({"roomId": "42", "type": "clear"})).await);
    assert_eq!(reply.error_code(), Some("E_NOT_JOINED"));
}

#[tokio::test]
async fn cursor_moves_skip_the_sender() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    let moved = json!({"roomId": "42", "userId": ada.user_id(), "position": {"x": 3.5, "y": 4.0}});
    assert!(send(&env, &ada, CANVAS_USER_MOVEMENT, moved).await.is_empty());

    let got = recv(&mut rx_bob).await;
    assert_eq!(got.syscall, CANVAS_USER_MOVEMENT);
    assert_eq!(got.data[KEY_POSITION]["x"], 3.5);
    assert_no_frame(&mut rx_ada).await;
}

#[tokio::test]
async fn cursor_before_join_is_dropped_quietly() {
    let env = test_env();
    let (ada, mut rx) = member(&env, "Ada", "42");
    let moved = json!({"roomId": "42", "position": {"x": 1, "y": 1}});
    assert!(send(&env, &ada, CANVAS_USER_MOVEMENT, moved).await.is_empty());
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn request_sync_with_peers_is_relayed() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    assert!(send(&env, &bob, CANVAS_REQUEST_SYNC, json!({"roomId": "42"})).await.is_empty());
    let asked = recv(&mut rx_ada).await;
    assert_eq!(asked.syscall, CANVAS_REQUEST_SYNC);
    assert_eq!(asked.from.as_deref(), Some(bob.id.to_string().as_str()));
}

#[tokio::test]
async fn lone_request_sync_falls_back_to_snapshot() {
    let env = test_env();
    let (ada, mut rx) = member(&env, "Ada", "42");
    join_canvas(&env, &ada, &mut rx).await;
    env.snapshots.seed(&RoomId::canvas("42"), "stored", 1);

    assert!(send(&env, &ada, CANVAS_REQUEST_SYNC, json!({"roomId": "42"})).await.is_empty());
    let sync = recv(&mut rx).await;
    assert_eq!(sync.syscall, CANVAS_SYNC);
    assert_eq!(sync.data[KEY_CANVAS_DATA], "stored");
}

#[tokio::test]
async fn provide_sync_is_relayed_and_stored() {
    let env = test_env();
    let (ada, mut rx_ada) = member(&env, "Ada", "42");
    let (bob, mut rx_bob) = member(&env, "Bob", "42");
    join_canvas(&env, &ada, &mut rx_ada).await;
    join_canvas(&env, &bob, &mut rx_bob).await;
    recv(&mut rx_ada).await;

    let provided = json!({"roomId": "42", "canvasData": "data:image/png;base64,BBBB"});
    assert!(send(&env, &ada, CANVAS_PROVIDE_SYNC, provided).await.is_empty());

    let sync = recv(&mut rx_bob).await;
    assert_eq!(sync.syscall, CANVAS_SYNC);
    assert_eq!(sync.data[KEY_CANVAS_DATA], "data:image/png;base64,BBBB");

    timeout(Duration::from_secs(2), async {
        while env.snapshots.stored(&RoomId::canvas("42")).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("provided raster was not stored");
}

#[tokio::test]
async fn save_snapshot_is_acknowledged_and_stored() {
    let env = test_env();
    let (ada, mut rx) = member(&env, "Ada", "42");
    join_canvas(&env, &ada, &mut rx).await;

    let reply = single(send(&env, &ada, CANVAS_SAVE_SNAPSHOT, json!({"roomId": "42", "canvasData": "v1"})).await);
    assert_eq!(reply.status, Status::Done);

    timeout(Duration::from_secs(2), async {
        while env.snapshots.stored(&RoomId::canvas("42")).as_deref() != Some("v1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("snapshot was not stored");
}

#[tokio::test]
async fn save_snapshot_requires_raster() {
    let env = test_env();
    let (ada, mut rx) = member(&env, "Ada", "42");
    join_canvas(&env, &ada, &mut rx).await;
    let reply = single(send(&env, &ada, CANVAS_SAVE_SNAPSHOT, json!({"roomId": "42", "canvasData": ""})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
}

// =============================================================================
// CHAT + COMMUNITY
// =============================================================================

#[tokio::test]
async fn chat_messages_fan_out_to_room() {
    let env = test_env();
    let (ada, mut rx_ada) = connect(&env, "Ada");
    let (bob, mut rx_bob) = connect(&env, "Bob");
    for h in [&ada, &bob] {
        let reply = single(send(&env, h, JOIN_ROOM, json!({"roomId": 7})).await);
        assert_eq!(reply.status, Status::Done);
    }

    let message = json!({"chatId": "7", "message": {"id": 1, "content": "hi"}});
    assert!(send(&env, &ada, NEW_MESSAGE, message).await.is_empty());

    let got = recv(&mut rx_bob).await;
    assert_eq!(got.syscall, NEW_MESSAGE);
    assert_eq!(got.room.as_deref(), Some("chat:7"));
    assert_eq!(got.data["message"]["content"], "hi");
    assert!(!got.data.contains_key("chatId"));
    assert_eq!(recv(&mut rx_ada).await.syscall, NEW_MESSAGE);
}

#[tokio::test]
async fn chat_message_outside_room_is_not_joined() {
    let env = test_env();
    let (ada, _rx) = connect(&env, "Ada");
    let reply = single(send(&env, &ada, NEW_MESSAGE, json!({"roomId": "7"})).await);
    assert_eq!(reply.error_code(), Some("E_NOT_JOINED"));
}

#[tokio::test]
async fn leave_room_stops_delivery() {
    let env = test_env();
    let (ada, _rx_ada) = connect(&env, "Ada");
    let (bob, mut rx_bob) = connect(&env, "Bob");
    send(&env, &ada, JOIN_ROOM, json!({"roomId": "7"})).await;
    send(&env, &bob, JOIN_ROOM, json!({"roomId": "7"})).await;

    let reply = single(send(&env, &bob, LEAVE_ROOM, json!({"roomId": "7"})).await);
    assert_eq!(reply.status, Status::Done);
    send(&env, &ada, NEW_MESSAGE, json!({"roomId": "7"})).await;
    assert_no_frame(&mut rx_bob).await;
}

#[tokio::test]
async fn community_join_uses_same_membership_check() {
    let env = test_env();
    let (ada, _rx) = connect(&env, "Ada");

    let reply = single(send(&env, &ada, JOIN_COMMUNITY, json!({"communityId": "42"})).await);
    assert_eq!(reply.error_code(), Some("E_FORBIDDEN"));

    env.identities.grant(ada.user_id(), "42");
    let reply = single(send(&env, &ada, JOIN_COMMUNITY, json!({"communityId": "42"})).await);
    assert_eq!(reply.status, Status::Done);
    assert!(env.state.relay.is_member(&ada, &RoomId::community("42")).unwrap());

    let reply = single(send(&env, &ada, LEAVE_COMMUNITY, json!({"communityId": "42"})).await);
    assert_eq!(reply.status, Status::Done);
}

#[tokio::test]
async fn missing_room_id_is_bad_payload() {
    let env = test_env();
    let (ada, _rx) = connect(&env, "Ada");
    let reply = single(send(&env, &ada, JOIN_ROOM, json!({})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
    let reply = single(send(&env, &ada, JOIN_ROOM, json!({"roomId": "canvas:1"})).await);
    assert_eq!(reply.error_code(), Some("E_BAD_PAYLOAD"));
}

#[tokio::test]
async fn requests_after_disconnect_get_no_reply() {
    let env = test_env();
    let (ada, _rx) = connect(&env, "Ada");
    env.state.relay.disconnect(&ada);

    assert!(send(&env, &ada, JOIN_ROOM, json!({"roomId": "7"})).await.is_empty());
}

// =============================================================================
// END TO END
// =============================================================================

mod live {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::routes::app(state)).await.unwrap();
        });
        addr
    }

    async fn next_frame(ws: &mut Client) -> Frame {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("socket read timed out")
                .expect("socket closed")
                .expect("socket error");
            match msg {
                WsMessage::Text(text) => return decode_json(text.as_str()).unwrap(),
                WsMessage::Binary(bytes) => return decode_frame(&bytes).unwrap(),
                _ => {}
            }
        }
    }

    /// Read frames until one with `syscall` arrives.
    async fn expect_event(ws: &mut Client, syscall: &str) -> Frame {
        for _ in 0..8 {
            let frame = next_frame(ws).await;
            if frame.syscall == syscall && frame.status == Status::Request {
                return frame;
            }
        }
        panic!("no {syscall} frame arrived");
    }

    async fn send_json(ws: &mut Client, syscall: &str, data: Value) {
        let frame = Frame::request(syscall, obj(data));
        ws.send(WsMessage::text(encode_json(&frame))).await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_without_credential_is_401() {
        let env = test_env();
        let addr = serve(env.state.clone()).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
            other => panic!("expected http rejection, got {other:?}"),
        }
        assert_eq!(env.state.relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn upgrade_with_unknown_credential_is_401() {
        let env = test_env();
        let addr = serve(env.state.clone()).await;
        let token = "a".repeat(64);

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?token={token}"))
            .await
            .unwrap_err();
        assert!(matches!(err, tungstenite::Error::Http(resp) if resp.status() == 401));
    }

    #[tokio::test]
    async fn binary_encoding_is_negotiated_per_connection() {
        let env = test_env();
        let who = identity("Ada");
        let token = env.identities.issue(&who);
        let addr = serve(env.state.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?token={token}&encoding=binary"))
            .await
            .unwrap();
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        let bytes = match msg {
            WsMessage::Binary(bytes) => bytes,
            other => panic!("expected binary welcome, got {other:?}"),
        };
        let welcome = decode_frame(&bytes).unwrap();
        assert_eq!(welcome.syscall, SESSION_CONNECTED);
        assert_eq!(welcome.str_field("displayName"), Some("Ada"));
    }

    #[tokio::test]
    async fn presence_flows_between_two_sockets() {
        let env = test_env();
        let (ada, bob) = (identity("Ada"), identity("Bob"));
        env.identities.grant(ada.user_id, "42");
        env.identities.grant(bob.user_id, "42");
        let (ada_token, bob_token) = (env.identities.issue(&ada), env.identities.issue(&bob));
        let addr = serve(env.state.clone()).await;

        let (mut ws_ada, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?token={ada_token}"))
            .await
            .unwrap();
        let welcome = expect_event(&mut ws_ada, SESSION_CONNECTED).await;
        assert_eq!(welcome.str_field(KEY_USER_ID), Some(ada.user_id.to_string().as_str()));

        send_json(&mut ws_ada, CANVAS_JOIN, json!({"roomId": "42"})).await;
        let sync = expect_event(&mut ws_ada, CANVAS_SYNC).await;
        assert_eq!(sync.data[KEY_CANVAS_DATA], Value::Null);

        let (mut ws_bob, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?token={bob_token}"))
            .await
            .unwrap();
        expect_event(&mut ws_bob, SESSION_CONNECTED).await;
        send_json(&mut ws_bob, CANVAS_JOIN, json!({"roomId": "42"})).await;

        let joined = expect_event(&mut ws_ada, CANVAS_USER_JOINED).await;
        assert_eq!(joined.data[KEY_USER]["displayName"], "Bob");

        ws_bob.close(None).await.unwrap();
        let left = expect_event(&mut ws_ada, CANVAS_USER_LEFT).await;
        assert_eq!(left.data[KEY_USER_ID], json!(bob.user_id));
    }
}
