//! Protocol event names.
//!
//! Inbound events are sent by clients; outbound events are emitted by the
//! relay. A few names travel both ways (`canvas:draw`, `canvas:userMovement`,
//! the chat events).

// =============================================================================
// SESSION
// =============================================================================

/// Sent once to a freshly admitted connection.
pub const SESSION_CONNECTED: &str = "session:connected";
/// Sent for frames that could not be decoded at all.
pub const GATEWAY_ERROR: &str = "gateway:error";

// =============================================================================
// MEMBERSHIP
// =============================================================================

pub const JOIN_ROOM: &str = "joinRoom";
pub const LEAVE_ROOM: &str = "leaveRoom";
pub const JOIN_COMMUNITY: &str = "join:community";
pub const LEAVE_COMMUNITY: &str = "leave:community";

// =============================================================================
// CHAT
// =============================================================================

pub const NEW_MESSAGE: &str = "newMessage";
pub const MESSAGE_UPDATED: &str = "messageUpdated";
pub const MESSAGE_DELETED: &str = "messageDeleted";

// =============================================================================
// CANVAS
// =============================================================================

pub const CANVAS_JOIN: &str = "canvas:join";
pub const CANVAS_LEAVE: &str = "canvas:leave";
pub const CANVAS_REQUEST_ACTIVE_USERS: &str = "canvas:requestActiveUsers";
pub const CANVAS_ACTIVE_USERS: &str = "canvas:activeUsers";
pub const CANVAS_USER_JOINED: &str = "canvas:userJoined";
pub const CANVAS_USER_LEFT: &str = "canvas:userLeft";
pub const CANVAS_USER_MOVEMENT: &str = "canvas:userMovement";
pub const CANVAS_DRAW: &str = "canvas:draw";
pub const CANVAS_REQUEST_SYNC: &str = "canvas:requestSync";
pub const CANVAS_PROVIDE_SYNC: &str = "canvas:provideSync";
pub const CANVAS_SYNC: &str = "canvas:sync";
pub const CANVAS_SAVE_SNAPSHOT: &str = "canvas:saveSnapshot";

// =============================================================================
// PAYLOAD KEYS
// =============================================================================

pub const KEY_ROOM_ID: &str = "roomId";
pub const KEY_COMMUNITY_ID: &str = "communityId";
pub const KEY_USER_ID: &str = "userId";
pub const KEY_USER: &str = "user";
pub const KEY_USERS: &str = "users";
pub const KEY_POSITION: &str = "position";
pub const KEY_CANVAS_DATA: &str = "canvasData";
pub const KEY_UPDATED_AT: &str = "updatedAt";
pub const KEY_CAPACITY: &str = "capacity";
pub const KEY_HANDLE_ID: &str = "handleId";
/// On the `done` for a first `canvas:join`: a `canvas:sync` recovery follows.
pub const KEY_RECOVERING: &str = "recovering";
