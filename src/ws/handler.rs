//! WebSocket upgrade handler and per-connection session

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::reconcile::PaddleIntent;
use crate::game::{ConnectionHandle, JoinMode, RoomCommand, RoomHandle};
use crate::http::middleware::AuthenticatedUser;
use crate::rooms::RoomError;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Messages queued for one client before new ones are dropped
pub const OUTBOUND_CAPACITY: usize = 64;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: Option<Extension<AuthenticatedUser>>,
) -> Response {
    let verified = auth.map(|Extension(user)| {
        debug!(username = %user.username, user_id = ?user.claims.id, "Authenticated upgrade");
        user.username
    });
    ws.on_upgrade(move |socket| handle_socket(socket, state, verified))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, verified: Option<String>) {
    let conn_id = Uuid::new_v4();
    info!(%conn_id, username = ?verified, "New WebSocket connection");

    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let lobby_rx = state.registry.subscribe();

    let writer = tokio::spawn(write_loop(conn_id, ws_sink, out_rx, lobby_rx));

    let mut session = Session::new(conn_id, state, ConnectionHandle::new(conn_id, out_tx), verified);
    session.send(session.state.registry.room_list_msg());

    // Reader loop: WebSocket -> session
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !session.limiter.check_input() {
                    debug!(%conn_id, "Rate limited input message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => {
                        tracing::trace!(%conn_id, room = ?msg.room_name(), ?msg, "Client message");
                        session.dispatch(msg).await;
                    }
                    Err(e) => {
                        debug!(%conn_id, error = %e, "Failed to parse client message");
                        session.send(ServerMsg::error("bad_message", e.to_string()));
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(%conn_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(%conn_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(%conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.leave_current().await;
    writer.abort();

    info!(%conn_id, "WebSocket connection closed");
}

/// Forward room messages and lobby updates to the socket
async fn write_loop(
    conn_id: Uuid,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMsg>,
    mut lobby: broadcast::Receiver<ServerMsg>,
) {
    loop {
        let msg = tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            update = lobby.recv() => match update {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(%conn_id, skipped = n, "Lobby updates lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(%conn_id, error = %e, "WebSocket send failed");
            break;
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

/// What one connection is doing
struct Session {
    conn_id: Uuid,
    state: AppState,
    connection: ConnectionHandle,
    /// Username from a verified token; wins over payload usernames
    verified: Option<String>,
    /// Last username the client claimed
    claimed: Option<String>,
    /// Room this connection is seated in
    seat: Option<RoomHandle>,
    limiter: ConnectionRateLimiter,
}

impl Session {
    fn new(
        conn_id: Uuid,
        state: AppState,
        connection: ConnectionHandle,
        verified: Option<String>,
    ) -> Self {
        Self {
            conn_id,
            state,
            connection,
            verified,
            claimed: None,
            seat: None,
            limiter: ConnectionRateLimiter::new(),
        }
    }

    fn send(&self, msg: ServerMsg) {
        self.connection.deliver(msg);
    }

    fn resolve_username(&mut self, claimed: Option<String>) -> String {
        if let Some(verified) = &self.verified {
            return verified.clone();
        }
        if let Some(name) = claimed.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            self.claimed = Some(name);
        }
        self.claimed
            .clone()
            .unwrap_or_else(|| format!("guest-{}", &self.conn_id.simple().to_string()[..8]))
    }

    async fn dispatch(&mut self, msg: ClientMsg) {
        match msg {
            ClientMsg::Join { room, username } => {
                let username = self.resolve_username(username);
                let mut result = self.join_direct(&room, &username).await;
                if let Err(RoomError::Closed(_)) = result {
                    debug!(conn_id = %self.conn_id, %room, "Room closed during join, retrying");
                    result = self.join_direct(&room, &username).await;
                }
                if let Err(err) = result {
                    self.send(ServerMsg::Joined {
                        side: None,
                        error: Some(err.to_string()),
                    });
                }
            }
            ClientMsg::JoinLoading {
                room_name,
                username,
            } => {
                let username = self.resolve_username(username);
                let result = match self.state.registry.get_room(&room_name) {
                    Ok(handle) => self.take_seat(handle, username, JoinMode::Loading).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    self.send(ServerMsg::JoinLoadingFail {
                        error: err.to_string(),
                    });
                }
            }
            ClientMsg::JoinLoadingReadyToggle { room_name, .. } => {
                self.to_room(Some(&room_name), RoomCommand::ToggleReady).await;
            }
            ClientMsg::LeaveLoading { room_name } => {
                let matches = match (&self.seat, room_name.as_deref()) {
                    (Some(seat), Some(name)) => seat.name == name.trim(),
                    (seat, _) => seat.is_some(),
                };
                if matches {
                    self.leave_current().await;
                }
            }
            ClientMsg::PaddleMove { room, dx, dy, .. } => {
                let intent = PaddleIntent::Delta { dx, dy };
                self.to_room(room.as_deref(), RoomCommand::Paddle(intent)).await;
            }
            ClientMsg::PaddlePosition { room, x, y, .. } => {
                let intent = PaddleIntent::Position { x, y };
                self.to_room(room.as_deref(), RoomCommand::Paddle(intent)).await;
            }
            ClientMsg::ActivateSkill { room, skill_id, .. } => {
                self.to_room(room.as_deref(), RoomCommand::ActivateSkill(skill_id))
                    .await;
            }
            ClientMsg::SetSelectedSkill { room, skill_id, .. } => {
                self.to_room(room.as_deref(), RoomCommand::SelectSkill(skill_id))
                    .await;
            }
            ClientMsg::RoomCreate {
                room_name,
                username,
            } => {
                if !self.limiter.check_room_create() {
                    self.send(ServerMsg::RoomCreateFailed {
                        error: "Too many room requests".to_string(),
                    });
                    return;
                }
                let host = self.resolve_username(username);
                // Success reaches every lobby through `room_updated`
                if let Err(err) = self.state.registry.create_room(&room_name, Some(host)) {
                    self.send(ServerMsg::RoomCreateFailed {
                        error: err.to_string(),
                    });
                }
            }
            ClientMsg::RoomList {} => self.send(self.state.registry.room_list_msg()),
            ClientMsg::Ping { t } => {
                self.send(ServerMsg::Pong { t });
                if self.seat.is_some() {
                    self.to_room(None, RoomCommand::Heartbeat).await;
                }
            }
        }
    }

    /// Direct `join`: the room is created when missing
    async fn join_direct(&mut self, room: &str, username: &str) -> Result<(), RoomError> {
        let handle = self
            .state
            .registry
            .get_or_create(room, Some(username.to_string()))?;
        let (name, room_id) = (handle.name.clone(), handle.id);
        let result = self.take_seat(handle, username.to_string(), JoinMode::Direct).await;
        if let Err(RoomError::Closed(_)) = result {
            self.state.registry.remove_room(&name, room_id);
        }
        result
    }

    /// Seat this connection in a room, leaving any other room first. A full
    /// room has already told the client, so the session simply stays
    /// unseated.
    async fn take_seat(
        &mut self,
        handle: RoomHandle,
        username: String,
        mode: JoinMode,
    ) -> Result<(), RoomError> {
        if self.seat.as_ref().is_some_and(|seat| seat.id != handle.id) {
            self.leave_current().await;
        }

        let loadout = self.state.skill_store.loadout_for(&username).await;
        let (reply, joined) = oneshot::channel();
        let cmd = RoomCommand::Join {
            connection: self.connection.clone(),
            username,
            verified: self.verified.is_some(),
            loadout,
            mode,
            reply,
        };
        handle.send(self.conn_id, cmd).await?;

        match joined.await {
            Ok(Ok(side)) => {
                debug!(conn_id = %self.conn_id, room = %handle.name, %side, "Seated");
                self.seat = Some(handle);
            }
            Ok(Err(err)) => {
                debug!(conn_id = %self.conn_id, room = %handle.name, error = %err, "Seat refused");
            }
            Err(_) => return Err(RoomError::Closed(handle.name.clone())),
        }
        Ok(())
    }

    /// Forward a command to the seated room. Commands naming another room
    /// are dropped.
    async fn to_room(&mut self, room_name: Option<&str>, cmd: RoomCommand) {
        let Some(seat) = &self.seat else {
            debug!(conn_id = %self.conn_id, ?cmd, "Command without a seat");
            return;
        };
        if room_name.is_some_and(|name| name.trim() != seat.name) {
            debug!(conn_id = %self.conn_id, room = ?room_name, "Command for another room ignored");
            return;
        }
        if let Err(err) = seat.send(self.conn_id, cmd).await {
            debug!(conn_id = %self.conn_id, error = %err, "Room gone, dropping seat");
            self.seat = None;
        }
    }

    async fn leave_current(&mut self) {
        if let Some(seat) = self.seat.take() {
            debug!(conn_id = %self.conn_id, room = %seat.name, "Leaving room");
            // A room that already closed has nothing to clean up
            let _ = seat.send(self.conn_id, RoomCommand::Leave).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::Config;
    use crate::game::Side;

    fn session(verified: Option<&str>) -> (Session, mpsc::Receiver<ServerMsg>) {
        let (state, _results) = AppState::new(Config::for_tests());
        session_in(&state, verified)
    }

    fn session_in(state: &AppState, verified: Option<&str>) -> (Session, mpsc::Receiver<ServerMsg>) {
        let state = state.clone();
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Session::new(
            conn_id,
            state,
            ConnectionHandle::new(conn_id, tx),
            verified.map(str::to_string),
        );
        (session, rx)
    }

    /// Next message matching the predicate, skipping snapshots and the like
    async fn expect<F>(rx: &mut mpsc::Receiver<ServerMsg>, mut pred: F) -> ServerMsg
    where
        F: FnMut(&ServerMsg) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let msg = rx.recv().await.expect("outbound channel closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    #[test]
    fn verified_username_wins() {
        let (mut verified, _rx) = session(Some("alice"));
        assert_eq!(verified.resolve_username(Some("mallory".into())), "alice");

        let (mut anonymous, _rx) = session(None);
        assert!(anonymous.resolve_username(None).starts_with("guest-"));
        assert_eq!(anonymous.resolve_username(Some(" bob ".into())), "bob");
        assert_eq!(anonymous.resolve_username(None), "bob");
    }

    #[tokio::test]
    async fn direct_join_creates_room_and_seats_player() {
        let (mut session, mut rx) = session(None);
        session
            .dispatch(ClientMsg::Join {
                room: "direct".into(),
                username: Some("alice".into()),
            })
            .await;

        let joined = expect(&mut rx, |m| matches!(m, ServerMsg::Joined { .. })).await;
        assert!(matches!(
            joined,
            ServerMsg::Joined { side: Some(Side::Top), error: None }
        ));
        expect(&mut rx, |m| matches!(m, ServerMsg::State(_))).await;
        assert_eq!(session.seat.as_ref().map(|s| s.name.as_str()), Some("direct"));
    }

    #[tokio::test]
    async fn loading_join_requires_existing_room() {
        let (mut session, mut rx) = session(None);
        session
            .dispatch(ClientMsg::JoinLoading {
                room_name: "missing".into(),
                username: Some("alice".into()),
            })
            .await;
        expect(&mut rx, |m| matches!(m, ServerMsg::JoinLoadingFail { .. })).await;
        assert!(session.seat.is_none());
    }

    #[tokio::test]
    async fn duplicate_room_create_is_reported() {
        let (mut session, mut rx) = session(None);
        let create = || ClientMsg::RoomCreate {
            room_name: "dup".into(),
            username: Some("alice".into()),
        };
        session.dispatch(create()).await;
        session.dispatch(create()).await;
        let failed = expect(&mut rx, |m| matches!(m, ServerMsg::RoomCreateFailed { .. })).await;
        match failed {
            ServerMsg::RoomCreateFailed { error } => assert!(error.contains("dup")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (mut session, mut rx) = session(None);
        session.dispatch(ClientMsg::Ping { t: 77 }).await;
        let pong = expect(&mut rx, |m| matches!(m, ServerMsg::Pong { .. })).await;
        assert!(matches!(pong, ServerMsg::Pong { t: 77 }));
    }

    #[tokio::test]
    async fn commands_for_other_rooms_are_dropped() {
        let (mut session, _rx) = session(None);
        session
            .dispatch(ClientMsg::Join {
                room: "mine".into(),
                username: None,
            })
            .await;
        session
            .dispatch(ClientMsg::PaddleMove {
                room: Some("theirs".into()),
                side: None,
                dx: 5.0,
                dy: 0.0,
            })
            .await;
        assert!(session.seat.is_some());

        session
            .dispatch(ClientMsg::LeaveLoading {
                room_name: Some("mine".into()),
            })
            .await;
        assert!(session.seat.is_none());
    }

    #[tokio::test]
    async fn shared_default_name_fills_both_seats() {
        let (state, _results) = AppState::new(Config::for_tests());
        let join = || ClientMsg::Join {
            room: "shared".into(),
            username: Some("player1".into()),
        };

        let (mut first, mut first_rx) = session_in(&state, None);
        let (mut second, mut second_rx) = session_in(&state, None);
        first.dispatch(join()).await;
        second.dispatch(join()).await;

        let seated = |m: &ServerMsg| matches!(m, ServerMsg::Joined { .. });
        assert!(matches!(
            expect(&mut first_rx, seated).await,
            ServerMsg::Joined { side: Some(Side::Top), .. }
        ));
        assert!(matches!(
            expect(&mut second_rx, seated).await,
            ServerMsg::Joined { side: Some(Side::Bottom), .. }
        ));
        expect(&mut first_rx, |m| matches!(m, ServerMsg::GameStartReady { .. })).await;
        assert!(first.seat.is_some() && second.seat.is_some());
    }

    #[tokio::test]
    async fn refused_join_leaves_session_unseated() {
        let (state, _results) = AppState::new(Config::for_tests());
        let join = |name: &str| ClientMsg::Join {
            room: "crowded".into(),
            username: Some(name.into()),
        };

        let (mut alice, _alice_rx) = session_in(&state, None);
        let (mut bob, _bob_rx) = session_in(&state, None);
        let (mut carol, mut carol_rx) = session_in(&state, None);
        alice.dispatch(join("alice")).await;
        bob.dispatch(join("bob")).await;
        carol.dispatch(join("carol")).await;

        let refused = expect(&mut carol_rx, |m| matches!(m, ServerMsg::Joined { .. })).await;
        assert!(matches!(refused, ServerMsg::Joined { side: None, error: Some(_) }));
        assert!(carol.seat.is_none());
        assert!(alice.seat.is_some() && bob.seat.is_some());
    }
}
