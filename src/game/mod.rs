//! Game simulation modules

pub mod r#match;
pub mod physics;
pub mod reconcile;
pub mod skills;
pub mod snapshot;

pub use r#match::{GameMatch, MatchRecord, RoomHandle};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ws::protocol::ServerMsg;

use r#match::JoinError;
use reconcile::PaddleIntent;
use skills::SkillId;

/// One of the two seats. On the wire the game client calls the top seat
/// `left` and the bottom seat `right`; both spellings are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "left", alias = "top")]
    Top,
    #[serde(rename = "right", alias = "bottom")]
    Bottom,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Top, Side::Bottom];

    pub fn opponent(self) -> Side {
        match self {
            Side::Top => Side::Bottom,
            Side::Bottom => Side::Top,
        }
    }

    /// Direction the seat's paddle faces along the y axis
    pub fn facing(self) -> f32 {
        match self {
            Side::Top => 1.0,
            Side::Bottom => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Top => write!(f, "top"),
            Side::Bottom => write!(f, "bottom"),
        }
    }
}

/// A value per seat, serialized as `{"top": .., "bottom": ..}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerSide<T> {
    pub top: T,
    pub bottom: T,
}

impl<T> PerSide<T> {
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Top => &self.top,
            Side::Bottom => &self.bottom,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Top => &mut self.top,
            Side::Bottom => &mut self.bottom,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Side, &T) -> U) -> PerSide<U> {
        PerSide {
            top: f(Side::Top, &self.top),
            bottom: f(Side::Bottom, &self.bottom),
        }
    }
}

/// Outcome of pushing a message to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Outbound queue full, message dropped
    Dropped,
    /// Receiver gone
    Closed,
}

/// Outbound side of one WebSocket connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    tx: mpsc::Sender<ServerMsg>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, tx: mpsc::Sender<ServerMsg>) -> Self {
        Self { id, tx }
    }

    /// Queue a message without waiting; a backed-up client loses it
    pub fn deliver(&self, msg: ServerMsg) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// The client side of the connection is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// How a seat was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// From the loading screen; readiness is toggled explicitly
    Loading,
    /// From the game screen; the seat counts as ready
    Direct,
}

/// Commands funneled into a room's loop
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        connection: ConnectionHandle,
        username: String,
        /// Username comes from a verified token
        verified: bool,
        loadout: Vec<SkillId>,
        mode: JoinMode,
        reply: oneshot::Sender<Result<Side, JoinError>>,
    },
    /// Keep-alive from a seated client
    Heartbeat,
    ToggleReady,
    Paddle(PaddleIntent),
    ActivateSkill(SkillId),
    SelectSkill(SkillId),
    Leave,
    Close,
}

/// Input received from a connection, addressed to one room
#[derive(Debug)]
pub struct RoomInput {
    pub conn_id: Uuid,
    pub cmd: RoomCommand,
}
