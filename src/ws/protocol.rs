//! WebSocket protocol message definitions
//! These are the wire types for client-server communication. Every frame is
//! a JSON object `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::game::physics::Vec2;
use crate::game::skills::{SkillId, SkillKind};
use crate::game::{PerSide, Side};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Take a seat directly from the game screen (marks the seat ready)
    Join {
        #[serde(default = "default_room")]
        room: String,
        #[serde(default)]
        username: Option<String>,
    },

    /// Relative paddle movement
    PaddleMove {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        side: Option<Side>,
        #[serde(default)]
        dx: f32,
        #[serde(default)]
        dy: f32,
    },

    /// Absolute paddle position
    PaddlePosition {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        side: Option<Side>,
        x: f32,
        y: f32,
    },

    /// Use a skill
    ActivateSkill {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        side: Option<Side>,
        #[serde(alias = "skill_number")]
        skill_id: SkillId,
    },

    /// Pick the skill bound to the activation key (0 clears)
    SetSelectedSkill {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        side: Option<Side>,
        #[serde(default, alias = "skill_number")]
        skill_id: SkillId,
    },

    /// Take a seat on the pre-game loading screen
    JoinLoading {
        room_name: String,
        #[serde(default)]
        username: Option<String>,
    },

    /// Flip readiness on the loading screen
    JoinLoadingReadyToggle {
        room_name: String,
        #[serde(default)]
        side: Option<Side>,
    },

    /// Leave the loading screen (and the seat)
    LeaveLoading {
        #[serde(default)]
        room_name: Option<String>,
    },

    /// Create a named room
    RoomCreate {
        room_name: String,
        #[serde(default)]
        username: Option<String>,
    },

    /// Ask for the current room list
    RoomList {},

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

fn default_room() -> String {
    "default".to_string()
}

impl ClientMsg {
    /// Room named by the payload, when the event carries one
    pub fn room_name(&self) -> Option<&str> {
        match self {
            ClientMsg::Join { room, .. } => Some(room),
            ClientMsg::PaddleMove { room, .. }
            | ClientMsg::PaddlePosition { room, .. }
            | ClientMsg::ActivateSkill { room, .. }
            | ClientMsg::SetSelectedSkill { room, .. } => room.as_deref(),
            ClientMsg::JoinLoading { room_name, .. }
            | ClientMsg::JoinLoadingReadyToggle { room_name, .. }
            | ClientMsg::RoomCreate { room_name, .. } => Some(room_name),
            ClientMsg::LeaveLoading { room_name } => room_name.as_deref(),
            ClientMsg::RoomList {} | ClientMsg::Ping { .. } => None,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Result of a direct `join`; `side` is null when the room is full
    Joined {
        side: Option<Side>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Authoritative snapshot
    State(StateSnapshot),

    /// Puck touched a paddle
    Bounce {},

    /// A goal was scored
    Goal {
        scorer: Side,
        scores: PerSide<u32>,
    },

    /// A skill was accepted for a side
    SkillActivated {
        side: Side,
        skill_id: SkillId,
    },

    /// Puck is in play
    GameReady {},

    /// Both players are ready, countdown running
    GameStartReady {
        room_name: String,
    },

    /// The other seat was vacated
    OpponentDisconnected {},

    /// Loading-screen seat granted (sent to the whole room)
    JoinLoadingSuccess(LoadingRoomState),

    /// Loading-screen seat refused
    JoinLoadingFail {
        error: String,
    },

    /// Readiness flipped
    JoinLoadingReadyToggleSuccess {
        room_name: String,
        side: Side,
        ready: bool,
    },

    /// Loading-screen state after someone left
    LoadingRoomUpdated(LoadingRoomState),

    /// Lobby room list
    RoomUpdated {
        rooms: Vec<RoomSummary>,
    },

    /// Room creation refused
    RoomCreateFailed {
        error: String,
    },

    /// Match finished
    MatchEnd {
        winner: Side,
        winner_username: String,
        scores: PerSide<u32>,
        duration_secs: u32,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// The `state` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub ball: Vec2,
    pub paddles: PerSide<Vec2>,
    pub scores: PerSide<u32>,
    pub skills: PerSide<SkillSnapshot>,
    pub goal_width_ratio: PerSide<f32>,
}

/// Skill state of one side in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSnapshot {
    /// Engaged skill id, 0 when none
    pub active: SkillId,
    /// Skill bound to the activation key, 0 when none
    pub selected: SkillId,
    pub available: Vec<AvailableSkill>,
}

/// One unlocked skill as shown to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableSkill {
    pub id: SkillId,
    pub name: String,
    pub icon: String,
    #[serde(flatten)]
    pub kind: SkillKind,
    /// Seconds until the skill can be used again
    pub cooldown_remaining: f32,
}

/// Loading-screen view of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingRoomState {
    pub room_name: String,
    pub left_username: String,
    pub right_username: String,
    /// Side of the player the event concerns
    pub side: Option<Side>,
    pub left_user_skills: Vec<SkillId>,
    pub right_user_skills: Vec<SkillId>,
    pub left_ready: bool,
    pub right_ready: bool,
}

/// Lobby entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_name: String,
    pub created_at: DateTime<Utc>,
    pub is_playing: bool,
    pub current_players: usize,
    pub host: Option<String>,
}
