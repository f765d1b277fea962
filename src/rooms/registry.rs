//! Registry of named rooms, each running its own match loop

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GameSettings;
use crate::game::r#match::MatchServices;
use crate::game::{GameMatch, RoomCommand, RoomHandle};
use crate::ws::protocol::{RoomSummary, ServerMsg};

/// Longest accepted room name, in characters
pub const MAX_ROOM_NAME_LEN: usize = 32;

/// Room registry errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room name already exists: {0}")]
    DuplicateName(String),

    #[error("Room not found: {0}")]
    NotFound(String),

    #[error("Room name must be 1 to 32 characters")]
    InvalidName,

    #[error("Room is shutting down: {0}")]
    Closed(String),
}

/// Concurrent name -> room map
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    settings: GameSettings,
    services: MatchServices,
    /// Lobby `room_updated` fan-out
    updates: broadcast::Sender<ServerMsg>,
}

impl RoomRegistry {
    pub fn new(settings: GameSettings, services: MatchServices) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            rooms: DashMap::new(),
            settings,
            services,
            updates,
        }
    }

    /// Trim and check a requested room name
    pub fn validate_name(name: &str) -> Result<String, RoomError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(RoomError::InvalidName);
        }
        Ok(name.to_string())
    }

    /// Create a room and start its loop. The first creator of a name wins.
    pub fn create_room(
        self: &Arc<Self>,
        name: &str,
        host: Option<String>,
    ) -> Result<RoomHandle, RoomError> {
        let name = Self::validate_name(name)?;

        let handle = match self.rooms.entry(name.clone()) {
            Entry::Occupied(_) => return Err(RoomError::DuplicateName(name)),
            Entry::Vacant(entry) => {
                let (game_match, handle) = GameMatch::new(
                    name.clone(),
                    host,
                    rand::random(),
                    self.settings.clone(),
                    self.services.clone(),
                );
                entry.insert(handle.clone());

                let registry = Arc::clone(self);
                let room_id = handle.id;
                let room_name = name.clone();
                tokio::spawn(async move {
                    game_match.run().await;
                    registry.remove_room(&room_name, room_id);
                });
                handle
            }
        };

        info!(room = %name, room_id = %handle.id, host = ?handle.host, "Room created");
        self.services.room_changed.notify_one();
        Ok(handle)
    }

    /// Existing room, or a new one for the direct `join` path
    pub fn get_or_create(
        self: &Arc<Self>,
        name: &str,
        host: Option<String>,
    ) -> Result<RoomHandle, RoomError> {
        let name = Self::validate_name(name)?;
        match self.get_room(&name) {
            Ok(handle) if !handle.is_closed() => return Ok(handle),
            // Loop already gone, entry not yet cleaned up
            Ok(stale) => self.remove_room(&name, stale.id),
            Err(_) => {}
        }
        match self.create_room(&name, host) {
            // Lost a creation race; the winner's room is fine
            Err(RoomError::DuplicateName(_)) => self.get_room(&name),
            other => other,
        }
    }

    pub fn get_room(&self, name: &str) -> Result<RoomHandle, RoomError> {
        self.rooms
            .get(name.trim())
            .map(|r| r.value().clone())
            .ok_or_else(|| RoomError::NotFound(name.to_string()))
    }

    /// Lobby view, oldest room first
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self.rooms.iter().map(|r| r.value().summary()).collect();
        rooms.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.room_name.cmp(&b.room_name))
        });
        rooms
    }

    /// Drop the entry for a room whose loop ended. A newer room that reused
    /// the name is left alone.
    pub fn remove_room(&self, name: &str, room_id: Uuid) {
        if self.rooms.remove_if(name, |_, h| h.id == room_id).is_some() {
            info!(room = %name, room_id = %room_id, "Room removed");
            self.services.room_changed.notify_one();
        }
    }

    /// Ask a room to shut down; its entry disappears once the loop exits
    pub async fn close_room(&self, name: &str) -> Result<(), RoomError> {
        let handle = self.get_room(name)?;
        handle.send(Uuid::nil(), RoomCommand::Close).await?;
        debug!(room = %handle.name, "Close requested");
        Ok(())
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn seated_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }

    /// Receive `room_updated` messages
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMsg> {
        self.updates.subscribe()
    }

    /// Current lobby message
    pub fn room_list_msg(&self) -> ServerMsg {
        ServerMsg::RoomUpdated {
            rooms: self.list_rooms(),
        }
    }

    /// Push the room list to lobby subscribers whenever a room changes
    pub async fn run_publisher(self: Arc<Self>) {
        loop {
            self.services.room_changed.notified().await;
            // Nobody listening is fine
            let _ = self.updates.send(self.room_list_msg());
        }
    }
}
