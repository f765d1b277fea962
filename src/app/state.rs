//! Application state shared across routes

use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::config::Config;
use crate::game::r#match::MatchServices;
use crate::game::skills::SkillCatalog;
use crate::game::MatchRecord;
use crate::rooms::RoomRegistry;
use crate::store::{AccountsClient, MatchStore, SkillStore};

/// Finished matches waiting for the persistence worker
const RESULTS_CAPACITY: usize = 64;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub skill_store: SkillStore,
    pub match_store: MatchStore,
}

impl AppState {
    /// Build the state. The returned receiver carries finished matches and
    /// belongs to [`MatchStore::run`].
    pub fn new(config: Config) -> (Self, mpsc::Receiver<MatchRecord>) {
        let config = Arc::new(config);
        let catalog = Arc::new(SkillCatalog::builtin());
        info!(skills = catalog.len(), "Skill catalog loaded");

        let accounts = AccountsClient::new(&config);
        let skill_store = SkillStore::new(accounts.clone(), catalog.clone());
        let match_store = MatchStore::new(accounts);

        let (results, results_rx) = mpsc::channel(RESULTS_CAPACITY);
        let services = MatchServices {
            catalog,
            results,
            room_changed: Arc::new(Notify::new()),
        };
        let registry = Arc::new(RoomRegistry::new(config.game.clone(), services));

        let state = Self {
            config,
            registry,
            skill_store,
            match_store,
        };
        (state, results_rx)
    }
}
