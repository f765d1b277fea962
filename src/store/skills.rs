//! Skill loadouts from the accounts service

use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::game::skills::{SkillCatalog, SkillId, DEFAULT_LOADOUT};

use super::client::{AccountsClient, StoreError};

/// Body of `GET /api/user/skills`
#[derive(Debug, Clone, Deserialize)]
pub struct UserSkillsResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub skills: Vec<UserSkill>,
}

/// One catalog row with the user's unlock flag
#[derive(Debug, Clone, Deserialize)]
pub struct UserSkill {
    pub id: u32,
    #[serde(default, deserialize_with = "flag")]
    pub is_unlocked: bool,
}

/// MySQL hands booleans back as 0/1
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}

impl UserSkillsResponse {
    /// Unlocked ids the catalog knows about
    pub fn unlocked_ids(&self, catalog: &SkillCatalog) -> Vec<SkillId> {
        catalog.filter_known(
            self.skills
                .iter()
                .filter(|s| s.is_unlocked)
                .filter_map(|s| SkillId::try_from(s.id).ok()),
        )
    }
}

/// Loadout lookups
#[derive(Clone)]
pub struct SkillStore {
    client: AccountsClient,
    catalog: Arc<SkillCatalog>,
}

impl SkillStore {
    pub fn new(client: AccountsClient, catalog: Arc<SkillCatalog>) -> Self {
        Self { client, catalog }
    }

    /// Skills the user has unlocked
    pub async fn fetch_unlocked(&self, username: &str) -> Result<Vec<SkillId>, StoreError> {
        let response: UserSkillsResponse = self
            .client
            .get("/api/user/skills", &[("username", username)])
            .await?;
        if !response.ok {
            return Err(StoreError::Refused(
                response.message.unwrap_or_else(|| "ok=false".to_string()),
            ));
        }
        Ok(response.unlocked_ids(&self.catalog))
    }

    /// Loadout for a seat; falls back to the starter skills
    pub async fn loadout_for(&self, username: &str) -> Vec<SkillId> {
        if username.is_empty() || !self.client.is_configured() {
            return DEFAULT_LOADOUT.to_vec();
        }
        match self.fetch_unlocked(username).await {
            Ok(ids) if !ids.is_empty() => {
                debug!(%username, skills = ?ids, "Loadout fetched");
                ids
            }
            Ok(_) => DEFAULT_LOADOUT.to_vec(),
            Err(err) => {
                warn!(%username, error = %err, "Loadout lookup failed, using defaults");
                DEFAULT_LOADOUT.to_vec()
            }
        }
    }
}
