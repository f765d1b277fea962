//! Skill catalog and per-seat skill state

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::util::time::secs_to_ticks;

pub type SkillId = u8;

/// What a skill does
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkillKind {
    /// Armed until the seat's next paddle contact, then multiplies puck speed
    SpeedBoost { multiplier: f32 },
    /// Shrinks the seat's own goal opening by `ratio` for `duration_secs`
    GoalShrink { ratio: f32, duration_secs: f32 },
}

/// Immutable catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDef {
    pub id: SkillId,
    pub name: String,
    pub icon: String,
    pub kind: SkillKind,
    pub cooldown_secs: f32,
}

impl SkillDef {
    fn new(id: SkillId, name: &str, icon: &str, kind: SkillKind, cooldown_secs: f32) -> Self {
        Self {
            id,
            name: name.to_string(),
            icon: icon.to_string(),
            kind,
            cooldown_secs,
        }
    }
}

/// Catalog validation errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CatalogError {
    #[error("Skill id 0 is reserved")]
    ReservedId,

    #[error("Duplicate skill id {0}")]
    DuplicateId(SkillId),

    #[error("Skill {0} has a multiplier outside 1.0..=3.0")]
    BadMultiplier(SkillId),

    #[error("Skill {0} has a shrink ratio outside (0, 1]")]
    BadRatio(SkillId),

    #[error("Skill {0} has a non-positive duration or negative cooldown")]
    BadTiming(SkillId),
}

/// Skills keyed by id
#[derive(Debug, Clone)]
pub struct SkillCatalog {
    skills: BTreeMap<SkillId, SkillDef>,
}

/// Skills every new account starts with
pub const DEFAULT_LOADOUT: [SkillId; 2] = [1, 2];

impl SkillCatalog {
    /// Build a catalog, rejecting entries that could break the simulation
    pub fn from_defs(defs: Vec<SkillDef>) -> Result<Self, CatalogError> {
        let mut skills = BTreeMap::new();
        for def in defs {
            if def.id == 0 {
                return Err(CatalogError::ReservedId);
            }
            if !(def.cooldown_secs >= 0.0) {
                return Err(CatalogError::BadTiming(def.id));
            }
            match def.kind {
                SkillKind::SpeedBoost { multiplier } => {
                    if !(1.0..=3.0).contains(&multiplier) {
                        return Err(CatalogError::BadMultiplier(def.id));
                    }
                }
                SkillKind::GoalShrink {
                    ratio,
                    duration_secs,
                } => {
                    if !(ratio > 0.0 && ratio <= 1.0) {
                        return Err(CatalogError::BadRatio(def.id));
                    }
                    if !(duration_secs > 0.0) {
                        return Err(CatalogError::BadTiming(def.id));
                    }
                }
            }
            let id = def.id;
            if skills.insert(id, def).is_some() {
                return Err(CatalogError::DuplicateId(id));
            }
        }
        Ok(Self { skills })
    }

    /// The shipped skill table. A table that fails validation is logged and
    /// leaves the catalog empty.
    pub fn builtin() -> Self {
        match Self::from_defs(builtin_defs()) {
            Ok(catalog) => catalog,
            Err(err) => {
                error!(error = %err, "Built-in skill table is invalid, skills disabled");
                Self {
                    skills: BTreeMap::new(),
                }
            }
        }
    }

    pub fn get(&self, id: SkillId) -> Option<&SkillDef> {
        self.skills.get(&id)
    }

    pub fn contains(&self, id: SkillId) -> bool {
        self.skills.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Keep only ids the catalog knows, in catalog order, without repeats
    pub fn filter_known(&self, ids: impl IntoIterator<Item = SkillId>) -> Vec<SkillId> {
        let mut known: Vec<SkillId> = ids.into_iter().filter(|id| self.contains(*id)).collect();
        known.sort_unstable();
        known.dedup();
        known
    }
}

fn builtin_defs() -> Vec<SkillDef> {
    vec![
        SkillDef::new(1, "Skill 1", "⚡", SkillKind::SpeedBoost { multiplier: 1.5 }, 5.0),
        SkillDef::new(2, "Skill 2", "🔥", SkillKind::SpeedBoost { multiplier: 2.0 }, 7.0),
        SkillDef::new(3, "Skill 3", "💨", SkillKind::SpeedBoost { multiplier: 2.5 }, 9.0),
        SkillDef::new(4, "Skill 4", "🚀", SkillKind::SpeedBoost { multiplier: 3.0 }, 12.0),
        SkillDef::new(
            5,
            "Narrow Goal",
            "🧱",
            SkillKind::GoalShrink {
                ratio: 0.6,
                duration_secs: 5.0,
            },
            15.0,
        ),
        SkillDef::new(
            6,
            "Fortress",
            "🛡",
            SkillKind::GoalShrink {
                ratio: 0.4,
                duration_secs: 4.0,
            },
            20.0,
        ),
    ]
}

impl Default for SkillCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Skill currently in play for a seat
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Engaged {
    /// Speed boost waiting for the next paddle contact
    Armed { skill_id: SkillId, multiplier: f32 },
    /// Timed goal shrink
    Active {
        skill_id: SkillId,
        ratio: f32,
        expires_at: u64,
    },
}

impl Engaged {
    pub fn skill_id(&self) -> SkillId {
        match self {
            Engaged::Armed { skill_id, .. } | Engaged::Active { skill_id, .. } => *skill_id,
        }
    }
}

/// Why an activation was refused. None of these reach the other player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillRejection {
    Unknown,
    Locked,
    CoolingDown,
    Busy,
}

/// Per-seat skill state machine
#[derive(Debug, Clone, Default)]
pub struct SkillSlot {
    loadout: Vec<SkillId>,
    selected: Option<SkillId>,
    engaged: Option<Engaged>,
    /// Tick at which each skill becomes usable again
    ready_at: HashMap<SkillId, u64>,
}

impl SkillSlot {
    pub fn new(loadout: Vec<SkillId>) -> Self {
        Self {
            loadout,
            ..Self::default()
        }
    }

    pub fn loadout(&self) -> &[SkillId] {
        &self.loadout
    }

    pub fn selected(&self) -> Option<SkillId> {
        self.selected
    }

    pub fn engaged(&self) -> Option<Engaged> {
        self.engaged
    }

    pub fn is_unlocked(&self, id: SkillId) -> bool {
        self.loadout.contains(&id)
    }

    pub fn on_cooldown(&self, id: SkillId, now: u64) -> bool {
        self.ready_at.get(&id).is_some_and(|ready| now < *ready)
    }

    /// Ticks left on a skill's cooldown
    pub fn cooldown_remaining(&self, id: SkillId, now: u64) -> u64 {
        self.ready_at
            .get(&id)
            .map(|ready| ready.saturating_sub(now))
            .unwrap_or(0)
    }

    /// Bind a skill to the activation key; 0 clears. Returns whether the
    /// selection changed.
    pub fn select(&mut self, id: SkillId, now: u64) -> bool {
        if id == 0 {
            return self.selected.take().is_some();
        }
        if !self.is_unlocked(id) || self.on_cooldown(id, now) {
            return false;
        }
        let changed = self.selected != Some(id);
        self.selected = Some(id);
        changed
    }

    /// Engage a skill. Speed boosts arm, goal shrinks start their timer.
    pub fn activate(
        &mut self,
        id: SkillId,
        catalog: &SkillCatalog,
        now: u64,
    ) -> Result<SkillKind, SkillRejection> {
        let def = catalog.get(id).ok_or(SkillRejection::Unknown)?;
        if !self.is_unlocked(id) {
            return Err(SkillRejection::Locked);
        }
        if self.engaged.is_some() {
            return Err(SkillRejection::Busy);
        }
        if self.on_cooldown(id, now) {
            return Err(SkillRejection::CoolingDown);
        }

        self.engaged = Some(match def.kind {
            SkillKind::SpeedBoost { multiplier } => Engaged::Armed {
                skill_id: id,
                multiplier,
            },
            SkillKind::GoalShrink {
                ratio,
                duration_secs,
            } => Engaged::Active {
                skill_id: id,
                ratio,
                expires_at: now + secs_to_ticks(duration_secs),
            },
        });
        Ok(def.kind)
    }

    /// Paddle touched the puck: an armed boost fires and starts cooling
    /// down. Returns the skill and multiplier applied.
    pub fn consume_on_contact(&mut self, catalog: &SkillCatalog, now: u64) -> Option<(SkillId, f32)> {
        match self.engaged {
            Some(Engaged::Armed {
                skill_id,
                multiplier,
            }) => {
                self.engaged = None;
                self.start_cooldown(skill_id, catalog, now);
                Some((skill_id, multiplier))
            }
            _ => None,
        }
    }

    /// End a timed skill whose duration elapsed; its cooldown starts at
    /// expiry.
    pub fn expire(&mut self, catalog: &SkillCatalog, now: u64) -> Option<SkillId> {
        match self.engaged {
            Some(Engaged::Active {
                skill_id,
                expires_at,
                ..
            }) if now >= expires_at => {
                self.engaged = None;
                self.start_cooldown(skill_id, catalog, expires_at);
                Some(skill_id)
            }
            _ => None,
        }
    }

    /// Multiplier on this seat's own goal opening
    pub fn goal_ratio_factor(&self) -> f32 {
        match self.engaged {
            Some(Engaged::Active { ratio, .. }) => ratio,
            _ => 1.0,
        }
    }

    /// Drop engaged skills and cooldowns, keeping loadout and selection
    pub fn reset(&mut self) {
        self.engaged = None;
        self.ready_at.clear();
    }

    fn start_cooldown(&mut self, id: SkillId, catalog: &SkillCatalog, from: u64) {
        let cooldown = catalog
            .get(id)
            .map(|def| secs_to_ticks(def.cooldown_secs))
            .unwrap_or(0);
        self.ready_at.insert(id, from + cooldown);
        if self.selected == Some(id) && cooldown > 0 {
            self.selected = None;
        }
    }
}
