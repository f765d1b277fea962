//! Snapshot cadence and `state` payload building

use crate::util::time::SIMULATION_TPS;
use crate::ws::protocol::{AvailableSkill, ServerMsg, SkillSnapshot, StateSnapshot};

use super::r#match::{MatchState, PlayerSlot};
use super::skills::SkillCatalog;

/// Decides when a room broadcasts its state and builds the message
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Builder for a target snapshot rate, capped at the simulation rate
    pub fn for_rate(snapshot_tps: u32) -> Self {
        Self::new(SIMULATION_TPS / snapshot_tps.clamp(1, SIMULATION_TPS))
    }

    pub fn interval(&self) -> u32 {
        self.snapshot_interval
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (phase changes, goals, skills)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    pub fn build(&self, state: &MatchState) -> ServerMsg {
        ServerMsg::State(Self::snapshot(state))
    }

    pub fn snapshot(state: &MatchState) -> StateSnapshot {
        let catalog = state.catalog();
        StateSnapshot {
            ball: state.puck.pos,
            paddles: state.paddles(),
            scores: state.scores,
            skills: state
                .slots
                .map(|_, slot| skill_snapshot(slot.as_ref(), catalog, state.tick)),
            goal_width_ratio: state.goal_ratios(),
        }
    }
}

fn skill_snapshot(slot: Option<&PlayerSlot>, catalog: &SkillCatalog, now: u64) -> SkillSnapshot {
    let Some(slot) = slot else {
        return SkillSnapshot {
            active: 0,
            selected: 0,
            available: Vec::new(),
        };
    };

    let available = slot
        .skills
        .loadout()
        .iter()
        .filter_map(|id| catalog.get(*id))
        .map(|def| AvailableSkill {
            id: def.id,
            name: def.name.clone(),
            icon: def.icon.clone(),
            kind: def.kind,
            cooldown_remaining: slot.skills.cooldown_remaining(def.id, now) as f32
                / SIMULATION_TPS as f32,
        })
        .collect();

    SkillSnapshot {
        active: slot.skills.engaged().map(|e| e.skill_id()).unwrap_or(0),
        selected: slot.skills.selected().unwrap_or(0),
        available,
    }
}
