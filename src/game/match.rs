//! Match state and authoritative tick loop

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GameSettings;
use crate::rooms::RoomError;
use crate::util::time::{secs_to_ticks, tick_duration, ticks_to_secs};
use crate::ws::protocol::{LoadingRoomState, RoomSummary, ServerMsg};

use super::physics::{
    paddle_home, Contact, PhysicsSystem, Puck, Vec2, DEFAULT_GOAL_RATIO, MAX_PUCK_SPEED,
    MIN_PUCK_SPEED,
};
use super::reconcile::{reconcile, PaddleIntent, Reconciled};
use super::skills::{SkillCatalog, SkillId, SkillSlot};
use super::snapshot::SnapshotBuilder;
use super::{ConnectionHandle, Delivery, JoinMode, PerSide, RoomCommand, RoomInput, Side};

/// Capacity of a room's input queue
pub const ROOM_INPUT_CAPACITY: usize = 256;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Fewer than two players seated
    Waiting,
    /// Both seats taken, not everyone ready
    Ready,
    /// Both ready, countdown before the serve
    Starting,
    /// Puck in play
    InProgress,
    /// Win score reached, result on screen
    Finished,
}

/// A seated player (authoritative)
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub username: String,
    pub connection: ConnectionHandle,
    pub paddle: Vec2,
    pub ready: bool,
    pub skills: SkillSlot,
    pub last_input_tick: u64,
    /// Paddle and puck overlapped on the previous tick
    in_contact: bool,
    /// Coalesced paddle input for the next tick
    pending: Option<PaddleIntent>,
}

impl PlayerSlot {
    fn new(side: Side, username: String, connection: ConnectionHandle, loadout: Vec<SkillId>, now: u64) -> Self {
        Self {
            username,
            connection,
            paddle: paddle_home(side),
            ready: false,
            skills: SkillSlot::new(loadout),
            last_input_tick: now,
            in_contact: false,
            pending: None,
        }
    }
}

/// Result of a finished match, in the shape the stats service records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRecord {
    pub player1: String,
    pub player2: String,
    pub score1: u32,
    pub score2: u32,
    /// Seconds of play
    pub duration: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Room is full")]
    RoomFull,
}

/// Message addressed by the state machine, delivered by the room loop
#[derive(Debug, Clone)]
pub enum Outbound {
    To(Side, ServerMsg),
    /// A connection that holds no seat (e.g. a refused joiner)
    ToConn(ConnectionHandle, ServerMsg),
    All(ServerMsg),
}

/// Match state (owned by the room task)
pub struct MatchState {
    pub room: String,
    pub phase: MatchPhase,
    pub tick: u64,
    pub slots: PerSide<Option<PlayerSlot>>,
    pub puck: Puck,
    pub scores: PerSide<u32>,
    rng: ChaCha8Rng,
    catalog: Arc<SkillCatalog>,
    settings: GameSettings,
    /// Tick at which the current phase began
    phase_started: u64,
    /// Tick at which the puck was first served
    play_started: u64,
    outbox: Vec<Outbound>,
    record: Option<MatchRecord>,
    snapshot_due: bool,
}

impl MatchState {
    pub fn new(
        room: impl Into<String>,
        seed: u64,
        catalog: Arc<SkillCatalog>,
        settings: GameSettings,
    ) -> Self {
        Self {
            room: room.into(),
            phase: MatchPhase::Waiting,
            tick: 0,
            slots: PerSide::default(),
            puck: Puck::centered(),
            scores: PerSide::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            catalog,
            settings,
            phase_started: 0,
            play_started: 0,
            outbox: Vec::new(),
            record: None,
            snapshot_due: false,
        }
    }

    pub fn catalog(&self) -> &SkillCatalog {
        &self.catalog
    }

    pub fn slot(&self, side: Side) -> Option<&PlayerSlot> {
        self.slots.get(side).as_ref()
    }

    pub fn side_of(&self, conn_id: Uuid) -> Option<Side> {
        Side::ALL
            .into_iter()
            .find(|side| self.slot(*side).is_some_and(|s| s.connection.id == conn_id))
    }

    pub fn player_count(&self) -> usize {
        Side::ALL.iter().filter(|side| self.slot(**side).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.player_count() == 0
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.phase, MatchPhase::Starting | MatchPhase::InProgress)
    }

    pub fn paddles(&self) -> PerSide<Vec2> {
        self.slots
            .map(|side, slot| slot.as_ref().map(|s| s.paddle).unwrap_or_else(|| paddle_home(side)))
    }

    /// Effective goal opening ratio per side, including shrink skills
    pub fn goal_ratios(&self) -> PerSide<f32> {
        self.slots.map(|_, slot| {
            DEFAULT_GOAL_RATIO * slot.as_ref().map(|s| s.skills.goal_ratio_factor()).unwrap_or(1.0)
        })
    }

    /// Loading-screen view of the room
    pub fn loading_state(&self, side: Option<Side>) -> LoadingRoomState {
        let username = |side| self.slot(side).map(|s| s.username.clone()).unwrap_or_default();
        let loadout = |side| {
            self.slot(side)
                .map(|s| s.skills.loadout().to_vec())
                .unwrap_or_default()
        };
        let ready = |side| self.slot(side).is_some_and(|s| s.ready);
        LoadingRoomState {
            room_name: self.room.clone(),
            left_username: username(Side::Top),
            right_username: username(Side::Bottom),
            side,
            left_user_skills: loadout(Side::Top),
            right_user_skills: loadout(Side::Bottom),
            left_ready: ready(Side::Top),
            right_ready: ready(Side::Bottom),
        }
    }

    /// Seat a connection. A seated username is handed to the new connection
    /// only when the name is verified or its old connection is gone.
    pub fn join(
        &mut self,
        connection: ConnectionHandle,
        username: String,
        verified: bool,
        loadout: Vec<SkillId>,
        mode: JoinMode,
    ) -> Result<Side, JoinError> {
        let rebound = Side::ALL.into_iter().find(|side| {
            self.slot(*side).is_some_and(|s| {
                s.connection.id == connection.id
                    || (!username.is_empty()
                        && s.username == username
                        && (verified || s.connection.is_closed()))
            })
        });

        let side = match rebound {
            Some(side) => {
                if let Some(slot) = self.slots.get_mut(side) {
                    let previous = std::mem::replace(&mut slot.connection, connection);
                    slot.last_input_tick = self.tick;
                    if previous.id != slot.connection.id {
                        info!(room = %self.room, %side, username = %slot.username, "Seat re-bound to new connection");
                        self.outbox.push(Outbound::ToConn(
                            previous,
                            ServerMsg::error("seat_taken", "Seat taken over by another connection"),
                        ));
                    }
                }
                side
            }
            None => {
                let Some(side) = Side::ALL.into_iter().find(|side| self.slot(*side).is_none()) else {
                    let error = JoinError::RoomFull.to_string();
                    let msg = match mode {
                        JoinMode::Direct => ServerMsg::Joined {
                            side: None,
                            error: Some(error),
                        },
                        JoinMode::Loading => ServerMsg::JoinLoadingFail { error },
                    };
                    self.outbox.push(Outbound::ToConn(connection, msg));
                    return Err(JoinError::RoomFull);
                };
                let loadout = self.catalog.filter_known(loadout);
                info!(room = %self.room, %side, %username, "Player seated");
                *self.slots.get_mut(side) = Some(PlayerSlot::new(side, username, connection, loadout, self.tick));
                side
            }
        };

        match mode {
            JoinMode::Direct => {
                if let Some(slot) = self.slots.get_mut(side) {
                    slot.ready = true;
                }
                self.outbox.push(Outbound::To(
                    side,
                    ServerMsg::Joined {
                        side: Some(side),
                        error: None,
                    },
                ));
            }
            JoinMode::Loading => {
                let view = self.loading_state(Some(side));
                self.outbox.push(Outbound::All(ServerMsg::JoinLoadingSuccess(view)));
            }
        }

        if self.phase == MatchPhase::Waiting && self.player_count() == 2 {
            self.set_phase(MatchPhase::Ready);
        }
        self.check_start();
        self.snapshot_due = true;
        Ok(side)
    }

    /// Flip readiness from the loading screen
    pub fn toggle_ready(&mut self, side: Side) {
        if !matches!(
            self.phase,
            MatchPhase::Waiting | MatchPhase::Ready | MatchPhase::Starting
        ) {
            debug!(room = %self.room, %side, phase = ?self.phase, "Ready toggle ignored");
            return;
        }
        let Some(slot) = self.slots.get_mut(side) else {
            return;
        };
        slot.ready = !slot.ready;
        let ready = slot.ready;

        self.outbox.push(Outbound::All(ServerMsg::JoinLoadingReadyToggleSuccess {
            room_name: self.room.clone(),
            side,
            ready,
        }));

        if self.phase == MatchPhase::Starting && !ready {
            info!(room = %self.room, %side, "Countdown cancelled");
            self.set_phase(MatchPhase::Ready);
        }
        self.check_start();
    }

    /// Vacate a seat. Any match in progress is abandoned and the room goes
    /// back to waiting.
    pub fn disconnect(&mut self, side: Side) {
        let Some(slot) = self.slots.get_mut(side).take() else {
            return;
        };
        info!(
            room = %self.room,
            %side,
            username = %slot.username,
            phase = ?self.phase,
            "Player left"
        );

        let abandoned = matches!(
            self.phase,
            MatchPhase::Starting | MatchPhase::InProgress | MatchPhase::Finished
        );
        self.reset_match();
        if abandoned {
            if let Some(other) = self.slots.get_mut(side.opponent()) {
                other.ready = false;
            }
        }
        if self.slot(side.opponent()).is_some() {
            let view = self.loading_state(Some(side.opponent()));
            self.outbox.push(Outbound::To(side.opponent(), ServerMsg::OpponentDisconnected {}));
            self.outbox
                .push(Outbound::To(side.opponent(), ServerMsg::LoadingRoomUpdated(view)));
        }
        self.set_phase(MatchPhase::Waiting);
    }

    /// Record paddle input for the next tick
    pub fn queue_paddle(&mut self, side: Side, intent: PaddleIntent) {
        if let Some(slot) = self.slots.get_mut(side) {
            slot.pending = Some(match slot.pending {
                Some(prev) => prev.coalesce(intent),
                None => intent,
            });
        }
    }

    /// Mark a seat as active
    pub fn touch(&mut self, side: Side) {
        let now = self.tick;
        if let Some(slot) = self.slots.get_mut(side) {
            slot.last_input_tick = now;
        }
    }

    pub fn activate_skill(&mut self, side: Side, skill_id: SkillId) {
        if self.phase != MatchPhase::InProgress {
            debug!(room = %self.room, %side, skill_id, "Skill outside of play ignored");
            return;
        }
        let now = self.tick;
        let Some(slot) = self.slots.get_mut(side) else {
            return;
        };
        match slot.skills.activate(skill_id, &self.catalog, now) {
            Ok(kind) => {
                debug!(room = %self.room, %side, skill_id, ?kind, "Skill engaged");
                self.outbox
                    .push(Outbound::All(ServerMsg::SkillActivated { side, skill_id }));
                self.snapshot_due = true;
            }
            Err(reason) => {
                debug!(room = %self.room, %side, skill_id, ?reason, "Skill refused");
            }
        }
    }

    pub fn select_skill(&mut self, side: Side, skill_id: SkillId) {
        let now = self.tick;
        if let Some(slot) = self.slots.get_mut(side) {
            if slot.skills.select(skill_id, now) {
                self.snapshot_due = true;
            }
        }
    }

    /// Queue a message for everyone seated
    pub fn broadcast(&mut self, msg: ServerMsg) {
        self.outbox.push(Outbound::All(msg));
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_record(&mut self) -> Option<MatchRecord> {
        self.record.take()
    }

    /// Whether something changed that clients should see right away
    pub fn take_snapshot_due(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_due)
    }

    /// Seats that sent nothing for the idle timeout
    pub fn idle_sides(&self) -> Vec<Side> {
        let limit = secs_to_ticks(self.settings.idle_timeout.as_secs_f32());
        Side::ALL
            .into_iter()
            .filter(|side| {
                self.slot(*side)
                    .is_some_and(|s| self.tick.saturating_sub(s.last_input_tick) > limit)
            })
            .collect()
    }

    /// Advance one simulation tick
    pub fn tick(&mut self) {
        self.tick += 1;

        match self.phase {
            MatchPhase::Waiting | MatchPhase::Ready => self.apply_paddle_inputs(),
            MatchPhase::Starting => {
                self.apply_paddle_inputs();
                if self.phase_elapsed() >= secs_to_ticks(self.settings.start_delay.as_secs_f32()) {
                    self.begin_play();
                }
            }
            MatchPhase::InProgress => {
                self.step_puck();
                if self.phase == MatchPhase::InProgress {
                    self.apply_paddle_inputs();
                    self.expire_skills();
                }
            }
            MatchPhase::Finished => {
                if self.phase_elapsed() >= secs_to_ticks(self.settings.result_hold.as_secs_f32()) {
                    self.recycle();
                }
            }
        }
    }

    fn phase_elapsed(&self) -> u64 {
        self.tick.saturating_sub(self.phase_started)
    }

    fn set_phase(&mut self, phase: MatchPhase) {
        if self.phase != phase {
            debug!(room = %self.room, from = ?self.phase, to = ?phase, "Phase change");
            self.phase = phase;
            self.phase_started = self.tick;
            self.snapshot_due = true;
        }
    }

    fn check_start(&mut self) {
        let both_ready = Side::ALL
            .iter()
            .all(|side| self.slot(*side).is_some_and(|s| s.ready));
        if self.phase == MatchPhase::Ready && both_ready {
            info!(room = %self.room, "Both players ready, starting countdown");
            self.set_phase(MatchPhase::Starting);
            self.outbox.push(Outbound::All(ServerMsg::GameStartReady {
                room_name: self.room.clone(),
            }));
        }
    }

    fn begin_play(&mut self) {
        self.set_phase(MatchPhase::InProgress);
        self.play_started = self.tick;
        let now = self.tick;
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                slot.last_input_tick = now;
            }
        }
        let toward = if self.rng.gen_bool(0.5) { Side::Top } else { Side::Bottom };
        self.serve(toward);
        info!(room = %self.room, "Match started");
        self.outbox.push(Outbound::All(ServerMsg::GameReady {}));
    }

    fn serve(&mut self, toward: Side) {
        self.puck = Puck::centered();
        self.puck.vel = PhysicsSystem::serve_velocity(&mut self.rng, toward);
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                slot.in_contact = false;
            }
        }
    }

    /// Puck integration, walls, goals, paddle contacts and speed clamp
    fn step_puck(&mut self) {
        let ratios = self.goal_ratios();
        PhysicsSystem::integrate(&mut self.puck);
        PhysicsSystem::resolve_walls(&mut self.puck, &ratios);

        if let Some(scorer) = PhysicsSystem::check_goal(&self.puck, &ratios) {
            self.goal(scorer);
            return;
        }
        if !PhysicsSystem::in_bounds(&self.puck) {
            warn!(
                room = %self.room,
                x = self.puck.pos.x,
                y = self.puck.pos.y,
                "Puck left the board, re-serving"
            );
            let toward = if self.rng.gen_bool(0.5) { Side::Top } else { Side::Bottom };
            self.serve(toward);
            return;
        }

        let now = self.tick;
        for side in Side::ALL {
            let Some(slot) = self.slots.get_mut(side) else {
                continue;
            };
            match PhysicsSystem::resolve_paddle_contact(&mut self.puck, slot.paddle, side.facing()) {
                Contact::None => slot.in_contact = false,
                Contact::Touching { .. } => {
                    if slot.in_contact {
                        continue;
                    }
                    slot.in_contact = true;
                    if let Some((skill_id, multiplier)) =
                        slot.skills.consume_on_contact(&self.catalog, now)
                    {
                        self.puck.vel = self.puck.vel.scale(multiplier);
                        debug!(
                            room = %self.room,
                            %side,
                            skill_id,
                            multiplier,
                            speed = self.puck.speed(),
                            "Speed boost applied"
                        );
                        self.snapshot_due = true;
                    }
                    self.outbox.push(Outbound::All(ServerMsg::Bounce {}));
                }
            }
        }

        // A paddle near the boards can push the puck past them
        PhysicsSystem::resolve_walls(&mut self.puck, &ratios);
        self.puck.vel = PhysicsSystem::clamp_speed(self.puck.vel, MIN_PUCK_SPEED, MAX_PUCK_SPEED);
    }

    fn goal(&mut self, scorer: Side) {
        *self.scores.get_mut(scorer) += 1;
        info!(
            room = %self.room,
            %scorer,
            top = self.scores.top,
            bottom = self.scores.bottom,
            "Goal"
        );
        self.outbox.push(Outbound::All(ServerMsg::Goal {
            scorer,
            scores: self.scores,
        }));
        self.snapshot_due = true;

        if *self.scores.get(scorer) >= self.settings.win_score {
            self.finish(scorer);
        } else {
            self.serve(scorer.opponent());
        }
    }

    fn finish(&mut self, winner: Side) {
        let duration = ticks_to_secs(self.tick.saturating_sub(self.play_started));
        let username = |side| self.slot(side).map(|s| s.username.clone()).unwrap_or_default();
        let record = MatchRecord {
            player1: username(Side::Top),
            player2: username(Side::Bottom),
            score1: self.scores.top,
            score2: self.scores.bottom,
            duration,
        };
        let winner_username = username(winner);
        info!(room = %self.room, %winner, ?record, "Match finished");

        self.outbox.push(Outbound::All(ServerMsg::MatchEnd {
            winner,
            winner_username,
            scores: self.scores,
            duration_secs: duration,
        }));
        self.record = Some(record);
        self.puck = Puck::centered();
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                slot.skills.reset();
            }
        }
        self.set_phase(MatchPhase::Finished);
    }

    /// After the result hold both players are back on the ready screen
    fn recycle(&mut self) {
        self.reset_match();
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                slot.ready = false;
            }
        }
        let next = if self.player_count() == 2 {
            MatchPhase::Ready
        } else {
            MatchPhase::Waiting
        };
        self.set_phase(next);
        let view = self.loading_state(None);
        self.outbox.push(Outbound::All(ServerMsg::LoadingRoomUpdated(view)));
    }

    fn reset_match(&mut self) {
        self.puck = Puck::centered();
        self.scores = PerSide::default();
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                slot.paddle = paddle_home(side);
                slot.skills.reset();
                slot.in_contact = false;
                slot.pending = None;
            }
        }
        self.snapshot_due = true;
    }

    fn apply_paddle_inputs(&mut self) {
        for side in Side::ALL {
            let Some(slot) = self.slots.get_mut(side) else {
                continue;
            };
            let Some(intent) = slot.pending.take() else {
                continue;
            };
            match reconcile(side, slot.paddle, intent) {
                Reconciled::Moved(pos) => slot.paddle = pos,
                Reconciled::Unchanged => {}
                Reconciled::Rejected => {
                    debug!(room = %self.room, %side, ?intent, "Paddle update rejected");
                }
            }
        }
    }

    fn expire_skills(&mut self) {
        let now = self.tick;
        for side in Side::ALL {
            if let Some(slot) = self.slots.get_mut(side) {
                if let Some(skill_id) = slot.skills.expire(&self.catalog, now) {
                    debug!(room = %self.room, %side, skill_id, "Skill expired");
                    self.snapshot_due = true;
                }
            }
        }
    }
}

/// Shared collaborators handed to every room
#[derive(Clone)]
pub struct MatchServices {
    pub catalog: Arc<SkillCatalog>,
    /// Finished matches go to the persistence worker
    pub results: mpsc::Sender<MatchRecord>,
    /// Signalled whenever a room's lobby summary may have changed
    pub room_changed: Arc<Notify>,
}

/// Handle to a running room
#[derive(Clone, Debug)]
pub struct RoomHandle {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub host: Option<String>,
    pub input_tx: mpsc::Sender<RoomInput>,
    player_count: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
}

impl RoomHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_name: self.name.clone(),
            created_at: self.created_at,
            is_playing: self.is_playing(),
            current_players: self.player_count(),
            host: self.host.clone(),
        }
    }

    /// The room loop has exited
    pub fn is_closed(&self) -> bool {
        self.input_tx.is_closed()
    }

    pub async fn send(&self, conn_id: Uuid, cmd: RoomCommand) -> Result<(), RoomError> {
        self.input_tx
            .send(RoomInput { conn_id, cmd })
            .await
            .map_err(|_| RoomError::Closed(self.name.clone()))
    }
}

/// The authoritative room loop
pub struct GameMatch {
    id: Uuid,
    state: MatchState,
    input_rx: mpsc::Receiver<RoomInput>,
    snapshot_builder: SnapshotBuilder,
    services: MatchServices,
    player_count: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
    /// A room nobody joins within this many ticks shuts down
    vacancy_limit: u64,
    had_players: bool,
}

impl GameMatch {
    pub fn new(
        name: String,
        host: Option<String>,
        seed: u64,
        settings: GameSettings,
        services: MatchServices,
    ) -> (Self, RoomHandle) {
        let id = Uuid::new_v4();
        let (input_tx, input_rx) = mpsc::channel(ROOM_INPUT_CAPACITY);
        let player_count = Arc::new(AtomicUsize::new(0));
        let playing = Arc::new(AtomicBool::new(false));

        let handle = RoomHandle {
            id,
            name: name.clone(),
            created_at: Utc::now(),
            host,
            input_tx,
            player_count: player_count.clone(),
            playing: playing.clone(),
        };

        let game_match = Self {
            id,
            snapshot_builder: SnapshotBuilder::for_rate(settings.snapshot_tps),
            vacancy_limit: secs_to_ticks(settings.idle_timeout.as_secs_f32()),
            state: MatchState::new(name, seed, services.catalog.clone(), settings),
            input_rx,
            services,
            player_count,
            playing,
            had_players: false,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop until the room empties or is closed
    pub async fn run(mut self) {
        info!(
            room = %self.state.room,
            room_id = %self.id,
            snapshot_interval = self.snapshot_builder.interval(),
            "Room opened"
        );

        let mut tick_interval = interval(tick_duration());
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            if !self.process_inputs() {
                info!(room = %self.state.room, "Room closed");
                break;
            }

            self.state.tick();
            for side in self.state.idle_sides() {
                warn!(room = %self.state.room, %side, "Player idle, disconnecting");
                if let Some(slot) = self.state.slot(side) {
                    slot.connection
                        .deliver(ServerMsg::error("idle_timeout", "Disconnected for inactivity"));
                }
                self.state.disconnect(side);
            }

            if self.state.take_snapshot_due() {
                self.snapshot_builder.force_next();
            }
            if self.snapshot_builder.should_send() && !self.state.is_empty() {
                let snapshot = self.snapshot_builder.build(&self.state);
                self.state.broadcast(snapshot);
            }
            self.flush();

            if let Some(record) = self.state.take_record() {
                if let Err(err) = self.services.results.try_send(record) {
                    warn!(room = %self.state.room, error = %err, "Match record dropped");
                }
            }
            self.publish_counters();

            if self.state.is_empty() {
                if self.had_players {
                    info!(room = %self.state.room, "All players left, closing room");
                    break;
                }
                if self.state.tick >= self.vacancy_limit {
                    info!(room = %self.state.room, "Nobody joined, closing room");
                    break;
                }
            } else {
                self.had_players = true;
            }
        }

        self.player_count.store(0, Ordering::Relaxed);
        self.playing.store(false, Ordering::Relaxed);
        self.services.room_changed.notify_one();
    }

    /// Drain the input queue. Returns false when the room must shut down.
    fn process_inputs(&mut self) -> bool {
        loop {
            let input = match self.input_rx.try_recv() {
                Ok(input) => input,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            };

            match input.cmd {
                RoomCommand::Join {
                    connection,
                    username,
                    verified,
                    loadout,
                    mode,
                    reply,
                } => {
                    let result = self.state.join(connection, username, verified, loadout, mode);
                    if let Err(err) = &result {
                        debug!(room = %self.state.room, conn_id = %input.conn_id, error = %err, "Join refused");
                    }
                    // The session may have given up waiting
                    let _ = reply.send(result);
                }
                RoomCommand::Close => {
                    for side in Side::ALL {
                        self.state.disconnect(side);
                    }
                    self.flush();
                    return false;
                }
                cmd => {
                    let Some(side) = self.state.side_of(input.conn_id) else {
                        debug!(room = %self.state.room, conn_id = %input.conn_id, ?cmd, "Input from unseated connection");
                        continue;
                    };
                    self.state.touch(side);

                    match cmd {
                        RoomCommand::ToggleReady => self.state.toggle_ready(side),
                        RoomCommand::Paddle(intent) => self.state.queue_paddle(side, intent),
                        RoomCommand::ActivateSkill(skill_id) => self.state.activate_skill(side, skill_id),
                        RoomCommand::SelectSkill(skill_id) => self.state.select_skill(side, skill_id),
                        RoomCommand::Leave => self.state.disconnect(side),
                        RoomCommand::Heartbeat | RoomCommand::Join { .. } | RoomCommand::Close => {}
                    }
                }
            }
        }
    }

    /// Deliver queued messages; a closed connection loses its seat
    fn flush(&mut self) {
        loop {
            let outbox = self.state.take_outbox();
            if outbox.is_empty() {
                return;
            }

            let mut closed: Vec<Side> = Vec::new();
            let mut deliver = |state: &MatchState, side: Side, msg: ServerMsg| {
                let Some(slot) = state.slot(side) else {
                    return;
                };
                match slot.connection.deliver(msg) {
                    Delivery::Sent => {}
                    Delivery::Dropped => {
                        debug!(room = %state.room, %side, "Outbound queue full, message dropped");
                    }
                    Delivery::Closed => {
                        if !closed.contains(&side) {
                            closed.push(side);
                        }
                    }
                }
            };

            for out in outbox {
                match out {
                    Outbound::To(side, msg) => deliver(&self.state, side, msg),
                    Outbound::All(msg) => {
                        for side in Side::ALL {
                            deliver(&self.state, side, msg.clone());
                        }
                    }
                    Outbound::ToConn(connection, msg) => {
                        connection.deliver(msg);
                    }
                }
            }

            for side in closed {
                warn!(room = %self.state.room, %side, "Connection closed, vacating seat");
                self.state.disconnect(side);
            }
        }
    }

    fn publish_counters(&self) {
        let count = self.state.player_count();
        let playing = self.state.is_playing();
        let old_count = self.player_count.swap(count, Ordering::Relaxed);
        let old_playing = self.playing.swap(playing, Ordering::Relaxed);
        if old_count != count || old_playing != playing {
            self.services.room_changed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{board_center, BOARD_HEIGHT, SERVE_SPEED};
    use proptest::prelude::*;

    fn connection() -> (ConnectionHandle, mpsc::Receiver<ServerMsg>) {
        let (tx, rx) = mpsc::channel(64);
        (ConnectionHandle::new(Uuid::new_v4(), tx), rx)
    }

    fn settings() -> GameSettings {
        GameSettings::default()
    }

    fn new_state() -> MatchState {
        MatchState::new("test", 42, Arc::new(SkillCatalog::builtin()), settings())
    }

    /// Two players seated from the game screen, puck in play
    fn playing_state() -> MatchState {
        playing_state_with(settings())
    }

    fn playing_state_with(settings: GameSettings) -> MatchState {
        let mut state = MatchState::new("test", 42, Arc::new(SkillCatalog::builtin()), settings);
        let (a, _) = connection();
        let (b, _) = connection();
        state.join(a, "alice".into(), false, vec![1, 2, 5], JoinMode::Direct).unwrap();
        state.join(b, "bob".into(), false, vec![1, 2], JoinMode::Direct).unwrap();
        assert_eq!(state.phase, MatchPhase::Starting);
        for _ in 0..secs_to_ticks(1.0) {
            state.tick();
        }
        assert_eq!(state.phase, MatchPhase::InProgress);
        state.take_outbox();
        state
    }

    fn park_paddles(state: &mut MatchState) {
        for side in Side::ALL {
            if let Some(slot) = state.slots.get_mut(side) {
                slot.paddle = Vec2::new(30.0, if side == Side::Top { 300.0 } else { 400.0 });
            }
        }
    }

    fn events(state: &mut MatchState) -> Vec<ServerMsg> {
        state
            .take_outbox()
            .into_iter()
            .map(|out| match out {
                Outbound::To(_, msg) | Outbound::ToConn(_, msg) | Outbound::All(msg) => msg,
            })
            .collect()
    }

    #[test]
    fn first_joiner_takes_top_then_bottom() {
        let mut state = new_state();
        let (a, _) = connection();
        let (b, _) = connection();
        let (c, _) = connection();
        assert_eq!(state.join(a, "a".into(), false, vec![], JoinMode::Loading), Ok(Side::Top));
        assert_eq!(state.phase, MatchPhase::Waiting);
        assert_eq!(state.join(b, "b".into(), false, vec![], JoinMode::Loading), Ok(Side::Bottom));
        assert_eq!(state.phase, MatchPhase::Ready);
        assert_eq!(
            state.join(c, "c".into(), false, vec![], JoinMode::Loading),
            Err(JoinError::RoomFull)
        );
        let last = events(&mut state).pop();
        assert!(matches!(last, Some(ServerMsg::JoinLoadingFail { .. })));
    }

    #[test]
    fn same_unverified_name_takes_the_free_seat() {
        let mut state = new_state();
        let (a, _a_rx) = connection();
        let (b, _b_rx) = connection();
        assert_eq!(
            state.join(a, "player1".into(), false, vec![], JoinMode::Direct),
            Ok(Side::Top)
        );
        assert_eq!(
            state.join(b, "player1".into(), false, vec![], JoinMode::Direct),
            Ok(Side::Bottom)
        );
        assert_eq!(state.player_count(), 2);
        assert_eq!(state.phase, MatchPhase::Starting);

        let (c, _c_rx) = connection();
        assert_eq!(
            state.join(c, "player1".into(), false, vec![], JoinMode::Direct),
            Err(JoinError::RoomFull)
        );
        assert!(!state.take_outbox().iter().any(|out| matches!(
            out,
            Outbound::ToConn(_, ServerMsg::Error { code, .. }) if code == "seat_taken"
        )));
    }

    #[test]
    fn verified_name_rebinds_seat() {
        let mut state = new_state();
        let (first, _first_rx) = connection();
        let (second, _second_rx) = connection();
        let first_id = first.id;
        let second_id = second.id;
        state.join(first, "alice".into(), true, vec![1], JoinMode::Loading).unwrap();
        state.take_outbox();

        assert_eq!(
            state.join(second, "alice".into(), true, vec![1], JoinMode::Direct),
            Ok(Side::Top)
        );
        assert_eq!(state.player_count(), 1);
        assert_eq!(state.side_of(second_id), Some(Side::Top));
        assert!(state.take_outbox().iter().any(|out| matches!(
            out,
            Outbound::ToConn(conn, ServerMsg::Error { code, .. })
                if conn.id == first_id && code == "seat_taken"
        )));
    }

    #[test]
    fn closed_connection_seat_is_reclaimed_by_name() {
        let mut state = new_state();
        let (stale, stale_rx) = connection();
        state.join(stale, "alice".into(), false, vec![1], JoinMode::Direct).unwrap();
        drop(stale_rx);

        let (fresh, _fresh_rx) = connection();
        let fresh_id = fresh.id;
        assert_eq!(
            state.join(fresh, "alice".into(), false, vec![1], JoinMode::Direct),
            Ok(Side::Top)
        );
        assert_eq!(state.player_count(), 1);
        assert_eq!(state.side_of(fresh_id), Some(Side::Top));
    }

    #[test]
    fn ready_toggles_drive_countdown() {
        let mut state = new_state();
        let (a, _) = connection();
        let (b, _) = connection();
        state.join(a, "a".into(), false, vec![], JoinMode::Loading).unwrap();
        state.join(b, "b".into(), false, vec![], JoinMode::Loading).unwrap();
        state.take_outbox();

        state.toggle_ready(Side::Top);
        assert_eq!(state.phase, MatchPhase::Ready);
        state.toggle_ready(Side::Bottom);
        assert_eq!(state.phase, MatchPhase::Starting);
        assert!(events(&mut state)
            .iter()
            .any(|m| matches!(m, ServerMsg::GameStartReady { room_name } if room_name == "test")));

        state.toggle_ready(Side::Bottom);
        assert_eq!(state.phase, MatchPhase::Ready);

        state.toggle_ready(Side::Bottom);
        for _ in 0..secs_to_ticks(1.0) {
            state.tick();
        }
        assert_eq!(state.phase, MatchPhase::InProgress);
        assert!((state.puck.speed() - SERVE_SPEED).abs() < 1e-3);
        assert!(events(&mut state)
            .iter()
            .any(|m| matches!(m, ServerMsg::GameReady {})));
    }

    #[test]
    fn paddle_position_shows_up_in_next_state() {
        let mut state = new_state();
        let (a, _) = connection();
        state.join(a, "alice".into(), false, vec![], JoinMode::Loading).unwrap();

        state.queue_paddle(Side::Top, PaddleIntent::Position { x: 200.0, y: 50.0 });
        state.tick();

        let snapshot = SnapshotBuilder::snapshot(&state);
        assert_eq!(snapshot.paddles.top, Vec2::new(200.0, 50.0));
    }

    #[test]
    fn last_paddle_update_in_a_tick_wins() {
        let mut state = new_state();
        let (a, _) = connection();
        state.join(a, "alice".into(), false, vec![], JoinMode::Loading).unwrap();

        state.queue_paddle(Side::Top, PaddleIntent::Position { x: 190.0, y: 40.0 });
        state.queue_paddle(Side::Top, PaddleIntent::Position { x: 210.0, y: 60.0 });
        state.tick();
        assert_eq!(state.paddles().top, Vec2::new(210.0, 60.0));

        state.queue_paddle(Side::Top, PaddleIntent::Position { x: 210.0, y: 60.0 });
        state.tick();
        assert_eq!(state.paddles().top, Vec2::new(210.0, 60.0));
    }

    #[test]
    fn puck_in_top_opening_scores_for_bottom_and_reserves_toward_top() {
        let mut state = playing_state();
        park_paddles(&mut state);
        state.puck.pos = Vec2::new(203.0, 10.0);
        state.puck.vel = Vec2::new(0.0, -5.0);

        state.tick();
        state.tick();

        assert_eq!(state.scores, PerSide { top: 0, bottom: 1 });
        assert_eq!(state.puck.pos, board_center());
        assert!(state.puck.vel.y < 0.0);
        assert!((state.puck.speed() - SERVE_SPEED).abs() < 1e-3);
        assert!(events(&mut state)
            .iter()
            .any(|m| matches!(m, ServerMsg::Goal { scorer: Side::Bottom, .. })));
    }

    #[test]
    fn armed_boost_multiplies_speed_on_contact() {
        let mut state = playing_state();
        park_paddles(&mut state);
        state.activate_skill(Side::Top, 1);
        assert!(events(&mut state)
            .iter()
            .any(|m| matches!(m, ServerMsg::SkillActivated { side: Side::Top, skill_id: 1 })));

        if let Some(slot) = state.slots.get_mut(Side::Top) {
            slot.paddle = Vec2::new(200.0, 100.0);
        }
        state.puck.pos = Vec2::new(200.0, 129.0);
        state.puck.vel = Vec2::new(0.0, -4.0);
        state.tick();

        assert!((state.puck.speed() - 6.0).abs() < 1e-3);
        assert!(state.puck.vel.y > 0.0);
        let slot = state.slot(Side::Top).unwrap();
        assert!(slot.skills.engaged().is_none());
        assert!(slot.skills.on_cooldown(1, state.tick));

        let bounces = events(&mut state)
            .iter()
            .filter(|m| matches!(m, ServerMsg::Bounce {}))
            .count();
        assert_eq!(bounces, 1);
    }

    #[test]
    fn continued_contact_bounces_once() {
        let mut state = playing_state();
        park_paddles(&mut state);
        if let Some(slot) = state.slots.get_mut(Side::Bottom) {
            slot.paddle = Vec2::new(200.0, 500.0);
        }
        state.puck.pos = Vec2::new(200.0, 475.0);
        state.puck.vel = Vec2::new(0.0, 3.0);
        state.tick();
        // Chase the puck so the circles keep overlapping
        for _ in 0..3 {
            let puck = state.puck.pos;
            if let Some(slot) = state.slots.get_mut(Side::Bottom) {
                slot.paddle = Vec2::new(puck.x, puck.y + 20.0);
            }
            state.tick();
        }
        let bounces = events(&mut state)
            .iter()
            .filter(|m| matches!(m, ServerMsg::Bounce {}))
            .count();
        assert_eq!(bounces, 1);
    }

    #[test]
    fn skill_rejected_while_another_is_engaged() {
        let mut state = playing_state();
        state.activate_skill(Side::Top, 5);
        state.activate_skill(Side::Top, 1);
        let activations = events(&mut state)
            .iter()
            .filter(|m| matches!(m, ServerMsg::SkillActivated { .. }))
            .count();
        assert_eq!(activations, 1);
        assert_eq!(
            state.slot(Side::Top).and_then(|s| s.skills.engaged()).map(|e| e.skill_id()),
            Some(5)
        );
        assert!((state.goal_ratios().top - DEFAULT_GOAL_RATIO * 0.6).abs() < 1e-6);
        assert_eq!(state.goal_ratios().bottom, DEFAULT_GOAL_RATIO);
    }

    #[test]
    fn skills_are_ignored_before_play() {
        let mut state = new_state();
        let (a, _) = connection();
        state.join(a, "a".into(), false, vec![1], JoinMode::Loading).unwrap();
        state.take_outbox();
        state.activate_skill(Side::Top, 1);
        assert!(state.take_outbox().is_empty());
    }

    #[test]
    fn disconnect_resets_to_waiting_and_notifies_opponent() {
        let mut state = playing_state();
        state.scores = PerSide { top: 3, bottom: 2 };
        state.disconnect(Side::Bottom);

        assert_eq!(state.phase, MatchPhase::Waiting);
        assert_eq!(state.scores, PerSide { top: 0, bottom: 0 });
        assert_eq!(state.puck, Puck::centered());
        assert!(state.slot(Side::Bottom).is_none());
        assert!(!state.slot(Side::Top).unwrap().ready);

        let outbox = state.take_outbox();
        assert!(outbox.iter().any(|out| matches!(
            out,
            Outbound::To(Side::Top, ServerMsg::OpponentDisconnected {})
        )));
        assert!(state.take_record().is_none());
    }

    #[test]
    fn join_then_disconnect_returns_to_waiting() {
        let mut state = new_state();
        let (a, _) = connection();
        state.join(a, "a".into(), false, vec![], JoinMode::Direct).unwrap();
        state.disconnect(Side::Top);
        assert_eq!(state.phase, MatchPhase::Waiting);
        assert!(state.is_empty());
    }

    #[test]
    fn reaching_win_score_finishes_and_records() {
        let mut state = MatchState::new(
            "final",
            9,
            Arc::new(SkillCatalog::builtin()),
            GameSettings {
                win_score: 2,
                ..settings()
            },
        );
        let (a, _) = connection();
        let (b, _) = connection();
        state.join(a, "alice".into(), false, vec![], JoinMode::Direct).unwrap();
        state.join(b, "bob".into(), false, vec![], JoinMode::Direct).unwrap();
        for _ in 0..secs_to_ticks(1.0) {
            state.tick();
        }
        park_paddles(&mut state);

        for _ in 0..2 {
            state.puck.pos = Vec2::new(203.0, BOARD_HEIGHT - 2.0);
            state.puck.vel = Vec2::new(0.0, 5.0);
            state.tick();
        }

        assert_eq!(state.phase, MatchPhase::Finished);
        let record = state.take_record().unwrap();
        assert_eq!(record.player1, "alice");
        assert_eq!(record.score1, 2);
        assert_eq!(record.score2, 0);
        assert!(events(&mut state).iter().any(|m| matches!(
            m,
            ServerMsg::MatchEnd { winner: Side::Top, winner_username, .. } if winner_username == "alice"
        )));

        for _ in 0..secs_to_ticks(3.0) {
            state.tick();
        }
        assert_eq!(state.phase, MatchPhase::Ready);
        assert_eq!(state.scores, PerSide { top: 0, bottom: 0 });
    }

    #[test]
    fn idle_player_is_reported_during_play() {
        let mut state = playing_state_with(GameSettings {
            win_score: 1000,
            ..settings()
        });
        let limit = secs_to_ticks(30.0);
        for _ in 0..limit {
            state.tick();
            state.touch(Side::Top);
        }
        assert!(state.idle_sides().is_empty());
        state.tick();
        state.touch(Side::Top);
        assert_eq!(state.idle_sides(), vec![Side::Bottom]);
    }

    #[test]
    fn idle_player_is_reported_before_play() {
        let mut state = new_state();
        let (a, _a_rx) = connection();
        let (b, _b_rx) = connection();
        state.join(a, "a".into(), false, vec![], JoinMode::Loading).unwrap();
        state.join(b, "b".into(), false, vec![], JoinMode::Loading).unwrap();
        assert_eq!(state.phase, MatchPhase::Ready);

        let limit = secs_to_ticks(30.0);
        for _ in 0..=limit {
            state.tick();
            state.touch(Side::Bottom);
        }
        assert_eq!(state.phase, MatchPhase::Ready);
        assert_eq!(state.idle_sides(), vec![Side::Top]);
    }


    proptest! {
        #[test]
        fn scores_never_decrease_and_puck_stays_on_board(
            seed in any::<u64>(),
            moves in proptest::collection::vec((-100.0f32..100.0, -100.0f32..100.0), 1..200),
        ) {
            let mut state = MatchState::new(
                "prop",
                seed,
                Arc::new(SkillCatalog::builtin()),
                GameSettings { win_score: 1000, ..GameSettings::default() },
            );
            let (a, _ra) = connection();
            let (b, _rb) = connection();
            state.join(a, "a".into(), false, vec![1, 2], JoinMode::Direct).unwrap();
            state.join(b, "b".into(), false, vec![1, 2], JoinMode::Direct).unwrap();

            let mut last = state.scores;
            for (i, (dx, dy)) in moves.into_iter().enumerate() {
                let side = if i % 2 == 0 { Side::Top } else { Side::Bottom };
                state.queue_paddle(side, PaddleIntent::Delta { dx, dy });
                if i % 17 == 0 {
                    state.activate_skill(side, 1);
                }
                state.tick();
                prop_assert!(state.scores.top >= last.top);
                prop_assert!(state.scores.bottom >= last.bottom);
                prop_assert!(PhysicsSystem::in_bounds(&state.puck));
                last = state.scores;
                state.take_outbox();
            }
        }
    }
}
