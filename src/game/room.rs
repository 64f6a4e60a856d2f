//! Room state and authoritative tick loop
//!
//! One tokio task owns each room: inputs arrive over a channel and are
//! applied by the same task that advances the simulation, so player and
//! tile state never needs a lock.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::util::time::{tick_delta, unix_millis, SIMULATION_TPS, SNAPSHOT_TPS};
use crate::ws::protocol::{
    ClientMsg, GameEvent, LobbyPlayer, Placement, PlayerSnapshot, ServerMsg, SpawnAssignment,
};

use super::grid::{TileGrid, TileState};
use super::leaderboard::Leaderboard;
use super::math::Vec2;
use super::physics;
use super::scheduler::TickScheduler;
use super::snapshot::SnapshotAccumulator;
use super::tuning::Tuning;
use super::PlayerInput;

/// How long an empty room lingers before its task shuts down
const EMPTY_ROOM_LINGER: Duration = Duration::from_secs(10);

/// Round phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Waiting for players to ready up
    Lobby,
    /// Countdown before the round starts
    Countdown,
    /// Round in progress
    InRound,
    /// Round finished, frozen until the lobby reset
    RoundOver,
}

/// Per-connection input bookkeeping between arrival and the next physics
/// step. Never sent to clients.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    /// Latest move vector, components clamped to [-1, 1]
    pub move_input: Vec2,
    /// Edge-triggered dash request: set on press, cleared once consumed
    pub dash_requested: bool,
    /// Last nonzero movement direction, used as dash direction when the
    /// move input is momentarily zero
    pub last_dir: Vec2,
}

/// Player state in a room (authoritative)
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,

    pub position: Vec2,
    pub velocity: Vec2,
    pub alive: bool,
    pub ready: bool,

    /// Dash active until this timestamp (ms, absolute)
    pub dash_until: u64,
    /// Next dash allowed at this timestamp (ms, absolute)
    pub dash_cooldown_until: u64,

    /// Highest accepted input sequence; monotonically non-decreasing
    pub last_input_seq: u32,
    pub input: InputState,

    pub death_at: Option<u64>,
    /// Since when the player has stood on a fallen tile
    pub unsupported_since: Option<u64>,
    /// Join order, used for stable placement ties
    pub join_order: u64,
}

impl PlayerState {
    fn new(id: Uuid, name: String, color: Option<String>, spawn: Vec2, join_order: u64) -> Self {
        Self {
            id,
            name,
            color,
            position: spawn,
            velocity: Vec2::ZERO,
            alive: false,
            ready: false,
            dash_until: 0,
            dash_cooldown_until: 0,
            last_input_seq: 0,
            input: InputState::default(),
            death_at: None,
            unsupported_since: None,
            join_order,
        }
    }

    pub fn dashing(&self, now: u64) -> bool {
        now < self.dash_until
    }
}

/// Final result of one round
#[derive(Debug, Clone)]
pub struct RoundResult {
    /// 1-based placements, best first
    pub placements: Vec<Placement>,
    /// The single surviving player; absent on a zero-survivor draw
    pub winner: Option<Uuid>,
}

/// What a single tick produced, for the room task to broadcast
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub round_started: Option<Vec<SpawnAssignment>>,
    pub round_over: Option<RoundResult>,
}

/// Room state (owned by the room task)
pub struct RoomState {
    pub id: String,
    /// Cosmetic map seed, also seeds the room RNG
    pub seed: u64,
    pub phase: RoundPhase,
    pub tick: u64,
    pub players: BTreeMap<Uuid, PlayerState>,
    pub grid: TileGrid,
    pub tuning: Tuning,
    pub leaderboard: Leaderboard,
    rng: ChaCha8Rng,
    countdown_ends_at: Option<u64>,
    next_hazard_at: u64,
    join_counter: u64,
    accumulator: SnapshotAccumulator,
}

impl RoomState {
    pub fn new(id: String, seed: u64, tuning: Tuning) -> Self {
        let grid = TileGrid::new(tuning.grid_width, tuning.grid_height, tuning.tile_size);
        let snapshot_interval = SIMULATION_TPS / SNAPSHOT_TPS;
        Self {
            id,
            seed,
            phase: RoundPhase::Lobby,
            tick: 0,
            players: BTreeMap::new(),
            grid,
            tuning,
            leaderboard: Leaderboard::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            countdown_ends_at: None,
            next_hazard_at: 0,
            join_counter: 0,
            accumulator: SnapshotAccumulator::new(snapshot_interval),
        }
    }

    /// Count alive players
    pub fn alive_count(&self) -> usize {
        self.players.values().filter(|p| p.alive).count()
    }

    /// Add a player. Returns false when the room is full or the id is taken.
    pub fn join(&mut self, id: Uuid, name: String, color: Option<String>) -> bool {
        if self.players.len() >= self.tuning.max_players || self.players.contains_key(&id) {
            return false;
        }
        // Park newcomers at the grid center; they only get a real spawn
        // (and an alive flag) at round setup.
        let center = Vec2::new(
            self.grid.width() as f32 * self.tuning.tile_size * 0.5,
            self.grid.height() as f32 * self.tuning.tile_size * 0.5,
        );
        let order = self.join_counter;
        self.join_counter += 1;
        self.players
            .insert(id, PlayerState::new(id, name, color, center, order));
        true
    }

    pub fn set_ready(&mut self, id: Uuid, ready: bool) {
        if let Some(player) = self.players.get_mut(&id) {
            player.ready = ready;
        }
    }

    /// Apply a validated input message. Stale sequence numbers and unknown
    /// players are silently dropped.
    pub fn handle_input(&mut self, id: Uuid, seq: u32, move_x: f32, move_y: f32, dash: bool) {
        let Some(player) = self.players.get_mut(&id) else {
            return;
        };
        if seq <= player.last_input_seq {
            return;
        }
        player.last_input_seq = seq;

        let mv = Vec2::new(move_x, move_y).clamp(-1.0, 1.0);
        player.input.move_input = mv;
        if !mv.is_zero() {
            player.input.last_dir = mv.normalized();
        }
        if dash {
            player.input.dash_requested = true;
        }
    }

    /// Remove a player. Mid-round this follows the same elimination path as
    /// going off the grid; in lobby/round-over it is a plain removal.
    pub fn disconnect(&mut self, id: Uuid, now: u64) {
        if let Some(player) = self.players.get_mut(&id) {
            if self.phase == RoundPhase::InRound && player.alive {
                eliminate(player, now, &mut self.accumulator);
            }
        }
        self.players.remove(&id);

        // A countdown that lost too many players goes back to the lobby
        if self.phase == RoundPhase::Countdown && self.players.len() < self.tuning.min_players {
            self.phase = RoundPhase::Lobby;
            self.countdown_ends_at = None;
        }
    }

    pub fn all_ready(&self) -> bool {
        !self.players.is_empty() && self.players.values().all(|p| p.ready)
    }

    /// Rare-event trigger, driven after joins/ready toggles/disconnects
    /// rather than per tick. Returns the countdown deadline when started.
    pub fn maybe_start_countdown(&mut self, now: u64) -> Option<u64> {
        if self.phase != RoundPhase::Lobby {
            return None;
        }
        if self.players.len() < self.tuning.min_players || !self.all_ready() {
            return None;
        }
        let ends_at = now + self.tuning.countdown_ms;
        self.phase = RoundPhase::Countdown;
        self.countdown_ends_at = Some(ends_at);
        Some(ends_at)
    }

    /// Advance the simulation by one fixed step.
    pub fn tick(&mut self, now: u64, dt: f32) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.tick += 1;

        match self.phase {
            // Frozen: inputs may buffer, positions never change
            RoundPhase::Lobby | RoundPhase::RoundOver => {}
            RoundPhase::Countdown => {
                if self.countdown_ends_at.is_some_and(|at| now >= at) {
                    outcome.round_started = Some(self.start_round(now));
                }
            }
            RoundPhase::InRound => {
                self.step_players(now, dt);
                self.resolve_collisions(now);
                self.run_hazard_timer(now);
                self.settle_tile_falls(now);
                self.run_eliminations(now);
                outcome.round_over = self.check_round_end(now);
            }
        }

        outcome
    }

    /// Round setup on entering `InRound`.
    fn start_round(&mut self, now: u64) -> Vec<SpawnAssignment> {
        self.phase = RoundPhase::InRound;
        self.countdown_ends_at = None;
        self.grid.reset();

        let mut ring = self.grid.spawn_ring();
        ring.shuffle(&mut self.rng);

        let mut spawns = Vec::with_capacity(self.players.len());
        for (i, player) in self.players.values_mut().enumerate() {
            // Cyclic reuse when players outnumber ring cells
            let (tile_x, tile_y) = ring[i % ring.len()];
            let index = (tile_y * self.grid.width() + tile_x) as usize;
            player.position = self.grid.center_of(index);
            player.velocity = Vec2::ZERO;
            player.alive = true;
            player.death_at = None;
            player.unsupported_since = None;
            player.dash_until = 0;
            player.dash_cooldown_until = 0;
            player.last_input_seq = 0;
            player.input = InputState::default();
            spawns.push(SpawnAssignment {
                player_id: player.id,
                tile_x,
                tile_y,
            });
        }

        self.next_hazard_at = now + self.tuning.hazard_interval_ms;
        spawns
    }

    /// Dash trigger, steering, friction, integration, tile step trigger.
    fn step_players(&mut self, now: u64, dt: f32) {
        let Self {
            players,
            grid,
            accumulator,
            tuning,
            ..
        } = self;

        for player in players.values_mut().filter(|p| p.alive) {
            // Dash trigger: the request flag is consumed exactly once per
            // press; a press inside the cooldown is discarded, it does not
            // queue a dash for the cooldown's expiry
            if player.input.dash_requested {
                player.input.dash_requested = false;
                let dir = player.input.last_dir;
                if now >= player.dash_cooldown_until && !dir.is_zero() {
                    player.dash_until = now + tuning.dash_duration_ms;
                    player.dash_cooldown_until = now + tuning.dash_cooldown_ms;
                    player.velocity = physics::dash_impulse(player.velocity, dir, tuning);
                }
            }

            player.velocity = physics::steer(player.velocity, player.input.move_input, tuning, dt);
            player.velocity =
                physics::apply_friction(player.velocity, player.dashing(now), tuning, dt);
            player.position += player.velocity * dt;

            // Stepping on a solid tile destabilizes it
            if let Some(index) = grid.tile_at(player.position) {
                if grid.start_shake(index, now, tuning.tile_fall_delay_ms) {
                    accumulator.note_tile(index);
                    accumulator.push_event(GameEvent::TileShake { index });
                }
            }
        }
    }

    /// Pairwise separation plus dash pushback, in deterministic id order.
    fn resolve_collisions(&mut self, now: u64) {
        let ids: Vec<Uuid> = self
            .players
            .values()
            .filter(|p| p.alive)
            .map(|p| p.id)
            .collect();

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (pos_a, dash_a) = {
                    let p = &self.players[&ids[i]];
                    (p.position, p.dashing(now))
                };
                let (pos_b, dash_b) = {
                    let p = &self.players[&ids[j]];
                    (p.position, p.dashing(now))
                };

                let Some(out) = physics::resolve_pair(pos_a, pos_b, dash_a, dash_b, &self.tuning)
                else {
                    continue;
                };

                if let Some(a) = self.players.get_mut(&ids[i]) {
                    a.position += out.shift_a;
                    a.velocity += out.impulse_a;
                }
                if let Some(b) = self.players.get_mut(&ids[j]) {
                    b.position += out.shift_b;
                    b.velocity += out.impulse_b;
                }
            }
        }
    }

    /// Once per interval, shake a random still-solid tile so boards never
    /// stay fully static.
    fn run_hazard_timer(&mut self, now: u64) {
        if now < self.next_hazard_at {
            return;
        }
        self.next_hazard_at = now + self.tuning.hazard_interval_ms;
        if let Some(index) = self.grid.random_solid(&mut self.rng) {
            if self
                .grid
                .start_shake(index, now, self.tuning.tile_fall_delay_ms)
            {
                self.accumulator.note_tile(index);
                self.accumulator.push_event(GameEvent::TileShake { index });
            }
        }
    }

    /// Drop shaking tiles whose deadline passed. Runs after the movement
    /// pass so eliminations can see this tick's falls.
    fn settle_tile_falls(&mut self, now: u64) {
        for index in self.grid.settle_falls(now) {
            self.accumulator.note_tile(index);
            self.accumulator.push_event(GameEvent::TileFall { index });
        }
    }

    /// Off-grid is instant death; a fallen tile starts the unsupported
    /// timer, deferred while dashing, fatal once the grace window elapses.
    fn run_eliminations(&mut self, now: u64) {
        let Self {
            players,
            grid,
            accumulator,
            tuning,
            ..
        } = self;

        for player in players.values_mut().filter(|p| p.alive) {
            match grid.tile_at(player.position) {
                None => {
                    eliminate(player, now, accumulator);
                }
                Some(index) if grid.state(index) == TileState::Fallen => {
                    let since = *player.unsupported_since.get_or_insert(now);
                    if !player.dashing(now) && now.saturating_sub(since) > tuning.fall_grace_ms {
                        eliminate(player, now, accumulator);
                    }
                }
                Some(_) => {
                    player.unsupported_since = None;
                }
            }
        }
    }

    /// Finish the round once the alive count drops to one or zero.
    pub fn check_round_end(&mut self, _now: u64) -> Option<RoundResult> {
        if self.phase != RoundPhase::InRound || self.alive_count() > 1 {
            return None;
        }
        self.phase = RoundPhase::RoundOver;
        self.accumulator.force_next();

        // Survivors first in stable join order, then the eliminated by
        // death time descending (later death places better).
        let mut survivors: Vec<&PlayerState> = self.players.values().filter(|p| p.alive).collect();
        survivors.sort_by_key(|p| p.join_order);

        let mut eliminated: Vec<&PlayerState> = self
            .players
            .values()
            .filter(|p| !p.alive && p.death_at.is_some())
            .collect();
        eliminated.sort_by(|a, b| {
            b.death_at
                .cmp(&a.death_at)
                .then(a.join_order.cmp(&b.join_order))
        });

        let placements: Vec<Placement> = survivors
            .iter()
            .chain(eliminated.iter())
            .enumerate()
            .map(|(i, p)| Placement {
                player_id: p.id,
                place: (i + 1) as u32,
            })
            .collect();

        let winner = match survivors.as_slice() {
            [single] => Some(single.id),
            _ => None,
        };

        let stats: Vec<(Uuid, u32)> = placements.iter().map(|p| (p.player_id, p.place)).collect();
        self.leaderboard.record_round(&stats);

        Some(RoundResult { placements, winner })
    }

    /// Return to the lobby, clearing per-round state and ready flags.
    /// Driven by the room task's delay timer, not by the engine.
    pub fn reset_to_lobby(&mut self) {
        self.phase = RoundPhase::Lobby;
        self.countdown_ends_at = None;
        for player in self.players.values_mut() {
            player.ready = false;
            player.alive = false;
            player.velocity = Vec2::ZERO;
            player.death_at = None;
            player.unsupported_since = None;
            player.dash_until = 0;
            player.dash_cooldown_until = 0;
            player.input = InputState::default();
        }
    }

    /// Whether the snapshot cadence elapsed this tick.
    pub fn snapshot_due(&mut self) -> bool {
        self.accumulator.should_send()
    }

    /// Drain the accumulator into a broadcastable snapshot.
    pub fn drain_snapshot(&mut self, now: u64) -> ServerMsg {
        let players: Vec<PlayerSnapshot> = self
            .players
            .values()
            .map(|p| PlayerSnapshot {
                id: p.id,
                x: p.position.x,
                y: p.position.y,
                vel_x: p.velocity.x,
                vel_y: p.velocity.y,
                dashing: p.dashing(now),
                alive: p.alive,
                last_input_seq: p.last_input_seq,
            })
            .collect();

        let (tiles, events) = self.accumulator.drain(&self.grid);

        ServerMsg::Snapshot {
            tick: self.tick,
            server_time: now,
            players,
            tiles,
            events,
        }
    }

    /// Current lobby roster view.
    pub fn lobby_view(&self) -> ServerMsg {
        ServerMsg::LobbyState {
            players: self
                .players
                .values()
                .map(|p| LobbyPlayer {
                    id: p.id,
                    name: p.name.clone(),
                    color: p.color.clone(),
                    ready: p.ready,
                })
                .collect(),
            min_players: self.tuning.min_players,
            max_players: self.tuning.max_players,
            all_ready: self.all_ready(),
        }
    }

    /// Ranked leaderboard over currently-connected players.
    pub fn leaderboard_view(&self) -> ServerMsg {
        let connected: Vec<(Uuid, String)> = self
            .players
            .values()
            .map(|p| (p.id, p.name.clone()))
            .collect();
        ServerMsg::Leaderboard {
            entries: self.leaderboard.ranked(&connected),
        }
    }
}

/// Shared elimination path: death timestamp, flag, event.
fn eliminate(player: &mut PlayerState, now: u64, accumulator: &mut SnapshotAccumulator) {
    player.alive = false;
    player.death_at = Some(now);
    accumulator.push_event(GameEvent::Death {
        player_id: player.id,
    });
}

/// Handle to a running room
#[derive(Clone)]
pub struct RoomHandle {
    pub id: String,
    pub seed: u64,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub broadcast_tx: broadcast::Sender<ServerMsg>,
    pub player_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }
}

/// Registry of all active rooms; the only process-wide state.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    tuning: Tuning,
}

impl RoomRegistry {
    pub fn new(tuning: Tuning) -> Self {
        Self {
            rooms: DashMap::new(),
            tuning,
        }
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn get(&self, id: &str) -> Option<RoomHandle> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    /// Fetch a room, creating it (and spawning its task) on first join.
    pub fn get_or_create(self: &Arc<Self>, id: &str) -> RoomHandle {
        if let Some(handle) = self.get(id) {
            return handle;
        }

        use dashmap::mapref::entry::Entry;
        match self.rooms.entry(id.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let seed = rand::random::<u64>();
                let (room, handle) = GameRoom::new(id.to_string(), seed, self.tuning.clone());
                vacant.insert(handle.clone());

                let registry = self.clone();
                let room_id = id.to_string();
                tokio::spawn(async move {
                    room.run().await;
                    registry.rooms.remove(&room_id);
                    info!(room_id = %room_id, "Room removed from registry");
                });

                handle
            }
        }
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }
}

/// The authoritative room task
pub struct GameRoom {
    state: RoomState,
    input_rx: mpsc::Receiver<PlayerInput>,
    broadcast_tx: broadcast::Sender<ServerMsg>,
    player_count: Arc<AtomicUsize>,
    round_over_since: Option<Instant>,
}

impl GameRoom {
    /// Create a new room plus its handle
    pub fn new(id: String, seed: u64, tuning: Tuning) -> (Self, RoomHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (broadcast_tx, _) = broadcast::channel(64);
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = RoomHandle {
            id: id.clone(),
            seed,
            input_tx,
            broadcast_tx: broadcast_tx.clone(),
            player_count: player_count.clone(),
        };

        let room = Self {
            state: RoomState::new(id, seed, tuning),
            input_rx,
            broadcast_tx,
            player_count,
            round_over_since: None,
        };

        (room, handle)
    }

    /// Run the authoritative tick loop until the room empties out.
    pub async fn run(mut self) {
        info!(room_id = %self.state.id, seed = self.state.seed, "Room started");

        let period = Duration::from_micros(1_000_000 / SIMULATION_TPS as u64);
        let mut scheduler = TickScheduler::new(period);
        let mut empty_since: Option<Instant> = None;

        loop {
            tokio::time::sleep_until(tokio::time::Instant::from_std(scheduler.next_deadline()))
                .await;

            // Inputs cross into the room here, serialized with the ticks
            self.process_inputs();

            let due = scheduler.due_ticks(Instant::now());
            for _ in 0..due {
                self.run_tick();
            }

            // Round-over display delay, then back to the lobby
            if let Some(since) = self.round_over_since {
                if since.elapsed() >= Duration::from_millis(self.state.tuning.round_reset_delay_ms)
                {
                    self.round_over_since = None;
                    self.state.reset_to_lobby();
                    let _ = self.broadcast_tx.send(self.state.lobby_view());
                }
            }

            // Teardown-on-empty, with a grace period for the first join
            if self.state.players.is_empty() {
                let since = *empty_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= EMPTY_ROOM_LINGER {
                    break;
                }
            } else {
                empty_since = None;
            }
        }

        info!(room_id = %self.state.id, "Room empty, shutting down");
    }

    /// Advance the simulation one step and broadcast what it produced.
    fn run_tick(&mut self) {
        let now = unix_millis();
        let outcome = self.state.tick(now, tick_delta());

        if let Some(spawns) = outcome.round_started {
            info!(room_id = %self.state.id, players = spawns.len(), "Round started");
            let _ = self.broadcast_tx.send(ServerMsg::RoundStart {
                spawns,
                seed: self.state.seed,
            });
        }

        if let Some(result) = outcome.round_over {
            self.finish_round(result);
        }

        if self.state.snapshot_due() {
            let snapshot = self.state.drain_snapshot(now);
            let _ = self.broadcast_tx.send(snapshot);
        }
    }

    fn finish_round(&mut self, result: RoundResult) {
        info!(
            room_id = %self.state.id,
            winner = ?result.winner,
            "Round over"
        );
        self.round_over_since = Some(Instant::now());
        let _ = self.broadcast_tx.send(ServerMsg::RoundOver {
            placements: result.placements,
            winner_id: result.winner,
        });
        let _ = self.broadcast_tx.send(self.state.leaderboard_view());
    }

    /// Process all pending inputs from players
    fn process_inputs(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            let now = unix_millis();
            match input.msg {
                ClientMsg::Join { name, color } => {
                    self.handle_join(input.player_id, name, color, now);
                }
                ClientMsg::Ready { ready } => {
                    self.handle_ready(input.player_id, ready, now);
                }
                ClientMsg::Input {
                    seq,
                    move_x,
                    move_y,
                    dash,
                } => {
                    self.state.handle_input(input.player_id, seq, move_x, move_y, dash);
                }
                ClientMsg::Ping { t } => {
                    let _ = self.broadcast_tx.send(ServerMsg::Pong { t });
                }
                ClientMsg::Leave => {
                    self.handle_leave(input.player_id, now);
                }
            }
        }
    }

    fn handle_join(&mut self, player_id: Uuid, name: String, color: Option<String>, now: u64) {
        if self.state.players.contains_key(&player_id) {
            warn!(room_id = %self.state.id, player_id = %player_id, "Player already in room");
            return;
        }
        if !self.state.join(player_id, name, color) {
            warn!(room_id = %self.state.id, player_id = %player_id, "Join rejected, room full");
            let _ = self.broadcast_tx.send(ServerMsg::Error {
                code: "room_full".to_string(),
                message: "Room is full".to_string(),
            });
            return;
        }
        self.player_count
            .store(self.state.players.len(), Ordering::Relaxed);

        info!(
            room_id = %self.state.id,
            player_id = %player_id,
            player_count = self.state.players.len(),
            "Player joined room"
        );

        let _ = self.broadcast_tx.send(self.state.lobby_view());
        let _ = self.broadcast_tx.send(self.state.leaderboard_view());
        self.announce_countdown(now);
    }

    fn handle_ready(&mut self, player_id: Uuid, ready: bool, now: u64) {
        self.state.set_ready(player_id, ready);
        let _ = self.broadcast_tx.send(self.state.lobby_view());
        self.announce_countdown(now);
    }

    fn handle_leave(&mut self, player_id: Uuid, now: u64) {
        if !self.state.players.contains_key(&player_id) {
            return;
        }
        self.state.disconnect(player_id, now);
        self.player_count
            .store(self.state.players.len(), Ordering::Relaxed);

        info!(
            room_id = %self.state.id,
            player_id = %player_id,
            "Player left room"
        );

        // A mid-round disconnect can end the round
        if let Some(result) = self.state.check_round_end(now) {
            self.finish_round(result);
        }
        let _ = self.broadcast_tx.send(self.state.lobby_view());
        self.announce_countdown(now);
    }

    /// Countdown start is a rare-event trigger, evaluated after roster or
    /// ready changes.
    fn announce_countdown(&mut self, now: u64) {
        if let Some(ends_at) = self.state.maybe_start_countdown(now) {
            info!(room_id = %self.state.id, "Countdown started");
            let _ = self.broadcast_tx.send(ServerMsg::Countdown {
                ends_at,
                server_time: now,
                seconds_remaining: ((ends_at - now) as u32).div_ceil(1000),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / SIMULATION_TPS as f32;
    const STEP_MS: u64 = 1000 / SIMULATION_TPS as u64;

    fn uid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn room() -> RoomState {
        RoomState::new("test".to_string(), 42, Tuning::default())
    }

    /// Join two players, ready them, and run the countdown out.
    /// Returns the state in `InRound` and the timestamp after round start.
    fn start_two_player_round(state: &mut RoomState, mut now: u64) -> u64 {
        assert!(state.join(uid(1), "a".to_string(), None));
        assert!(state.join(uid(2), "b".to_string(), None));
        state.set_ready(uid(1), true);
        state.set_ready(uid(2), true);
        assert!(state.maybe_start_countdown(now).is_some());
        assert_eq!(state.phase, RoundPhase::Countdown);

        now += state.tuning.countdown_ms;
        let outcome = state.tick(now, DT);
        assert!(outcome.round_started.is_some());
        assert_eq!(state.phase, RoundPhase::InRound);
        now
    }

    /// Park a player somewhere specific mid-test.
    fn place(state: &mut RoomState, id: Uuid, pos: Vec2) {
        let player = state.players.get_mut(&id).unwrap();
        player.position = pos;
        player.velocity = Vec2::ZERO;
    }

    #[test]
    fn test_lobby_positions_frozen() {
        let mut state = room();
        state.join(uid(1), "a".to_string(), None);
        state.handle_input(uid(1), 1, 1.0, 0.0, false);
        let before = state.players[&uid(1)].position;

        let mut now = 1000;
        for _ in 0..60 {
            now += STEP_MS;
            state.tick(now, DT);
        }
        assert_eq!(state.players[&uid(1)].position, before);
    }

    #[test]
    fn test_countdown_buffers_input_without_movement() {
        let mut state = room();
        state.join(uid(1), "a".to_string(), None);
        state.join(uid(2), "b".to_string(), None);
        state.set_ready(uid(1), true);
        state.set_ready(uid(2), true);
        let now = 1000;
        state.maybe_start_countdown(now).unwrap();

        state.handle_input(uid(1), 1, 1.0, 0.0, false);
        let before = state.players[&uid(1)].position;
        state.tick(now + STEP_MS, DT);
        // Buffered but not applied
        assert_eq!(state.players[&uid(1)].position, before);
        assert_eq!(state.players[&uid(1)].input.move_input, Vec2::new(1.0, 0.0));
    }

    #[test]
    fn test_countdown_requires_all_ready_and_min_players() {
        let mut state = room();
        state.join(uid(1), "a".to_string(), None);
        state.set_ready(uid(1), true);
        // One ready player is not enough
        assert!(state.maybe_start_countdown(0).is_none());

        state.join(uid(2), "b".to_string(), None);
        assert!(state.maybe_start_countdown(0).is_none());
        state.set_ready(uid(2), true);
        assert!(state.maybe_start_countdown(0).is_some());
    }

    #[test]
    fn test_round_setup_spawns_on_ring() {
        let mut state = room();
        start_two_player_round(&mut state, 1000);

        for player in state.players.values() {
            assert!(player.alive);
            assert_eq!(player.velocity, Vec2::ZERO);
            assert_eq!(player.last_input_seq, 0);
            let index = state.grid.tile_at(player.position).unwrap();
            assert_eq!(state.grid.state(index), TileState::Solid);
        }
    }

    #[test]
    fn test_step_shakes_tile_once_and_schedules_fall() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        // Keep the hazard timer out of the way
        state.next_hazard_at = u64::MAX;

        let index = state.grid.tile_at(state.players[&uid(1)].position).unwrap();
        now += STEP_MS;
        state.tick(now, DT);
        assert_eq!(state.grid.state(index), TileState::Shaking);

        let (_, events) = state.accumulator.drain(&state.grid);
        let shakes = events
            .iter()
            .filter(|e| matches!(e, GameEvent::TileShake { index: i } if *i == index))
            .count();
        assert_eq!(shakes, 1);

        // Standing still on the shaking tile: no re-trigger
        now += STEP_MS;
        state.tick(now, DT);
        let (_, events) = state.accumulator.drain(&state.grid);
        assert!(events
            .iter()
            .all(|e| !matches!(e, GameEvent::TileShake { index: i } if *i == index)));
    }

    #[test]
    fn test_fallen_tile_eliminates_after_grace() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;

        let index = state.grid.tile_at(state.players[&uid(1)].position).unwrap();
        now += STEP_MS;
        state.tick(now, DT); // tile starts shaking under player 1
        let falls_at = now + state.tuning.tile_fall_delay_ms;

        // Advance to the first tick at or past the fall deadline
        while now < falls_at {
            now += STEP_MS;
            state.tick(now, DT);
        }
        assert_eq!(state.grid.state(index), TileState::Fallen);
        // Unsupported timer started the same tick the tile fell
        assert!(state.players[&uid(1)].unsupported_since.is_some());
        assert!(state.players[&uid(1)].alive);

        // Grace window expiry eliminates
        let deadline = now + state.tuning.fall_grace_ms;
        while now <= deadline {
            now += STEP_MS;
            state.tick(now, DT);
        }
        assert!(!state.players[&uid(1)].alive);
        assert_eq!(state.phase, RoundPhase::RoundOver);
    }

    #[test]
    fn test_off_grid_is_instant_death_even_while_dashing() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;

        // Force an active dash, then step off the map
        let player = state.players.get_mut(&uid(1)).unwrap();
        player.dash_until = now + 10_000;
        place(&mut state, uid(1), Vec2::new(-50.0, -50.0));

        now += STEP_MS;
        state.tick(now, DT);
        assert!(!state.players[&uid(1)].alive);
        assert_eq!(state.players[&uid(1)].death_at, Some(now));
    }

    #[test]
    fn test_dash_defers_fallen_tile_elimination() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;

        let index = state.grid.tile_at(state.players[&uid(1)].position).unwrap();
        state.grid.start_shake(index, now, 0);
        state.grid.settle_falls(now);

        // Dashing across the gap: alive well past the grace window
        state.players.get_mut(&uid(1)).unwrap().dash_until = now + 10_000;
        let deadline = now + state.tuning.fall_grace_ms * 3;
        while now <= deadline {
            now += STEP_MS;
            state.tick(now, DT);
        }
        assert!(state.players[&uid(1)].alive);
    }

    #[test]
    fn test_dash_cooldown_allows_single_impulse() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;
        // Park the players apart so collisions stay out of the picture
        let p1_pos = state.grid.center_of(0);
        let p2_pos = state.grid.center_of(state.grid.len() - 1);
        place(&mut state, uid(1), p1_pos);
        place(&mut state, uid(2), p2_pos);

        // Establish a dash direction, then request two dashes inside one
        // cooldown window
        state.handle_input(uid(1), 1, 1.0, 0.0, true);
        now += STEP_MS;
        state.tick(now, DT);
        let first_dash_until = state.players[&uid(1)].dash_until;
        assert!(first_dash_until > now);

        state.handle_input(uid(1), 2, 1.0, 0.0, true);
        now += STEP_MS;
        state.tick(now, DT);
        // Second request is consumed by the cooldown gate: no new dash
        assert_eq!(state.players[&uid(1)].dash_until, first_dash_until);

        // After the cooldown, a third request succeeds
        now += state.tuning.dash_cooldown_ms;
        state.handle_input(uid(1), 3, 1.0, 0.0, true);
        now += STEP_MS;
        state.tick(now, DT);
        assert!(state.players[&uid(1)].dash_until > first_dash_until);
    }

    #[test]
    fn test_zero_direction_dash_is_consumed_without_impulse() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;
        let p1_pos = state.grid.center_of(0);
        let p2_pos = state.grid.center_of(state.grid.len() - 1);
        place(&mut state, uid(1), p1_pos);
        place(&mut state, uid(2), p2_pos);

        // Dash requested with no movement history: no impulse
        state.handle_input(uid(1), 1, 0.0, 0.0, true);
        now += STEP_MS;
        state.tick(now, DT);
        let player = &state.players[&uid(1)];
        assert_eq!(player.dash_until, 0);
        assert!(!player.input.dash_requested);
    }

    #[test]
    fn test_stale_input_sequence_dropped() {
        let mut state = room();
        state.join(uid(1), "a".to_string(), None);
        state.handle_input(uid(1), 5, 1.0, 0.0, false);
        assert_eq!(state.players[&uid(1)].last_input_seq, 5);

        state.handle_input(uid(1), 5, -1.0, 0.0, false);
        state.handle_input(uid(1), 3, -1.0, 0.0, false);
        // Stale messages ignored; move input unchanged
        assert_eq!(state.players[&uid(1)].input.move_input, Vec2::new(1.0, 0.0));
        assert_eq!(state.players[&uid(1)].last_input_seq, 5);

        // Unknown players are silently ignored
        state.handle_input(uid(9), 1, 1.0, 0.0, false);
    }

    #[test]
    fn test_round_ends_exactly_at_one_alive() {
        let mut state = room();
        let mut now = 1000;
        state.join(uid(1), "a".to_string(), None);
        state.join(uid(2), "b".to_string(), None);
        state.join(uid(3), "c".to_string(), None);
        for id in [uid(1), uid(2), uid(3)] {
            state.set_ready(id, true);
        }
        state.maybe_start_countdown(now).unwrap();
        now += state.tuning.countdown_ms;
        state.tick(now, DT);
        assert_eq!(state.phase, RoundPhase::InRound);
        state.next_hazard_at = u64::MAX;

        // One death out of three: round keeps going
        place(&mut state, uid(3), Vec2::new(-10.0, -10.0));
        now += STEP_MS;
        state.tick(now, DT);
        assert_eq!(state.phase, RoundPhase::InRound);
        assert_eq!(state.alive_count(), 2);

        // Second death leaves one alive: round over
        place(&mut state, uid(2), Vec2::new(-10.0, -10.0));
        now += STEP_MS;
        let outcome = state.tick(now, DT);
        let result = outcome.round_over.expect("round should end");
        assert_eq!(state.phase, RoundPhase::RoundOver);
        assert_eq!(result.winner, Some(uid(1)));
    }

    #[test]
    fn test_placement_orders_later_deaths_better() {
        let mut state = room();
        let mut now = 1000;
        state.join(uid(1), "a".to_string(), None);
        state.join(uid(2), "b".to_string(), None);
        state.join(uid(3), "c".to_string(), None);
        for id in [uid(1), uid(2), uid(3)] {
            state.set_ready(id, true);
        }
        state.maybe_start_countdown(now).unwrap();
        now += state.tuning.countdown_ms;
        state.tick(now, DT);
        state.next_hazard_at = u64::MAX;

        // B dies first, C dies later, A survives
        place(&mut state, uid(2), Vec2::new(-10.0, -10.0));
        now += STEP_MS;
        state.tick(now, DT);

        place(&mut state, uid(3), Vec2::new(-10.0, -10.0));
        now += 100;
        let outcome = state.tick(now, DT);
        let result = outcome.round_over.unwrap();

        let order: Vec<Uuid> = result.placements.iter().map(|p| p.player_id).collect();
        assert_eq!(order, vec![uid(1), uid(3), uid(2)]);
        assert_eq!(result.placements[0].place, 1);
        assert_eq!(result.placements[2].place, 3);
        assert_eq!(result.winner, Some(uid(1)));

        // Leaderboard saw the round
        assert_eq!(state.leaderboard.entry(&uid(1)).unwrap().wins, 1);
        assert_eq!(state.leaderboard.entry(&uid(2)).unwrap().games, 1);
    }

    #[test]
    fn test_simultaneous_wipe_is_a_draw() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;

        // Both players off the grid in the same tick
        place(&mut state, uid(1), Vec2::new(-10.0, -10.0));
        place(&mut state, uid(2), Vec2::new(-20.0, -20.0));
        now += STEP_MS;
        let outcome = state.tick(now, DT);
        let result = outcome.round_over.unwrap();

        assert_eq!(result.winner, None);
        assert_eq!(result.placements.len(), 2);
        assert_eq!(result.placements[0].place, 1);
    }

    #[test]
    fn test_disconnect_mid_round_eliminates_first() {
        let mut state = room();
        let mut now = 1000;
        state.join(uid(1), "a".to_string(), None);
        state.join(uid(2), "b".to_string(), None);
        state.join(uid(3), "c".to_string(), None);
        for id in [uid(1), uid(2), uid(3)] {
            state.set_ready(id, true);
        }
        state.maybe_start_countdown(now).unwrap();
        now += state.tuning.countdown_ms;
        state.tick(now, DT);
        state.next_hazard_at = u64::MAX;

        state.disconnect(uid(2), now);
        assert!(!state.players.contains_key(&uid(2)));
        assert_eq!(state.alive_count(), 2);
        assert_eq!(state.phase, RoundPhase::InRound);

        // The death event went into the accumulator
        let (_, events) = state.accumulator.drain(&state.grid);
        assert!(events.contains(&GameEvent::Death { player_id: uid(2) }));

        // Lobby disconnects have no elimination side effect
        let mut lobby = room();
        lobby.join(uid(1), "a".to_string(), None);
        lobby.disconnect(uid(1), now);
        let (_, events) = lobby.accumulator.drain(&lobby.grid);
        assert!(events.is_empty());
    }

    #[test]
    fn test_reset_to_lobby_clears_round_state() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        state.next_hazard_at = u64::MAX;

        place(&mut state, uid(1), Vec2::new(-10.0, -10.0));
        now += STEP_MS;
        state.tick(now, DT);
        assert_eq!(state.phase, RoundPhase::RoundOver);

        state.reset_to_lobby();
        assert_eq!(state.phase, RoundPhase::Lobby);
        for player in state.players.values() {
            assert!(!player.ready);
            assert!(!player.alive);
            assert_eq!(player.death_at, None);
        }

        // The room can run another round
        state.set_ready(uid(1), true);
        state.set_ready(uid(2), true);
        now += STEP_MS;
        assert!(state.maybe_start_countdown(now).is_some());
    }

    #[test]
    fn test_random_hazard_shakes_on_interval() {
        let mut state = room();
        let mut now = start_two_player_round(&mut state, 1000);
        // Park players off their tiles' influence by clearing what they shake
        let hazard_at = state.next_hazard_at;
        assert_eq!(hazard_at, now + state.tuning.hazard_interval_ms);

        while now < hazard_at {
            now += STEP_MS;
            state.tick(now, DT);
        }

        let shaking = (0..state.grid.len())
            .filter(|&i| state.grid.state(i) != TileState::Solid)
            .count();
        // At least one tile beyond the two the players are standing on
        assert!(shaking >= 3, "expected hazard shake, got {shaking}");
        assert_eq!(state.next_hazard_at, now + state.tuning.hazard_interval_ms);
    }

    #[test]
    fn test_room_capacity_enforced() {
        let mut state = room();
        for n in 0..state.tuning.max_players as u8 {
            assert!(state.join(uid(n + 1), format!("p{n}"), None));
        }
        assert!(!state.join(uid(100), "late".to_string(), None));
        // Duplicate ids are refused too
        assert!(!state.join(uid(1), "dup".to_string(), None));
    }

    #[test]
    fn test_snapshot_reports_players_and_acked_seq() {
        let mut state = room();
        let now = start_two_player_round(&mut state, 1000);
        state.handle_input(uid(1), 7, 0.5, 0.0, false);

        let msg = state.drain_snapshot(now);
        let ServerMsg::Snapshot { players, .. } = msg else {
            panic!("expected snapshot");
        };
        assert_eq!(players.len(), 2);
        let p1 = players.iter().find(|p| p.id == uid(1)).unwrap();
        assert_eq!(p1.last_input_seq, 7);
        assert!(p1.alive);
    }
}
