//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::grid::TileState;
use crate::game::tuning::Tuning;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Join the room this connection was opened against
    Join {
        /// Display name
        name: String,
        /// Optional cosmetic color (e.g. "#ff8800")
        color: Option<String>,
    },

    /// Toggle ready state in the lobby
    Ready { ready: bool },

    /// Player input for the current tick
    Input {
        /// Sequence number for client-side prediction reconciliation
        seq: u32,
        /// Move input X, clamped to [-1, 1] at the boundary
        move_x: f32,
        /// Move input Y, clamped to [-1, 1] at the boundary
        move_y: f32,
        /// Dash requested this message (edge-triggered)
        dash: bool,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Leave the room
    Leave,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message, sent directly to the joining socket
    Welcome {
        player_id: Uuid,
        room_id: String,
        /// Active gameplay constants
        tuning: Tuning,
        /// Cosmetic map seed
        seed: u64,
        grid_width: u32,
        grid_height: u32,
        server_time: u64,
    },

    /// Lobby roster, broadcast after every join/ready/leave
    LobbyState {
        players: Vec<LobbyPlayer>,
        min_players: usize,
        max_players: usize,
        all_ready: bool,
    },

    /// Countdown started
    Countdown {
        /// Absolute server timestamp the round starts at
        ends_at: u64,
        /// Server clock for client-side sync
        server_time: u64,
        seconds_remaining: u32,
    },

    /// Round started, with synchronized spawn assignments
    RoundStart {
        spawns: Vec<SpawnAssignment>,
        seed: u64,
    },

    /// Game state snapshot (sent at a slower cadence than the simulation)
    Snapshot {
        /// Server tick number
        tick: u64,
        server_time: u64,
        /// All current player states
        players: Vec<PlayerSnapshot>,
        /// Tiles that changed state since the last snapshot
        tiles: Vec<TileDelta>,
        /// Events that occurred since the last snapshot
        events: Vec<GameEvent>,
    },

    /// Round finished
    RoundOver {
        /// 1-based placements, best first
        placements: Vec<Placement>,
        /// Absent on a zero-survivor draw
        winner_id: Option<Uuid>,
    },

    /// Ranked leaderboard view (connected players only)
    Leaderboard { entries: Vec<LeaderboardRow> },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Lobby roster entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyPlayer {
    pub id: Uuid,
    pub name: String,
    pub color: Option<String>,
    pub ready: bool,
}

/// Spawn tile assignment for the round-start notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnAssignment {
    pub player_id: Uuid,
    pub tile_x: u32,
    pub tile_y: u32,
}

/// Player state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    /// Dash currently active
    pub dashing: bool,
    pub alive: bool,
    /// Highest input sequence the server accepted from this player
    pub last_input_seq: u32,
}

/// A tile whose state changed since the last snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileDelta {
    pub index: usize,
    pub state: TileState,
}

/// Discrete simulation events, consumed exactly once per snapshot drain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    TileShake { index: usize },
    TileFall { index: usize },
    Death { player_id: Uuid },
}

/// Final round placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub player_id: Uuid,
    /// 1-based, 1 = winner
    pub place: u32,
}

/// Ranked leaderboard entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub id: Uuid,
    pub name: String,
    pub wins: u32,
    pub games: u32,
    pub total_place: u32,
    /// Derived: total_place / games
    pub avg_place: f32,
}
