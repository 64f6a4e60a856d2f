//! Gameplay tuning constants
//!
//! Every constant that shapes the simulation lives here so the welcome
//! payload can hand clients the exact values the server runs with.

use serde::{Deserialize, Serialize};

/// Active tuning constants for a room. Sent verbatim in the welcome payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// Grid width in tiles
    pub grid_width: u32,
    /// Grid height in tiles
    pub grid_height: u32,
    /// Tile edge length in world units
    pub tile_size: f32,
    /// Player collision radius
    pub player_radius: f32,

    /// Target move speed in units per second
    pub move_speed: f32,
    /// Acceleration toward desired velocity, units per second squared
    pub move_accel: f32,
    /// Friction, units per second squared (magnitude decay)
    pub friction: f32,
    /// Friction multiplier while a dash is active
    pub dash_friction_factor: f32,

    /// Velocity impulse added on dash
    pub dash_impulse: f32,
    /// How long a dash stays active (ms)
    pub dash_duration_ms: u64,
    /// Cooldown between dashes (ms)
    pub dash_cooldown_ms: u64,
    /// Extra pushback impulse applied to the non-dashing side of a collision
    pub dash_pushback: f32,

    /// Delay between a tile starting to shake and falling (ms)
    pub tile_fall_delay_ms: u64,
    /// Grace window standing on a fallen tile before elimination (ms)
    pub fall_grace_ms: u64,
    /// Interval between random hazard shakes (ms)
    pub hazard_interval_ms: u64,

    /// Lobby countdown duration (ms)
    pub countdown_ms: u64,
    /// Delay before a finished round resets to the lobby (ms)
    pub round_reset_delay_ms: u64,

    /// Minimum players to start a round
    pub min_players: usize,
    /// Room capacity
    pub max_players: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            grid_width: 16,
            grid_height: 16,
            tile_size: 64.0,
            player_radius: 18.0,

            move_speed: 260.0,
            move_accel: 1400.0,
            friction: 900.0,
            dash_friction_factor: 0.35,

            dash_impulse: 520.0,
            dash_duration_ms: 180,
            dash_cooldown_ms: 1200,
            dash_pushback: 140.0,

            tile_fall_delay_ms: 1200,
            fall_grace_ms: 300,
            hazard_interval_ms: 1000,

            countdown_ms: 3000,
            round_reset_delay_ms: 4000,

            min_players: 2,
            max_players: 8,
        }
    }
}
