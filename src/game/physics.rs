//! Player movement and collision resolution
//!
//! A simplified acceleration/friction/impulse model, not a general physics
//! engine. All functions are pure; the room engine owns the mutation.

use super::math::Vec2;
use super::tuning::Tuning;

/// Accelerate velocity toward the desired velocity for this move input.
/// The step is clamped to `move_accel * dt`, never an instantaneous snap.
pub fn steer(velocity: Vec2, move_input: Vec2, tuning: &Tuning, dt: f32) -> Vec2 {
    let desired = if move_input.is_zero() {
        Vec2::ZERO
    } else {
        move_input.normalized() * tuning.move_speed
    };
    velocity.move_toward(desired, tuning.move_accel * dt)
}

/// Reduce speed by `friction * dt`. Direction is preserved; the magnitude
/// shrinks toward zero and never reverses sign. Friction drops to a fraction
/// while a dash is active so dashes retain momentum.
pub fn apply_friction(velocity: Vec2, dashing: bool, tuning: &Tuning, dt: f32) -> Vec2 {
    let friction = if dashing {
        tuning.friction * tuning.dash_friction_factor
    } else {
        tuning.friction
    };
    let speed = velocity.length();
    let new_speed = (speed - friction * dt).max(0.0);
    if new_speed <= 0.0 {
        return Vec2::ZERO;
    }
    velocity.with_length(new_speed)
}

/// Velocity after a dash impulse along `direction` (expected unit length).
pub fn dash_impulse(velocity: Vec2, direction: Vec2, tuning: &Tuning) -> Vec2 {
    velocity + direction * tuning.dash_impulse
}

/// Outcome of resolving one overlapping player pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairOutcome {
    /// Position correction for the first player
    pub shift_a: Vec2,
    /// Position correction for the second player
    pub shift_b: Vec2,
    /// Velocity change for the first player
    pub impulse_a: Vec2,
    /// Velocity change for the second player
    pub impulse_b: Vec2,
}

/// Resolve a player pair closer than twice the player radius.
///
/// Both are pushed apart symmetrically by half the overlap. A dashing
/// participant additionally shoves the other along the same normal, scaled
/// by overlap plus the pushback constant; two non-dashing players only
/// separate and gain no velocity.
pub fn resolve_pair(
    pos_a: Vec2,
    pos_b: Vec2,
    dashing_a: bool,
    dashing_b: bool,
    tuning: &Tuning,
) -> Option<PairOutcome> {
    let combined = tuning.player_radius * 2.0;
    let delta = pos_b - pos_a;
    let dist = delta.length();
    if dist >= combined {
        return None;
    }

    // Coincident players: separate along a fixed axis, deterministically
    let normal = if dist < 1e-3 {
        Vec2::new(1.0, 0.0)
    } else {
        delta * (1.0 / dist)
    };
    let overlap = combined - dist;
    let half = overlap * 0.5;

    let mut outcome = PairOutcome {
        shift_a: -normal * half,
        shift_b: normal * half,
        ..Default::default()
    };

    let pushback = overlap + tuning.dash_pushback;
    if dashing_a && !dashing_b {
        outcome.impulse_b = normal * pushback;
    } else if dashing_b && !dashing_a {
        outcome.impulse_a = -normal * pushback;
    } else if dashing_a && dashing_b {
        outcome.impulse_a = -normal * pushback;
        outcome.impulse_b = normal * pushback;
    }

    Some(outcome)
}
