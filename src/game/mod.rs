//! Game simulation modules

pub mod grid;
pub mod leaderboard;
pub mod math;
pub mod physics;
pub mod room;
pub mod scheduler;
pub mod snapshot;
pub mod tuning;

pub use room::{GameRoom, RoomHandle, RoomRegistry};

use crate::ws::protocol::ClientMsg;
use uuid::Uuid;

/// Player input received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub player_id: Uuid,
    pub msg: ClientMsg,
}
