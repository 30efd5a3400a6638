//! Exchange names, routing keys, and message types shared by Peril
//! servers and clients.

use serde::{Deserialize, Serialize};

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

pub const PAUSE_KEY: &str = "pause";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Binding key matching every player's game log.
pub fn game_log_pattern() -> String {
    format!("{GAME_LOG_SLUG}.*")
}

/// Sent on [`PAUSE_KEY`] to pause or resume every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayingState {
    pub is_paused: bool,
}

/// One line of game history, published by clients in bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    /// Milliseconds since the Unix epoch.
    pub current_time: u64,
    pub message: String,
    pub username: String,
}
