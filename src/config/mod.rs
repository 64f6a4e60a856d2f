//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

use crate::game::tuning::Tuning;

/// Grid dimensions the server will accept
const MIN_GRID_DIM: u32 = 4;
const MAX_GRID_DIM: u32 = 64;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origin(s) for CORS, comma-separated, "*" for any
    pub client_origin: String,

    /// Grid width in tiles
    pub grid_width: u32,
    /// Grid height in tiles
    pub grid_height: u32,
    /// Room capacity
    pub max_players: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render-style hosts provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = Tuning::default();
        let grid_width = parse_or("GRID_WIDTH", defaults.grid_width)?;
        let grid_height = parse_or("GRID_HEIGHT", defaults.grid_height)?;
        let max_players = parse_or("MAX_PLAYERS", defaults.max_players)?;

        for (name, dim) in [("GRID_WIDTH", grid_width), ("GRID_HEIGHT", grid_height)] {
            if !(MIN_GRID_DIM..=MAX_GRID_DIM).contains(&dim) {
                return Err(ConfigError::OutOfRange(name));
            }
        }
        if !(2..=32).contains(&max_players) {
            return Err(ConfigError::OutOfRange("MAX_PLAYERS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            grid_width,
            grid_height,
            max_players,
        })
    }

    /// Gameplay constants for rooms created by this server
    pub fn tuning(&self) -> Tuning {
        Tuning {
            grid_width: self.grid_width,
            grid_height: self.grid_height,
            max_players: self.max_players,
            ..Tuning::default()
        }
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Could not parse environment variable: {0}")]
    Invalid(&'static str),

    #[error("Environment variable out of range: {0}")]
    OutOfRange(&'static str),
}
