//! slm-server — controller for the SLM fleet lifecycle manager
//!
//! Owns the node registry, heartbeat ingest, update planning and jobs,
//! backup execution, the code-drift detector, and the WebSocket event
//! stream. Single-writer: one controller process owns all state.

#![forbid(unsafe_code)]

pub mod backups;
pub mod config;
pub mod drift;
pub mod error;
pub mod events;
pub mod jobs;
pub mod registry;
pub mod routes;
pub mod state;
pub mod updates;
pub mod ws;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::AppState;
