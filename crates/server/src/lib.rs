pub mod auth;
pub mod config;
pub mod error;
pub mod file_logging;
pub mod routes;
pub mod state;

pub use state::AppState;
