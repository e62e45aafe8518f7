//! PGC Server
//!
//! HTTP decision service: configuration loading, the axum router, the
//! upstream HTTP rule source and endpoint safety checks. The binary in
//! `main.rs` wires these together with tracing, metrics and the background
//! refresh loop.

pub mod config;
pub mod routes;
pub mod security;
pub mod state;
pub mod upstream;

pub use config::PgcConfig;
pub use routes::{create_router, AppError};
pub use state::AppState;
pub use upstream::{build_source, HttpRuleSource};
