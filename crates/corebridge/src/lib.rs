//! Local control server for a desktop proxy-engine UI.
//!
//! One HTTP listener carries:
//!
//! ```text
//! POST /api/login ------------------------> session-store
//! GET  /ws?token=... --------------------> event-bus Connection
//! ANY  /api/core/* ----------------------> core-gateway (loopback only)
//! POST /api/http/{request,download} -----> transfer (progress on the bus)
//! POST /api/exec/{background,kill} ------> exec (output on the bus)
//! POST /api/{logout,exit}
//! ```
//!
//! Everything except `/api/login` requires a session token.

pub mod auth;
pub mod config;
pub mod error;
pub mod exec;
pub mod server;
pub mod transfer;

pub use error::ApiError;
pub use server::{router, serve, AppState, SHUTDOWN_GRACE};
