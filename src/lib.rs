//! Single-file HTTP download server with paced transfers and a per-client
//! cap on concurrent downloads.

pub mod config;
pub mod error;
pub mod handler;
pub mod pacing;
pub mod planner;
pub mod range;
pub mod registry;
pub mod server;
pub mod session;
pub mod trace;
