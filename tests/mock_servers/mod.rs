//! Mock servers for integration testing
//!
//! Simulates an MPD instance so the client, watcher and HTTP surface can be
//! exercised end to end without a real daemon.

pub mod mpd;

pub use mpd::MockMpdServer;
