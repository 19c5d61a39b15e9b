//! MPD Mirror
//!
//! Mirrors the state of a Music Player Daemon as cacheable HTTP resources
//! and pushes change notifications over WebSocket.
//!
//! This library provides:
//! - An MPD protocol client with automatic reconnection
//! - An `idle` watcher that reports changed subsystems
//! - A resource cache with ETag/Last-Modified support and change broadcast
//! - A playlist engine that sorts, filters and rewrites the remote queue

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod mpd;
pub mod orchestrator;
pub mod playlist;
