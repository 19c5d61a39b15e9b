//! MPD protocol layer: connection, client, change watcher.

pub mod client;
pub mod command;
pub mod conn;
pub mod error;
pub mod response;
pub mod song;
pub mod watcher;

pub use client::{Client, ClientOptions, ConnectionState, Executor};
pub use command::{quote, Command, CommandList};
pub use conn::Connection;
pub use error::{AckError, MpdError};
pub use response::Response;
pub use song::Song;
pub use watcher::{Watcher, WatcherState, EVENT_BUFFER, RECONNECT_EVENT};
