//! Queue ordering and reconciliation with the remote playlist.

pub mod engine;
pub mod sort;

pub use engine::{
    Engine, EngineError, Lifecycle, Outcome, PlaylistView, SortSpec, Verdict,
    DEFAULT_BACKGROUND_TIMEOUT, DEFAULT_CAP,
};
pub use sort::{sort_playlist, Filter, Sorted, NOT_FOUND};
