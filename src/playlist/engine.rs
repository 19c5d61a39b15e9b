//! Playlist reconciliation engine.
//!
//! Turns a sort request into the smallest change to the remote queue:
//! a cursor move when the queue already has the requested order, or a
//! full rewrite (`clear`, `add`…, `play`) submitted as one command list in
//! the background. Every prediction moves through
//! `Predicted → Confirmed | RolledBack`.
//!
//! A monotonic generation number tags the remembered sort. It is bumped
//! on every write, clear and rewrite completion, so a playlist snapshot
//! fetched under an older generation can never roll back a newer
//! prediction.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::sort::{sort_playlist, Filter, NOT_FOUND};
use crate::cache::{keys, ResourceCache};
use crate::mpd::song::files;
use crate::mpd::{Command, CommandList, Executor, MpdError, Song};

/// Default maximum queue length after weak filtering
pub const DEFAULT_CAP: usize = 9999;
/// Default bound on a background rewrite
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("playlist rewrite already in progress")]
    Busy,
    #[error("library not loaded yet")]
    NoLibrary,
    #[error(transparent)]
    Mpd(#[from] MpdError),
}

/// A sort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub keys: Vec<String>,
    pub filters: Vec<Filter>,
    /// Leading filters applied regardless of the cap
    pub must: usize,
    /// Record to follow, indexed in library order before sorting
    pub target: Option<usize>,
}

/// The `/api/music/playlist` resource. `sort`, `filters` and `must` are
/// present only while a remembered sort explains the live queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistView {
    pub current: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Predicted,
    Confirmed,
    RolledBack,
}

/// What a sort request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A rewrite was started; the view is the expected result.
    Predicted(PlaylistView),
    /// The queue already matched; only the cursor moved.
    Confirmed(PlaylistView),
}

impl Outcome {
    pub fn view(&self) -> &PlaylistView {
        match self {
            Outcome::Predicted(view) | Outcome::Confirmed(view) => view,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            Outcome::Predicted(_) => Lifecycle::Predicted,
            Outcome::Confirmed(_) => Lifecycle::Confirmed,
        }
    }
}

/// Result of checking a live playlist snapshot against the prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing remembered to check
    Unsorted,
    /// A rewrite holds the permit; recorded, not judged
    InFlight,
    /// Snapshot predates the current generation; order recorded, not judged
    Stale,
    Settled(Lifecycle),
}

#[derive(Debug, Clone)]
struct Applied {
    keys: Vec<String>,
    used_filters: Vec<Filter>,
    must: usize,
    predicted: Vec<String>,
    lifecycle: Lifecycle,
}

#[derive(Debug, Default)]
struct State {
    library: Option<Arc<Vec<Song>>>,
    live: Vec<String>,
    current: i64,
    applied: Option<Applied>,
    generation: u64,
}

impl State {
    fn view(&self) -> PlaylistView {
        match &self.applied {
            Some(applied) => PlaylistView {
                current: self.current,
                sort: Some(applied.keys.clone()),
                filters: Some(applied.used_filters.clone()),
                must: Some(applied.must),
            },
            None => PlaylistView {
                current: self.current,
                ..Default::default()
            },
        }
    }
}

struct Inner {
    executor: Arc<dyn Executor>,
    cache: Arc<ResourceCache>,
    cap: usize,
    background_timeout: Duration,
    permit: Arc<Semaphore>,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        executor: Arc<dyn Executor>,
        cache: Arc<ResourceCache>,
        cap: usize,
        background_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                cache,
                cap,
                background_timeout,
                permit: Arc::new(Semaphore::new(1)),
                state: Mutex::new(State {
                    current: NOT_FOUND,
                    ..Default::default()
                }),
            }),
        }
    }

    pub fn view(&self) -> PlaylistView {
        self.inner.state().view()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state().generation
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.inner.state().applied.as_ref().map(|a| a.lifecycle)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.permit.available_permits() == 0
    }

    /// Wait until no rewrite is in flight.
    pub async fn settle(&self) {
        let _ = self.inner.permit.acquire().await;
    }

    /// Reorder the remote queue. Rejected with [`EngineError::Busy`] while
    /// another rewrite is in flight.
    pub async fn sort(&self, spec: SortSpec) -> Result<Outcome, EngineError> {
        let permit = self.inner.permit.clone().try_acquire_owned().map_err(|_| {
            warn!("Playlist sort rejected: rewrite in progress");
            EngineError::Busy
        })?;

        let library = self
            .inner
            .state()
            .library
            .clone()
            .ok_or(EngineError::NoLibrary)?;
        let sorted = sort_playlist(
            &library,
            &spec.keys,
            &spec.filters,
            spec.must,
            self.inner.cap,
            spec.target,
        );
        let predicted = sorted.files();
        let new_pos = sorted.new_pos;
        let applied = |lifecycle| Applied {
            keys: spec.keys.clone(),
            used_filters: sorted.used_filters.clone(),
            must: spec.must,
            predicted: predicted.clone(),
            lifecycle,
        };

        let unchanged = self.inner.state().live == predicted;
        if unchanged {
            if new_pos != NOT_FOUND {
                self.inner
                    .executor
                    .exec(Command::new("play").arg(new_pos))
                    .await?;
            }
            {
                let mut state = self.inner.state();
                if new_pos != NOT_FOUND {
                    state.current = new_pos;
                }
                state.applied = Some(applied(Lifecycle::Confirmed));
                state.generation += 1;
            }
            drop(permit);
            debug!("Playlist already sorted, moved cursor to {}", new_pos);
            self.publish().await;
            return Ok(Outcome::Confirmed(self.view()));
        }

        let mut batch = CommandList::new();
        batch.push(Command::new("clear"));
        for file in &predicted {
            batch.push(Command::new("add").arg(file));
        }
        if new_pos != NOT_FOUND {
            batch.push(Command::new("play").arg(new_pos));
        }

        let (generation, view) = {
            let mut state = self.inner.state();
            state.current = new_pos;
            state.applied = Some(applied(Lifecycle::Predicted));
            state.generation += 1;
            (state.generation, state.view())
        };
        info!(
            "Rewriting playlist: {} songs, sort {:?}, filters {:?}",
            predicted.len(),
            spec.keys,
            view.filters
        );
        self.publish().await;

        tokio::spawn(apply(self.clone(), batch, predicted, generation, permit));
        Ok(Outcome::Predicted(view))
    }

    /// New library snapshot. A changed library invalidates the remembered sort.
    pub async fn observe_library(&self, songs: Vec<Song>) {
        let cleared = {
            let mut state = self.inner.state();
            if state.library.as_deref().is_some_and(|l| *l == songs) {
                false
            } else {
                state.library = Some(Arc::new(songs));
                if state.applied.take().is_some() {
                    state.generation += 1;
                    true
                } else {
                    false
                }
            }
        };
        if cleared {
            info!("Library changed, dropping playlist sort");
            self.publish().await;
        }
    }

    /// New live queue snapshot, fetched while the engine was at `generation`.
    pub async fn observe_playlist(&self, songs: &[Song], generation: u64) -> Verdict {
        let live = files(songs);
        let verdict = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            if self.is_busy() {
                state.live = live;
                Verdict::InFlight
            } else if state.generation != generation {
                state.live = live;
                Verdict::Stale
            } else {
                state.live = live;
                match state.applied.as_mut() {
                    None => Verdict::Unsorted,
                    Some(applied) if applied.predicted == state.live => {
                        applied.lifecycle = Lifecycle::Confirmed;
                        Verdict::Settled(Lifecycle::Confirmed)
                    }
                    Some(_) => {
                        state.applied = None;
                        state.generation += 1;
                        Verdict::Settled(Lifecycle::RolledBack)
                    }
                }
            }
        };

        match verdict {
            Verdict::Settled(Lifecycle::RolledBack) => {
                info!("Playlist changed outside the engine, dropping sort");
                self.publish().await;
            }
            Verdict::Stale => {
                debug!("Not judging playlist snapshot from generation {}", generation)
            }
            _ => {}
        }
        verdict
    }

    /// Playback cursor from `status` (`-1` when nothing is selected).
    pub async fn observe_position(&self, current: i64) {
        self.inner.state().current = current;
        self.publish().await;
    }

    async fn publish(&self) {
        let view = self.view();
        if let Err(e) = self.inner.cache.set_if_modified(keys::PLAYLIST, &view).await {
            warn!("Failed to cache playlist view: {}", e);
        }
    }
}

/// Submit the rewrite and settle the prediction. The permit is held until
/// the outcome is recorded.
async fn apply(
    engine: Engine,
    batch: CommandList,
    predicted: Vec<String>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
) {
    let deadline = engine.inner.background_timeout;
    let executor = engine.inner.executor.clone();
    // Runs to completion even past the deadline so the connection never
    // sees a half-read command list.
    let submit = tokio::spawn(async move { executor.exec_batch(batch).await });

    let result = match timeout(deadline, submit).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(e)) => Err(MpdError::Unexpected(format!("rewrite task failed: {}", e))),
        Err(_) => Err(MpdError::Timeout("playlist rewrite", deadline)),
    };

    let cleared = {
        let mut state = engine.inner.state();
        let current = state.generation == generation;
        state.generation += 1;
        match &result {
            Ok(()) => {
                state.live = predicted;
                if current {
                    if let Some(applied) = state.applied.as_mut() {
                        applied.lifecycle = Lifecycle::Confirmed;
                    }
                }
                false
            }
            Err(_) => current && state.applied.take().is_some(),
        }
    };

    match result {
        Ok(()) => info!("Playlist rewrite applied"),
        Err(e) => warn!("Playlist rewrite failed: {}", e),
    }
    if cleared {
        engine.publish().await;
    }
}
