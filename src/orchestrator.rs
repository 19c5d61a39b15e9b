//! Orchestrator: turns watcher events into cache refreshes.
//!
//! Which resources a subsystem event invalidates is data
//! ([`dispatch_table`]), not control flow. Events are handled one at a
//! time, in server order; a failing refresh is logged and the remaining
//! ones still run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{keys, ResourceCache};
use crate::mpd::song::{parse_song, parse_songs};
use crate::mpd::{Command, CommandList, Executor, Response, RECONNECT_EVENT};
use crate::playlist::{Engine, NOT_FOUND};

/// One unit of refresh work: fetch from the server, update the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Refresh {
    Version,
    Status,
    CurrentSong,
    Playlist,
    Library,
    Stats,
    Outputs,
}

impl Refresh {
    /// Every refresh, in the order a full resync runs them. The library
    /// goes before the playlist so queue snapshots meet a loaded library.
    pub const ALL: [Refresh; 7] = [
        Refresh::Version,
        Refresh::Library,
        Refresh::Stats,
        Refresh::Playlist,
        Refresh::Status,
        Refresh::CurrentSong,
        Refresh::Outputs,
    ];
}

/// Subsystem name → refreshes to run, in order.
pub fn dispatch_table() -> HashMap<&'static str, Vec<Refresh>> {
    HashMap::from([
        ("database", vec![Refresh::Library, Refresh::Stats]),
        ("update", vec![Refresh::Status]),
        ("playlist", vec![Refresh::Playlist]),
        ("player", vec![Refresh::Status, Refresh::CurrentSong]),
        ("mixer", vec![Refresh::Status]),
        ("options", vec![Refresh::Status]),
        ("output", vec![Refresh::Outputs]),
        (RECONNECT_EVENT, Refresh::ALL.to_vec()),
    ])
}

/// `/api/version`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionView {
    pub app: String,
    pub version: String,
    pub mpd: String,
}

/// `/api/music`: player state from `status` and `replay_gain_status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlayerView {
    pub state: String,
    pub song: i64,
    pub song_elapsed: f64,
    pub song_length: f64,
    pub volume: i32,
    pub repeat: bool,
    pub random: bool,
    pub single: bool,
    pub oneshot: bool,
    pub consume: bool,
    pub crossfade: u32,
    pub replay_gain: String,
    pub playlist_length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlayerView {
    pub fn from_status(status: &Response, replay_gain: &Response) -> Self {
        let single = status.get("single").unwrap_or("0");
        Self {
            state: status.get("state").unwrap_or("stop").to_string(),
            song: status.parse("song").unwrap_or(NOT_FOUND),
            song_elapsed: status.parse("elapsed").unwrap_or(0.0),
            song_length: status.parse("duration").unwrap_or(0.0),
            volume: status.parse("volume").unwrap_or(-1),
            repeat: status.flag("repeat"),
            random: status.flag("random"),
            single: single != "0",
            oneshot: single == "oneshot",
            consume: status.flag("consume"),
            crossfade: status.parse("xfade").unwrap_or(0),
            replay_gain: replay_gain
                .get("replay_gain_mode")
                .unwrap_or("off")
                .to_string(),
            playlist_length: status.parse("playlistlength").unwrap_or(0),
            error: status.get("error").map(str::to_string),
        }
    }
}

/// `/api/music/library`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryView {
    pub updating: bool,
}

/// One entry of `/api/music/outputs`, keyed by output id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputView {
    pub name: String,
    pub plugin: String,
    pub enabled: bool,
}

pub fn parse_outputs(response: &Response) -> BTreeMap<String, OutputView> {
    let mut outputs = BTreeMap::new();
    let mut id: Option<String> = None;
    for (key, value) in response.pairs() {
        match key.as_str() {
            "outputid" => {
                id = Some(value.clone());
                outputs.insert(
                    value.clone(),
                    OutputView {
                        name: String::new(),
                        plugin: String::new(),
                        enabled: false,
                    },
                );
            }
            _ => {
                let Some(output) = id.as_ref().and_then(|id| outputs.get_mut(id)) else {
                    continue;
                };
                match key.as_str() {
                    "outputname" => output.name = value.clone(),
                    "plugin" => output.plugin = value.clone(),
                    "outputenabled" => output.enabled = value == "1",
                    _ => {}
                }
            }
        }
    }
    outputs
}

/// `stats` counters; non-numeric values are dropped.
pub fn parse_stats(response: &Response) -> BTreeMap<String, u64> {
    response
        .pairs()
        .iter()
        .filter_map(|(k, v)| v.parse().ok().map(|n| (k.clone(), n)))
        .collect()
}

pub struct Orchestrator {
    executor: Arc<dyn Executor>,
    cache: Arc<ResourceCache>,
    engine: Engine,
    table: HashMap<&'static str, Vec<Refresh>>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn Executor>, cache: Arc<ResourceCache>, engine: Engine) -> Self {
        Self {
            executor,
            cache,
            engine,
            table: dispatch_table(),
        }
    }

    /// Full resync, then one event at a time until `shutdown` fires or the
    /// event stream ends. Subscribe to `events` before calling so nothing
    /// reported during the initial resync is missed.
    pub async fn run<S>(self, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = String> + Send,
    {
        tokio::pin!(events);
        info!("Orchestrator started");
        self.refresh_all().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(subsystem) => self.handle(&subsystem).await,
                    None => break,
                },
            }
        }
        info!("Orchestrator stopped");
    }

    pub async fn refresh_all(&self) {
        for refresh in Refresh::ALL {
            self.run_refresh(refresh).await;
        }
    }

    /// Run every refresh mapped to `subsystem`.
    pub async fn handle(&self, subsystem: &str) {
        let Some(refreshes) = self.table.get(subsystem) else {
            debug!("No refresh mapped to subsystem {}", subsystem);
            return;
        };
        for refresh in refreshes.clone() {
            self.run_refresh(refresh).await;
        }
    }

    async fn run_refresh(&self, refresh: Refresh) {
        if let Err(e) = self.refresh(refresh).await {
            warn!("Refresh {:?} failed: {}", refresh, e);
        }
    }

    pub async fn refresh(&self, refresh: Refresh) -> Result<()> {
        debug!("Refreshing {:?}", refresh);
        match refresh {
            Refresh::Version => self.refresh_version().await,
            Refresh::Status => self.refresh_status().await,
            Refresh::CurrentSong => self.refresh_current_song().await,
            Refresh::Playlist => self.refresh_playlist().await,
            Refresh::Library => self.refresh_library().await,
            Refresh::Stats => self.refresh_stats().await,
            Refresh::Outputs => self.refresh_outputs().await,
        }
    }

    async fn refresh_version(&self) -> Result<()> {
        let view = VersionView {
            app: env!("CARGO_PKG_NAME").to_string(),
            version: env!("MIRROR_VERSION").to_string(),
            mpd: self.executor.version().await,
        };
        self.cache.set_if_modified(keys::VERSION, &view).await?;
        Ok(())
    }

    async fn refresh_status(&self) -> Result<()> {
        let batch = CommandList::new()
            .with(Command::new("status"))
            .with(Command::new("replay_gain_status"));
        let responses = self.executor.exec_batch(batch).await?;
        let (Some(status), Some(replay_gain)) = (responses.first(), responses.get(1)) else {
            anyhow::bail!("status batch returned {} responses", responses.len());
        };

        let player = PlayerView::from_status(status, replay_gain);
        let updating = LibraryView {
            updating: status.get("updating_db").is_some(),
        };

        // Always stamped: clients derive elapsed time from the timestamp.
        self.cache.set(keys::MUSIC, &player).await?;
        self.cache.set_if_modified(keys::LIBRARY, &updating).await?;
        self.engine.observe_position(player.song).await;
        Ok(())
    }

    async fn refresh_current_song(&self) -> Result<()> {
        let response = self.executor.exec(Command::new("currentsong")).await?;
        let song = parse_song(response.pairs());
        self.cache.set_if_modified(keys::CURRENT_SONG, &song).await?;
        Ok(())
    }

    async fn refresh_playlist(&self) -> Result<()> {
        let generation = self.engine.generation();
        let response = self.executor.exec(Command::new("playlistinfo")).await?;
        let songs = parse_songs(response.pairs());
        self.cache.set_if_modified(keys::PLAYLIST_SONGS, &songs).await?;
        let verdict = self.engine.observe_playlist(&songs, generation).await;
        debug!("Playlist snapshot of {} songs: {:?}", songs.len(), verdict);
        Ok(())
    }

    async fn refresh_library(&self) -> Result<()> {
        let response = self.executor.exec(Command::new("listallinfo")).await?;
        let songs = parse_songs(response.pairs());
        self.cache.set_if_modified(keys::LIBRARY_SONGS, &songs).await?;
        self.engine.observe_library(songs).await;
        Ok(())
    }

    async fn refresh_stats(&self) -> Result<()> {
        let response = self.executor.exec(Command::new("stats")).await?;
        self.cache
            .set_if_modified(keys::STATS, &parse_stats(&response))
            .await?;
        Ok(())
    }

    async fn refresh_outputs(&self) -> Result<()> {
        let response = self.executor.exec(Command::new("outputs")).await?;
        self.cache
            .set_if_modified(keys::OUTPUTS, &parse_outputs(&response))
            .await?;
        Ok(())
    }
}
