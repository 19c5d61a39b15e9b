//! Song records: tag name → ordered list of values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Keys that start a new record in list responses.
const RECORD_KEYS: &[&str] = &["file", "directory", "playlist"];

/// One song. Tags may repeat (several `Artist:` lines), so every tag maps
/// to the values in the order the server sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Song(BTreeMap<String, Vec<String>>);

impl Song {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor used by tests and fixtures.
    pub fn from_tags<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut song = Self::new();
        for (k, v) in tags {
            song.push(k, v);
        }
        song
    }

    pub fn push(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.0.entry(tag.into()).or_default().push(value.into());
    }

    /// File path: the identity used for queue comparisons.
    pub fn file(&self) -> Option<&str> {
        self.first("file")
    }

    pub fn tag(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

/// Split a list response into songs. `directory:` and `playlist:` records
/// (as produced by `listallinfo`) are dropped along with their attributes.
pub fn parse_songs<'a, I>(pairs: I) -> Vec<Song>
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    let mut songs = Vec::new();
    let mut current: Option<Song> = None;
    let mut in_song = false;

    for (key, value) in pairs {
        if RECORD_KEYS.contains(&key.as_str()) {
            if let Some(song) = current.take() {
                songs.push(song);
            }
            in_song = key == "file";
            if in_song {
                current = Some(Song::new());
            }
        }
        if in_song {
            if let Some(song) = current.as_mut() {
                song.push(key.clone(), value.clone());
            }
        }
    }
    if let Some(song) = current {
        songs.push(song);
    }
    songs
}

/// Single song (e.g. `currentsong`). Empty when nothing is queued.
pub fn parse_song<'a, I>(pairs: I) -> Song
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    let mut song = Song::new();
    for (key, value) in pairs {
        song.push(key.clone(), value.clone());
    }
    song
}

/// File paths of a song list, in order.
pub fn files(songs: &[Song]) -> Vec<String> {
    songs
        .iter()
        .map(|s| s.file().unwrap_or_default().to_string())
        .collect()
}
