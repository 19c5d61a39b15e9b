//! Resource cache: latest serialized view of every mirrored resource.
//!
//! Each entry is an immutable snapshot (JSON bytes, optional gzip variant,
//! modification time) replaced wholesale on update. Readers clone the
//! `Arc` and never hold the map lock while serving. Updates that change
//! an entry are announced on the [`ChangeBus`](crate::bus::ChangeBus).

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bus::SharedBus;

/// Resource keys. A key is also the HTTP path the resource is served on.
pub mod keys {
    pub const VERSION: &str = "/api/version";
    pub const MUSIC: &str = "/api/music";
    pub const STATS: &str = "/api/music/stats";
    pub const PLAYLIST: &str = "/api/music/playlist";
    pub const PLAYLIST_SONGS: &str = "/api/music/playlist/songs";
    pub const CURRENT_SONG: &str = "/api/music/playlist/songs/current";
    pub const LIBRARY: &str = "/api/music/library";
    pub const LIBRARY_SONGS: &str = "/api/music/library/songs";
    pub const OUTPUTS: &str = "/api/music/outputs";
}

/// Payloads smaller than this are not worth a gzip variant.
const GZIP_MIN_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One immutable snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResource {
    pub bytes: Bytes,
    pub gzip: Option<Bytes>,
    pub modified_at: DateTime<Utc>,
}

impl CachedResource {
    /// Strong validator derived from the modification time.
    pub fn etag(&self) -> String {
        let nanos = self
            .modified_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.modified_at.timestamp_micros() * 1000);
        format!("\"{:x}\"", nanos)
    }

    /// `Last-Modified` header value (IMF-fixdate, second precision).
    pub fn last_modified(&self) -> String {
        self.modified_at
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }
}

pub struct ResourceCache {
    entries: RwLock<HashMap<String, Arc<CachedResource>>>,
    bus: SharedBus,
}

impl ResourceCache {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Replace `key` unconditionally and notify, even when the bytes are
    /// identical. Used where the timestamp itself carries meaning.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serialize(key, value)?;
        self.store(key, bytes, false).await;
        Ok(())
    }

    /// Replace `key` only when the serialized bytes differ from the
    /// current snapshot. Returns whether anything changed.
    pub async fn set_if_modified<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<bool, CacheError> {
        let bytes = serialize(key, value)?;
        let unchanged = {
            let entries = self.entries.read().await;
            entries
                .get(key)
                .is_some_and(|current| current.bytes == bytes)
        };
        if unchanged {
            return Ok(false);
        }
        Ok(self.store(key, bytes, true).await)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CachedResource>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    async fn store(&self, key: &str, bytes: Bytes, only_if_modified: bool) -> bool {
        let gzip = compress(&bytes);

        let stored = {
            let mut entries = self.entries.write().await;
            let previous = entries.get(key).cloned();
            if only_if_modified && previous.as_ref().is_some_and(|p| p.bytes == bytes) {
                false
            } else {
                let modified_at = next_timestamp(previous.as_deref());
                entries.insert(
                    key.to_string(),
                    Arc::new(CachedResource {
                        bytes,
                        gzip,
                        modified_at,
                    }),
                );
                true
            }
        };

        if stored {
            debug!("Resource updated: {}", key);
            self.bus.publish(key).await;
        }
        stored
    }
}

fn serialize<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Bytes, CacheError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })
}

fn compress(bytes: &[u8]) -> Option<Bytes> {
    if bytes.len() < GZIP_MIN_BYTES {
        return None;
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    match encoder.write_all(bytes).and_then(|_| encoder.finish()) {
        Ok(out) => Some(Bytes::from(out)),
        Err(e) => {
            warn!("gzip failed, serving identity only: {}", e);
            None
        }
    }
}

/// Now, but strictly after the previous stamp so every update is
/// distinguishable by its validator.
fn next_timestamp(previous: Option<&CachedResource>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(p) if now <= p.modified_at => p.modified_at + ChronoDuration::microseconds(1),
        _ => now,
    }
}
