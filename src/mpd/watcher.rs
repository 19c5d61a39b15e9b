//! Change watcher: a second connection parked in `idle`.
//!
//! Every reported subsystem is published on a bounded broadcast channel.
//! Slow readers lose the oldest pending names instead of stalling the
//! watcher. After the watcher re-dials a lost connection it publishes
//! [`RECONNECT_EVENT`] so consumers can resynchronise everything they
//! might have missed.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientOptions;
use super::command::Command;
use super::conn::Connection;
use super::error::Result;

/// Synthetic subsystem published after a successful re-dial.
pub const RECONNECT_EVENT: &str = "reconnect";

/// Pending notifications kept per reader before the oldest are dropped.
pub const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Parked in `idle`
    Waiting,
    /// `noidle` requested, draining the reply
    Cancelling,
    Reconnecting,
    Closed,
}

struct WatchContext {
    addr: String,
    options: ClientOptions,
    subsystems: Vec<String>,
    sender: broadcast::Sender<String>,
    state: Arc<RwLock<WatcherState>>,
    cancel: CancellationToken,
}

impl WatchContext {
    fn new(addr: String, options: ClientOptions, subsystems: Vec<String>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            addr,
            options,
            subsystems,
            sender,
            state: Arc::new(RwLock::new(WatcherState::Waiting)),
            cancel: CancellationToken::new(),
        }
    }

    async fn set_state(&self, state: WatcherState) {
        *self.state.write().await = state;
    }

    async fn dial(&self) -> Result<Connection> {
        Connection::dial(
            &self.addr,
            self.options.password.as_deref(),
            self.options.timeout,
        )
        .await
    }

    fn publish(&self, subsystem: String) {
        debug!("MPD changed: {}", subsystem);
        // No subscribers is fine; events are only hints to refresh.
        let _ = self.sender.send(subsystem);
    }
}

pub struct Watcher {
    sender: broadcast::Sender<String>,
    state: Arc<RwLock<WatcherState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Dial the dedicated connection and start waiting. An empty
    /// `subsystems` list watches everything.
    pub async fn connect(
        addr: impl Into<String>,
        options: ClientOptions,
        subsystems: Vec<String>,
    ) -> Result<Self> {
        let ctx = WatchContext::new(addr.into(), options, subsystems);
        let conn = ctx.dial().await?;
        info!("MPD watcher connected to {}", ctx.addr);
        Ok(Self::spawn(ctx, Some(conn)))
    }

    /// Like [`Watcher::connect`], but an unreachable server is not an error.
    /// The watcher keeps re-dialling and announces [`RECONNECT_EVENT`] once
    /// it gets through.
    pub async fn start(
        addr: impl Into<String>,
        options: ClientOptions,
        subsystems: Vec<String>,
    ) -> Self {
        let ctx = WatchContext::new(addr.into(), options, subsystems);
        let conn = match ctx.dial().await {
            Ok(conn) => {
                info!("MPD watcher connected to {}", ctx.addr);
                Some(conn)
            }
            Err(e) => {
                warn!("MPD watcher at {} unavailable: {}", ctx.addr, e);
                None
            }
        };
        Self::spawn(ctx, conn)
    }

    fn spawn(ctx: WatchContext, conn: Option<Connection>) -> Self {
        let sender = ctx.sender.clone();
        let state = ctx.state.clone();
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run(conn, ctx));
        Self {
            sender,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stream of changed subsystem names, in server order. Each call gets
    /// an independent reader that starts at the next published event.
    pub fn events(&self) -> impl Stream<Item = String> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| event.ok())
    }

    pub async fn state(&self) -> WatcherState {
        *self.state.read().await
    }

    /// Interrupt a pending wait, close the connection and stop. Idempotent.
    pub async fn close(&self) {
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            return;
        };
        *self.state.write().await = WatcherState::Cancelling;
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!("MPD watcher task ended abnormally: {}", e);
        }
        info!("MPD watcher closed");
    }
}

async fn run(mut conn: Option<Connection>, ctx: WatchContext) {
    let subsystems: Vec<&str> = ctx.subsystems.iter().map(String::as_str).collect();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if conn.is_none() {
            ctx.set_state(WatcherState::Reconnecting).await;
            match ctx.dial().await {
                Ok(fresh) => {
                    info!("MPD watcher reconnected to {}", ctx.addr);
                    conn = Some(fresh);
                    ctx.publish(RECONNECT_EVENT.to_string());
                    continue;
                }
                Err(e) => warn!("MPD watcher reconnect to {} failed: {}", ctx.addr, e),
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(ctx.options.reconnect_interval) => continue,
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };

        ctx.set_state(WatcherState::Waiting).await;
        match active.idle(&subsystems, &ctx.cancel).await {
            Ok(changed) => {
                for subsystem in changed {
                    ctx.publish(subsystem);
                }
            }
            Err(e) if e.is_transport() => {
                warn!("MPD watcher connection lost: {}", e);
                conn = None;
            }
            Err(e) => {
                // The server rejected idle itself; back off instead of spinning.
                warn!("MPD watcher idle failed: {}", e);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ctx.options.reconnect_interval) => {}
                }
            }
        }
    }

    if let Some(mut active) = conn {
        if let Err(e) = active.send(&Command::new("close")).await {
            debug!("MPD watcher close: {}", e);
        }
    }
    ctx.set_state(WatcherState::Closed).await;
}
