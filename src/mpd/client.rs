//! Protocol client: a pool of exactly one reusable [`Connection`].
//!
//! Callers borrow the connection for one round trip at a time. A transport
//! failure discards the connection and hands the still-locked slot to a
//! reconnect task, so other borrowers wait (up to their deadline) instead
//! of observing an empty slot. `close()` is terminal.
//!
//! ```text
//! Disconnected → Connecting → Connected ⇄ Reconnecting
//!                                  ↓
//!                                Closed
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{Command, CommandList};
use super::conn::Connection;
use super::error::{MpdError, Result};
use super::response::Response;

/// Default per-call deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Fixed delay between reconnection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// Idle time after which a `ping` is sent
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection settings shared by [`Client`] and [`Watcher`](super::Watcher).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub password: Option<String>,
    pub timeout: Duration,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            password: None,
            timeout: DEFAULT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// The seam the playlist engine and orchestrator talk through.
#[async_trait]
pub trait Executor: Send + Sync {
    /// One command, one round trip.
    async fn exec(&self, command: Command) -> Result<Response>;

    /// All commands in one `command_list_ok_begin` round trip.
    async fn exec_batch(&self, list: CommandList) -> Result<Vec<Response>>;

    /// Protocol version from the most recent greeting.
    async fn version(&self) -> String;
}

type Slot = Arc<Mutex<Option<Connection>>>;

struct Inner {
    addr: String,
    options: ClientOptions,
    slot: Slot,
    version: RwLock<String>,
    state: RwLock<ConnectionState>,
    last_used: StdMutex<Instant>,
    closed: CancellationToken,
}

impl Inner {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

/// Shared handle to the control connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    fn new(addr: String, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                options,
                slot: Arc::new(Mutex::new(None)),
                version: RwLock::new(String::new()),
                state: RwLock::new(ConnectionState::Disconnected),
                last_used: StdMutex::new(Instant::now()),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Negotiate the first connection and start the liveness probe.
    pub async fn connect(addr: impl Into<String>, options: ClientOptions) -> Result<Self> {
        let client = Self::new(addr.into(), options);
        client.dial_first().await?;
        client.spawn_ping();
        Ok(client)
    }

    /// Like [`Client::connect`], but an unreachable server is not an error:
    /// the client starts out reconnecting at the fixed interval.
    pub async fn start(addr: impl Into<String>, options: ClientOptions) -> Self {
        let client = Self::new(addr.into(), options);
        if let Err(e) = client.dial_first().await {
            warn!("MPD at {} unavailable: {}", client.inner.addr, e);
            client.inner.set_state(ConnectionState::Reconnecting).await;
            let slot = client.inner.slot.clone().lock_owned().await;
            tokio::spawn(reconnect(client.inner.clone(), slot));
        }
        client.spawn_ping();
        client
    }

    async fn dial_first(&self) -> Result<()> {
        let inner = &self.inner;
        inner.set_state(ConnectionState::Connecting).await;
        let conn = match Connection::dial(
            &inner.addr,
            inner.options.password.as_deref(),
            inner.options.timeout,
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected).await;
                return Err(e);
            }
        };
        *inner.version.write().await = conn.version().to_string();
        *inner.slot.lock().await = Some(conn);
        inner.set_state(ConnectionState::Connected).await;
        info!("MPD client connected to {}", inner.addr);
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Send `close`, then refuse every further borrow. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Ok(());
        }

        // A reconnect task owns the slot; there is no socket to say goodbye on.
        let result = if self.state().await == ConnectionState::Reconnecting {
            Ok(())
        } else {
            match self.borrow().await {
                Ok(mut slot) => match slot.take() {
                    Some(mut conn) => conn.send(&Command::new("close")).await,
                    None => Ok(()),
                },
                Err(MpdError::Closed) => Ok(()),
                Err(e) => Err(e),
            }
        };

        self.inner.closed.cancel();
        self.inner.set_state(ConnectionState::Closed).await;
        info!("MPD client closed");
        result
    }

    /// Wait for the connection: returns when it is free, the per-call
    /// deadline passes, or the client is closed.
    async fn borrow(&self) -> Result<OwnedMutexGuard<Option<Connection>>> {
        let deadline = self.inner.options.timeout;
        let slot = self.inner.slot.clone();
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(MpdError::Closed),
            guard = timeout(deadline, slot.lock_owned()) => {
                let guard = guard.map_err(|_| MpdError::Timeout("borrow", deadline))?;
                if self.inner.closed.is_cancelled() {
                    return Err(MpdError::Closed);
                }
                Ok(guard)
            }
        }
    }

    /// Return the slot. Transport errors hand it to the reconnect task.
    fn release<T>(&self, mut slot: OwnedMutexGuard<Option<Connection>>, result: &Result<T>) {
        self.inner.touch();
        let Err(e) = result else {
            return;
        };
        if !e.is_transport() {
            return;
        }
        warn!("MPD connection to {} lost: {}", self.inner.addr, e);
        slot.take();
        let inner = self.inner.clone();
        tokio::spawn(reconnect(inner, slot));
    }

    fn spawn_ping(&self) {
        let client = self.clone();
        let closed = self.inner.closed.clone();
        let every = self.inner.options.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {
                        if client.inner.idle_for() < every {
                            continue;
                        }
                        if let Err(e) = client.exec(Command::new("ping")).await {
                            debug!("MPD liveness probe failed: {}", e);
                        }
                    }
                }
            }
            debug!("MPD liveness probe stopped");
        });
    }
}

#[async_trait]
impl Executor for Client {
    async fn exec(&self, command: Command) -> Result<Response> {
        let mut slot = self.borrow().await?;
        let result = match slot.as_mut() {
            Some(conn) => conn.request(&command).await,
            None => Err(MpdError::Closed),
        };
        self.release(slot, &result);
        result
    }

    async fn exec_batch(&self, list: CommandList) -> Result<Vec<Response>> {
        if list.is_empty() {
            return Ok(Vec::new());
        }
        let mut slot = self.borrow().await?;
        let result = match slot.as_mut() {
            Some(conn) => conn.request_list(&list).await,
            None => Err(MpdError::Closed),
        };
        self.release(slot, &result);
        result
    }

    async fn version(&self) -> String {
        self.inner.version.read().await.clone()
    }
}

/// Re-dial at a fixed interval while holding the slot, until success or close.
async fn reconnect(inner: Arc<Inner>, mut slot: OwnedMutexGuard<Option<Connection>>) {
    inner.set_state(ConnectionState::Reconnecting).await;
    let interval = inner.options.reconnect_interval;

    loop {
        match Connection::dial(
            &inner.addr,
            inner.options.password.as_deref(),
            inner.options.timeout,
        )
        .await
        {
            Ok(conn) => {
                *inner.version.write().await = conn.version().to_string();
                *slot = Some(conn);
                inner.set_state(ConnectionState::Connected).await;
                info!("MPD client reconnected to {}", inner.addr);
                return;
            }
            Err(e) => warn!("MPD reconnect to {} failed: {}", inner.addr, e),
        }

        tokio::select! {
            _ = inner.closed.cancelled() => {
                debug!("MPD reconnect cancelled by close");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
