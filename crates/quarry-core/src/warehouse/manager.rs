//! Lifecycle of the single current warehouse connection.
//!
//! The connection slot lives behind an async mutex.  [`ConnectionManager::ensure`]
//! takes the lock, replaces a stale or dead connection, and hands the locked
//! slot to the caller as a [`ConnectionLease`].  Concurrent callers therefore
//! wait for one reconnection instead of racing, and a connection never runs
//! two statements at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WarehouseConfig;
use crate::error::{GatewayError, WarehouseError};
use crate::warehouse::{Row, WarehouseDriver, WarehouseSession};

/// A session plus the bookkeeping needed to decide whether to keep it.
struct ManagedConnection {
    id: u64,
    session: Box<dyn WarehouseSession>,
    created_at: Instant,
}

type Slot = Option<ManagedConnection>;

/// Owns at most one live warehouse session.
pub struct ConnectionManager {
    driver: Arc<dyn WarehouseDriver>,
    slot: Arc<Mutex<Slot>>,
    stale_after: Duration,
    open_attempts: u32,
    open_backoff: Duration,
    probe_timeout: Duration,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connected", &self.is_connected())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn WarehouseDriver>, config: &WarehouseConfig) -> Self {
        Self {
            driver,
            slot: Arc::new(Mutex::new(None)),
            stale_after: config.stale_after,
            open_attempts: config.open_attempts.max(1),
            open_backoff: config.open_backoff,
            probe_timeout: config.probe_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether a connection is currently held.  Does not probe it.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Return a lease on a connection that is younger than the staleness
    /// threshold and reported alive, opening a new one if needed.
    pub async fn ensure(&self) -> Result<ConnectionLease, GatewayError> {
        let mut slot = Arc::clone(&self.slot).lock_owned().await;

        let discard_reason = match slot.as_ref() {
            Some(conn) => self.discard_reason(conn).await,
            None => None,
        };
        if let Some(reason) = discard_reason {
            if let Some(conn) = slot.take() {
                info!(connection_id = conn.id, reason, "replacing warehouse connection");
                self.connected.store(false, Ordering::Relaxed);
                close_quietly(conn).await;
            }
        }

        if slot.is_none() {
            *slot = Some(self.open().await?);
        }

        Ok(ConnectionLease {
            guard: slot,
            connected: Arc::clone(&self.connected),
        })
    }

    /// Close the current connection, ignoring close errors.  Safe to call
    /// any number of times.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.take() {
            info!(connection_id = conn.id, "closing warehouse connection");
            close_quietly(conn).await;
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn discard_reason(&self, conn: &ManagedConnection) -> Option<&'static str> {
        if conn.created_at.elapsed() > self.stale_after {
            return Some("stale");
        }
        if !probe(conn, self.probe_timeout).await {
            return Some("not alive");
        }
        None
    }

    async fn open(&self) -> Result<ManagedConnection, GatewayError> {
        let mut last_err = WarehouseError::ConnectionFault("no connection attempt made".into());

        for attempt in 1..=self.open_attempts {
            match self.driver.connect().await {
                Ok(session) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    info!(connection_id = id, attempt, "warehouse connection opened");
                    self.connected.store(true, Ordering::Relaxed);
                    return Ok(ManagedConnection {
                        id,
                        session,
                        created_at: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(attempt, max_attempts = self.open_attempts, error = %e, "failed to open warehouse connection");
                    last_err = e;
                    if attempt < self.open_attempts {
                        tokio::time::sleep(self.open_backoff * attempt).await;
                    }
                }
            }
        }

        Err(GatewayError::Connection {
            attempts: self.open_attempts,
            source: last_err,
        })
    }
}

/// Health query first, ready-state flag second, optimistic otherwise.  A
/// health query that outlives `limit` counts as not alive.
async fn probe(conn: &ManagedConnection, limit: Duration) -> bool {
    match tokio::time::timeout(limit, conn.session.ping()).await {
        Err(_) => {
            warn!(connection_id = conn.id, limit_ms = limit.as_millis() as u64, "warehouse health query timed out");
            false
        }
        Ok(Some(Ok(()))) => true,
        Ok(Some(Err(e))) => {
            warn!(connection_id = conn.id, error = %e, "warehouse health query failed");
            false
        }
        Ok(None) => match conn.session.is_up() {
            Some(up) => up,
            None => {
                debug!(connection_id = conn.id, "session exposes no liveness signal; assuming alive");
                true
            }
        },
    }
}

async fn close_quietly(conn: ManagedConnection) {
    if let Err(e) = conn.session.close().await {
        debug!(connection_id = conn.id, error = %e, "ignoring error while closing warehouse connection");
    }
}

/// Exclusive use of the current connection.  Dropping the lease returns the
/// connection to the manager.
pub struct ConnectionLease {
    guard: OwnedMutexGuard<Slot>,
    connected: Arc<AtomicBool>,
}

impl ConnectionLease {
    /// Manager-assigned id of the leased connection.
    pub fn id(&self) -> Option<u64> {
        self.guard.as_ref().map(|c| c.id)
    }

    pub async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        match self.guard.as_ref() {
            Some(conn) => conn.session.execute(sql).await,
            None => Err(WarehouseError::ConnectionFault(
                "warehouse connection was invalidated".into(),
            )),
        }
    }

    /// Close and forget the leased connection so the next `ensure` opens a
    /// fresh one.
    pub async fn invalidate(mut self) {
        if let Some(conn) = self.guard.take() {
            info!(connection_id = conn.id, "invalidating warehouse connection");
            self.connected.store(false, Ordering::Relaxed);
            close_quietly(conn).await;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
