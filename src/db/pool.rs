use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::db::{ConnectionDescriptor, DbConnection, Driver, DriverRegistry, HealthProbe};
use crate::error::{EngineError, Result};

/// Bookkeeping for one physical connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub use_count: u64,
    pub healthy: bool,
}

impl ConnectionStats {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Utc::now();
        self.use_count += 1;
    }
}

#[derive(Default)]
struct PoolSlot {
    conn: Option<Box<dyn DbConnection>>,
    stats: Option<ConnectionStats>,
}

type SharedSlot = Arc<AsyncMutex<PoolSlot>>;

enum HandleInner {
    Pooled(OwnedMutexGuard<PoolSlot>),
    Overflow {
        conn: Option<Box<dyn DbConnection>>,
        stats: ConnectionStats,
    },
}

/// Exclusive access to a connection for the lifetime of the handle.
///
/// Dropping a pooled handle returns the connection to its pool entry; an
/// overflow handle closes its connection.
pub struct PooledHandle {
    descriptor: ConnectionDescriptor,
    inner: HandleInner,
}

impl PooledHandle {
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// True when the pooled connection was busy and a transient one was opened.
    pub fn is_overflow(&self) -> bool {
        matches!(self.inner, HandleInner::Overflow { .. })
    }

    pub fn stats(&self) -> Option<&ConnectionStats> {
        match &self.inner {
            HandleInner::Pooled(slot) => slot.stats.as_ref(),
            HandleInner::Overflow { stats, .. } => Some(stats),
        }
    }

    pub fn connection(&mut self) -> Result<&mut (dyn DbConnection + 'static)> {
        let conn = match &mut self.inner {
            HandleInner::Pooled(slot) => slot.conn.as_deref_mut(),
            HandleInner::Overflow { conn, .. } => conn.as_deref_mut(),
        };
        conn.ok_or_else(|| {
            EngineError::Connection(format!(
                "connection to {} was invalidated",
                self.descriptor.display_string()
            ))
        })
    }

    /// Drop the physical connection; the next acquire opens a new one.
    pub fn invalidate(&mut self) {
        debug!(db = %self.descriptor.display_string(), "invalidating connection");
        match &mut self.inner {
            HandleInner::Pooled(slot) => {
                slot.conn = None;
                if let Some(stats) = slot.stats.as_mut() {
                    stats.healthy = false;
                }
            }
            HandleInner::Overflow { conn, stats } => {
                *conn = None;
                stats.healthy = false;
            }
        }
    }
}

/// Keeps one reusable connection per descriptor.
///
/// This is not a multi-slot pool: a second concurrent caller for the same
/// descriptor gets a transient overflow connection instead of waiting.
pub struct ConnectionPoolManager {
    drivers: DriverRegistry,
    probe: HealthProbe,
    slots: Mutex<HashMap<ConnectionDescriptor, SharedSlot>>,
}

impl ConnectionPoolManager {
    pub fn new(drivers: DriverRegistry, probe: HealthProbe) -> Self {
        Self {
            drivers,
            probe,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn probe(&self) -> &HealthProbe {
        &self.probe
    }

    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<PooledHandle> {
        let driver = self.drivers.get(descriptor.database_type())?;
        let slot = self.slot_for(descriptor);

        let mut guard = match slot.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    db = %descriptor.display_string(),
                    "pooled connection busy, opening overflow connection"
                );
                let conn = self.open(driver.as_ref(), descriptor).await?;
                let mut stats = ConnectionStats::fresh();
                stats.touch();
                return Ok(PooledHandle {
                    descriptor: descriptor.clone(),
                    inner: HandleInner::Overflow {
                        conn: Some(conn),
                        stats,
                    },
                });
            }
        };

        if let Some(conn) = guard.conn.as_deref_mut() {
            let status = self.probe.check(conn).await;
            if status.is_healthy() {
                if let Some(stats) = guard.stats.as_mut() {
                    stats.touch();
                }
                return Ok(PooledHandle {
                    descriptor: descriptor.clone(),
                    inner: HandleInner::Pooled(guard),
                });
            }
            warn!(
                db = %descriptor.display_string(),
                error = status.error.as_deref().unwrap_or("unknown"),
                "pooled connection failed health check, replacing"
            );
            guard.conn = None;
        }

        let conn = self.open(driver.as_ref(), descriptor).await?;
        let mut stats = ConnectionStats::fresh();
        stats.touch();
        guard.conn = Some(conn);
        guard.stats = Some(stats);
        debug!(db = %descriptor.display_string(), "opened pooled connection");

        Ok(PooledHandle {
            descriptor: descriptor.clone(),
            inner: HandleInner::Pooled(guard),
        })
    }

    /// Stats of the pooled connection, or None when it is checked out or absent.
    pub fn stats(&self, descriptor: &ConnectionDescriptor) -> Option<ConnectionStats> {
        let slot = self.slots.lock().get(descriptor).cloned()?;
        let guard = slot.try_lock().ok()?;
        guard.stats.clone()
    }

    /// Number of descriptors with a pool entry.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the entry for a descriptor. A handle currently checked out
    /// keeps its connection until dropped.
    pub fn evict(&self, descriptor: &ConnectionDescriptor) -> bool {
        self.slots.lock().remove(descriptor).is_some()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    fn slot_for(&self, descriptor: &ConnectionDescriptor) -> SharedSlot {
        self.slots
            .lock()
            .entry(descriptor.clone())
            .or_default()
            .clone()
    }

    async fn open(
        &self,
        driver: &dyn Driver,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DbConnection>> {
        let mut conn = driver
            .connect(descriptor.connection_string())
            .await
            .map_err(|e| match e {
                EngineError::Connection(_) | EngineError::Configuration(_) => e,
                other => EngineError::Connection(other.to_string()),
            })?;

        let status = self.probe.check(conn.as_mut()).await;
        if !status.is_healthy() {
            return Err(EngineError::Connection(format!(
                "health check failed for {}: {}",
                descriptor.display_string(),
                status.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(conn)
    }
}
