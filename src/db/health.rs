use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::DbConnection;

/// Outcome of probing a connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub is_connected: bool,
    pub is_queryable: bool,
    pub last_checked: DateTime<Utc>,
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.is_connected && self.is_queryable
    }

    /// Status for a connection that could not be opened at all.
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            is_connected: false,
            is_queryable: false,
            last_checked: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Runs the dialect's trivial probe statement under a short timeout.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn check(&self, conn: &mut dyn DbConnection) -> HealthStatus {
        if conn.is_closed() {
            return HealthStatus::unreachable("connection is closed");
        }

        let probe = conn.database_type().probe_sql();
        let error = match tokio::time::timeout(self.timeout, conn.query(probe)).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "health probe timed out after {} ms",
                self.timeout.as_millis()
            )),
        };

        HealthStatus {
            is_connected: true,
            is_queryable: error.is_none(),
            last_checked: Utc::now(),
            error,
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
