//! PostgreSQL routing store

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, warn};

use super::{ACQUIRE_TIMEOUT, RoutingStore};

/// Routing store backed by the `devices` table in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over a lazily-connected pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string cannot be parsed.
    pub fn connect(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(connection_string)
            .context("invalid PostgreSQL connection string")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RoutingStore for PostgresStore {
    async fn query(&self, guid: &str) -> Option<String> {
        let instance = sqlx::query_scalar::<_, Option<String>>(
            "SELECT mpsinstance FROM devices WHERE guid = $1",
        )
        .bind(guid)
        .fetch_optional(&self.pool)
        .await;

        match instance {
            Ok(row) => row.flatten().filter(|host| !host.is_empty()),
            Err(e) => {
                warn!("instance lookup failed for device {}: {}", guid, e);
                None
            }
        }
    }

    async fn health(&self) -> bool {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                debug!("health probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PostgresStore {
        // Nothing listens here; every operation fails and must fail open.
        PostgresStore::connect("postgresql://router@127.0.0.1:1/mpsdb", 2).unwrap()
    }

    #[test]
    fn rejects_malformed_connection_string() {
        assert!(PostgresStore::connect("definitely not a url", 2).is_err());
    }

    #[tokio::test]
    async fn query_fails_open_when_database_is_unreachable() {
        assert_eq!(store().query("d12428be-9fa1-4226-9784-54b2038beab6").await, None);
    }

    #[tokio::test]
    async fn health_is_false_when_database_is_unreachable() {
        assert!(!store().health().await);
    }
}
