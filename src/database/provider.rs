//! Cached connection provider
//!
//! Holds at most one live connection. A cached connection is validated
//! before every hand-out and replaced when the round-trip fails.

use super::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::task::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lazily opens, validates and caches a single connection
pub struct CachedConnectionProvider {
    factory: Arc<dyn ConnectionFactory>,
    max_attempts: u32,
    backoff: Duration,
    clock: Arc<dyn Clock>,
    connection: Option<Box<dyn Connection>>,
}

impl CachedConnectionProvider {
    /// Create a provider; no connection is opened until first use
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        max_attempts: u32,
        backoff: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            factory,
            max_attempts: max_attempts.max(1),
            backoff,
            clock,
            connection: None,
        }
    }

    /// Return the cached connection, reconnecting if it is missing or broken
    pub async fn get_connection(&mut self) -> Result<&mut dyn Connection> {
        let valid = self.connection.as_mut().map(|c| c.is_valid());
        if valid == Some(false) {
            warn!("Cached connection to {} is no longer valid", self.factory.describe());
            self.close();
        }

        if self.connection.is_none() {
            let connection = connect_with_retry(
                self.factory.as_ref(),
                self.clock.as_ref(),
                self.max_attempts,
                self.backoff,
            )
            .await?;
            self.connection = Some(connection);
        }

        let attempts = self.max_attempts;
        match self.connection.as_mut() {
            Some(connection) => {
                let connection: &mut dyn Connection = connection.as_mut();
                Ok(connection)
            }
            None => Err(Error::Connection {
                attempts,
                message: "no connection available".to_string(),
            }),
        }
    }

    /// Whether a connection is currently cached
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the cached connection, if any
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close() {
                warn!("Failed to close connection: {}", e);
            }
        }
    }
}

/// Open a validated connection, retrying with a fixed backoff
async fn connect_with_retry(
    factory: &dyn ConnectionFactory,
    clock: &dyn Clock,
    max_attempts: u32,
    backoff: Duration,
) -> Result<Box<dyn Connection>> {
    let target = factory.describe();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let message = match factory.connect() {
            Ok(mut connection) => {
                if connection.is_valid() {
                    info!("Connected to {}", target);
                    return Ok(connection);
                }
                "connection failed validation".to_string()
            }
            Err(e) => e.to_string(),
        };

        if attempt >= max_attempts {
            return Err(Error::Connection {
                attempts: attempt,
                message,
            });
        }

        warn!(
            "Connection to {} failed, attempt {}/{}, retrying in {:?}: {}",
            target, attempt, max_attempts, backoff, message
        );
        clock.sleep(backoff).await;
    }
}

impl Drop for CachedConnectionProvider {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ColumnDefinition, ResultCursor, SqlValue, TableId};
    use crate::task::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Connection whose validity is controlled from the test
    struct StubConnection {
        valid: Arc<AtomicBool>,
    }

    impl Connection for StubConnection {
        fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<ResultCursor> {
            Ok(ResultCursor::default())
        }

        fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<usize> {
            Ok(0)
        }

        fn is_valid(&mut self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn describe_columns(&mut self, _table: &TableId) -> Result<Vec<ColumnDefinition>> {
            Ok(Vec::new())
        }
    }

    /// Fails the first `failures` connects, then hands out probe connections
    struct FlakyFactory {
        failures: u32,
        connects: AtomicU32,
        valid: Arc<AtomicBool>,
    }

    impl FlakyFactory {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                connects: AtomicU32::new(0),
                valid: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl ConnectionFactory for FlakyFactory {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::sql("connection refused"));
            }
            Ok(Box::new(StubConnection {
                valid: self.valid.clone(),
            }))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn provider(factory: Arc<FlakyFactory>, attempts: u32, clock: &ManualClock) -> CachedConnectionProvider {
        CachedConnectionProvider::new(
            factory,
            attempts,
            Duration::from_millis(500),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_connection_is_cached() {
        let factory = Arc::new(FlakyFactory::new(0));
        let clock = ManualClock::new(0);
        let mut provider = provider(factory.clone(), 3, &clock);

        assert!(!provider.is_connected());
        provider.get_connection().await.unwrap();
        let conn = provider.get_connection().await.unwrap();
        assert!(conn.query("SELECT 1", &[]).unwrap().into_rows().is_empty());
        assert!(provider.is_connected());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_with_fixed_backoff() {
        let factory = Arc::new(FlakyFactory::new(2));
        let clock = ManualClock::new(0);
        let mut provider = provider(factory.clone(), 3, &clock);

        provider.get_connection().await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
        assert_eq!(clock.now_millis(), 1_000);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_fatal() {
        let factory = Arc::new(FlakyFactory::new(5));
        let clock = ManualClock::new(0);
        let mut provider = provider(factory.clone(), 2, &clock);

        let err = provider.get_connection().await.err().unwrap();
        assert!(matches!(err, Error::Connection { attempts: 2, .. }));
        assert!(!err.is_transient());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_connection_is_replaced() {
        let factory = Arc::new(FlakyFactory::new(0));
        let clock = ManualClock::new(0);
        let mut provider = provider(factory.clone(), 3, &clock);

        provider.get_connection().await.unwrap();
        factory.valid.store(false, Ordering::SeqCst);

        // Replacements share the flag, so they fail validation too
        let err = provider.get_connection().await.err().unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 4);

        factory.valid.store(true, Ordering::SeqCst);
        provider.get_connection().await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 5);
    }
}
