//! Time source used by the poll loop and the connection provider

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall clock plus an awaitable sleep
#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Current UTC time
    fn now(&self) -> NaiveDateTime {
        DateTime::from_timestamp_millis(self.now_millis())
            .map(|dt| dt.naive_utc())
            .unwrap_or_default()
    }

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// System time with tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only moves when told to; sleeping advances it instantly
///
/// ```
/// use solidafy_sql_source::task::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(0);
/// # tokio_test::block_on(async {
/// clock.sleep(Duration::from_secs(5)).await;
/// # });
/// assert_eq!(clock.now_millis(), 5_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock at the given epoch millis
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    /// Create a clock at the given UTC time
    pub fn at(time: NaiveDateTime) -> Self {
        Self::new(time.and_utc().timestamp_millis())
    }

    /// Move the clock forward
    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute epoch millis value
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
