//! Token-bucket rate limiting for outbound requests.
//!
//! [`TokenBucket`] is a request processor: it sits in the fetcher's pipeline
//! and makes every request wait for a token before the remaining processors
//! and the transport see it. Token counts are integers. The bucket starts
//! full, and a refill task spawned on the fetcher's loop adds `qps` tokens
//! once per second, capped at `max_qps`.

use crate::actor;
use crate::error::{Result, SpiderError};
use crate::pipeline::{Processor, ProcessorAction};
use crate::request::Request;
use crate::settings::Settings;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::trace;

const REFILL_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    capacity: u32,
    refill: u32,
    tokens: Mutex<u32>,
    notify: Notify,
}

impl BucketState {
    fn try_take(&self) -> bool {
        let mut tokens = self.tokens.lock();
        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    fn refill(&self) {
        {
            let mut tokens = self.tokens.lock();
            *tokens = tokens.saturating_add(self.refill).min(self.capacity);
            trace!(tokens = *tokens, "token bucket refilled");
        }
        self.notify.notify_waiters();
    }
}

/// Bounds the request rate of one fetcher.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    state: Arc<BucketState>,
}

impl TokenBucket {
    /// A bucket holding at most `max_qps` tokens, refilled by `qps` per second.
    pub fn new(qps: u32, max_qps: u32) -> Result<Self> {
        if qps == 0 || qps > max_qps {
            return Err(SpiderError::Settings(format!(
                "token bucket needs 1 <= qps <= max_qps, got qps={} max_qps={}",
                qps, max_qps
            )));
        }
        Ok(Self {
            state: Arc::new(BucketState {
                capacity: max_qps,
                refill: qps,
                tokens: Mutex::new(max_qps),
                notify: Notify::new(),
            }),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.fetcher_qps(), settings.fetcher_max_qps())
    }

    pub fn capacity(&self) -> u32 {
        self.state.capacity
    }

    pub fn refill_rate(&self) -> u32 {
        self.state.refill
    }

    pub fn available(&self) -> u32 {
        *self.state.tokens.lock()
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.state.try_take()
    }

    /// Suspends the calling task until a token is available, then takes it.
    pub async fn acquire(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a refill between the check and the
            // await is not missed.
            notified.as_mut().enable();
            if self.state.try_take() {
                return;
            }
            notified.await;
        }
    }

    /// Adds tokens once per period, forever.
    pub(crate) async fn run_refill(self) {
        let mut ticker = tokio::time::interval(REFILL_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.state.refill();
        }
    }
}

#[async_trait]
impl Processor<Request> for TokenBucket {
    fn name(&self) -> &str {
        "token_bucket"
    }

    fn on_start(&self) -> anyhow::Result<()> {
        actor::spawn_local(self.clone().run_refill())?;
        Ok(())
    }

    async fn process(&self, _request: &mut Request) -> Result<ProcessorAction> {
        self.acquire().await;
        Ok(ProcessorAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn rejects_invalid_rates() {
        assert!(TokenBucket::new(0, 5).is_err());
        assert!(TokenBucket::new(6, 5).is_err());
        let bucket = TokenBucket::new(2, 5).unwrap();
        assert_eq!(bucket.capacity(), 5);
        assert_eq!(bucket.refill_rate(), 2);
        assert_eq!(bucket.available(), 5);
    }

    #[test]
    fn burst_is_bounded_by_capacity() {
        let bucket = TokenBucket::new(1, 3).unwrap();
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn refill_is_capped() {
        let bucket = TokenBucket::new(4, 5).unwrap();
        assert!(bucket.try_acquire());
        bucket.state.refill();
        assert_eq!(bucket.available(), 5);
    }

    #[tokio::test]
    async fn acquire_waits_for_the_next_refill() {
        let bucket = TokenBucket::new(2, 2).unwrap();
        let refill = tokio::spawn(bucket.clone().run_refill());

        let started = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        // 2 up front, 2 after one second, 1 after two seconds.
        assert!(started.elapsed() >= Duration::from_millis(1900));
        assert!(started.elapsed() < Duration::from_secs(4));
        refill.abort();
    }

    #[tokio::test]
    async fn waiters_wake_on_refill() {
        let bucket = TokenBucket::new(3, 3).unwrap();
        while bucket.try_acquire() {}

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let bucket = bucket.clone();
            waiters.push(tokio::spawn(async move { bucket.acquire().await }));
        }
        tokio::task::yield_now().await;
        bucket.state.refill();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(bucket.available(), 0);
    }
}
