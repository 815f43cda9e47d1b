//! Poll-until-condition waits.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self { interval: DEFAULT_POLL_INTERVAL, timeout: DEFAULT_POLL_TIMEOUT }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Satisfied,
    TimedOut,
    Errored,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PollState::Polling)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollWaiter {
    settings: PollSettings,
}

impl PollWaiter {
    pub fn new(settings: PollSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Call `check` immediately and then once per interval until it returns
    /// `Ok(true)` (satisfied), an error (errored) or the deadline passes
    /// (`Ok(false)`).
    pub async fn poll_until<F, Fut, E>(&self, mut check: F) -> Result<bool, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let t0 = Instant::now();
        let deadline = t0 + self.settings.timeout;
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        let (state, outcome) = loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    break (PollState::TimedOut, Ok(false));
                }
                _ = ticker.tick() => {}
            }
            ticks += 1;
            counter!("poll_ticks_total", 1u64);
            match check().await {
                Ok(true) => break (PollState::Satisfied, Ok(true)),
                Ok(false) => debug!(ticks, "poll: condition not met"),
                Err(e) => break (PollState::Errored, Err(e)),
            }
        };
        info!(state = ?state, ticks, took_ms = %t0.elapsed().as_millis(), "poll: finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn satisfied_on_third_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let t0 = Instant::now();
        let res: Result<bool, String> = PollWaiter::default()
            .poll_until(|| {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n == 3) }
            })
            .await;
        assert_eq!(res, Ok(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(t0.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_false_without_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let t0 = Instant::now();
        let res: Result<bool, String> = PollWaiter::default()
            .poll_until(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(false) }
            })
            .await;
        assert_eq!(res, Ok(false));
        assert_eq!(t0.elapsed(), DEFAULT_POLL_TIMEOUT);
        assert!(calls.load(Ordering::SeqCst) >= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn error_is_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let res: Result<bool, String> = PollWaiter::default()
            .poll_until(|| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move { if n == 1 { Err("list failed".to_string()) } else { Ok(false) } }
            })
            .await;
        assert_eq!(res, Err("list failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn terminal_states() {
        assert!(!PollState::Polling.is_terminal());
        assert!(PollState::TimedOut.is_terminal());
    }
}
