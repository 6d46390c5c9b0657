//! Polling helpers for mailbox waits and segment discovery.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

use super::errors::Result;

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 256;
const BACKOFF_SLEEP: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// `yield_now` between every poll. Lowest latency, burns a core.
    Yield,
    /// Spin, then yield, then sleep 1ms between polls.
    Backoff,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Backoff
    }
}

pub struct Waiter {
    strategy: WaitStrategy,
    rounds: u32,
}

impl Waiter {
    pub fn new(strategy: WaitStrategy) -> Waiter {
        Waiter {
            strategy,
            rounds: 0,
        }
    }

    pub fn pause(&mut self) {
        match self.strategy {
            WaitStrategy::Yield => thread::yield_now(),
            WaitStrategy::Backoff => {
                if self.rounds < SPIN_ROUNDS {
                    hint::spin_loop();
                } else if self.rounds < YIELD_ROUNDS {
                    thread::yield_now();
                } else {
                    thread::sleep(BACKOFF_SLEEP);
                }
                self.rounds = self.rounds.saturating_add(1);
            }
        }
    }

    pub fn reset(&mut self) {
        self.rounds = 0;
    }
}

/// Calls `ready` until it reports `true` or `timeout` elapses. `None` never
/// times out. Errors from `ready` end the wait.
pub fn wait_until<F>(timeout: Option<Duration>, strategy: WaitStrategy, mut ready: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut waiter = Waiter::new(strategy);
    loop {
        if ready()? {
            return Ok(true);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
        waiter.pause();
    }
}

/// [`wait_until`] with a bounded timeout and [`WaitStrategy::Backoff`].
pub fn poll_until<F>(timeout: Duration, ready: F) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    wait_until(Some(timeout), WaitStrategy::Backoff, ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IpcError;

    #[test]
    fn returns_as_soon_as_ready() {
        let mut calls = 0;
        let ready = wait_until(None, WaitStrategy::Yield, || {
            calls += 1;
            Ok(calls == 3)
        })
        .unwrap();
        assert!(ready);
        assert_eq!(calls, 3);
    }

    #[test]
    fn times_out() {
        let started = Instant::now();
        let ready = poll_until(Duration::from_millis(30), || Ok(false)).unwrap();
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn errors_stop_the_wait() {
        let result = poll_until(Duration::from_secs(5), || Err(IpcError::WouldBlock));
        assert!(matches!(result, Err(IpcError::WouldBlock)));
    }
}
