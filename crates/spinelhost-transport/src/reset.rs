//! Out-of-band reset notification and bounded reconnect.
//!
//! A broker process (the CPC daemon, a binder service) can vanish underneath a
//! transport. Its death callback runs on a foreign thread and only raises a
//! [`ResetSignal`]; the mainloop thread notices the signal on its next call into the
//! transport and runs [`reconnect`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, TransportError};

/// Cross-thread "the channel is gone" flag.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ResetSignal(Arc<AtomicBool>);

impl ResetSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the channel as lost. Safe to call from any thread.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether both handles refer to the same flag.
    pub fn same_as(&self, other: &ResetSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Signals raised together by a death callback that carries no context.
///
/// Registering the same signal twice keeps one entry.
#[derive(Debug, Default)]
pub struct ResetRegistry {
    signals: Mutex<Vec<ResetSignal>>,
}

impl ResetRegistry {
    pub const fn new() -> Self {
        Self {
            signals: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, signal: &ResetSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            if !signals.iter().any(|known| known.same_as(signal)) {
                signals.push(signal.clone());
            }
        }
    }

    pub fn unregister(&self, signal: &ResetSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.retain(|known| !known.same_as(signal));
        }
    }

    pub fn raise_all(&self) {
        if let Ok(signals) = self.signals.lock() {
            for signal in signals.iter() {
                signal.raise();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.signals.lock().map(|signals| signals.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How hard [`reconnect`] tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep before each attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1);

    /// Total time spent sleeping when every attempt fails.
    pub fn worst_case_backoff(&self) -> Duration {
        self.backoff * self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Retry `restart` under `policy`, sleeping through `sleep` before every attempt.
///
/// Returns the 1-based attempt that succeeded, or
/// [`TransportError::ReconnectExhausted`] once the budget is spent.
pub fn reconnect<S, R>(policy: &RetryPolicy, mut sleep: S, mut restart: R) -> Result<u32>
where
    S: FnMut(Duration),
    R: FnMut(u32) -> io::Result<()>,
{
    for attempt in 1..=policy.max_attempts {
        sleep(policy.backoff);
        match restart(attempt) {
            Ok(()) => {
                info!(attempt, "channel restarted");
                return Ok(attempt);
            }
            Err(err) => warn!(attempt, error = %err, "channel restart failed"),
        }
    }
    Err(TransportError::ReconnectExhausted {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn signal_is_shared_between_clones_and_threads() {
        let signal = ResetSignal::new();
        let remote = signal.clone();
        assert!(!signal.is_raised());

        thread::spawn(move || remote.raise()).join().unwrap();
        assert!(signal.is_raised());

        signal.clear();
        assert!(!signal.is_raised());
    }

    #[test]
    fn registry_keeps_one_entry_per_signal() {
        let registry = ResetRegistry::new();
        let first = ResetSignal::new();
        let second = ResetSignal::new();

        registry.register(&first);
        registry.register(&first.clone());
        registry.register(&second);
        assert_eq!(registry.len(), 2);

        registry.raise_all();
        assert!(first.is_raised());
        assert!(second.is_raised());

        registry.unregister(&first);
        registry.unregister(&second);
        assert!(registry.is_empty());
    }

    #[test]
    fn always_failing_restart_gives_up_after_budget() {
        let policy = RetryPolicy::default();
        let mut slept = Vec::new();
        let mut attempts = Vec::new();

        let result = reconnect(
            &policy,
            |d| slept.push(d),
            |attempt| {
                attempts.push(attempt);
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            },
        );

        assert!(matches!(
            result,
            Err(TransportError::ReconnectExhausted { attempts: 10 })
        ));
        assert_eq!(attempts, (1..=10).collect::<Vec<_>>());
        assert_eq!(slept.len(), 10);
        assert_eq!(slept.iter().sum::<Duration>(), policy.worst_case_backoff());
        assert_eq!(policy.worst_case_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn stops_at_first_success() {
        let policy = RetryPolicy::default();
        let mut sleeps = 0;

        let result = reconnect(
            &policy,
            |_| sleeps += 1,
            |attempt| {
                if attempt < 3 {
                    Err(io::Error::from(io::ErrorKind::NotFound))
                } else {
                    Ok(())
                }
            },
        );

        assert_eq!(result.unwrap(), 3);
        assert_eq!(sleeps, 3);
    }

    #[test]
    fn zero_budget_fails_without_trying() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Duration::from_secs(1),
        };
        let mut called = false;
        let result = reconnect(&policy, |_| called = true, |_| Ok(()));
        assert!(result.is_err());
        assert!(!called);
    }

    #[test]
    fn real_sleep_stays_bounded() {
        let policy = RetryPolicy::default();
        let start = std::time::Instant::now();
        let result = reconnect(&policy, thread::sleep, |_| {
            Err(io::Error::from(io::ErrorKind::Other))
        });
        assert!(result.is_err());
        assert!(start.elapsed() >= policy.worst_case_backoff());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
