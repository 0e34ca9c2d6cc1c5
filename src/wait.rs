//! First-settled race between a scope signal, a poll predicate and a timer.

use crate::host::ScopeEvent;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polling cadence and attempt ceiling for a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBounds {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for WaitBounds {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl WaitBounds {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Longest a wait under these bounds can take, saturating at `Duration::MAX`.
    pub fn ceiling(&self) -> Duration {
        self.interval
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }
}

/// Which racer produced the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T> {
    Signal(T),
    Poll(T),
}

impl<T> Settled<T> {
    pub fn into_inner(self) -> T {
        match self {
            Settled::Signal(v) | Settled::Poll(v) => v,
        }
    }
}

/// Nothing settled before the timer or the attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitExpired {
    pub attempts: u32,
    pub elapsed: Duration,
}

type SignalFilter<'a, T> = Box<dyn FnMut(&ScopeEvent) -> Option<T> + Send + 'a>;
type Check<'a, T> = Box<dyn FnMut() -> Option<T> + Send + 'a>;

/// A race whose losers (listener, ticker, timer) are all dropped as soon as
/// one racer settles.
pub struct Race<'a, T> {
    signal: Option<(broadcast::Receiver<ScopeEvent>, SignalFilter<'a, T>)>,
    poll: Option<(WaitBounds, Check<'a, T>)>,
    deadline: Option<Duration>,
}

impl<'a, T> Default for Race<'a, T> {
    fn default() -> Self {
        Self {
            signal: None,
            poll: None,
            deadline: None,
        }
    }
}

impl<'a, T> Race<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle when `filter` maps a received event to a value.
    pub fn on_signal(
        mut self,
        rx: broadcast::Receiver<ScopeEvent>,
        filter: impl FnMut(&ScopeEvent) -> Option<T> + Send + 'a,
    ) -> Self {
        self.signal = Some((rx, Box::new(filter)));
        self
    }

    /// Run `check` immediately, then once per interval; expire after
    /// `bounds.max_attempts` interval checks.
    pub fn poll(
        mut self,
        bounds: WaitBounds,
        check: impl FnMut() -> Option<T> + Send + 'a,
    ) -> Self {
        self.poll = Some((bounds, Box::new(check)));
        self
    }

    pub fn deadline(mut self, after: Duration) -> Self {
        self.deadline = Some(after);
        self
    }

    pub async fn first_settled(self) -> Result<Settled<T>, WaitExpired> {
        let started = Instant::now();
        let deadline = self.deadline;
        let (mut rx, mut filter) = match self.signal {
            Some((rx, filter)) => (Some(rx), Some(filter)),
            None => (None, None),
        };
        let (mut ticker, bounds, mut check) = match self.poll {
            Some((bounds, check)) => {
                // tokio rejects a zero period.
                let period = bounds.interval.max(MIN_POLL_INTERVAL);
                let mut ticker = interval_at(started + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                (Some(ticker), bounds, Some(check))
            }
            None => (None, WaitBounds::default(), None),
        };
        let mut attempts = 0u32;

        if let Some(check) = check.as_mut()
            && let Some(value) = check()
        {
            return Ok(Settled::Poll(value));
        }

        let timer = async {
            match deadline {
                Some(after) => sleep(after).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                event = next_event(&mut rx) => match event {
                    Ok(event) => {
                        if let Some(filter) = filter.as_mut()
                            && let Some(value) = filter(&event)
                        {
                            return Ok(Settled::Signal(value));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "scope listener lagged");
                    }
                    Err(RecvError::Closed) => rx = None,
                },
                _ = next_tick(&mut ticker) => {
                    attempts += 1;
                    if let Some(check) = check.as_mut()
                        && let Some(value) = check()
                    {
                        return Ok(Settled::Poll(value));
                    }
                    if attempts >= bounds.max_attempts {
                        return Err(WaitExpired { attempts, elapsed: started.elapsed() });
                    }
                }
                _ = &mut timer => {
                    return Err(WaitExpired { attempts, elapsed: started.elapsed() });
                }
            }
        }
    }
}

async fn next_event(rx: &mut Option<broadcast::Receiver<ScopeEvent>>) -> Result<ScopeEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn signal_wins_before_deadline() {
        let (tx, rx) = broadcast::channel(4);
        let race = Race::new()
            .on_signal(rx, |ev| (*ev == ScopeEvent::Ready).then_some("ready"))
            .deadline(Duration::from_secs(30));
        let handle = tokio::spawn(race.first_settled());
        tokio::task::yield_now().await;
        tx.send(ScopeEvent::ChatReady).unwrap();
        tx.send(ScopeEvent::Ready).unwrap();
        assert_eq!(handle.await.unwrap(), Ok(Settled::Signal("ready")));
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_at_configured_time() {
        let (_tx, rx) = broadcast::channel::<ScopeEvent>(4);
        let started = Instant::now();
        let res = Race::<()>::new()
            .on_signal(rx, |_| None)
            .deadline(Duration::from_secs(30))
            .first_settled()
            .await;
        let expired = res.unwrap_err();
        assert_eq!(expired.elapsed, Duration::from_secs(30));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_settles_once_predicate_holds() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            setter.store(true, Ordering::SeqCst);
        });
        let check_flag = flag.clone();
        let res = Race::new()
            .poll(WaitBounds::default(), move || {
                check_flag.load(Ordering::SeqCst).then_some(7)
            })
            .first_settled()
            .await;
        assert_eq!(res, Ok(Settled::Poll(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_expires_after_attempt_ceiling() {
        let started = Instant::now();
        let res = Race::<()>::new()
            .poll(WaitBounds::default(), || None)
            .first_settled()
            .await;
        let expired = res.unwrap_err();
        assert_eq!(expired.attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(started.elapsed(), WaitBounds::default().ceiling());
    }

    #[tokio::test]
    async fn immediate_check_short_circuits() {
        let res = Race::new().poll(WaitBounds::default(), || Some(1)).first_settled().await;
        assert_eq!(res, Ok(Settled::Poll(1)));
    }

    #[test]
    fn default_bounds_cover_five_seconds() {
        assert_eq!(WaitBounds::default().ceiling(), Duration::from_secs(5));
    }

    #[test]
    fn huge_bounds_saturate_instead_of_overflowing() {
        let bounds = WaitBounds::new(Duration::MAX, u32::MAX);
        assert_eq!(bounds.ceiling(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_polls_at_minimum_period() {
        let started = Instant::now();
        let res = Race::<()>::new()
            .poll(WaitBounds::new(Duration::ZERO, 3), || None)
            .first_settled()
            .await;
        assert_eq!(res.unwrap_err().attempts, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(3));
    }
}
