//! Wall-clock aligned capture timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Source of wall-clock time for boundary alignment.
#[derive(Debug, Clone, Copy)]
pub enum WallClock {
    /// The system clock.
    System,
    /// A fixed start time advanced by the tokio clock, so paused-time tests
    /// see wall-clock time move with `tokio::time`.
    Anchored { origin: DateTime<Utc>, at: Instant },
}

impl WallClock {
    /// A clock that reads `origin` now and advances with `tokio::time`.
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        WallClock::Anchored {
            origin,
            at: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            WallClock::System => Utc::now(),
            WallClock::Anchored { origin, at } => {
                let elapsed = TimeDelta::from_std(at.elapsed()).unwrap_or(TimeDelta::zero());
                origin.checked_add_signed(elapsed).unwrap_or(*origin)
            }
        }
    }
}

/// The first multiple of `interval` since the Unix epoch strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let period = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let now_ms = now.timestamp_millis();
    let next_ms = (now_ms - now_ms.rem_euclid(period)).saturating_add(period);

    DateTime::<Utc>::from_timestamp_millis(next_ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time to sleep from `now` until the next boundary.
pub fn delay_until_next_boundary(now: DateTime<Utc>, interval: Duration) -> Duration {
    (next_boundary(now, interval) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Restartable interval timer that runs an action on wall-clock multiples of
/// its interval (a 60 s interval fires at every full minute).
pub struct CaptureTrigger {
    interval: Duration,
    clock: WallClock,
    action: Arc<dyn Fn() + Send + Sync>,
    timer: Option<JoinHandle<()>>,
}

impl CaptureTrigger {
    /// Create a stopped trigger.
    pub fn new(
        interval: Duration,
        clock: WallClock,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            interval,
            clock,
            action: Arc::new(action),
            timer: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the timer if it is not running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        tracing::info!(interval_secs = self.interval.as_secs_f64(), "Capture timer started");
        self.timer = Some(tokio::spawn(run_timer(
            self.interval,
            self.clock,
            self.action.clone(),
        )));
    }

    /// Replace the interval.
    ///
    /// The pending timer is cancelled and joined before the new one starts,
    /// so the old period never fires again.
    pub async fn update_interval(&mut self, interval: Duration) {
        self.cancel().await;
        tracing::info!(
            old_secs = self.interval.as_secs_f64(),
            new_secs = interval.as_secs_f64(),
            "Capture interval changed"
        );
        self.interval = interval;
        self.start();
    }

    /// Stop the timer; the action does not run afterwards.
    pub async fn exit(&mut self) {
        self.cancel().await;
        tracing::info!("Capture timer stopped");
    }

    async fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            // Cancelled is the expected outcome
            let _ = timer.await;
        }
    }
}

impl Drop for CaptureTrigger {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

async fn run_timer(interval: Duration, clock: WallClock, action: Arc<dyn Fn() + Send + Sync>) {
    let mut target = next_boundary(clock.now(), interval);

    loop {
        let delay = (target - clock.now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        tracing::debug!(boundary = %target, "Capture timer fired");
        action();

        // Skips boundaries missed while the action ran
        target = next_boundary(clock.now().max(target), interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn counting_trigger(interval: Duration, origin: &str) -> (CaptureTrigger, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let trigger = CaptureTrigger::new(interval, WallClock::starting_at(at(origin)), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (trigger, fired)
    }

    #[test]
    fn test_next_boundary() {
        let minute = Duration::from_secs(60);

        assert_eq!(
            next_boundary(at("2024-01-01T00:00:50Z"), minute),
            at("2024-01-01T00:01:00Z")
        );
        // On a boundary the next one is a full period away
        assert_eq!(
            next_boundary(at("2024-01-01T00:01:00Z"), minute),
            at("2024-01-01T00:02:00Z")
        );
        assert_eq!(
            delay_until_next_boundary(at("2024-01-01T00:00:50.250Z"), minute),
            Duration::from_millis(9750)
        );
        assert_eq!(
            delay_until_next_boundary(at("2024-01-01T00:10:00Z"), Duration::from_secs(900)),
            Duration::from_secs(300)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_on_boundaries() {
        let (mut trigger, fired) = counting_trigger(Duration::from_secs(60), "2024-01-01T00:00:50Z");
        trigger.start();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_interval_cancels_pending_fire() {
        let (mut trigger, fired) = counting_trigger(Duration::from_secs(60), "2024-01-01T00:00:50Z");
        trigger.start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.update_interval(Duration::from_secs(45)).await;
        assert_eq!(trigger.interval(), Duration::from_secs(45));
        assert!(trigger.is_running());

        // Past the old 00:01:00 boundary: nothing fired
        tokio::time::sleep(Duration::from_secs(18)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // 00:01:30 is the first 45 s boundary
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_stops_firing() {
        let (mut trigger, fired) = counting_trigger(Duration::from_secs(10), "2024-01-01T00:00:05Z");
        trigger.start();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        trigger.exit().await;
        assert!(!trigger.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (mut trigger, fired) = counting_trigger(Duration::from_secs(10), "2024-01-01T00:00:05Z");
        trigger.start();
        trigger.start();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
