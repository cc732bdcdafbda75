//! Polls a [`ReachabilityProbe`] until it succeeds or a deadline passes.

use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ReachabilityConfig;
use crate::error::RemediationError;
use crate::probe::ReachabilityProbe;
use crate::signal::ShutdownToken;

/// Fixed-cadence poller bounded by a wall-clock deadline
#[derive(Debug, Clone, Copy)]
pub struct ReachabilityWaiter {
    interval: Duration,
    deadline: Duration,
}

impl ReachabilityWaiter {
    /// `interval` must be non-zero.
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            deadline,
        }
    }

    pub fn from_config(config: &ReachabilityConfig) -> Self {
        Self::new(config.interval(), config.deadline())
    }

    /// Probe `target` once per interval, starting one interval from now.
    ///
    /// Returns the number of attempts made, the last one being the success.
    /// A probe starts on every tick strictly before the deadline. A tick that
    /// lands exactly on the deadline does not probe, since the result could
    /// never be observed: with a deadline that is a whole number of intervals
    /// the cap is `deadline / interval - 1` attempts (14 for 15s every 1s),
    /// otherwise `floor(deadline / interval)`. A probe still in flight when
    /// the deadline passes or `shutdown` fires is dropped and its result
    /// never observed.
    pub async fn wait(
        &self,
        probe: &dyn ReachabilityProbe,
        target: IpAddr,
        shutdown: &ShutdownToken,
    ) -> Result<u32, RemediationError> {
        let start = Instant::now();
        let deadline = sleep(self.deadline);
        tokio::pin!(deadline);

        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timed_out = || RemediationError::ReachabilityTimeout {
            target,
            deadline: self.deadline,
        };

        info!(
            "Waiting for {} to answer (every {}ms, up to {}s)...",
            target,
            self.interval.as_millis(),
            self.deadline.as_secs()
        );

        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(RemediationError::Cancelled),
                _ = &mut deadline => {
                    warn!("{} unreachable after {} attempts", target, attempts);
                    return Err(timed_out());
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(attempt = attempts, "Shutdown during probe, discarding result");
                    return Err(RemediationError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!("{} unreachable after {} attempts", target, attempts);
                    return Err(timed_out());
                }
                result = probe.probe(target) => result,
            };

            match result {
                Ok(()) => {
                    info!(
                        "{} is reachable (attempt {}, {:.1}s)",
                        target,
                        attempts,
                        start.elapsed().as_secs_f64()
                    );
                    return Ok(attempts);
                }
                Err(failure) => debug!(attempt = attempts, "Probe of {} failed: {}", target, failure),
            }
        }
    }
}

impl Default for ReachabilityWaiter {
    fn default() -> Self {
        Self::from_config(&ReachabilityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::probe::ProbeFailure;

    const TARGET: &str = "203.0.113.7";

    fn target() -> IpAddr {
        TARGET.parse().unwrap()
    }

    fn assert_near(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(5);
        assert!(
            actual >= expected && actual <= expected + slack,
            "elapsed {:?}, expected {:?}",
            actual,
            expected
        );
    }

    fn waiter() -> ReachabilityWaiter {
        ReachabilityWaiter::new(Duration::from_secs(1), Duration::from_secs(15))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_after_one_interval() {
        let probe = MockProbe::new(vec![Ok(())]);
        let start = Instant::now();

        let attempts = waiter()
            .wait(&probe, target(), &ShutdownToken::new())
            .await
            .unwrap();

        assert_eq!(attempts, 1);
        assert_near(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_on_first_success() {
        let probe = MockProbe::new(vec![
            Err(ProbeFailure::Timeout),
            Err(ProbeFailure::WrongSource {
                expected: target(),
                actual: "198.51.100.1".parse().unwrap(),
            }),
            Ok(()),
            Ok(()),
        ]);
        let start = Instant::now();

        let attempts = waiter()
            .wait(&probe, target(), &ShutdownToken::new())
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(probe.calls(), 3);
        assert_near(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_deadline() {
        let probe = MockProbe::always_failing();
        let start = Instant::now();

        let err = waiter()
            .wait(&probe, target(), &ShutdownToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RemediationError::ReachabilityTimeout { target: t, .. } if t == target()
        ));
        assert!(err.to_string().contains(TARGET));
        assert_near(start.elapsed(), Duration::from_secs(15));
        // The tick at 15s coincides with the deadline
        assert_eq!(probe.calls(), 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_follow_cadence() {
        let probe = MockProbe::always_failing();
        let waiter = ReachabilityWaiter::new(Duration::from_millis(300), Duration::from_secs(2));

        let _ = waiter.wait(&probe, target(), &ShutdownToken::new()).await;

        // floor(2000 / 300)
        assert_eq!(probe.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_cut_off_by_deadline() {
        let probe = MockProbe::new(vec![Ok(())]).with_delay(Duration::from_secs(30));
        let start = Instant::now();

        let err = waiter()
            .wait(&probe, target(), &ShutdownToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RemediationError::ReachabilityTimeout { .. }));
        assert_near(start.elapsed(), Duration::from_secs(15));
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_result() {
        let probe = MockProbe::new(vec![Ok(())]).with_delay(Duration::from_secs(2));
        let token = ShutdownToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                // Lands while the first probe (started at 1s) is still running
                tokio::time::sleep(Duration::from_millis(1500)).await;
                token.cancel();
            })
        };

        let err = waiter().wait(&probe, target(), &token).await.unwrap_err();

        assert!(matches!(err, RemediationError::Cancelled));
        assert_eq!(probe.calls(), 1);
        canceller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_probes() {
        let probe = MockProbe::new(vec![Ok(())]);
        let token = ShutdownToken::new();
        token.cancel();

        let err = waiter().wait(&probe, target(), &token).await.unwrap_err();

        assert!(matches!(err, RemediationError::Cancelled));
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_zero_interval_clamped() {
        let waiter = ReachabilityWaiter::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(waiter.interval, Duration::from_millis(1));
    }
}
