use crate::{
    ble::BleTransport,
    device::PeripheralReader,
    error::{MifloraError, Result},
    retry::{RetryController, RetryPolicy},
    types::{ErrorMetric, Metric, Peripheral, SweepParams},
};
use std::future::Future;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Success and failure counts over the lifetime of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStats {
    /// Peripherals read successfully
    pub successes: u64,
    /// Peripherals that failed every attempt
    pub failures: u64,
}

/// How a sweep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Every peripheral was visited
    Completed,
    /// Cancellation was raised, remaining peripherals were skipped
    Cancelled,
}

/// Check the sweep timing against the number of peripherals
///
/// A sweep must always finish before the next one is due, so the interval has
/// to exceed the worst case of every attempt of every peripheral timing out.
///
/// # Errors
///
/// Returns [`MifloraError::Validation`] if there are no peripherals, no
/// attempts, or the interval is too short.
pub fn validate_sweep_params(params: &SweepParams, peripheral_count: usize) -> Result<()> {
    if peripheral_count == 0 {
        return Err(MifloraError::Validation(
            "at least one peripheral address is required".to_string(),
        ));
    }

    if params.max_attempts == 0 {
        return Err(MifloraError::Validation(
            "max attempts must be at least 1".to_string(),
        ));
    }

    if params.scan_timeout_ms == 0 {
        return Err(MifloraError::Validation(
            "scan timeout must be greater than 0".to_string(),
        ));
    }

    let worst_case = params.worst_case_sweep(peripheral_count);
    if params.interval() <= worst_case {
        return Err(MifloraError::Validation(format!(
            "interval {}ms must be greater than scan timeout {}ms x {} attempts x {} \
             peripherals = {}ms",
            params.interval_ms,
            params.scan_timeout_ms,
            params.max_attempts,
            peripheral_count,
            worst_case.as_millis()
        )));
    }

    Ok(())
}

/// Periodically reads every configured peripheral in order
///
/// The scheduler owns the radio transport and the per-peripheral metadata
/// cache. Readings and failures leave through the metric channel; cancellation
/// comes in through the watch channel and is honored between peripherals.
pub struct SweepScheduler<T: BleTransport> {
    transport: T,
    peripherals: Vec<Peripheral>,
    params: SweepParams,
    stats: SweepStats,
    metrics: mpsc::Sender<Metric>,
    cancel: watch::Receiver<bool>,
}

impl<T: BleTransport> SweepScheduler<T> {
    /// Create a scheduler
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Validation`] if the parameters fail
    /// [`validate_sweep_params`].
    pub fn new(
        transport: T,
        peripherals: Vec<Peripheral>,
        params: SweepParams,
        metrics: mpsc::Sender<Metric>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        validate_sweep_params(&params, peripherals.len())?;

        Ok(Self {
            transport,
            peripherals,
            params,
            stats: SweepStats::default(),
            metrics,
            cancel,
        })
    }

    /// Counters accumulated so far
    #[must_use]
    pub const fn stats(&self) -> SweepStats {
        self.stats
    }

    /// Configured peripherals with their cached metadata
    #[must_use]
    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    /// Visit every peripheral once
    ///
    /// Emits one metric per visited peripheral. Returns
    /// [`SweepOutcome::Cancelled`] if cancellation was raised or the metric
    /// channel closed before the last peripheral.
    pub async fn sweep(&mut self) -> SweepOutcome {
        let controller = RetryController::new(
            PeripheralReader::new(&self.transport, self.params.scan_timeout()),
            RetryPolicy::new(self.params.max_attempts),
        );

        for peripheral in &mut self.peripherals {
            if *self.cancel.borrow() {
                info!("Sweep cancelled before {}", peripheral.id);
                return SweepOutcome::Cancelled;
            }

            let metric = match controller.read(peripheral).await {
                Ok(data) => {
                    self.stats.successes += 1;
                    Metric::Data(data)
                }
                Err(e) => {
                    error!("Giving up on {} for this sweep: {}", peripheral.id, e);
                    self.stats.failures += 1;
                    Metric::Error(ErrorMetric {
                        peripheral_id: peripheral.id.clone(),
                        failed: 1,
                    })
                }
            };

            if self.metrics.send(metric).await.is_err() {
                warn!("Metric channel closed, stopping sweep");
                return SweepOutcome::Cancelled;
            }
        }

        debug!(
            "Sweep completed: {} successes, {} failures so far",
            self.stats.successes, self.stats.failures
        );
        SweepOutcome::Completed
    }

    /// Sweep immediately, then once per interval, until cancelled
    ///
    /// A sweep that overruns the interval delays the next tick instead of
    /// causing a burst. Releases the transport before returning.
    pub async fn run(mut self) -> SweepStats {
        info!(
            "Sweeping {} peripherals every {}ms",
            self.peripherals.len(),
            self.params.interval_ms
        );

        let mut ticker = interval(self.params.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.cancel.borrow() {
                break;
            }

            let cancel_signal = tokio::select! {
                biased;
                changed = self.cancel.changed() => Some(changed),
                _ = ticker.tick() => None,
            };

            match cancel_signal {
                Some(Err(_)) => {
                    debug!("Cancellation sender dropped");
                    break;
                }
                Some(Ok(())) => continue,
                None => {
                    if self.sweep().await == SweepOutcome::Cancelled {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Release the radio transport and report the final counters
    pub async fn shutdown(self) -> SweepStats {
        if let Err(e) = self.transport.shutdown().await {
            warn!("Failed to release Bluetooth adapter: {}", e);
        }

        info!(
            "Failures: {}, Successes: {}",
            self.stats.failures, self.stats.successes
        );
        self.stats
    }
}

/// Run `scheduler` until `shutdown` resolves, then stop it
///
/// Once `shutdown` resolves, `cancel` is raised and the scheduler gets
/// [`SweepParams::grace_period`] to finish the peripheral in flight and release
/// the transport. Returns `None` if it had to be abandoned.
pub async fn run_until<T: BleTransport>(
    scheduler: SweepScheduler<T>,
    cancel: &watch::Sender<bool>,
    shutdown: impl Future<Output = ()>,
) -> Option<SweepStats> {
    let grace_period = scheduler.params.grace_period();
    let run = scheduler.run();
    tokio::pin!(run);

    tokio::select! {
        stats = &mut run => return Some(stats),
        () = shutdown => info!("Shutting down..."),
    }

    // Fails only once the scheduler dropped its receiver.
    let _ = cancel.send(true);

    match tokio::time::timeout(grace_period, run).await {
        Ok(stats) => Some(stats),
        Err(_) => {
            warn!(
                "Sweep did not finish within {}ms, abandoning it",
                grace_period.as_millis()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{Call, MockTransport};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const PRESENT: &str = "C4:7C:8D:6A:12:34";
    const ABSENT: &str = "C4:7C:8D:6A:99:99";

    fn params(interval_ms: u64) -> SweepParams {
        SweepParams {
            scan_timeout_ms: 1_000,
            interval_ms,
            max_attempts: 2,
        }
    }

    #[test]
    fn test_interval_must_exceed_worst_case() {
        // 1000ms x 2 attempts x 3 peripherals
        assert_err!(validate_sweep_params(&params(6_000), 3));
        assert_err!(validate_sweep_params(&params(5_999), 3));
        assert_ok!(validate_sweep_params(&params(6_001), 3));
        assert_ok!(validate_sweep_params(&SweepParams::default(), 1));
    }

    #[test]
    fn test_degenerate_configurations_are_rejected() {
        let error = validate_sweep_params(&params(60_000), 0).unwrap_err();
        assert!(error.is_fatal());

        let zero_attempts = SweepParams {
            max_attempts: 0,
            ..params(60_000)
        };
        assert!(matches!(
            validate_sweep_params(&zero_attempts, 1),
            Err(MifloraError::Validation(_))
        ));

        let zero_timeout = SweepParams {
            scan_timeout_ms: 0,
            ..params(60_000)
        };
        assert_err!(validate_sweep_params(&zero_timeout, 1));
    }

    #[test]
    fn test_new_rejects_short_interval() {
        let (metric_tx, _metric_rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = SweepScheduler::new(
            MockTransport::with_firmware(PRESENT, "2.7.0"),
            vec![Peripheral::new(PRESENT), Peripheral::new(ABSENT)],
            params(4_000),
            metric_tx,
            cancel_rx,
        );

        assert!(matches!(result, Err(MifloraError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_emits_one_metric_per_peripheral_in_order() {
        let (metric_tx, mut metric_rx) = mpsc::channel(10);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut scheduler = SweepScheduler::new(
            MockTransport::with_firmware(PRESENT, "2.7.0"),
            vec![
                Peripheral::new(ABSENT),
                Peripheral::new(PRESENT),
                Peripheral::new(PRESENT),
            ],
            params(60_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();

        assert_eq!(scheduler.sweep().await, SweepOutcome::Completed);

        match metric_rx.recv().await.unwrap() {
            Metric::Error(error) => {
                assert_eq!(error.peripheral_id, ABSENT);
                assert_eq!(error.failed, 1);
            }
            other => panic!("unexpected metric: {other:?}"),
        }
        for _ in 0..2 {
            let metric = metric_rx.recv().await.unwrap();
            assert!(matches!(metric, Metric::Data(_)));
            assert_eq!(metric.peripheral_id(), PRESENT);
        }
        assert!(metric_rx.try_recv().is_err());

        assert_eq!(
            scheduler.stats(),
            SweepStats {
                successes: 2,
                failures: 1,
            }
        );
        // duplicates keep their own metadata cache
        assert!(scheduler
            .peripherals()
            .iter()
            .skip(1)
            .all(|p| p.cached_metadata.firmware_version == "2.7.0"));
    }

    #[tokio::test]
    async fn test_raised_cancellation_skips_remaining_peripherals() {
        let (metric_tx, mut metric_rx) = mpsc::channel(10);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut scheduler = SweepScheduler::new(
            MockTransport::with_firmware(PRESENT, "2.7.0"),
            vec![Peripheral::new(PRESENT), Peripheral::new(PRESENT)],
            params(60_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();

        cancel_tx.send(true).unwrap();

        assert_eq!(scheduler.sweep().await, SweepOutcome::Cancelled);
        assert!(metric_rx.try_recv().is_err());
        assert_eq!(scheduler.stats(), SweepStats::default());
    }

    #[tokio::test]
    async fn test_closed_metric_channel_stops_sweep() {
        let (metric_tx, metric_rx) = mpsc::channel(10);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut scheduler = SweepScheduler::new(
            MockTransport::with_firmware(PRESENT, "2.7.0"),
            vec![Peripheral::new(PRESENT), Peripheral::new(PRESENT)],
            params(60_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();
        drop(metric_rx);

        assert_eq!(scheduler.sweep().await, SweepOutcome::Cancelled);
        assert_eq!(scheduler.stats().successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_immediately_then_every_interval() {
        let (metric_tx, mut metric_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let scheduler = SweepScheduler::new(
            MockTransport::with_firmware(PRESENT, "2.7.0"),
            vec![Peripheral::new(PRESENT)],
            params(25_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();

        let start = Instant::now();
        let handle = tokio::spawn(scheduler.run());

        assert!(metric_rx.recv().await.is_some());
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(metric_rx.recv().await.is_some());
        assert!(start.elapsed() >= Duration::from_secs(25));

        cancel_tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_sweep_stops_before_next_peripheral() {
        let (metric_tx, mut metric_rx) = mpsc::channel(10);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let transport = MockTransport::with_firmware(PRESENT, "2.7.0");
        let calls = transport.call_log();
        let scheduler = SweepScheduler::new(
            transport,
            vec![
                Peripheral::new(PRESENT),
                Peripheral::new(ABSENT),
                Peripheral::new(PRESENT),
            ],
            params(60_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();

        let start = Instant::now();
        // raised while the absent peripheral is being scanned
        let shutdown = tokio::time::sleep(Duration::from_millis(500));
        let stats = run_until(scheduler, &cancel_tx, shutdown).await;

        assert_eq!(
            stats,
            Some(SweepStats {
                successes: 1,
                failures: 1,
            })
        );
        let grace_period = params(60_000).grace_period();
        assert!(start.elapsed() <= Duration::from_millis(500) + grace_period);
        assert!(*cancel_tx.borrow());

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Scan(_))).count(), 3);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Connect(_))).count(), 1);
        assert_eq!(calls.last(), Some(&Call::Shutdown));

        assert!(matches!(metric_rx.recv().await, Some(Metric::Data(_))));
        assert!(matches!(metric_rx.recv().await, Some(Metric::Error(_))));
        assert!(metric_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sweep_is_abandoned_after_grace_period() {
        let (metric_tx, _metric_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let transport = MockTransport::with_firmware(PRESENT, "2.7.0");
        let calls = transport.call_log();
        let scheduler = SweepScheduler::new(
            transport,
            vec![Peripheral::new(PRESENT), Peripheral::new(PRESENT)],
            params(60_000),
            metric_tx,
            cancel_rx,
        )
        .unwrap();

        let start = Instant::now();
        // nobody drains the metric channel, so the second send never completes
        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let stats = run_until(scheduler, &cancel_tx, shutdown).await;

        assert_eq!(stats, None);
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(100) + params(60_000).grace_period()
        );
        assert!(!calls.lock().unwrap().contains(&Call::Shutdown));
    }
}
