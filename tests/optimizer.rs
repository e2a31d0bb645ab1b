use fanout::metrics::{FailureKind, MetricsWindow, NullSink};
use fanout::optimizer::{
    FixedProbe, Optimizer, OptimizerConfig, ResourceProbe, Tuning, TuningCell,
};
use std::sync::Arc;
use std::time::Duration;

fn tuning(concurrency: usize) -> Tuning {
    Tuning {
        concurrency,
        timeout: Duration::from_secs(30),
        requests_per_second: 20.0,
        failure_threshold: 5,
    }
}

fn optimizer(cell: &TuningCell, metrics: &Arc<MetricsWindow>, cap: usize) -> Optimizer {
    Optimizer::new(
        cell.clone(),
        Arc::clone(metrics),
        Arc::new(FixedProbe(cap)),
        Arc::new(NullSink),
        OptimizerConfig::default(),
    )
}

fn cycle(metrics: &MetricsWindow, optimizer: &Optimizer, successes: u64, failures: u64) {
    for _ in 0..(successes + failures) {
        metrics.record_attempt();
    }
    for _ in 0..successes {
        metrics.record_success(Duration::from_millis(50));
    }
    for _ in 0..failures {
        metrics.record_failure(FailureKind::Connection);
    }
    optimizer.adjust();
}

#[test]
fn sustained_failure_converges_to_minimum_concurrency() {
    let cell = TuningCell::new(tuning(16));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = optimizer(&cell, &metrics, 64);

    // 70% success: below the low watermark every cycle. Concurrency drops
    // strictly each cycle until the floor.
    let mut previous = cell.get().concurrency;
    for _ in 0..5 {
        cycle(&metrics, &optimizer, 70, 30);
        let current = cell.get().concurrency;
        if previous > 1 {
            assert!(current < previous, "concurrency did not decrease");
        } else {
            assert_eq!(current, 1);
        }
        previous = current;
    }
    assert_eq!(previous, 1);

    // Floor holds under continued failure.
    cycle(&metrics, &optimizer, 70, 30);
    assert_eq!(cell.get().concurrency, 1);
}

#[test]
fn sustained_health_climbs_to_the_resource_cap() {
    let cell = TuningCell::new(tuning(2));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = optimizer(&cell, &metrics, 20);

    let mut previous = cell.get().concurrency;
    for _ in 0..30 {
        cycle(&metrics, &optimizer, 100, 0);
        let current = cell.get().concurrency;
        assert!(current >= previous, "concurrency fell while healthy");
        assert!(current <= 20, "concurrency exceeded the cap");
        previous = current;
    }
    assert_eq!(previous, 20);

    // The cap holds under continued health.
    cycle(&metrics, &optimizer, 100, 0);
    assert_eq!(cell.get().concurrency, 20);
}

#[test]
fn crash_and_recovery_cycle() {
    let cell = TuningCell::new(tuning(8));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = optimizer(&cell, &metrics, 64);

    // Outage: two bad cycles halve twice.
    cycle(&metrics, &optimizer, 10, 90);
    cycle(&metrics, &optimizer, 10, 90);
    assert_eq!(cell.get().concurrency, 2);
    assert_eq!(cell.get().requests_per_second, 5.0);

    // Recovery climbs back one slot per cycle and the rate grows toward its
    // configured value without overshooting it.
    for _ in 0..10 {
        cycle(&metrics, &optimizer, 100, 0);
        assert!(cell.get().requests_per_second <= 20.0);
    }
    assert_eq!(cell.get().concurrency, 12);
    assert_eq!(cell.get().requests_per_second, 20.0);
}

#[test]
fn timeout_follows_observed_latency() {
    let cell = TuningCell::new(tuning(8));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = optimizer(&cell, &metrics, 64);

    for _ in 0..200 {
        metrics.record_attempt();
        metrics.record_success(Duration::from_secs(2));
    }
    optimizer.adjust();

    // Roughly 2 x p95, allowing for histogram precision.
    let timeout = cell.get().timeout;
    assert!(timeout >= Duration::from_millis(3950), "timeout was {timeout:?}");
    assert!(timeout <= Duration::from_millis(4050), "timeout was {timeout:?}");
}

#[test]
fn probe_errors_leave_tuning_untouched() {
    struct BrokenProbe;
    impl ResourceProbe for BrokenProbe {
        fn concurrency_cap(&self) -> Result<usize, fanout::optimizer::ProbeError> {
            Err(fanout::optimizer::ProbeError("no /proc".to_owned()))
        }
    }

    let cell = TuningCell::new(tuning(8));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = Optimizer::new(
        cell.clone(),
        Arc::clone(&metrics),
        Arc::new(BrokenProbe),
        Arc::new(NullSink),
        OptimizerConfig::default(),
    );

    for _ in 0..100 {
        metrics.record_attempt();
        metrics.record_success(Duration::from_millis(10));
    }
    optimizer.adjust();

    assert_eq!(*cell.get(), tuning(8));
}

#[tokio::test(start_paused = true)]
async fn background_loop_adjusts_on_its_interval() {
    let cell = TuningCell::new(tuning(2));
    let metrics = Arc::new(MetricsWindow::new());
    let optimizer = Arc::new(Optimizer::new(
        cell.clone(),
        Arc::clone(&metrics),
        Arc::new(FixedProbe(20)),
        Arc::new(NullSink),
        OptimizerConfig { interval: Duration::from_secs(10), ..Default::default() },
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(Arc::clone(&optimizer).run(shutdown_rx));

    for _ in 0..20 {
        metrics.record_attempt();
        metrics.record_success(Duration::from_millis(10));
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(cell.get().concurrency, 3);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}
