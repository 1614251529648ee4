use crate::merger::merge_relabel_rules;
use crate::metrics_defs::{
    PATROL_CYCLE_DURATION, PATROL_CYCLE_ERRORS, PATROL_CYCLES, PATROL_LAST_SUCCESS,
};
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::relabel::generate;
use crate::scanner::{CardinalityScanner, QueryFailure};
use crate::types::{HighCardinalitySeries, RelabelRule};
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

#[derive(Debug, PartialEq)]
pub struct CycleReport {
    pub detected: Vec<HighCardinalitySeries>,
    pub rules_generated: usize,
    pub query_failures: usize,
    /// `None` when nothing was detected and the store was not touched.
    pub outcome: Option<ReconcileOutcome>,
}

#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error("all {} cardinality queries failed, first error: {}", .failures.len(), first_failure(.failures))]
    Scan { failures: Vec<QueryFailure> },
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

fn first_failure(failures: &[QueryFailure]) -> String {
    failures
        .first()
        .map(|f| format!("{}: {}", f.label, f.error))
        .unwrap_or_default()
}

impl CycleError {
    fn stage(&self) -> &'static str {
        match self {
            CycleError::Scan { .. } => "scan",
            CycleError::Reconcile(_) => "reconcile",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PatrolError {
    #[error("the patrol loop is not running")]
    Stopped,
    #[error("patrol loop did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

#[derive(Debug)]
pub enum Command {
    // Run a cycle now instead of waiting for the next tick. The cycle result
    // is sent back once it completes.
    RunNow(oneshot::Sender<Result<CycleReport, CycleError>>),
    // Stop the loop. An in-flight cycle is completed first.
    Shutdown,
}

/// Drives scan → generate → reconcile on a fixed interval.
pub struct Patrol {
    scanner: CardinalityScanner,
    reconciler: Reconciler,
    top_n: usize,
    threshold: f64,
    interval: Duration,
}

impl Patrol {
    pub fn new(
        scanner: CardinalityScanner,
        reconciler: Reconciler,
        top_n: usize,
        threshold: f64,
        interval: Duration,
    ) -> Self {
        Patrol {
            scanner,
            reconciler,
            top_n,
            threshold,
            interval,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// One full pass. All rules found in the scan are merged in a single
    /// reconciliation. If only some queries failed, the cycle continues with
    /// what the others found.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let scan = self.scanner.scan(self.top_n, self.threshold).await;
        if scan.all_failed() {
            return Err(CycleError::Scan {
                failures: scan.failures,
            });
        }

        let rules: Vec<RelabelRule> = scan.series.iter().map(generate).collect();

        let outcome = if rules.is_empty() {
            None
        } else {
            Some(
                self.reconciler
                    .reconcile(|doc| merge_relabel_rules(doc, &rules))
                    .await?,
            )
        };

        Ok(CycleReport {
            detected: scan.series,
            rules_generated: rules.len(),
            query_failures: scan.failures.len(),
            outcome,
        })
    }

    /// Runs a cycle and records its result. Errors never escape the loop.
    async fn cycle(&self) -> Result<CycleReport, CycleError> {
        let start = Instant::now();
        let result = self.run_cycle().await;

        counter!(PATROL_CYCLES).increment(1);
        histogram!(PATROL_CYCLE_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(report) => {
                if report.query_failures > 0 {
                    tracing::warn!(
                        failed_queries = report.query_failures,
                        "patrol cycle completed with partial scan results"
                    );
                }
                if let Some(ReconcileOutcome::Written { attempts }) = report.outcome {
                    tracing::info!(
                        rules = report.rules_generated,
                        attempts,
                        "silenced high cardinality labels"
                    );
                } else {
                    tracing::debug!(
                        detected = report.detected.len(),
                        "patrol cycle completed without changes"
                    );
                }

                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                gauge!(PATROL_LAST_SUCCESS).set(now.as_secs_f64());
            }
            Err(e) => {
                tracing::error!(stage = e.stage(), error = %e, "patrol cycle failed");
                counter!(PATROL_CYCLE_ERRORS, "stage" => e.stage()).increment(1);
            }
        }

        result
    }

    /// Starts the loop on its own task. `ready` is raised while the loop runs.
    pub fn spawn(self, ready: Arc<AtomicBool>) -> PatrolHandle {
        // Channel to send commands to the patrol task.
        let (tx, rx) = mpsc::channel::<Command>(16);

        let handle = tokio::spawn(async move {
            ready.store(true, Ordering::Relaxed);
            self.run(rx).await;
            ready.store(false, Ordering::Relaxed);
        });

        PatrolHandle { tx, handle }
    }

    /// Cycles run on this task only and each one is awaited before the next
    /// tick or command is looked at, so cycles never overlap.
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the first cycle runs one interval in.
        ticker.tick().await;

        tracing::info!(interval = ?self.interval, "patrol started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.cycle().await;
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::RunNow(reply)) => {
                        let _ = reply.send(self.cycle().await);
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
        }

        tracing::info!("patrol stopped");
    }
}

pub struct PatrolHandle {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl PatrolHandle {
    /// Runs a cycle as soon as the loop is idle and returns its result.
    pub async fn run_now(&self) -> Result<CycleReport, PatrolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::RunNow(reply_tx))
            .await
            .map_err(|_| PatrolError::Stopped)?;

        Ok(reply_rx.await.map_err(|_| PatrolError::Stopped)??)
    }

    /// Asks the loop to stop and waits up to `grace` for an in-flight cycle
    /// to finish.
    pub async fn shutdown(self, grace: Duration) -> Result<(), PatrolError> {
        let _ = self.tx.send(Command::Shutdown).await;

        match timeout(grace, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "patrol task failed");
                Ok(())
            }
            Err(_) => Err(PatrolError::ShutdownTimeout(grace)),
        }
    }
}
