//! Re-evaluation coordinator: decides when and for which users membership is
//! recomputed, and publishes each result through the cache materializer.
//!
//! Two entry points share one per-user pipeline:
//! - `run_sweep`: the whole population plus the reconciliation backlog
//!   against one catalog snapshot, on a bounded worker pool.
//! - `handle_event`: one order event, recomputing that user right away when
//!   the event asks for it.
//!
//! At most one recompute per user runs at a time. A trigger arriving while
//! the user is being evaluated is folded into the running one, which goes
//! round once more if the trigger carried a newer sequence. The folded-in
//! caller waits for the pass that covers its sequence and gets that pass's
//! result, errors included.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use daffodil_cache::{CacheMaterializer, PublishOutcome};
use daffodil_core::config::EvaluationConfig;
use daffodil_core::{AttributeReadError, MetricStore, OrderEvent, Sequence, StoreError};
use daffodil_segmentation::{resolve, CatalogSnapshot, SegmentCatalog};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::DaffodilError;
use crate::sequence::SequenceSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    Published { segments: usize },
    /// A newer materialization was already in the cache.
    Stale { last_applied: Sequence },
}

type RecomputeResult = Result<RecomputeOutcome, DaffodilError>;

/// Tally of one batch sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sequence: u64,
    pub catalog_version: u64,
    pub users: usize,
    pub published: usize,
    pub stale: usize,
    /// Users whose attributes could not be read.
    pub skipped: usize,
    pub failed: usize,
    /// Users never started because the sweep was cancelled.
    pub cancelled: usize,
    pub duration_ms: u64,
}

impl SweepReport {
    fn record(&mut self, user_id: &str, result: RecomputeResult) {
        match result {
            Ok(RecomputeOutcome::Published { .. }) => self.published += 1,
            Ok(RecomputeOutcome::Stale { .. }) => self.stale += 1,
            Err(DaffodilError::AttributeRead(e)) => {
                debug!(user_id = %user_id, error = %e, "Skipping user without readable attributes");
                self.skipped += 1;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "User recompute failed during sweep");
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    pending: Option<Pending>,
}

/// Triggers folded into a running recompute. Every waiter is covered by the
/// next pass, which runs at the newest of their sequences.
#[derive(Debug)]
struct Pending {
    sequence: Sequence,
    done: watch::Sender<Option<RecomputeResult>>,
}

enum Claim {
    Run,
    Wait(watch::Receiver<Option<RecomputeResult>>),
}

enum Next {
    Rerun(Pending),
    Release(Option<Pending>),
}

/// Releases a user's in-flight slot if the recompute future is dropped
/// before it finishes normally.
struct SlotGuard<'a> {
    in_flight: &'a DashMap<String, InFlight>,
    user_id: &'a str,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.remove(self.user_id);
        }
    }
}

pub struct Coordinator {
    metric_store: Arc<dyn MetricStore>,
    catalog: Arc<SegmentCatalog>,
    materializer: Arc<CacheMaterializer>,
    sequences: Arc<SequenceSource>,
    in_flight: DashMap<String, InFlight>,
    config: EvaluationConfig,
}

impl Coordinator {
    pub fn new(
        metric_store: Arc<dyn MetricStore>,
        catalog: Arc<SegmentCatalog>,
        materializer: Arc<CacheMaterializer>,
        sequences: Arc<SequenceSource>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            metric_store,
            catalog,
            materializer,
            sequences,
            in_flight: DashMap::new(),
            config,
        }
    }

    pub fn next_sequence(&self) -> Sequence {
        self.sequences.next()
    }

    pub fn materializer(&self) -> &Arc<CacheMaterializer> {
        &self.materializer
    }

    /// Number of users with a recompute currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Incremental path: fold the order into the metric store, then recompute
    /// the user immediately if the event requests instant sync.
    pub async fn handle_event(
        &self,
        event: &OrderEvent,
        sequence: Sequence,
    ) -> Result<Option<RecomputeOutcome>, DaffodilError> {
        if event.user_id.trim().is_empty() {
            return Err(DaffodilError::InvalidEvent("empty user_id".into()));
        }

        metrics::counter!("events.received").increment(1);
        self.store_op(self.metric_store.record_order(event)).await?;

        if !event.instant_sync {
            debug!(user_id = %event.user_id, "Order recorded, waiting for next sweep");
            return Ok(None);
        }

        let outcome = self.recompute_user(&event.user_id, sequence).await?;
        Ok(Some(outcome))
    }

    /// Create an empty metrics row for a user who has none, so sweeps pick
    /// them up before their first order.
    pub async fn register_user(&self, user_id: &str) -> Result<(), DaffodilError> {
        if user_id.trim().is_empty() {
            return Err(DaffodilError::InvalidEvent("empty user_id".into()));
        }
        self.store_op(self.metric_store.ensure_user(user_id)).await?;
        info!(user_id = %user_id, "User registered");
        Ok(())
    }

    /// Recompute one user against a freshly loaded catalog snapshot.
    pub async fn recompute_user(
        &self,
        user_id: &str,
        sequence: Sequence,
    ) -> Result<RecomputeOutcome, DaffodilError> {
        self.recompute(user_id, sequence, None).await
    }

    /// Batch path: every known user plus every user flagged for
    /// reconciliation, evaluated against one snapshot. Setting `shutdown` to
    /// `true` stops new users from starting; users already running finish.
    pub async fn run_sweep(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SweepReport, DaffodilError> {
        let start = Instant::now();
        let sequence = self.sequences.next();
        let snapshot = Arc::new(self.load_snapshot().await?);

        let mut users: BTreeSet<String> = self
            .store_op(self.metric_store.list_users())
            .await?
            .into_iter()
            .collect();
        users.extend(self.materializer.backlog().users());

        let mut report = SweepReport {
            sequence: sequence.0,
            catalog_version: snapshot.version(),
            users: users.len(),
            ..SweepReport::default()
        };

        info!(
            sequence = %sequence,
            catalog_version = snapshot.version(),
            users = users.len(),
            segments = snapshot.len(),
            "Sweep started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut started = 0;

        for user_id in users {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            started += 1;
            let this = Arc::clone(self);
            let snapshot = Arc::clone(&snapshot);
            tasks.spawn(async move {
                let result = this.recompute(&user_id, sequence, Some(snapshot)).await;
                drop(permit);
                (user_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            collect(&mut report, joined);
        }

        report.cancelled = report.users - started;
        report.duration_ms = start.elapsed().as_millis() as u64;

        metrics::counter!("sweep.completed").increment(1);
        metrics::histogram!("sweep.duration_ms").record(report.duration_ms as f64);
        if report.cancelled > 0 {
            warn!(cancelled = report.cancelled, "Sweep cancelled before all users started");
        }
        info!(
            sequence = report.sequence,
            published = report.published,
            stale = report.stale,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Sweep finished"
        );

        Ok(report)
    }

    async fn recompute(
        &self,
        user_id: &str,
        sequence: Sequence,
        snapshot: Option<Arc<CatalogSnapshot>>,
    ) -> RecomputeResult {
        loop {
            match self.claim(user_id, sequence) {
                Claim::Run => return self.run_claimed(user_id, sequence, snapshot).await,
                Claim::Wait(mut done) => {
                    metrics::counter!("recompute.coalesced").increment(1);
                    debug!(user_id = %user_id, sequence = %sequence, "Recompute coalesced into running one");
                    if let Ok(result) = done.wait_for(Option::is_some).await {
                        if let Some(result) = result.as_ref() {
                            return result.clone();
                        }
                    }
                    // The running recompute was dropped; claim the slot again.
                }
            }
        }
    }

    /// Runs the caller's own pass, then one pass per batch of folded-in
    /// triggers. Returns the caller's own result.
    async fn run_claimed(
        &self,
        user_id: &str,
        sequence: Sequence,
        snapshot: Option<Arc<CatalogSnapshot>>,
    ) -> RecomputeResult {
        let mut guard = SlotGuard {
            in_flight: &self.in_flight,
            user_id,
            armed: true,
        };

        let own = self.evaluate_and_publish(user_id, sequence, snapshot).await;
        let mut covered = sequence;
        let mut last = own.clone();
        loop {
            match self.finish(user_id, covered) {
                Next::Rerun(pending) => {
                    debug!(user_id = %user_id, sequence = %pending.sequence, "Re-running recompute for newer trigger");
                    let result = self
                        .evaluate_and_publish(user_id, pending.sequence, None)
                        .await;
                    if let Err(e) = &result {
                        warn!(
                            user_id = %user_id,
                            sequence = %pending.sequence,
                            error = %e,
                            "Coalesced recompute failed"
                        );
                    }
                    covered = pending.sequence;
                    pending.done.send_replace(Some(result.clone()));
                    last = result;
                }
                Next::Release(waiting) => {
                    guard.armed = false;
                    if let Some(pending) = waiting {
                        pending.done.send_replace(Some(last));
                    }
                    return own;
                }
            }
        }
    }

    async fn evaluate_and_publish(
        &self,
        user_id: &str,
        sequence: Sequence,
        snapshot: Option<Arc<CatalogSnapshot>>,
    ) -> RecomputeResult {
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => Arc::new(self.load_snapshot().await?),
        };

        let timeout = self.config.operation_timeout();
        let user_metrics = tokio::time::timeout(timeout, self.metric_store.fetch_metrics(user_id))
            .await
            .unwrap_or(Err(AttributeReadError::Store(StoreError::Timeout(
                timeout.as_millis() as u64,
            ))))?;

        let result = resolve(user_id, &user_metrics.attributes(), &snapshot, sequence);
        metrics::counter!("segments.evaluated").increment(snapshot.len() as u64);

        let segments = result.matched_segments.len();
        match self.materializer.publish(&result, sequence).await? {
            PublishOutcome::Applied => Ok(RecomputeOutcome::Published { segments }),
            PublishOutcome::Stale { last_applied } => Ok(RecomputeOutcome::Stale { last_applied }),
        }
    }

    fn claim(&self, user_id: &str, sequence: Sequence) -> Claim {
        match self.in_flight.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut().pending.get_or_insert_with(|| Pending {
                    sequence,
                    done: watch::channel(None).0,
                });
                pending.sequence = pending.sequence.max(sequence);
                Claim::Wait(pending.done.subscribe())
            }
            Entry::Vacant(entry) => {
                entry.insert(InFlight::default());
                Claim::Run
            }
        }
    }

    /// Hands back the next batch of triggers to run, or releases the slot
    /// along with any triggers the completed pass already covers.
    fn finish(&self, user_id: &str, completed: Sequence) -> Next {
        match self.in_flight.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut().pending.take() {
                Some(pending) if pending.sequence > completed => Next::Rerun(pending),
                waiting => {
                    entry.remove();
                    Next::Release(waiting)
                }
            },
            Entry::Vacant(_) => Next::Release(None),
        }
    }

    async fn load_snapshot(&self) -> Result<CatalogSnapshot, DaffodilError> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, self.catalog.load_snapshot()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DaffodilError::Timeout {
                operation: "catalog_load",
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn store_op<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, DaffodilError> {
        let timeout: Duration = self.config.operation_timeout();
        tokio::time::timeout(timeout, op)
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout.as_millis() as u64)))
            .map_err(DaffodilError::from)
    }
}

fn collect(
    report: &mut SweepReport,
    joined: Result<(String, RecomputeResult), tokio::task::JoinError>,
) {
    match joined {
        Ok((user_id, result)) => report.record(&user_id, result),
        Err(e) => {
            error!(error = %e, "Sweep worker panicked");
            report.failed += 1;
        }
    }
}

/// Resolves once `shutdown` holds `true`. A dropped sender never cancels.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
