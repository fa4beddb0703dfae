// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record dispositions and per-target totals.

use crate::batch::Batch;
use crate::errors::IngestError;
use crate::outcome::{DropReason, FailureReason};
use crate::record::{RecordId, Target};
use crate::retry::DeliveryReport;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Settled dispositions kept per target before the oldest are forgotten.
pub const DEFAULT_RETAINED_DISPOSITIONS: usize = 100_000;

/// Where a record currently stands. Every admitted record moves from `Pending` to exactly one of
/// the other variants.
///
/// Records of one failed batch share a single [`FailureReason`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Pending,
    Delivered,
    FailedPermanent(Arc<FailureReason>),
    Dropped(DropReason),
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A batch, or a set of records, that will never be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Unset when the records failed before they were batched.
    pub batch_sequence: Option<u64>,
    pub records: usize,
    pub attempts: u32,
    pub reason: Arc<FailureReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStatus {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    pub pending: usize,
    /// Transient failures that were followed by a retry or ended the batch.
    pub retries: usize,
    pub failures: Vec<FailureReport>,
}

impl TargetStatus {
    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

struct TargetLedger {
    status: TargetStatus,
    records: HashMap<RecordId, Disposition>,
    /// Settled records, oldest first
    settled: VecDeque<RecordId>,
    retained: usize,
    pending_tx: watch::Sender<usize>,
}

impl TargetLedger {
    fn new(retained: usize) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            status: TargetStatus::default(),
            records: HashMap::new(),
            settled: VecDeque::new(),
            retained,
            pending_tx,
        }
    }

    fn settle(&mut self, id: RecordId, disposition: &Disposition) {
        let Some(current) = self.records.get_mut(&id) else {
            return;
        };
        if current.is_terminal() || !disposition.is_terminal() {
            return;
        }
        match disposition {
            Disposition::Delivered => self.status.delivered += 1,
            Disposition::FailedPermanent(_) => self.status.failed += 1,
            Disposition::Dropped(_) => self.status.dropped += 1,
            Disposition::Pending => {}
        }
        *current = disposition.clone();
        self.status.pending = self.status.pending.saturating_sub(1);

        self.settled.push_back(id);
        while self.settled.len() > self.retained {
            if let Some(oldest) = self.settled.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    fn publish(&self) {
        self.pending_tx.send_replace(self.status.pending);
    }
}

/// Tracks what happened to every admitted record, per target.
///
/// Pending records are always tracked. Once settled, only the most recent `retained`
/// dispositions per target stay queryable; the totals keep counting everything.
pub struct ResultAggregator {
    targets: Mutex<HashMap<Target, TargetLedger>>,
    retained: usize,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_DISPOSITIONS)
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retained: usize) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            retained,
        }
    }

    fn with_ledger<R>(&self, target: &Target, f: impl FnOnce(&mut TargetLedger) -> R) -> R {
        #[allow(clippy::expect_used)]
        let mut targets = self.targets.lock().expect("lock poisoned");
        let retained = self.retained;
        f(targets
            .entry(target.clone())
            .or_insert_with(|| TargetLedger::new(retained)))
    }

    /// Registers a record as pending. Called once per record, when it is submitted.
    pub fn admit(&self, target: &Target, id: RecordId) {
        self.with_ledger(target, |ledger| {
            if ledger.records.insert(id, Disposition::Pending).is_none() {
                ledger.status.pending += 1;
                ledger.publish();
            }
        });
    }

    /// Applies the terminal outcome of a delivered, failed or abandoned batch to its records.
    pub fn record(&self, batch: &Batch, report: &DeliveryReport) {
        let disposition = match (&report.failure, report.dropped) {
            (Some(reason), _) => Disposition::FailedPermanent(Arc::new(reason.clone())),
            (None, Some(reason)) => Disposition::Dropped(reason),
            (None, None) => Disposition::Delivered,
        };
        self.with_ledger(batch.target(), |ledger| {
            ledger.status.retries += report.transient_failures();
            if let Disposition::FailedPermanent(reason) = &disposition {
                ledger.status.failures.push(FailureReport {
                    batch_sequence: Some(batch.sequence()),
                    records: batch.len(),
                    attempts: report.attempts.len() as u32,
                    reason: Arc::clone(reason),
                });
            }
            for id in batch.record_ids() {
                ledger.settle(*id, &disposition);
            }
            ledger.publish();
        });
    }

    /// Marks records as permanently failed without any delivery attempt.
    pub(crate) fn fail_records(
        &self,
        target: &Target,
        batch_sequence: Option<u64>,
        ids: &[RecordId],
        reason: FailureReason,
    ) {
        let reason = Arc::new(reason);
        self.with_ledger(target, |ledger| {
            ledger.status.failures.push(FailureReport {
                batch_sequence,
                records: ids.len(),
                attempts: 0,
                reason: Arc::clone(&reason),
            });
            let disposition = Disposition::FailedPermanent(reason);
            for id in ids {
                ledger.settle(*id, &disposition);
            }
            ledger.publish();
        });
    }

    pub(crate) fn drop_records(&self, target: &Target, ids: &[RecordId], reason: DropReason) {
        if ids.is_empty() {
            return;
        }
        debug!(destination = %target, records = ids.len(), "Dropping records: {reason}");
        self.with_ledger(target, |ledger| {
            let disposition = Disposition::Dropped(reason);
            for id in ids {
                ledger.settle(*id, &disposition);
            }
            ledger.publish();
        });
    }

    /// Snapshot of the target's totals.
    pub fn status(&self, target: &Target) -> TargetStatus {
        #[allow(clippy::expect_used)]
        let targets = self.targets.lock().expect("lock poisoned");
        targets
            .get(target)
            .map(|ledger| ledger.status.clone())
            .unwrap_or_default()
    }

    pub fn disposition(&self, target: &Target, id: RecordId) -> Option<Disposition> {
        #[allow(clippy::expect_used)]
        let targets = self.targets.lock().expect("lock poisoned");
        targets
            .get(target)
            .and_then(|ledger| ledger.records.get(&id).cloned())
    }

    /// Every target seen so far, ordered by target.
    pub fn report(&self) -> Vec<(Target, TargetStatus)> {
        #[allow(clippy::expect_used)]
        let targets = self.targets.lock().expect("lock poisoned");
        let mut report: Vec<(Target, TargetStatus)> = targets
            .iter()
            .map(|(target, ledger)| (target.clone(), ledger.status.clone()))
            .collect();
        report.sort_by_key(|(target, _)| target.to_string());
        report
    }

    /// Waits until no record of the target is pending. A target that never received a record
    /// is already drained.
    pub async fn wait_for_drain(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<(), IngestError> {
        self.wait_for_drain_until(target, Instant::now() + timeout, timeout)
            .await
    }

    pub(crate) async fn wait_for_drain_until(
        &self,
        target: &Target,
        deadline: Instant,
        waited: Duration,
    ) -> Result<(), IngestError> {
        let pending_rx = {
            #[allow(clippy::expect_used)]
            let targets = self.targets.lock().expect("lock poisoned");
            targets.get(target).map(|ledger| ledger.pending_tx.subscribe())
        };
        let Some(mut pending_rx) = pending_rx else {
            return Ok(());
        };
        let drained =
            tokio::time::timeout_at(deadline, pending_rx.wait_for(|pending| *pending == 0))
                .await
                .is_ok();
        if drained {
            return Ok(());
        }
        Err(self.drain_timeout(target, waited))
    }

    pub(crate) fn drain_timeout(&self, target: &Target, waited: Duration) -> IngestError {
        IngestError::DrainTimeout {
            target: target.to_string(),
            waited,
            pending: self.status(target).pending,
        }
    }
}
