// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::{Batch, ClosedBatch, PendingRecord};
use crate::errors::IngestError;
use crate::gate::BackpressureGate;
use crate::outcome::{DropReason, FailureReason};
use crate::record::{RecordId, Target};
use crate::results::ResultAggregator;
use crate::retry::RetryController;
use crate::transport::BatchSender;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use zstd::zstd_safe::CompressionLevel;

/// Everything a closed batch goes through on its way out: sealing, admission, delivery with
/// retries, and bookkeeping of the final disposition.
pub struct Pipeline {
    sender: Arc<dyn BatchSender>,
    gate: BackpressureGate,
    controller: RetryController,
    results: ResultAggregator,
    shutdown: CancellationToken,
    compression_level: Option<CompressionLevel>,
}

impl Pipeline {
    pub fn new(
        sender: Arc<dyn BatchSender>,
        gate: BackpressureGate,
        controller: RetryController,
        compression_level: Option<CompressionLevel>,
    ) -> Self {
        Self {
            sender,
            gate,
            controller,
            results: ResultAggregator::new(),
            shutdown: CancellationToken::new(),
            compression_level,
        }
    }

    /// Keeps at most `retained` settled dispositions per target.
    #[must_use]
    pub fn with_retained_dispositions(mut self, retained: usize) -> Self {
        self.results = ResultAggregator::with_retention(retained);
        self
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    pub fn gate(&self) -> &BackpressureGate {
        &self.gate
    }

    /// Cancelled when the ingester is aborted. Record cancellations are children of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Seals a closed batch and waits for it to be admitted, then delivers it in the background.
    ///
    /// Returns once the batch holds an in-flight slot or has reached a terminal state, so the
    /// caller is held back while the target is saturated.
    pub async fn dispatch(self: &Arc<Self>, target: &Target, closed: ClosedBatch) {
        let (live, cancelled): (Vec<PendingRecord>, Vec<PendingRecord>) = closed
            .records
            .into_iter()
            .partition(|record| !record.cancel.is_cancelled());
        if !cancelled.is_empty() {
            let ids: Vec<RecordId> = cancelled.iter().map(|r| r.id).collect();
            self.results.drop_records(target, &ids, self.drop_reason());
        }
        if live.is_empty() {
            return;
        }

        let ids: Vec<RecordId> = live.iter().map(|r| r.id).collect();
        let batch = match Batch::seal(target.clone(), closed.sequence, live, self.compression_level)
        {
            Ok(batch) => batch,
            Err(err) => {
                error!(
                    destination = %target,
                    batch = closed.sequence,
                    "Failed to encode batch: {}",
                    err.diagnostic()
                );
                self.results.fail_records(
                    target,
                    Some(closed.sequence),
                    &ids,
                    FailureReason::encoding(&err),
                );
                return;
            }
        };

        let permit = match self.gate.admit(&batch).await {
            Ok(permit) => permit,
            Err(err @ IngestError::SubmissionTimeout { .. }) => {
                error!(
                    destination = %target,
                    batch = batch.sequence(),
                    records = batch.len(),
                    "Failed to send payload: {}",
                    err.diagnostic()
                );
                self.results.fail_records(
                    target,
                    Some(batch.sequence()),
                    batch.record_ids(),
                    FailureReason::submission_timeout(err.to_string()),
                );
                return;
            }
            Err(_) => {
                self.results
                    .drop_records(target, batch.record_ids(), DropReason::Closed);
                return;
            }
        };

        debug!(
            destination = %target,
            batch = batch.sequence(),
            records = batch.len(),
            bytes = batch.body().len(),
            in_flight = self.gate.in_flight(target),
            "Dispatching batch"
        );
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let report = pipeline
                .controller
                .deliver(pipeline.sender.as_ref(), &batch, &pipeline.shutdown)
                .await;
            pipeline.results.record(&batch, &report);
            drop(permit);
        });
    }

    fn drop_reason(&self) -> DropReason {
        if self.shutdown.is_cancelled() {
            DropReason::Aborted
        } else {
            DropReason::Cancelled
        }
    }
}
