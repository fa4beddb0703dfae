// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec;
use crate::errors::EncodingError;
use crate::record::{RecordId, Target};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zstd::zstd_safe::CompressionLevel;

/// A record accepted by an assembler, already encoded.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub id: RecordId,
    pub encoded: Bytes,
    pub cancel: CancellationToken,
}

/// Records closed together, in submission order, before they are sealed into a [`Batch`].
#[derive(Debug)]
pub struct ClosedBatch {
    pub sequence: u64,
    pub records: Vec<PendingRecord>,
}

/// An ordered group of records bound to one target. The body is computed once, so every attempt
/// sends the same bytes.
#[derive(Debug, Clone)]
pub struct Batch {
    target: Target,
    sequence: u64,
    record_ids: Vec<RecordId>,
    cancellations: Vec<CancellationToken>,
    body: Bytes,
}

impl Batch {
    pub fn seal(
        target: Target,
        sequence: u64,
        records: Vec<PendingRecord>,
        compression_level: Option<CompressionLevel>,
    ) -> Result<Self, EncodingError> {
        let body = codec::encode_batch(records.iter().map(|r| &r.encoded), compression_level)?;
        let (record_ids, cancellations) = records.into_iter().map(|r| (r.id, r.cancel)).unzip();
        Ok(Self {
            target,
            sequence,
            record_ids,
            cancellations,
            body,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Per-target sequence number, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.record_ids
    }

    pub fn len(&self) -> usize {
        self.record_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[cfg(test)]
    pub(crate) fn cancellations(&self) -> &[CancellationToken] {
        &self.cancellations
    }

    /// True once every record of the batch has been cancelled.
    pub fn is_abandoned(&self) -> bool {
        !self.cancellations.is_empty() && self.cancellations.iter().all(|c| c.is_cancelled())
    }
}

/// Thresholds that close a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub linger: Duration,
}

/// Accumulates records for a single target into the open batch and closes it when a limit is
/// hit.
pub struct BatchBuilder {
    limits: BatchLimits,
    next_sequence: u64,
    open: Vec<PendingRecord>,
    open_bytes: usize,
    opened_at: Option<Instant>,
}

impl BatchBuilder {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            next_sequence: 1,
            open: Vec::new(),
            open_bytes: 0,
            opened_at: None,
        }
    }

    /// Adds a record and returns the batches that closed because of it.
    ///
    /// A record that would push a non-empty batch over the byte cap closes that batch first. A
    /// record larger than the cap on its own still forms a batch.
    pub fn push(&mut self, record: PendingRecord, now: Instant) -> Vec<ClosedBatch> {
        let mut closed = Vec::new();
        if !self.open.is_empty() && self.open_bytes + 1 + record.encoded.len() > self.limits.max_bytes
        {
            closed.extend(self.close());
        }

        if self.open.is_empty() {
            self.opened_at = Some(now);
            self.open_bytes = codec::framing_len(1) + record.encoded.len();
        } else {
            self.open_bytes += 1 + record.encoded.len();
        }
        self.open.push(record);

        if self.open.len() >= self.limits.max_records || self.open_bytes >= self.limits.max_bytes {
            closed.extend(self.close());
        }
        closed
    }

    /// When the open batch has to be closed regardless of its size.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.limits.linger)
    }

    pub fn close(&mut self) -> Option<ClosedBatch> {
        if self.open.is_empty() {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.open_bytes = 0;
        self.opened_at = None;
        Some(ClosedBatch {
            sequence,
            records: std::mem::take(&mut self.open),
        })
    }

    pub fn open_len(&self) -> usize {
        self.open.len()
    }
}
