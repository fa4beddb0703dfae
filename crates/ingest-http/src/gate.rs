// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::Batch;
use crate::errors::IngestError;
use crate::record::Target;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounds the number of batches in flight per target. Every target gets its own limit, so a slow
/// target only ever holds up its own submissions.
pub struct BackpressureGate {
    limit: usize,
    wait: Duration,
    slots: Mutex<HashMap<Target, Arc<Semaphore>>>,
}

/// Proof of admission. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl BackpressureGate {
    pub fn new(limit: usize, wait: Duration) -> Self {
        Self {
            limit: limit.max(1),
            wait,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots_for(&self, target: &Target) -> Arc<Semaphore> {
        #[allow(clippy::expect_used)]
        let mut slots = self.slots.lock().expect("lock poisoned");
        Arc::clone(
            slots
                .entry(target.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
        )
    }

    /// Waits for a free slot on the batch's target, for at most the configured wait bound.
    pub async fn admit(&self, batch: &Batch) -> Result<Permit, IngestError> {
        let slots = self.slots_for(batch.target());
        match tokio::time::timeout(self.wait, slots.acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(
                    destination = %batch.target(),
                    batch = batch.sequence(),
                    "Batch admitted"
                );
                Ok(Permit { _permit: permit })
            }
            // the semaphore is never closed
            Ok(Err(_)) => Err(IngestError::Closed),
            Err(_) => Err(IngestError::SubmissionTimeout {
                target: batch.target().to_string(),
                waited: self.wait,
            }),
        }
    }

    /// Number of batches currently admitted for the target.
    pub fn in_flight(&self, target: &Target) -> usize {
        self.limit - self.slots_for(target).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PendingRecord;
    use crate::record::RecordId;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn batch(url: &str, sequence: u64) -> Batch {
        let record = PendingRecord {
            id: RecordId(sequence),
            encoded: Bytes::from_static(b"{}"),
            cancel: CancellationToken::new(),
        };
        Batch::seal(Target::new(url, None).unwrap(), sequence, vec![record], None).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_never_exceeds_limit_under_load() {
        let gate = Arc::new(BackpressureGate::new(3, Duration::from_secs(10)));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..40 {
            let gate = Arc::clone(&gate);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let batch = batch("http://example.com/a", i);
                let permit = gate.admit(&batch).await.expect("admission failed");
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.expect("task failed");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        let target = Target::new("http://example.com/a", None).unwrap();
        assert_eq!(gate.in_flight(&target), 0);
    }

    #[tokio::test]
    async fn test_gate_times_out_when_saturated() {
        let gate = BackpressureGate::new(1, Duration::from_millis(20));
        let first = batch("http://example.com/a", 1);
        let _held = gate.admit(&first).await.expect("first admission failed");
        assert_eq!(gate.in_flight(first.target()), 1);

        let second = batch("http://example.com/a", 2);
        let err = gate.admit(&second).await.unwrap_err();
        assert!(matches!(err, IngestError::SubmissionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_targets_have_independent_limits() {
        let gate = BackpressureGate::new(1, Duration::from_millis(20));
        let _slow = gate
            .admit(&batch("http://example.com/slow", 1))
            .await
            .expect("admission failed");

        let healthy = gate.admit(&batch("http://example.com/healthy", 1)).await;
        assert!(healthy.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_permit_frees_slot() {
        let gate = BackpressureGate::new(1, Duration::from_millis(20));
        let first = batch("http://example.com/a", 1);
        let permit = gate.admit(&first).await.expect("admission failed");
        drop(permit);
        assert_eq!(gate.in_flight(first.target()), 0);
        assert!(gate.admit(&batch("http://example.com/a", 2)).await.is_ok());
    }
}
