// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion capability and its HTTP implementation.

use crate::assembler::{AssemblerHandle, AssemblerService};
use crate::batch::{BatchLimits, PendingRecord};
use crate::codec;
use crate::config::IngestConfig;
use crate::errors::IngestError;
use crate::gate::BackpressureGate;
use crate::outcome::{DropReason, FailureReason};
use crate::pipeline::Pipeline;
use crate::record::{Record, RecordId, Target};
use crate::results::{Disposition, ResultAggregator, TargetStatus};
use crate::retry::RetryController;
use crate::transport::{BatchSender, HttpTransport};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Something that takes payloads and sends them somewhere.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Ingests every record of `payload`.
    ///
    /// `destination_table` is stamped as `@table` on records that do not name one. A missing or
    /// empty `target` falls back to the configured default target.
    async fn ingest_payload(
        &self,
        payload: Vec<Record>,
        destination_table: Option<&str>,
        target: Option<&str>,
        collection_id: Option<&str>,
    ) -> Result<(), IngestError>;
}

/// Handle to one submitted record.
#[derive(Debug, Clone)]
pub struct SubmissionToken {
    id: RecordId,
    target: Target,
    cancel: CancellationToken,
}

impl SubmissionToken {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Drops the record from its batch if the batch has not closed yet. Once it has, the batch
    /// is only abandoned when all of its records are cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Lane {
    handle: AssemblerHandle,
    task: JoinHandle<()>,
}

struct Inner {
    config: IngestConfig,
    pipeline: Arc<Pipeline>,
    lanes: Mutex<HashMap<Target, Lane>>,
    next_record: AtomicU64,
    closed: AtomicBool,
}

/// Batches records per target and delivers them over HTTP with retries and backpressure.
///
/// Cloning is cheap; clones share the same batches and results.
#[derive(Clone)]
pub struct HttpIngester {
    inner: Arc<Inner>,
}

impl HttpIngester {
    pub fn new(config: IngestConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::with_sender(config, Arc::new(transport))
    }

    /// Uses `sender` instead of the HTTP transport.
    pub fn with_sender(
        config: IngestConfig,
        sender: Arc<dyn BatchSender>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let pipeline = Pipeline::new(
            sender,
            BackpressureGate::new(config.max_in_flight_per_target, config.admit_timeout),
            RetryController::new(config.retry_strategy.clone()),
            config.compression_level,
        )
        .with_retained_dispositions(config.retained_dispositions);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pipeline: Arc::new(pipeline),
                lanes: Mutex::new(HashMap::new()),
                next_record: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    /// Resolves an optional target against the configured default.
    pub fn resolve_target(
        &self,
        target: Option<&str>,
        collection_id: Option<&str>,
    ) -> Result<Target, IngestError> {
        let url = target
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .or(self.inner.config.default_target.as_deref());
        let resolved = match url {
            Some(url) => Target::new(url, collection_id),
            None => Err(IngestError::Configuration(
                "target has not been provided. Most likely it has been mis-configured".to_string(),
            )),
        };
        if let Err(err) = &resolved {
            error!("Cannot send payload: {}", err.diagnostic());
        }
        resolved
    }

    fn lane(&self, target: &Target) -> Result<AssemblerHandle, IngestError> {
        #[allow(clippy::expect_used)]
        let mut lanes = self.inner.lanes.lock().expect("lock poisoned");
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        let lane = lanes.entry(target.clone()).or_insert_with(|| {
            let config = &self.inner.config;
            let limits = BatchLimits {
                max_records: config.max_batch_records,
                max_bytes: config.max_batch_bytes,
                linger: config.linger,
            };
            let (service, handle) = AssemblerService::new(
                target.clone(),
                limits,
                config.queue_capacity,
                Arc::clone(&self.inner.pipeline),
            );
            Lane {
                handle,
                task: tokio::spawn(service.run()),
            }
        });
        Ok(lane.handle.clone())
    }

    fn handles(&self) -> Vec<(Target, AssemblerHandle)> {
        #[allow(clippy::expect_used)]
        let lanes = self.inner.lanes.lock().expect("lock poisoned");
        lanes
            .iter()
            .map(|(target, lane)| (target.clone(), lane.handle.clone()))
            .collect()
    }

    /// Queues one record for `target`. Suspends while the target's queue is full.
    ///
    /// The record is tracked from here on: if it cannot be encoded it is marked failed, and if
    /// the ingester is closed it is marked dropped.
    pub async fn submit(
        &self,
        record: Record,
        target: &Target,
    ) -> Result<SubmissionToken, IngestError> {
        let results = self.inner.pipeline.results();
        let id = RecordId(self.inner.next_record.fetch_add(1, Ordering::Relaxed));
        let cancel = self.inner.pipeline.shutdown_token().child_token();
        results.admit(target, id);

        let encoded = match codec::encode(&record) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(destination = %target, record = %id, "{}", err.diagnostic());
                results.fail_records(target, None, &[id], FailureReason::encoding(&err));
                return Err(err.into());
            }
        };

        let pending = PendingRecord {
            id,
            encoded,
            cancel: cancel.clone(),
        };
        let queued = match self.lane(target) {
            Ok(lane) => lane.submit(pending).await,
            Err(err) => Err(err),
        };
        if let Err(err) = queued {
            results.drop_records(target, &[id], DropReason::Closed);
            return Err(err);
        }

        Ok(SubmissionToken {
            id,
            target: target.clone(),
            cancel,
        })
    }

    /// Queues anything that serializes to a JSON object.
    pub async fn submit_value<T>(
        &self,
        value: &T,
        target: &Target,
    ) -> Result<SubmissionToken, IngestError>
    where
        T: Serialize + ?Sized,
    {
        let record = Record::from_serialize(value)?;
        self.submit(record, target).await
    }

    /// Closes every open batch and returns once each has been admitted or has failed.
    pub async fn flush(&self) {
        for (target, handle) in self.handles() {
            if let Err(err) = handle.flush().await {
                debug!(destination = %target, "Skipping flush: {err}");
            }
        }
    }

    /// Flushes the target and waits until none of its records is pending. Fails with
    /// `DrainTimeout` once `timeout` has elapsed, even while the flush itself is still held back
    /// by a saturated target.
    pub async fn wait_for_drain(
        &self,
        target: &Target,
        timeout: Duration,
    ) -> Result<(), IngestError> {
        let deadline = Instant::now() + timeout;
        let handle = self
            .handles()
            .into_iter()
            .find_map(|(lane, handle)| (&lane == target).then_some(handle));
        if let Some(handle) = handle {
            match tokio::time::timeout_at(deadline, handle.flush()).await {
                Ok(flushed) => flushed?,
                Err(_) => return Err(self.results().drain_timeout(target, timeout)),
            }
        }
        self.results()
            .wait_for_drain_until(target, deadline, timeout)
            .await
    }

    /// Stops accepting records, dispatches every open batch, then waits for all targets to
    /// drain. Everything, including dispatching, has to finish within `timeout`; whatever is
    /// still pending then keeps going in the background.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), IngestError> {
        let deadline = Instant::now() + timeout;
        let lanes = {
            #[allow(clippy::expect_used)]
            let mut lanes = self.inner.lanes.lock().expect("lock poisoned");
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *lanes)
        };
        debug!(targets = lanes.len(), "Shutting down ingester");

        for (target, lane) in &lanes {
            match tokio::time::timeout_at(deadline, lane.handle.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(destination = %target, "Assembler already stopped: {err}"),
                Err(_) => return Err(self.results().drain_timeout(target, timeout)),
            }
        }
        for (target, mut lane) in lanes {
            match tokio::time::timeout_at(deadline, &mut lane.task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(destination = %target, "Assembler task failed: {err}"),
                Err(_) => return Err(self.results().drain_timeout(&target, timeout)),
            }
        }

        for (target, _) in self.report() {
            self.results()
                .wait_for_drain_until(&target, deadline, timeout)
                .await?;
        }
        Ok(())
    }

    /// Stops accepting records and abandons everything not yet delivered. Requests already on
    /// the wire complete, but nothing is retried.
    pub fn abort(&self) {
        #[allow(clippy::expect_used)]
        let mut lanes = self.inner.lanes.lock().expect("lock poisoned");
        self.inner.closed.store(true, Ordering::Release);
        self.inner.pipeline.shutdown_token().cancel();
        // assemblers see their queue close and drop what they hold
        lanes.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn results(&self) -> &ResultAggregator {
        self.inner.pipeline.results()
    }

    pub fn status(&self, target: &Target) -> TargetStatus {
        self.results().status(target)
    }

    pub fn disposition(&self, token: &SubmissionToken) -> Option<Disposition> {
        self.results().disposition(token.target(), token.id())
    }

    pub fn report(&self) -> Vec<(Target, TargetStatus)> {
        self.results().report()
    }
}

#[async_trait]
impl Ingester for HttpIngester {
    async fn ingest_payload(
        &self,
        payload: Vec<Record>,
        destination_table: Option<&str>,
        target: Option<&str>,
        collection_id: Option<&str>,
    ) -> Result<(), IngestError> {
        let target = self.resolve_target(target, collection_id)?;
        let table = destination_table.filter(|table| !table.is_empty());
        debug!(
            destination = %target,
            records = payload.len(),
            "Ingesting payload"
        );

        for record in payload {
            let record = match table {
                Some(table) => record.with_table(table),
                None => record,
            };
            match self.submit(record, &target).await {
                // already tracked as failed, keep going
                Ok(_) | Err(IngestError::Encoding(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
