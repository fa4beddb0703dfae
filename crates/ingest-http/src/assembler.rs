// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::{BatchBuilder, BatchLimits, PendingRecord};
use crate::errors::IngestError;
use crate::outcome::DropReason;
use crate::pipeline::Pipeline;
use crate::record::Target;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub enum AssemblerCommand {
    Submit(PendingRecord),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Sending side of one target's assembler. Submitting suspends while the queue is full.
#[derive(Clone)]
pub struct AssemblerHandle {
    tx: mpsc::Sender<AssemblerCommand>,
}

impl AssemblerHandle {
    pub async fn submit(&self, record: PendingRecord) -> Result<(), IngestError> {
        self.tx
            .send(AssemblerCommand::Submit(record))
            .await
            .map_err(|_| IngestError::Closed)
    }

    /// Closes the open batch and returns once it has been admitted or has failed.
    pub async fn flush(&self) -> Result<(), IngestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AssemblerCommand::Flush(response_tx))
            .await
            .map_err(|_| IngestError::Closed)?;
        response_rx.await.map_err(|_| IngestError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), IngestError> {
        self.tx
            .send(AssemblerCommand::Shutdown)
            .await
            .map_err(|_| IngestError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the open batch of one target and hands closed batches to the pipeline.
pub struct AssemblerService {
    target: Target,
    builder: BatchBuilder,
    pipeline: Arc<Pipeline>,
    rx: mpsc::Receiver<AssemblerCommand>,
}

impl AssemblerService {
    pub fn new(
        target: Target,
        limits: BatchLimits,
        queue_capacity: usize,
        pipeline: Arc<Pipeline>,
    ) -> (Self, AssemblerHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let service = Self {
            target,
            builder: BatchBuilder::new(limits),
            pipeline,
            rx,
        };
        (service, AssemblerHandle { tx })
    }

    pub async fn run(mut self) {
        debug!(destination = %self.target, "Assembler service started");

        loop {
            let deadline = self.builder.deadline();
            let command = tokio::select! {
                command = self.rx.recv() => command,
                () = linger(deadline) => {
                    self.close_open().await;
                    continue;
                }
            };

            match command {
                Some(AssemblerCommand::Submit(record)) => {
                    for closed in self.builder.push(record, Instant::now()) {
                        self.pipeline.dispatch(&self.target, closed).await;
                    }
                }
                Some(AssemblerCommand::Flush(response_tx)) => {
                    self.close_open().await;
                    if response_tx.send(()).is_err() {
                        debug!(destination = %self.target, "Flush caller stopped waiting");
                    }
                }
                Some(AssemblerCommand::Shutdown) | None => {
                    self.close_open().await;
                    break;
                }
            }
        }

        self.rx.close();
        let mut late = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            if let AssemblerCommand::Submit(record) = command {
                late.push(record.id);
            }
        }
        self.pipeline
            .results()
            .drop_records(&self.target, &late, DropReason::Closed);

        debug!(destination = %self.target, "Assembler service stopped");
    }

    async fn close_open(&mut self) {
        if let Some(closed) = self.builder.close() {
            self.pipeline.dispatch(&self.target, closed).await;
        }
    }
}

async fn linger(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
