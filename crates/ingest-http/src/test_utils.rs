// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::{Batch, PendingRecord};
use crate::codec;
use crate::errors::TransportError;
use crate::record::{Record, RecordId, Target};
use crate::transport::{BatchSender, RawResponse};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const SAMPLE_URL: &str = "http://example.com/data-source";

pub(crate) fn sample_target() -> Target {
    Target::new(SAMPLE_URL, None).unwrap()
}

pub(crate) fn sample_record(i: u64) -> Record {
    Record::from_value(json!({"@table": "test_table", "some_data": i})).unwrap()
}

pub(crate) fn sample_pending(i: u64) -> PendingRecord {
    PendingRecord {
        id: RecordId(i),
        encoded: codec::encode(&sample_record(i)).unwrap(),
        cancel: CancellationToken::new(),
    }
}

pub(crate) fn sample_batch(records: u64) -> Batch {
    let pending = (0..records).map(sample_pending).collect();
    Batch::seal(sample_target(), 1, pending, None).unwrap()
}

/// Sender that replays scripted responses and records every body it was asked to send.
pub(crate) struct ScriptedSender {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    fallback: Result<RawResponse, TransportError>,
    bodies: Mutex<Vec<Bytes>>,
}

impl ScriptedSender {
    /// Replays `script` in order, then answers 200.
    pub(crate) fn new(script: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Self::status(200, ""),
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn repeating(response: Result<RawResponse, TransportError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: response,
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn status(code: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: StatusCode::from_u16(code).unwrap(),
            body: body.to_string(),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    pub(crate) fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSender for ScriptedSender {
    async fn send(&self, batch: &Batch) -> Result<RawResponse, TransportError> {
        self.bodies.lock().unwrap().push(batch.body().clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Sender that accepts every batch, but only after `delay`.
pub(crate) struct SlowSender {
    delay: Duration,
}

impl SlowSender {
    pub(crate) fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl BatchSender for SlowSender {
    async fn send(&self, _batch: &Batch) -> Result<RawResponse, TransportError> {
        tokio::time::sleep(self.delay).await;
        ScriptedSender::status(200, "")
    }
}
