// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Composition of payload pre-processors with a single ingester.

use crate::errors::IngestError;
use crate::ingester::Ingester;
use crate::record::Record;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Transforms a payload before it is ingested.
pub trait PayloadPreprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn pre_ingest_process(&self, payload: Vec<Record>) -> Result<Vec<Record>, IngestError>;
}

/// Runs pre-processors in the order they were added, then hands the payload to the ingester.
pub struct IngestChain {
    preprocessors: Vec<Box<dyn PayloadPreprocessor>>,
    ingester: Arc<dyn Ingester>,
}

impl IngestChain {
    pub fn new(ingester: Arc<dyn Ingester>) -> Self {
        Self {
            preprocessors: Vec::new(),
            ingester,
        }
    }

    #[must_use]
    pub fn with_preprocessor<P>(mut self, preprocessor: P) -> Self
    where
        P: PayloadPreprocessor + 'static,
    {
        self.preprocessors.push(Box::new(preprocessor));
        self
    }

    pub fn preprocessors(&self) -> impl Iterator<Item = &str> {
        self.preprocessors.iter().map(|p| p.name())
    }
}

#[async_trait]
impl Ingester for IngestChain {
    async fn ingest_payload(
        &self,
        payload: Vec<Record>,
        destination_table: Option<&str>,
        target: Option<&str>,
        collection_id: Option<&str>,
    ) -> Result<(), IngestError> {
        let mut payload = payload;
        for preprocessor in &self.preprocessors {
            debug!(
                preprocessor = preprocessor.name(),
                records = payload.len(),
                "Pre-processing payload"
            );
            payload = preprocessor.pre_ingest_process(payload)?;
        }
        self.ingester
            .ingest_payload(payload, destination_table, target, collection_id)
            .await
    }
}

/// Replaces every non-string top-level value with its JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringifyValues;

impl PayloadPreprocessor for StringifyValues {
    fn name(&self) -> &str {
        "convert-to-string"
    }

    fn pre_ingest_process(&self, payload: Vec<Record>) -> Result<Vec<Record>, IngestError> {
        payload
            .into_iter()
            .map(|record| {
                let fields: Map<String, Value> = record
                    .into_fields()
                    .into_iter()
                    .map(|(key, value)| match value {
                        Value::String(_) => (key, value),
                        other => (key, Value::String(other.to_string())),
                    })
                    .collect();
                Record::new(fields).map_err(IngestError::from)
            })
            .collect()
    }
}

/// One call to [`MemoryIngester`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedPayload {
    pub payload: Vec<Record>,
    pub destination_table: Option<String>,
    pub target: Option<String>,
    pub collection_id: Option<String>,
}

/// Keeps every payload in memory instead of sending it anywhere.
#[derive(Debug, Default)]
pub struct MemoryIngester {
    payloads: Mutex<Vec<IngestedPayload>>,
}

impl MemoryIngester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<IngestedPayload> {
        #[allow(clippy::expect_used)]
        let payloads = self.payloads.lock().expect("lock poisoned");
        payloads.clone()
    }
}

#[async_trait]
impl Ingester for MemoryIngester {
    async fn ingest_payload(
        &self,
        payload: Vec<Record>,
        destination_table: Option<&str>,
        target: Option<&str>,
        collection_id: Option<&str>,
    ) -> Result<(), IngestError> {
        #[allow(clippy::expect_used)]
        let mut payloads = self.payloads.lock().expect("lock poisoned");
        payloads.push(IngestedPayload {
            payload,
            destination_table: destination_table.map(str::to_string),
            target: target.map(str::to_string),
            collection_id: collection_id.map(str::to_string),
        });
        Ok(())
    }
}
