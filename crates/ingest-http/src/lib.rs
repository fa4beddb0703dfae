// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliable batched ingestion over HTTP.
//!
//! Records submitted for a target are grouped into batches, admitted under a per-target
//! in-flight limit, sent with retries and backoff, and tracked until each one is delivered,
//! failed or dropped.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod assembler;
pub mod batch;
pub mod chain;
pub mod codec;
pub mod config;
pub mod errors;
pub mod gate;
pub mod ingester;
pub mod outcome;
pub mod pipeline;
pub mod record;
pub mod results;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chain::{IngestChain, IngestedPayload, MemoryIngester, PayloadPreprocessor, StringifyValues};
pub use config::IngestConfig;
pub use errors::{Diagnostic, EncodingError, IngestError, ResolvableBy, TransportError};
pub use ingester::{HttpIngester, Ingester, SubmissionToken};
pub use outcome::{DropReason, FailureKind, FailureReason, Outcome};
pub use record::{Record, RecordId, Target, TABLE_FIELD};
pub use results::{Disposition, FailureReport, TargetStatus};
pub use retry::RetryStrategy;
