// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::{Diagnostic, EncodingError, ResolvableBy, TransportError};
use reqwest::StatusCode;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 4xx response
    ClientError,
    /// 5xx response
    ServerError,
    /// Status outside 2xx/4xx/5xx
    UnexpectedStatus,
    /// No response: connection, timeout or protocol error
    Transport,
    /// The record or batch could not be encoded
    Encoding,
    /// The batch never got an in-flight slot
    SubmissionTimeout,
}

/// Why a send or a batch failed, with the HTTP status and body when there was a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

impl FailureReason {
    pub fn from_status(status: StatusCode, body: String) -> Self {
        let kind = if status.is_client_error() {
            FailureKind::ClientError
        } else if status.is_server_error() {
            FailureKind::ServerError
        } else {
            FailureKind::UnexpectedStatus
        };
        Self {
            kind,
            status: Some(status.as_u16()),
            message: body,
        }
    }

    pub fn transport(err: &TransportError) -> Self {
        Self {
            kind: FailureKind::Transport,
            status: None,
            message: err.to_string(),
        }
    }

    pub fn encoding(err: &EncodingError) -> Self {
        Self {
            kind: FailureKind::Encoding,
            status: None,
            message: err.to_string(),
        }
    }

    pub fn submission_timeout(message: String) -> Self {
        Self {
            kind: FailureKind::SubmissionTimeout,
            status: None,
            message,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        match self.kind {
            FailureKind::ClientError => Diagnostic::new(
                ResolvableBy::UserError,
                "Failed to send payload.",
                format!(
                    "HTTP Client error. status is {status} and message was: {}",
                    self.message
                ),
                "The payload is not ingested and will not be retried.",
                "Fix the error and try again.",
            ),
            FailureKind::ServerError | FailureKind::Transport | FailureKind::SubmissionTimeout => {
                Diagnostic::new(
                    ResolvableBy::PlatformError,
                    "Failed to send payload.",
                    format!(
                        "HTTP Server or network error. status is {status} and message was: {}",
                        self.message
                    ),
                    "The payload is not ingested.",
                    "Re-try the operation again. If the error persists contact the target's owners.",
                )
            }
            FailureKind::UnexpectedStatus => Diagnostic::new(
                ResolvableBy::PlatformError,
                "Failed to send payload.",
                format!(
                    "Unexpected HTTP status {status} and message was: {}",
                    self.message
                ),
                "The payload is not ingested and will not be retried.",
                "Check that the target URL points at an ingestion endpoint.",
            ),
            FailureKind::Encoding => Diagnostic::new(
                ResolvableBy::UserError,
                "Failed to convert payload to the wire format.",
                self.message.clone(),
                "The payload is not ingested.",
                "Fix the types in the payload being sent.",
            ),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({status}): {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Classification of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered { status: u16 },
    RetryableFailure(FailureReason),
    PermanentFailure(FailureReason),
}

impl Outcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure(_))
    }
}

/// Why records were dropped instead of reaching a delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The caller cancelled every record of the batch.
    Cancelled,
    /// The ingester was aborted.
    Aborted,
    /// The ingester was shut down before the record was queued.
    Closed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted => write!(f, "aborted"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
