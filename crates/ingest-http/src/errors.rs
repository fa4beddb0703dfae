// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types and the structured diagnostics attached to them.

use std::fmt;
use std::time::Duration;

/// Who is expected to act on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvableBy {
    /// The caller sent something the destination rejects.
    UserError,
    /// The destination or the network misbehaved.
    PlatformError,
    /// The ingester was set up incorrectly.
    ConfigError,
}

impl fmt::Display for ResolvableBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserError => write!(f, "User Error"),
            Self::PlatformError => write!(f, "Platform Error"),
            Self::ConfigError => write!(f, "Configuration Error"),
        }
    }
}

/// Four-part description of a failure, kept as fields rather than prose so callers can route on
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub resolvable_by: ResolvableBy,
    pub what_happened: String,
    pub why_it_happened: String,
    pub consequences: String,
    pub countermeasures: String,
}

impl Diagnostic {
    pub fn new(
        resolvable_by: ResolvableBy,
        what_happened: impl Into<String>,
        why_it_happened: impl Into<String>,
        consequences: impl Into<String>,
        countermeasures: impl Into<String>,
    ) -> Self {
        Self {
            resolvable_by,
            what_happened: what_happened.into(),
            why_it_happened: why_it_happened.into(),
            consequences: consequences.into(),
            countermeasures: countermeasures.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] what: {} why: {} consequences: {} countermeasures: {}",
            self.resolvable_by,
            self.what_happened,
            self.why_it_happened,
            self.consequences,
            self.countermeasures
        )
    }
}

/// Errors returned by the ingestion API
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Timed out after {waited:?} waiting for an in-flight slot on {target}")]
    SubmissionTimeout { target: String, waited: Duration },

    #[error("Timed out after {waited:?} waiting for {target} to drain, {pending} records pending")]
    DrainTimeout {
        target: String,
        waited: Duration,
        pending: usize,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Ingester is closed")]
    Closed,
}

impl IngestError {
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            Self::Configuration(msg) => Diagnostic::new(
                ResolvableBy::ConfigError,
                "Cannot send payload for ingestion over http.",
                msg.clone(),
                "The payload is not sent and the submission call fails.",
                "Set a valid target, either as INGEST_HTTP_DEFAULT_TARGET or passed to the \
                 ingestion call, and check the other INGEST_HTTP_* settings.",
            ),
            Self::Encoding(err) => err.diagnostic(),
            Self::SubmissionTimeout { target, waited } => Diagnostic::new(
                ResolvableBy::PlatformError,
                "Failed to send payload.",
                format!("{target} kept every in-flight slot busy for {waited:?}."),
                "The batch is marked as permanently failed.",
                "Check that the target is healthy, or raise the in-flight limit or the admission timeout.",
            ),
            Self::DrainTimeout {
                target, pending, ..
            } => Diagnostic::new(
                ResolvableBy::PlatformError,
                "Ingestion did not finish in time.",
                format!("{pending} records for {target} were still in flight."),
                "Those records may still be delivered or may fail later.",
                "Wait longer, or check the target for slow or failing responses.",
            ),
            Self::Client(msg) => Diagnostic::new(
                ResolvableBy::ConfigError,
                "Cannot create the HTTP client.",
                msg.clone(),
                "No payload can be sent.",
                "Check the proxy and TLS settings.",
            ),
            Self::Closed => Diagnostic::new(
                ResolvableBy::PlatformError,
                "Cannot accept the payload.",
                "The ingester was shut down.",
                "The payload is dropped.",
                "Submit payloads before shutting the ingester down.",
            ),
        }
    }
}

/// Failures turning a value into the wire format
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("Record must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Record nests deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("Record is not serializable: {0}")]
    Serialize(String),

    #[error("Failed to compress payload: {0}")]
    Compression(String),
}

impl EncodingError {
    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            ResolvableBy::UserError,
            "Failed to convert payload to the wire format.",
            format!("Likely the payload contains a type not supported by the codec. Error was: {self}"),
            "The record is not sent and is marked as permanently failed.",
            "Fix the types in the payload being sent. See the error message for help.",
        )
    }
}

/// Failures of a single request that never produced an HTTP status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}
