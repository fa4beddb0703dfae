// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ingest_http::{HttpIngester, IngestConfig, Record};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("INGEST_HTTP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {}", e.diagnostic());
            return ExitCode::FAILURE;
        }
    };
    let drain_timeout = env::var("INGEST_HTTP_DRAIN_TIMEOUT_MS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_DRAIN_TIMEOUT);
    let collection_id = env::var("INGEST_HTTP_COLLECTION_ID").ok();
    let destination_table = env::var("INGEST_HTTP_DESTINATION_TABLE")
        .ok()
        .filter(|table| !table.trim().is_empty());

    let ingester = match HttpIngester::new(config) {
        Ok(ingester) => ingester,
        Err(e) => {
            error!("Error creating ingester: {}", e.diagnostic());
            return ExitCode::FAILURE;
        }
    };
    // only the configured default target is used
    let target = match ingester.resolve_target(None, collection_id.as_deref()) {
        Ok(target) => target,
        Err(_) => return ExitCode::FAILURE,
    };

    let cancel = CancellationToken::new();
    let interrupted = cancel.clone();
    let aborter = ingester.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning pending records");
            interrupted.cancel();
            aborter.abort();
        }
    });

    info!(destination = %target, "Relaying records from stdin");
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut line_number: usize = 0;
    let mut submitted: usize = 0;
    let mut malformed: usize = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record = match serde_json::from_str(&line)
            .map_err(|e| e.to_string())
            .and_then(|value| Record::from_value(value).map_err(|e| e.to_string()))
        {
            Ok(record) => record,
            Err(e) => {
                malformed += 1;
                error!(line = line_number, "Skipping malformed record: {e}");
                continue;
            }
        };
        let record = match &destination_table {
            Some(table) => record.with_table(table),
            None => record,
        };
        match ingester.submit(record, &target).await {
            Ok(_) => submitted += 1,
            Err(e) => {
                error!("Failed to submit record: {}", e.diagnostic());
                break;
            }
        }
    }

    debug!(submitted, malformed, "Input exhausted, shutting down");
    let drained = ingester.shutdown(drain_timeout).await;
    if let Err(e) = &drained {
        error!("{}", e.diagnostic());
    }

    let mut failed = false;
    for (target, status) in ingester.report() {
        info!(
            destination = %target,
            delivered = status.delivered,
            failed = status.failed,
            dropped = status.dropped,
            pending = status.pending,
            retries = status.retries,
            "Ingestion finished"
        );
        for failure in &status.failures {
            error!(
                destination = %target,
                batch = failure.batch_sequence,
                records = failure.records,
                attempts = failure.attempts,
                "Permanent failure: {}",
                failure.reason
            );
        }
        failed |= status.failed > 0 || status.dropped > 0 || status.pending > 0;
    }

    if failed || malformed > 0 || drained.is_err() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
