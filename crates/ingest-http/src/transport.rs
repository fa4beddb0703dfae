// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::Batch;
use crate::config::IngestConfig;
use crate::errors::{IngestError, TransportError};
use crate::outcome::{FailureReason, Outcome};
use async_trait::async_trait;
use core::time::Duration;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Instant;
use tracing::debug;

/// Longest response body kept, in bytes. The rest is not read.
pub const MAX_RESPONSE_BODY: usize = 64 * 1024;

/// Status and body of a response, truncated to [`MAX_RESPONSE_BODY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Sends one batch with exactly one request and no retries of its own.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(&self, batch: &Batch) -> Result<RawResponse, TransportError>;
}

/// Maps the result of one send to an [`Outcome`].
pub fn classify(result: Result<RawResponse, TransportError>) -> Outcome {
    match result {
        Ok(response) if response.status.is_success() => Outcome::Delivered {
            status: response.status.as_u16(),
        },
        Ok(response) if response.status.is_server_error() => {
            Outcome::RetryableFailure(FailureReason::from_status(response.status, response.body))
        }
        Ok(response) => {
            Outcome::PermanentFailure(FailureReason::from_status(response.status, response.body))
        }
        Err(err) => Outcome::RetryableFailure(FailureReason::transport(&err)),
    }
}

/// Builds a reqwest client with optional proxy, timeout and TLS verification settings.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
    verify_tls: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

/// HTTP transport shared by every target. The inner client holds the connection pool and is
/// cheap to clone.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    content_type: HeaderValue,
    compressed: bool,
}

impl HttpTransport {
    pub fn new(config: &IngestConfig) -> Result<Self, IngestError> {
        let client = build_client(
            config.https_proxy.as_deref(),
            config.request_timeout,
            config.verify_tls,
        )
        .map_err(|e| IngestError::Client(e.to_string()))?;
        let content_type = HeaderValue::from_str(&config.content_type).map_err(|_| {
            IngestError::Configuration(format!(
                "content type '{}' is not a valid header value",
                config.content_type
            ))
        })?;
        Ok(Self {
            client,
            content_type,
            compressed: config.compression_level.is_some(),
        })
    }
}

#[async_trait]
impl BatchSender for HttpTransport {
    async fn send(&self, batch: &Batch) -> Result<RawResponse, TransportError> {
        let mut request = self
            .client
            .post(batch.target().url().clone())
            .header(CONTENT_TYPE, self.content_type.clone())
            .body(batch.body().clone());
        if self.compressed {
            request = request.header(CONTENT_ENCODING, "zstd");
        }

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let body = read_body(response, MAX_RESPONSE_BODY).await?;
        debug!(
            destination = %batch.target(),
            batch = batch.sequence(),
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Received response"
        );
        Ok(RawResponse { status, body })
    }
}

async fn read_body(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<String, reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PendingRecord;
    use crate::outcome::FailureKind;
    use crate::record::{RecordId, Target};
    use bytes::Bytes;
    use mockito::Server;
    use tokio_util::sync::CancellationToken;

    fn response(status: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        })
    }

    fn batch(url: &str) -> Batch {
        let record = PendingRecord {
            id: RecordId(1),
            encoded: Bytes::from_static(br#"{"@table":"test_table","some_data":"x"}"#),
            cancel: CancellationToken::new(),
        };
        Batch::seal(Target::new(url, None).unwrap(), 1, vec![record], None).unwrap()
    }

    #[test]
    fn test_classify_status_classes() {
        assert_eq!(classify(response(200, "")), Outcome::Delivered { status: 200 });
        assert_eq!(classify(response(202, "")), Outcome::Delivered { status: 202 });

        match classify(response(404, "not here")) {
            Outcome::PermanentFailure(reason) => {
                assert_eq!(reason.kind, FailureKind::ClientError);
                assert_eq!(reason.status, Some(404));
                assert_eq!(reason.message, "not here");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        match classify(response(503, "busy")) {
            Outcome::RetryableFailure(reason) => {
                assert_eq!(reason.kind, FailureKind::ServerError);
                assert_eq!(reason.message, "busy");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert!(matches!(
            classify(response(302, "")),
            Outcome::PermanentFailure(_)
        ));
    }

    #[test]
    fn test_classify_transport_errors_are_retryable() {
        let outcome = classify(Err(TransportError::Timeout("deadline".to_string())));
        match outcome {
            Outcome::RetryableFailure(reason) => {
                assert_eq!(reason.kind, FailureKind::Transport);
                assert_eq!(reason.status, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_invalid_content_type_is_rejected() {
        let config = IngestConfig {
            content_type: "bad\nvalue".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(IngestError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_send_posts_body_with_content_type() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/data-source")
            .match_header("Content-Type", "application/octet-stream")
            .match_body(r#"[{"@table":"test_table","some_data":"x"}]"#)
            .with_status(200)
            .with_body("ok")
            .expect(1)
            .create_async()
            .await;

        let transport = HttpTransport::new(&IngestConfig::default()).unwrap();
        let result = transport
            .send(&batch(&format!("{}/data-source", server.url())))
            .await;

        assert_eq!(result, response(200, "ok"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_truncates_large_error_bodies() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/data-source")
            .with_status(400)
            .with_body("x".repeat(MAX_RESPONSE_BODY * 3))
            .expect(1)
            .create_async()
            .await;

        let transport = HttpTransport::new(&IngestConfig::default()).unwrap();
        let response = transport
            .send(&batch(&format!("{}/data-source", server.url())))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body.len(), MAX_RESPONSE_BODY);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_connection_refused_is_transport_error() {
        // nothing listens on the discard port
        let transport = HttpTransport::new(&IngestConfig::default()).unwrap();
        let result = transport.send(&batch("http://127.0.0.1:9/data-source")).await;
        assert!(result.is_err());
        assert!(classify(result).is_retryable());
    }
}
