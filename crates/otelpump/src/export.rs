//! Protobuf-over-HTTP delivery to the collector.

use anyhow::{Context, Result};
use prost::Message;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::warn;

use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;

/// Most of an error body is noise; keep a bounded snippet for the log.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

pub struct HttpExporter {
    client: reqwest::Client,
    base: String,
}

impl HttpExporter {
    pub fn new(base: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn export_metrics(&self, resource_metrics: ResourceMetrics) -> Result<()> {
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![resource_metrics],
        };
        let body = self.post("/v1/metrics", request.encode_to_vec()).await?;

        // Some receivers return an empty body on success, others a protobuf
        // response carrying partial-success tallies.
        if !body.is_empty() {
            if let Ok(response) = ExportMetricsServiceResponse::decode(body.as_ref()) {
                if let Some(partial) = response.partial_success {
                    if partial.rejected_data_points > 0 || !partial.error_message.is_empty() {
                        warn!(
                            rejected = partial.rejected_data_points,
                            error = %partial.error_message,
                            "collector reported partial metric success"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn export_logs(&self, resource_logs: ResourceLogs) -> Result<()> {
        let request = ExportLogsServiceRequest {
            resource_logs: vec![resource_logs],
        };
        let body = self.post("/v1/logs", request.encode_to_vec()).await?;

        if !body.is_empty() {
            if let Ok(response) = ExportLogsServiceResponse::decode(body.as_ref()) {
                if let Some(partial) = response.partial_success {
                    if partial.rejected_log_records > 0 || !partial.error_message.is_empty() {
                        warn!(
                            rejected = partial.rejected_log_records,
                            error = %partial.error_message,
                            "collector reported partial log success"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<bytes::Bytes> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.bytes().await.unwrap_or_default();
            let snippet = String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_LIMIT)]);
            anyhow::bail!("POST {url} returned {status}: {}", snippet.trim());
        }
        response.bytes().await.context("failed to read collector response")
    }
}
