//! OpenAI-compatible LLM service client.
//!
//! Two surfaces:
//!   synchronous — /v1/chat/completions with a JSON-schema response format
//!   batch       — /v1/files + /v1/batches (upload JSONL, create job,
//!                 poll status, download output)

use async_trait::async_trait;
use publink_common::config::ReasoningEffort;
use publink_common::{PublinkError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String, // "system" | "user" | "assistant"
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub reasoning: ReasoningEffort,
    pub max_tokens: u32,
    pub schema_name: String,
    pub schema: serde_json::Value,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub parsed: serde_json::Value,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Batch job status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed  => "completed",
            BatchStatus::Failed     => "failed",
            BatchStatus::Expired    => "expired",
            BatchStatus::Cancelled  => "cancelled",
            BatchStatus::Unknown    => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub input_file_id: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
}

/// The synchronous completion surface, a trait so drivers and tests can
/// swap the real service for a fake.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// The asynchronous batch surface.
#[async_trait]
pub trait BatchApi: Send + Sync {
    async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<String>;
    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
    ) -> Result<BatchJob>;
    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob>;
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>>;
}

pub struct LlmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn check(resp: reqwest::Response) -> Result<serde_json::Value> {
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await?;
        if status >= 400 {
            let message = body["error"]["message"]
                .as_str()
                .or_else(|| body["message"].as_str())
                .unwrap_or("unknown API error");
            return Err(PublinkError::LlmSync(format!("HTTP {status}: {message}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl CompletionApi for LlmClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_completion_tokens": request.max_tokens,
            "reasoning_effort": request.reasoning.as_str(),
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "strict": true,
                    "schema": request.schema,
                }
            }
        });

        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = Self::check(resp).await?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PublinkError::LlmSync("completion has no text content".to_string()))?;
        let parsed: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| PublinkError::Parse(format!("completion is not valid JSON: {e}")))?;

        Ok(Completion {
            parsed,
            prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }
}

#[async_trait]
impl BatchApi for LlmClient {
    #[instrument(skip(self, bytes))]
    async fn upload_file(&self, filename: &str, bytes: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/jsonl")
            .map_err(|e| PublinkError::LlmSync(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let resp = self
            .client
            .post(self.url("/v1/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let json = Self::check(resp).await?;
        json["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PublinkError::LlmSync("file upload returned no id".to_string()))
    }

    #[instrument(skip(self))]
    async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
    ) -> Result<BatchJob> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": completion_window,
        });
        let resp = self
            .client
            .post(self.url("/v1/batches"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = Self::check(resp).await?;
        let job: BatchJob = serde_json::from_value(json)?;
        debug!(batch_id = %job.id, status = job.status.as_str(), "Batch created");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/batches/{batch_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let json = Self::check(resp).await?;
        Ok(serde_json::from_value(json)?)
    }

    #[instrument(skip(self))]
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PublinkError::LlmSync(format!(
                "file download failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_deserializes_service_strings() {
        for (raw, expected) in [
            ("\"validating\"", BatchStatus::Validating),
            ("\"in_progress\"", BatchStatus::InProgress),
            ("\"finalizing\"", BatchStatus::Finalizing),
            ("\"completed\"", BatchStatus::Completed),
            ("\"failed\"", BatchStatus::Failed),
            ("\"expired\"", BatchStatus::Expired),
            ("\"cancelled\"", BatchStatus::Cancelled),
            ("\"cancelling\"", BatchStatus::Unknown),
        ] {
            let status: BatchStatus = serde_json::from_str(raw).unwrap();
            assert_eq!(status, expected, "{raw}");
        }
    }

    #[test]
    fn test_terminal_failure_set() {
        assert!(BatchStatus::Failed.is_terminal_failure());
        assert!(BatchStatus::Expired.is_terminal_failure());
        assert!(BatchStatus::Cancelled.is_terminal_failure());
        assert!(!BatchStatus::Completed.is_terminal_failure());
        assert!(!BatchStatus::InProgress.is_terminal_failure());
    }

    #[test]
    fn test_batch_job_parses_minimal_payload() {
        let job: BatchJob = serde_json::from_value(serde_json::json!({
            "id": "batch_123",
            "status": "in_progress",
            "input_file_id": "file_in",
            "request_counts": { "total": 10, "completed": 4, "failed": 0 }
        }))
        .unwrap();
        assert_eq!(job.id, "batch_123");
        assert_eq!(job.status, BatchStatus::InProgress);
        assert!(job.output_file_id.is_none());
        assert_eq!(job.request_counts.unwrap().completed, 4);
    }
}
