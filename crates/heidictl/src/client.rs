//! HTTP client for heidi-server.
//!
//! Talks to the dispatch API over local HTTP.

use heidi_core::{RunId, RunRecord, RunStatus, RunSummary, TranscriptEvent};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server not running at {addr}\n  → start with: heidi-server\n  → or set HEIDI_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check HEIDI_API_KEY env var or --token flag")]
    Unauthorized,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.origin().ascii_serialization())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /run.
#[derive(Debug, Default, Serialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Request payload for POST /loop.
#[derive(Debug, Default, Serialize)]
pub struct LoopRequest {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Response from POST /run and POST /loop.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
struct ExecutorsResponse {
    executors: Vec<String>,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub kind: String,
}

/// HTTP client for heidi-server.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Build headers with optional api key.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response, run_id: Option<&str>) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let body = response.json::<ErrorResponse>().await.ok();
        match (status, body) {
            (404, _) => ClientError::RunNotFound(run_id.unwrap_or("resource").to_string()),
            (_, Some(body)) if body.kind == "invalid_argument" => {
                ClientError::InvalidArgument(body.error)
            }
            (_, Some(body)) => ClientError::HttpError {
                status,
                message: body.error,
            },
            (_, None) => ClientError::HttpError {
                status,
                message: "unknown error".to_string(),
            },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        run_id: Option<&str>,
    ) -> Result<T, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response, run_id).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<SubmitResponse, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response, None).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// GET /executors
    pub async fn executors(&self) -> Result<Vec<String>, ClientError> {
        let body: ExecutorsResponse = self.get_json("/executors", None).await?;
        Ok(body.executors)
    }

    /// POST /run
    pub async fn submit_run(&self, req: &RunRequest) -> Result<SubmitResponse, ClientError> {
        self.post_json("/run", req).await
    }

    /// POST /loop
    pub async fn submit_loop(&self, req: &LoopRequest) -> Result<SubmitResponse, ClientError> {
        self.post_json("/loop", req).await
    }

    /// GET /runs?limit=N
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, ClientError> {
        self.get_json(&format!("/runs?limit={limit}"), None).await
    }

    /// GET /runs/{run_id}
    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let path = format!("/runs/{}", urlencoding::encode(run_id));
        self.get_json(&path, Some(run_id)).await
    }

    /// POST /runs/{run_id}/cancel
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/runs/{}/cancel", self.base_url, urlencoding::encode(run_id));
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response, Some(run_id)).await);
        }
        Ok(())
    }

    /// Follow GET /runs/{run_id}/stream, calling `on_event` for each
    /// transcript entry until the server closes the stream.
    pub async fn tail_run<F>(&self, run_id: &str, mut on_event: F) -> Result<(), ClientError>
    where
        F: FnMut(&TranscriptEvent),
    {
        use futures::StreamExt;

        let url = format!("{}/runs/{}/stream", self.base_url, urlencoding::encode(run_id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response, Some(run_id)).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer.drain(..end + 2);
                if let Some(event) = parse_sse_event(&event_str) {
                    on_event(&event);
                }
            }
        }

        if let Some(event) = parse_sse_event(&buffer) {
            on_event(&event);
        }
        Ok(())
    }
}

/// Parse one SSE block into a transcript entry. Comments and keep-alives yield `None`.
fn parse_sse_event(event_str: &str) -> Option<TranscriptEvent> {
    let data: Vec<&str> = event_str
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data.join("\n")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transcript_event() {
        let event_str = r#"event: RUN_STARTED
data: {"timestamp":"2025-01-01T00:00:00Z","type":"RUN_STARTED","data":{"run_id":"abc"}}"#;

        let event = parse_sse_event(event_str).unwrap();
        assert_eq!(event.event_type, "RUN_STARTED");
        assert_eq!(event.data["run_id"], "abc");
    }

    #[test]
    fn parse_ignores_keepalive_and_comments() {
        assert!(parse_sse_event(":").is_none());
        assert!(parse_sse_event(":keep-alive").is_none());
        assert!(parse_sse_event("event: RUN_STARTED").is_none());
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(parse_sse_event("data: not valid json").is_none());
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let event_str = r#"data:   {"timestamp":"2025-01-01T00:00:00Z","type":"X","data":{}}  "#;
        assert_eq!(parse_sse_event(event_str).unwrap().event_type, "X");
    }

    #[test]
    fn run_request_omits_unset_fields() {
        let body = serde_json::to_value(RunRequest {
            prompt: "hi".to_string(),
            executor: Some("ollama".to_string()),
            ..RunRequest::default()
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "prompt": "hi", "executor": "ollama" }));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = Client::new("http://127.0.0.1:7777/", None);
        assert_eq!(client.base_url, "http://127.0.0.1:7777");
    }
}
