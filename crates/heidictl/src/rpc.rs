//! Framed JSON-RPC client for the local engine socket.
//!
//! Each message is a 4-byte big-endian length followed by a UTF-8 JSON body.
//! Requests are `{"jsonrpc":"2.0","method","params","id"}`; responses carry
//! either `result` or `error: {code, message, data}`.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use heidi_core::Config;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Largest request body accepted for sending.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

/// Largest response body accepted from the engine.
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Server-reserved codes; the engine uses them for capabilities missing from its build.
pub const CAPABILITY_UNAVAILABLE_CODES: RangeInclusive<i64> = -32099..=-32000;

/// Engine code for a disabled network transport.
pub const E_TRANSPORT_UNAVAILABLE: i64 = -32001;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request body is {size} bytes; limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(
        "engine unreachable at {} after {attempts} attempt(s): {last_error}",
        .socket_path.display()
    )]
    Unavailable {
        socket_path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("RPC error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcError {
    /// True for remote errors in the reserved server range.
    pub fn is_capability_unavailable(&self) -> bool {
        matches!(self, Self::Remote { code, .. } if CAPABILITY_UNAVAILABLE_CODES.contains(code))
    }

    /// Only an unreachable engine is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RpcConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path(),
            connect_timeout: Duration::from_millis(config.rpc_connect_timeout_ms),
            request_timeout: Duration::from_millis(config.rpc_request_timeout_ms),
            max_retries: config.rpc_max_retries,
            backoff_base: Duration::from_millis(config.rpc_backoff_ms),
        }
    }

    /// Delay before the retry that follows `attempt` (0-based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Prefix `body` with its big-endian length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, RpcError> {
    if body.len() > MAX_FRAME_BYTES {
        return Err(RpcError::PayloadTooLarge {
            size: body.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| RpcError::PayloadTooLarge {
        size: body.len(),
        limit: MAX_FRAME_BYTES,
    })?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read one frame. Short reads are continued; EOF before the frame is
/// complete is `UnexpectedEof`, and a length over `max_len` is `InvalidData`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    fill(reader, &mut prefix).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_len}"),
        ));
    }

    let mut body = vec![0u8; len];
    fill(reader, &mut body).await?;
    Ok(body)
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed after {filled} of {} bytes", buf.len()),
            ));
        }
        filled += n;
    }
    Ok(())
}

/// Why one exchange failed.
enum Fault {
    /// Worth another attempt on a fresh connection.
    Transport(std::io::Error),
    Protocol(String),
}

/// Client for the engine socket. Ids are unique per client.
#[derive(Debug)]
pub struct RpcClient {
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Call `method` and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&Request {
            jsonrpc: "2.0",
            method,
            params: &params,
            id,
        })?;
        let frame = encode_frame(&body)?;

        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match self.exchange(&frame).await {
                Ok(response) => return decode_response(&response, id),
                Err(Fault::Protocol(message)) => return Err(RpcError::Protocol(message)),
                Err(Fault::Transport(err)) => {
                    last_error = err.to_string();
                    if attempt + 1 < attempts {
                        let delay = self.config.backoff(attempt);
                        debug!(
                            method,
                            attempt = attempt + 1,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "engine call failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            method,
            socket = %self.config.socket_path.display(),
            attempts,
            error = %last_error,
            "engine unreachable"
        );
        Err(RpcError::Unavailable {
            socket_path: self.config.socket_path.clone(),
            attempts,
            last_error,
        })
    }

    /// Call `provider.generate`.
    pub async fn generate(&self, params: Value) -> Result<Value, RpcError> {
        self.call("provider.generate", params).await
    }

    /// One request/response on a fresh connection.
    async fn exchange(&self, frame: &[u8]) -> Result<Vec<u8>, Fault> {
        let mut stream = match timeout(
            self.config.connect_timeout,
            UnixStream::connect(&self.config.socket_path),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(Fault::Transport(err)),
            Err(_) => {
                return Err(Fault::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };

        let exchange = async {
            stream.write_all(frame).await?;
            stream.flush().await?;
            read_frame(&mut stream, MAX_RESPONSE_BYTES).await
        };
        match timeout(self.config.request_timeout, exchange).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                Err(Fault::Protocol(err.to_string()))
            }
            Ok(Err(err)) => Err(Fault::Transport(err)),
            Err(_) => Err(Fault::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request timed out",
            ))),
        }
    }
}

fn decode_response(body: &[u8], id: u64) -> Result<Value, RpcError> {
    let response: Value = serde_json::from_slice(body)
        .map_err(|err| RpcError::Protocol(format!("malformed response: {err}")))?;
    let Some(object) = response.as_object() else {
        return Err(RpcError::Protocol("response is not a JSON object".to_string()));
    };

    match object.get("id") {
        None | Some(Value::Null) => {}
        Some(got) if got.as_u64() == Some(id) => {}
        Some(got) => {
            return Err(RpcError::Protocol(format!(
                "response id mismatch: expected {id}, got {got}"
            )));
        }
    }

    if let Some(error) = object.get("error").filter(|e| !e.is_null()) {
        let error: RemoteError = serde_json::from_value(error.clone())
            .map_err(|err| RpcError::Protocol(format!("malformed error object: {err}")))?;
        return Err(RpcError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }

    object
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Protocol("response has neither result nor error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn fast_config(socket_path: PathBuf) -> RpcConfig {
        RpcConfig {
            backoff_base: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            ..RpcConfig::new(socket_path)
        }
    }

    /// Serve frames on `path`, answering each request with `respond(request)`.
    /// Returns the number of accepted connections.
    fn spawn_server<F>(path: &Path, respond: F) -> Arc<AtomicUsize>
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        let listener = UnixListener::bind(path).unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(body) = read_frame(&mut stream, MAX_RESPONSE_BYTES).await else {
                    continue;
                };
                let request: Value = serde_json::from_slice(&body).unwrap();
                // `None` drops the connection without answering.
                if let Some(response) = respond(request) {
                    let body = serde_json::to_vec(&response).unwrap();
                    stream
                        .write_all(&(body.len() as u32).to_be_bytes())
                        .await
                        .unwrap();
                    stream.write_all(&body).await.unwrap();
                }
            }
        });
        connections
    }

    #[test]
    fn encode_frame_prefixes_length() {
        let frame = encode_frame(b"{}").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn encode_frame_enforces_limit() {
        assert!(encode_frame(&vec![b'a'; MAX_FRAME_BYTES]).is_ok());
        let err = encode_frame(&vec![b'a'; MAX_FRAME_BYTES + 1]).unwrap_err();
        assert!(matches!(
            err,
            RpcError::PayloadTooLarge { size, limit } if size == MAX_FRAME_BYTES + 1 && limit == MAX_FRAME_BYTES
        ));
    }

    #[tokio::test]
    async fn read_frame_assembles_short_reads() {
        let (mut client, mut server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            let frame = encode_frame(br#"{"result":"ok"}"#).unwrap();
            for chunk in frame.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let body = read_frame(&mut server, MAX_RESPONSE_BYTES).await.unwrap();
        assert_eq!(body, br#"{"result":"ok"}"#);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_frame_reports_early_close() {
        let mut truncated: &[u8] = &[0, 0, 0, 10, b'a', b'b'];
        let err = read_frame(&mut truncated, MAX_RESPONSE_BYTES).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        let mut short_prefix: &[u8] = &[0, 0];
        let err = read_frame(&mut short_prefix, MAX_RESPONSE_BYTES).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let mut oversized: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let err = read_frame(&mut oversized, 1024).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn call_round_trips_request_and_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |request| {
            assert_eq!(request["jsonrpc"], "2.0");
            assert_eq!(request["method"], "provider.generate");
            Some(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "output": "hello", "echo": request["params"] },
            }))
        });

        let client = RpcClient::new(fast_config(path));
        let result = client.generate(json!({ "prompt": "hi" })).await.unwrap();
        assert_eq!(result["output"], "hello");
        assert_eq!(result["echo"], json!({ "prompt": "hi" }));

        // Ids advance per call.
        client.generate(json!({})).await.unwrap();
        assert_eq!(client.next_id.load(Ordering::Relaxed), 3);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversized_request_never_connects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |_| Some(json!({ "result": null })));

        let client = RpcClient::new(fast_config(path));
        let err = client
            .call("provider.generate", json!({ "data": "x".repeat(MAX_FRAME_BYTES + 1) }))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::PayloadTooLarge { .. }));
        assert!(!err.is_retryable());
        assert_eq!(connections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_socket_fails_after_bounded_retries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.sock");
        let client = RpcClient::new(fast_config(path.clone()));

        let started = Instant::now();
        let err = client.call("ping", json!({})).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match &err {
            RpcError::Unavailable {
                socket_path,
                attempts,
                ..
            } => {
                assert_eq!(socket_path, &path);
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(!err.is_capability_unavailable());
    }

    #[tokio::test]
    async fn dropped_connections_are_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |_| None);

        let client = RpcClient::new(fast_config(path));
        let err = client.call("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Unavailable { attempts: 3, .. }));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn default_backoff_spaces_retries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |_| None);

        // 500 ms base with 2 retries: waits of 500 ms then 1 s.
        let client = RpcClient::new(RpcConfig::new(path));
        let started = Instant::now();
        let err = client.call("ping", json!({})).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, RpcError::Unavailable { attempts: 3, .. }));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[tokio::test]
    async fn remote_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |request| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {
                    "code": E_TRANSPORT_UNAVAILABLE,
                    "message": "E_TRANSPORT_UNAVAILABLE: curl not built",
                    "data": { "feature": "curl" },
                },
            }))
        });

        let client = RpcClient::new(fast_config(path));
        let err = client
            .generate(json!({ "real_network_enabled": true }))
            .await
            .unwrap_err();
        match &err {
            RpcError::Remote {
                code,
                message,
                data,
            } => {
                assert_eq!(*code, -32001);
                assert!(message.contains("E_TRANSPORT_UNAVAILABLE"));
                assert_eq!(data.as_ref().unwrap()["feature"], "curl");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        assert!(err.is_capability_unavailable());
        assert!(!err.is_retryable());
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn application_errors_are_not_capability_errors() {
        let err = decode_response(br#"{"id":1,"error":{"code":-32602,"message":"bad params"}}"#, 1)
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: -32602, .. }));
        assert!(!err.is_capability_unavailable());
    }

    #[tokio::test]
    async fn mismatched_id_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heidid.sock");
        let connections = spawn_server(&path, |_| Some(json!({ "id": 999, "result": {} })));

        let client = RpcClient::new(fast_config(path));
        let err = client.call("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(ref m) if m.contains("mismatch")));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_responses_are_protocol_errors() {
        assert!(matches!(
            decode_response(b"not json", 1),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            decode_response(b"[1,2]", 1),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            decode_response(br#"{"id":1}"#, 1),
            Err(RpcError::Protocol(_))
        ));
        assert_eq!(
            decode_response(br#"{"id":1,"result":null}"#, 1).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn config_follows_heidi_settings() {
        let config = Config {
            home: PathBuf::from("/tmp/heidi-home"),
            rpc_max_retries: 5,
            rpc_backoff_ms: 100,
            ..Config::default()
        };
        let rpc = RpcConfig::from_config(&config);
        assert_eq!(rpc.socket_path, PathBuf::from("/tmp/heidi-home/run/heidid.sock"));
        assert_eq!(rpc.connect_timeout, Duration::from_millis(500));
        assert_eq!(rpc.request_timeout, Duration::from_secs(30));
        assert_eq!(rpc.max_retries, 5);
        assert_eq!(rpc.backoff(0), Duration::from_millis(100));
        assert_eq!(rpc.backoff(2), Duration::from_millis(400));
    }
}
