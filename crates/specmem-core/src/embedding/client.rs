//! Embedding client
//!
//! Each request opens its own connection to the active socket, writes one
//! frame, skips heartbeats, and returns the first real frame. Two clocks
//! guard every request: an idle timeout that heartbeats reset, and a hard
//! wall-clock cap that nothing resets.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{EmbeddingError, EmbeddingErrorKind};
use super::protocol::{
    truncate_chars, validate_dimension, BulkOutcome, BulkRequest, Request, ServerFrame,
};
use super::retry::RetryConfig;
use super::supervisor::EmbeddingSupervisor;
use super::transport::SocketTransport;
use super::EmbeddingBackend;
use crate::config::EmbeddingConfig;

/// Client settings, usually derived from `EmbeddingConfig`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_text_chars: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub batch_timeout: Duration,
    pub hard_timeout: Duration,
    pub batch_hard_timeout: Duration,
    pub bulk_timeout: Duration,
    pub retry: RetryConfig,
    pub failure_threshold: u32,
    pub max_heartbeats: usize,
    pub max_batch_heartbeats: usize,
    pub min_dimension: usize,
    pub max_dimension: usize,
}

impl From<&EmbeddingConfig> for ClientConfig {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            max_text_chars: config.max_text_chars,
            connect_timeout: config.probe_timeout(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            hard_timeout: Duration::from_millis(config.hard_timeout_ms),
            batch_hard_timeout: Duration::from_millis(config.batch_hard_timeout_ms),
            bulk_timeout: Duration::from_millis(config.bulk_timeout_ms),
            retry: RetryConfig::new(config.max_attempts),
            failure_threshold: config.failure_threshold,
            max_heartbeats: config.max_heartbeats,
            max_batch_heartbeats: config.max_batch_heartbeats,
            min_dimension: config.min_dimension,
            max_dimension: config.max_dimension,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&EmbeddingConfig::default())
    }
}

/// Timing and heartbeat limits for one request kind
#[derive(Debug, Clone, Copy)]
struct Limits {
    idle: Duration,
    hard: Duration,
    max_heartbeats: usize,
    attempts: u32,
}

/// Socket client for the embedding server
pub struct EmbeddingClient {
    supervisor: Arc<EmbeddingSupervisor>,
    config: ClientConfig,
    errors: Mutex<BTreeMap<EmbeddingErrorKind, usize>>,
}

impl EmbeddingClient {
    pub fn new(supervisor: Arc<EmbeddingSupervisor>, config: ClientConfig) -> Self {
        Self {
            supervisor,
            config,
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<EmbeddingSupervisor> {
        &self.supervisor
    }

    /// Failures seen so far, by category (every failed attempt counts)
    pub fn error_counts(&self) -> BTreeMap<EmbeddingErrorKind, usize> {
        self.errors.lock().clone()
    }

    fn single_limits(&self) -> Limits {
        Limits {
            idle: self.config.request_timeout,
            hard: self.config.hard_timeout,
            max_heartbeats: self.config.max_heartbeats,
            attempts: self.config.retry.max_attempts,
        }
    }

    fn batch_limits(&self) -> Limits {
        Limits {
            idle: self.config.batch_timeout,
            hard: self.config.batch_hard_timeout,
            max_heartbeats: self.config.max_batch_heartbeats,
            attempts: self.config.retry.max_attempts,
        }
    }

    /// Embed a single text
    pub async fn embed_one(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let text = truncate_chars(text, self.config.max_text_chars);

        let frame = self
            .request(&Request::Embed { text }, self.single_limits())
            .await?;
        let embedding = match frame {
            ServerFrame::Embedding(embedding) => embedding,
            ServerFrame::Batch(mut entries) if entries.len() == 1 => match entries.pop().flatten()
            {
                Some(embedding) => embedding,
                None => return Ok(None),
            },
            other => {
                return Err(self.unexpected(&other, "embed"));
            }
        };
        Ok(self.check_dimension(embedding))
    }

    /// Embed many texts in one request.
    ///
    /// Empty texts are not sent and come back as `None`. If the server
    /// returns the wrong number of vectors, the result is padded with `None`
    /// or truncated so it always lines up with `texts`.
    pub async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        let (positions, payload): (Vec<usize>, Vec<&str>) = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (i, truncate_chars(t, self.config.max_text_chars)))
            .unzip();

        if payload.is_empty() {
            return Ok(results);
        }

        let sent = payload.len();
        let frame = self
            .request(&Request::BatchEmbed { texts: payload }, self.batch_limits())
            .await?;

        let mut entries = match frame {
            ServerFrame::Batch(entries) => entries,
            ServerFrame::Embedding(embedding) if sent == 1 => vec![Some(embedding)],
            other => return Err(self.unexpected(&other, "batch_embed")),
        };

        if entries.len() != sent {
            warn!(
                expected = sent,
                received = entries.len(),
                "Embedding batch length mismatch, repairing"
            );
            entries.resize(sent, None);
        }

        for (position, entry) in positions.into_iter().zip(entries) {
            results[position] = entry.and_then(|e| self.check_dimension(e));
        }
        Ok(results)
    }

    /// Ask the server for its health report
    pub async fn health(&self) -> Result<serde_json::Value, EmbeddingError> {
        let limits = Limits {
            attempts: 1,
            ..self.single_limits()
        };
        match self.request(&Request::Health, limits).await? {
            ServerFrame::Health(value) => Ok(value),
            other => Err(self.unexpected(&other, "health")),
        }
    }

    /// Server-side bulk pass over rows without embeddings. Not retried.
    pub async fn process_bulk(&self, request: BulkRequest) -> Result<BulkOutcome, EmbeddingError> {
        let limits = Limits {
            idle: self.config.bulk_timeout,
            hard: self.config.bulk_timeout,
            max_heartbeats: usize::MAX,
            attempts: 1,
        };
        match self.request(&Request::Bulk(request), limits).await? {
            ServerFrame::Bulk(outcome) => Ok(outcome),
            other => Err(self.unexpected(&other, "bulk")),
        }
    }

    fn check_dimension(&self, embedding: Vec<f32>) -> Option<Vec<f32>> {
        validate_dimension(
            embedding,
            self.config.min_dimension,
            self.config.max_dimension,
        )
    }

    fn unexpected(&self, frame: &ServerFrame, request: &str) -> EmbeddingError {
        let err = EmbeddingError::invalid(format!("unexpected {frame:?} reply to {request}"));
        self.record_error(err.kind);
        err
    }

    fn record_error(&self, kind: EmbeddingErrorKind) {
        *self.errors.lock().entry(kind).or_insert(0) += 1;
    }

    /// Send with retries, escalating to the supervisor after repeated failures
    async fn request(
        &self,
        request: &Request<'_>,
        limits: Limits,
    ) -> Result<ServerFrame, EmbeddingError> {
        let mut attempt = 0;
        loop {
            let socket = self.supervisor.active_socket().await;
            let err = match self.exchange(&socket, request, limits).await {
                Ok(frame) => {
                    self.supervisor.record_success().await;
                    return Ok(frame);
                }
                Err(err) => err,
            };

            self.record_error(err.kind);
            let failures = self.supervisor.record_failure().await;
            attempt += 1;
            warn!(
                request = request.label(),
                attempt,
                kind = %err.kind,
                error = %err.message,
                "Embedding request failed"
            );

            if attempt >= limits.attempts {
                return Err(err);
            }

            if failures >= self.config.failure_threshold {
                match self.supervisor.revalidate().await {
                    Ok(socket) => {
                        debug!(socket = %socket.display(), "Embedding socket revalidated")
                    }
                    Err(e) => debug!(error = %e, "Embedding socket revalidation failed"),
                }
            }

            tokio::time::sleep(self.config.retry.delay_for(attempt - 1, err.kind)).await;
        }
    }

    /// One connection, one request, one result frame
    async fn exchange(
        &self,
        socket: &Path,
        request: &Request<'_>,
        limits: Limits,
    ) -> Result<ServerFrame, EmbeddingError> {
        let work = async {
            let mut transport =
                SocketTransport::connect(socket, self.config.connect_timeout).await?;
            transport.send(&request.encode()).await?;

            let mut heartbeats = 0usize;
            loop {
                let line = match tokio::time::timeout(limits.idle, transport.receive()).await {
                    Ok(line) => line?,
                    Err(_) => {
                        return Err(EmbeddingError::timeout(format!(
                            "no frame within {:?}",
                            limits.idle
                        )))
                    }
                };

                match ServerFrame::parse(&line)? {
                    ServerFrame::Heartbeat => {
                        heartbeats += 1;
                        if heartbeats > limits.max_heartbeats {
                            return Err(EmbeddingError::new(
                                EmbeddingErrorKind::ServerOverload,
                                format!("{heartbeats} heartbeats without a result"),
                            ));
                        }
                    }
                    ServerFrame::Error(message) => {
                        return Err(EmbeddingError::new(EmbeddingErrorKind::ServerError, message))
                    }
                    frame => return Ok(frame),
                }
            }
        };

        match tokio::time::timeout(limits.hard, work).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::timeout(format!(
                "{} exceeded hard timeout of {:?}",
                request.label(),
                limits.hard
            ))),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for EmbeddingClient {
    async fn ensure_ready(&self) -> Result<(), EmbeddingError> {
        self.supervisor.ensure_running().await?;
        Ok(())
    }

    async fn embed_one(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        EmbeddingClient::embed_one(self, text).await
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        EmbeddingClient::embed_batch(self, texts).await
    }

    async fn process_bulk(&self, request: BulkRequest) -> Result<BulkOutcome, EmbeddingError> {
        EmbeddingClient::process_bulk(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::fake_server::{vector, FakeServer, Reply};
    use crate::embedding::supervisor::SupervisorConfig;
    use serde_json::json;

    fn client_for(server: &FakeServer, config: ClientConfig) -> EmbeddingClient {
        let supervisor = EmbeddingSupervisor::new(SupervisorConfig {
            project_root: server.path.parent().unwrap().to_path_buf(),
            socket_path: server.path.clone(),
            candidates: vec![server.path.clone()],
            server_command: Vec::new(),
            auto_spawn: false,
            schema: "specmem_test".into(),
            startup_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
        });
        EmbeddingClient::new(Arc::new(supervisor), config)
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            retry: RetryConfig::new(1),
            ..Default::default()
        }
    }

    fn heartbeat() -> Reply {
        Reply::Frame(json!({"status": "processing", "text_length": 5}))
    }

    #[tokio::test]
    async fn test_embed_one_skips_heartbeats() {
        let server = FakeServer::start(|_, _| {
            let mut replies: Vec<Reply> = (0..5).map(|_| heartbeat()).collect();
            replies.push(Reply::Frame(json!({"embedding": vector(384)})));
            replies
        });
        let client = client_for(&server, fast_config());

        let embedding = client.embed_one("fn main() {}").await.unwrap().unwrap();
        assert_eq!(embedding.len(), 384);
        assert_eq!(server.request_count(), 1);
        assert_eq!(server.requests.lock()[0]["type"], "embed");
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let server = FakeServer::start(|_, _| {
            vec![
                Reply::Raw("{\"status\":\"processing\"}\n{\"embedding\":[0.5,".into()),
                Reply::Sleep(Duration::from_millis(30)),
                Reply::Raw(format!("{}]}}\n", vec!["0.25"; 63].join(","))),
            ]
        });
        let client = client_for(&server, fast_config());

        let embedding = client.embed_one("text").await.unwrap().unwrap();
        assert_eq!(embedding.len(), 64);
        assert_eq!(embedding[0], 0.5);
        assert_eq!(embedding[63], 0.25);
    }

    #[tokio::test]
    async fn test_heartbeats_below_cap_succeed() {
        let server = FakeServer::start(|_, _| {
            let mut replies: Vec<Reply> = (0..20).map(|_| heartbeat()).collect();
            replies.push(Reply::Frame(json!({"embedding": vector(64)})));
            replies
        });
        let client = client_for(&server, fast_config());
        assert!(client.embed_one("text").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_cap_is_server_overload() {
        let server = FakeServer::start(|_, _| {
            let mut replies: Vec<Reply> = (0..21).map(|_| heartbeat()).collect();
            replies.push(Reply::Frame(json!({"embedding": vector(64)})));
            replies
        });
        let client = client_for(&server, fast_config());

        let err = client.embed_one("text").await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::ServerOverload);
        assert_eq!(
            client.error_counts().get(&EmbeddingErrorKind::ServerOverload),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_batch_heartbeat_cap_is_wider() {
        let server = FakeServer::start(|_, _| {
            let mut replies: Vec<Reply> = (0..25).map(|_| heartbeat()).collect();
            replies.push(Reply::Frame(json!({"embeddings": [vector(64)]})));
            replies
        });
        let client = client_for(&server, fast_config());
        let out = client.embed_batch(&["a".to_string()]).await.unwrap();
        assert!(out[0].is_some());
    }

    #[tokio::test]
    async fn test_empty_text_skips_round_trip() {
        let server = FakeServer::start(|_, _| vec![]);
        let client = client_for(&server, fast_config());

        assert_eq!(client.embed_one("   \n\t").await.unwrap(), None);
        let out = client
            .embed_batch(&["".to_string(), "  ".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![None, None]);
        assert_eq!(server.request_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_under_delivery_is_padded() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(json!({"embeddings": [vector(64)]}))]
        });
        let client = client_for(&server, fast_config());

        let texts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let out = client.embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out[0].is_some());
        assert!(out[1].is_none() && out[2].is_none());
    }

    #[tokio::test]
    async fn test_batch_over_delivery_is_truncated() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(
                json!({"embeddings": [vector(64), vector(64), vector(64), vector(64)]}),
            )]
        });
        let client = client_for(&server, fast_config());

        let texts = vec!["a".to_string(), "b".to_string()];
        let out = client.embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_batch_skips_empty_texts_and_realigns() {
        let server = FakeServer::start(|request, _| {
            let n = request["texts"].as_array().map(Vec::len).unwrap_or(0);
            let vectors: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32; 64]).collect();
            vec![Reply::Frame(json!({"embeddings": vectors}))]
        });
        let client = client_for(&server, fast_config());

        let texts = vec!["first".to_string(), " ".to_string(), "third".to_string()];
        let out = client.embed_batch(&texts).await.unwrap();

        assert_eq!(server.requests.lock()[0]["texts"], json!(["first", "third"]));
        assert_eq!(out[0].as_ref().unwrap()[0], 0.0);
        assert!(out[1].is_none());
        assert_eq!(out[2].as_ref().unwrap()[0], 1.0);
    }

    #[tokio::test]
    async fn test_out_of_range_dimension_is_no_embedding() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(json!({"embedding": vector(8)}))]
        });
        let client = client_for(&server, fast_config());
        assert_eq!(client.embed_one("text").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_frame() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(json!({"error": "model not loaded"}))]
        });
        let client = client_for(
            &server,
            ClientConfig {
                retry: RetryConfig::new(2),
                ..Default::default()
            },
        );

        let err = client.embed_one("text").await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::ServerError);
        assert_eq!(err.message, "model not loaded");
        assert_eq!(server.request_count(), 2);
        assert_eq!(
            client.error_counts().get(&EmbeddingErrorKind::ServerError),
            Some(&2)
        );
    }

    #[tokio::test]
    async fn test_retry_recovers_after_dropped_connection() {
        let server = FakeServer::start(|_, index| {
            if index == 0 {
                vec![]
            } else {
                vec![Reply::Frame(json!({"embedding": vector(64)}))]
            }
        });
        let client = client_for(
            &server,
            ClientConfig {
                retry: RetryConfig::new(3),
                ..Default::default()
            },
        );

        assert!(client.embed_one("text").await.unwrap().is_some());
        assert_eq!(server.request_count(), 2);
        assert_eq!(
            client.error_counts().get(&EmbeddingErrorKind::SocketClosed),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_hard_timeout_ignores_heartbeats() {
        let server = FakeServer::start(|_, _| {
            (0..200)
                .flat_map(|_| [heartbeat(), Reply::Sleep(Duration::from_millis(20))])
                .collect()
        });
        let client = client_for(
            &server,
            ClientConfig {
                retry: RetryConfig::new(1),
                max_heartbeats: usize::MAX,
                request_timeout: Duration::from_secs(5),
                hard_timeout: Duration::from_millis(300),
                ..Default::default()
            },
        );

        let started = std::time::Instant::now();
        let err = client.embed_one("text").await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let server = FakeServer::start(|_, _| vec![Reply::Sleep(Duration::from_secs(5))]);
        let client = client_for(
            &server,
            ClientConfig {
                retry: RetryConfig::new(1),
                request_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let err = client.embed_one("text").await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_text_is_truncated_before_sending() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(json!({"embedding": vector(64)}))]
        });
        let client = client_for(
            &server,
            ClientConfig {
                max_text_chars: 10,
                ..fast_config()
            },
        );

        let long = "abcdefghij".repeat(50);
        client.embed_one(&long).await.unwrap();
        client.embed_one(&long).await.unwrap();

        let requests = server.requests.lock();
        assert_eq!(requests[0]["text"], "abcdefghij");
        assert_eq!(requests[0]["text"], requests[1]["text"]);
    }

    #[tokio::test]
    async fn test_bulk_request_outcome() {
        let server = FakeServer::start(|request, _| {
            assert_eq!(request["process_codebase"], true);
            vec![
                heartbeat(),
                Reply::Frame(json!({
                    "status": "completed",
                    "processed": 12,
                    "errors": 0,
                    "remaining": 0
                })),
            ]
        });
        let client = client_for(&server, fast_config());

        let outcome = client
            .process_bulk(BulkRequest {
                target: crate::embedding::BulkTarget::Files,
                batch_size: 200,
                limit: 0,
                project_path: "/p".into(),
                schema: "specmem_p".into(),
                db_path: "/p/specmem/index/specmem_p.db".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.processed, 12);
    }

    #[tokio::test]
    async fn test_health_report() {
        let server = FakeServer::start(|_, _| {
            vec![Reply::Frame(json!({"status": "healthy", "ready": true}))]
        });
        let client = client_for(&server, fast_config());
        let report = client.health().await.unwrap();
        assert_eq!(report["ready"], true);
    }

    #[tokio::test]
    async fn test_missing_socket_fails_with_socket_not_found() {
        let server = FakeServer::start(|_, _| vec![]);
        let mut client = client_for(&server, fast_config());
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.sock");
        client.supervisor = Arc::new(EmbeddingSupervisor::new(SupervisorConfig {
            socket_path: missing.clone(),
            candidates: vec![missing],
            ..client.supervisor.config().clone()
        }));

        let err = client.embed_one("text").await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::SocketNotFound);
    }
}
