// Correlates HTTP range requests with chunk controller replies through a pending table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{ChunkRequest, ChunkResponse, RegisterVideoSession};
use crate::config::{EngineConfig, CHUNK_REQUEST_TIMEOUT_MS, STREAM_WINDOW_BYTES};

/// A file registered for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub session_id: String,
    pub file_id: String,
    pub bucket_id: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no chunk controller attached")]
    NoController,

    #[error("chunk controller went away")]
    ControllerGone,

    #[error("chunk request timed out after {0} ms")]
    Timeout(u64),

    #[error("chunk fetch failed: {0}")]
    Fetch(String),
}

/// Session registry plus request/reply correlation between the endpoint and a controller.
pub struct RangeStreamBridge {
    sessions: RwLock<HashMap<String, StreamSession>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ChunkResponse>>>,
    controller: RwLock<Option<mpsc::Sender<ChunkRequest>>>,
    request_timeout: Duration,
    window_bytes: u64,
}

impl RangeStreamBridge {
    pub fn new(request_timeout: Duration, window_bytes: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            controller: RwLock::new(None),
            request_timeout,
            window_bytes: window_bytes.max(1),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.chunk_request_timeout_ms),
            cfg.stream_window_bytes,
        )
    }

    /// Largest window served for an open-ended range.
    pub fn window_bytes(&self) -> u64 {
        self.window_bytes
    }

    /// Register a file for streaming. Existing sessions are kept.
    pub fn register(&self, msg: RegisterVideoSession) -> StreamSession {
        let session = StreamSession {
            session_id: Uuid::new_v4().to_string(),
            file_id: msg.file_id,
            bucket_id: msg.bucket_id,
            file_size: msg.file_size,
        };
        info!(
            "stream session {} registered: file {} ({} bytes)",
            session.session_id, session.file_id, session.file_size
        );
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn unregister(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn session(&self, session_id: &str) -> Option<StreamSession> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Number of registered sessions playing `file_id` from `bucket_id`.
    pub fn sessions_for_file(&self, bucket_id: &str, file_id: &str) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.bucket_id == bucket_id && s.file_id == file_id)
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Attach a controller, replacing any previous one. Requests issued from now on are
    /// delivered through the returned link.
    pub fn attach_controller(self: &Arc<Self>, queue_depth: usize) -> ControllerLink {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        *self.controller.write() = Some(tx);
        debug!("chunk controller attached");
        ControllerLink {
            requests: rx,
            replier: ChunkReplier {
                bridge: Arc::clone(self),
            },
        }
    }

    pub fn detach_controller(&self) {
        *self.controller.write() = None;
        debug!("chunk controller detached");
    }

    /// Settle the pending request named by `response`. Returns `false` for unknown,
    /// already-settled or timed-out requests.
    pub fn resolve(&self, response: ChunkResponse) -> bool {
        let waiter = self.pending.lock().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!("ignoring reply for unknown request {}", response.request_id);
                false
            }
        }
    }

    /// Ask the controller for the inclusive window `[start, end]` of `session`'s file and
    /// wait for the reply.
    pub async fn request_window(
        &self,
        session: &StreamSession,
        start: u64,
        end: u64,
    ) -> Result<Bytes, BridgeError> {
        let controller = self
            .controller
            .read()
            .clone()
            .ok_or(BridgeError::NoController)?;
        if controller.is_closed() {
            return Err(BridgeError::ControllerGone);
        }

        let request_id = new_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            bridge: self,
            request_id: &request_id,
        };

        let request = ChunkRequest {
            request_id: request_id.clone(),
            file_id: session.file_id.clone(),
            bucket_id: session.bucket_id.clone(),
            start,
            end,
            file_size: session.file_size,
        };
        debug!("chunk request {} for bytes {}-{}", request_id, start, end);

        let exchange = async {
            controller
                .send(request)
                .await
                .map_err(|_| BridgeError::ControllerGone)?;
            rx.await.map_err(|_| BridgeError::ControllerGone)
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(response)) => response.into_result().map_err(BridgeError::Fetch),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let ms = self.request_timeout.as_millis() as u64;
                warn!("chunk request {} timed out after {} ms", request_id, ms);
                Err(BridgeError::Timeout(ms))
            }
        }
    }
}

impl Default for RangeStreamBridge {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(CHUNK_REQUEST_TIMEOUT_MS),
            STREAM_WINDOW_BYTES,
        )
    }
}

/// Drops the pending entry however the wait ends, so late replies find nothing.
struct PendingGuard<'a> {
    bridge: &'a RangeStreamBridge,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.bridge.pending.lock().remove(self.request_id);
    }
}

/// Millisecond timestamp plus a random suffix.
fn new_request_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:08x}", ms, suffix)
}

/// Controller side of the bridge: incoming requests plus the reply path.
pub struct ControllerLink {
    requests: mpsc::Receiver<ChunkRequest>,
    replier: ChunkReplier,
}

impl ControllerLink {
    pub async fn recv(&mut self) -> Option<ChunkRequest> {
        self.requests.recv().await
    }

    pub fn replier(&self) -> ChunkReplier {
        self.replier.clone()
    }
}

/// Cloneable reply path into the bridge's pending table.
#[derive(Clone)]
pub struct ChunkReplier {
    bridge: Arc<RangeStreamBridge>,
}

impl ChunkReplier {
    pub fn reply(&self, response: ChunkResponse) -> bool {
        self.bridge.resolve(response)
    }
}
