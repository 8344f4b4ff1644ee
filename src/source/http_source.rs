use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::{header, Body, Client, RequestBuilder, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::traits::ShardTransport;
use crate::error::TransportError;

/// Shard transport over plain HTTP: PUT to signed upload URLs, ranged GET from download URLs.
pub struct HttpShardTransport {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpShardTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the extra headers sent with every shard request.
    pub fn set_headers(&self, headers: HashMap<String, String>) {
        *self.headers.write() = headers;
    }

    fn with_headers(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (k, v) in self.headers.read().iter() {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    /// Map a non-success response onto the transport error union.
    async fn reject(resp: Response, what: &str) -> TransportError {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        warn!("shard {} failed status={} body={}", what, status, body);
        TransportError::from_status(status, &headers, body)
    }
}

impl Default for HttpShardTransport {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl ShardTransport for HttpShardTransport {
    async fn put(&self, url: &str, body: mpsc::Receiver<Bytes>, len: u64) -> Result<(), TransportError> {
        let stream = ReceiverStream::new(body).map(Ok::<_, std::io::Error>);
        let req = self
            .with_headers(self.client.put(url))
            .header(header::CONTENT_LENGTH, len)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream));

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Self::reject(resp, "put").await);
        }
        debug!("shard put ok ({} bytes)", len);
        Ok(())
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, TransportError> {
        if end < start {
            return Err(TransportError::Protocol(format!("empty range {}-{}", start, end)));
        }
        let range = format!("bytes={}-{}", start, end);
        let resp = self
            .with_headers(self.client.get(url))
            .header(header::RANGE, &range)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Self::reject(resp, "fetch").await);
        }

        let whole_object = resp.status().as_u16() == 200;
        let bytes = resp.bytes().await?;

        // Servers that ignore Range send the whole object; cut our window out of it.
        let bytes = if whole_object && bytes.len() as u64 > end - start + 1 {
            if bytes.len() as u64 <= end {
                return Err(TransportError::Protocol(format!(
                    "object is {} bytes, range {} out of bounds",
                    bytes.len(),
                    range
                )));
            }
            bytes.slice(start as usize..=end as usize)
        } else {
            bytes
        };

        let expected = end - start + 1;
        if bytes.len() as u64 != expected {
            return Err(TransportError::Protocol(format!(
                "range {} returned {} bytes, expected {}",
                range,
                bytes.len(),
                expected
            )));
        }
        debug!("shard fetch {} ok", range);
        Ok(bytes)
    }
}
