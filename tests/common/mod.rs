// In-memory storage network and shard store shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;

use drive_transfer_engine::crypto::{FileKeys, Mnemonic};
use drive_transfer_engine::error::TransportError;
use drive_transfer_engine::source::traits::{
    DownloadLinks, FinishUploadRequest, FinishUploadResponse, ShardRef, ShardTransport,
    StartUploadRequest, StartUploadResponse, StorageNetwork, UploadUrl,
};

pub const PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const BUCKET: &str = "4f2c9a0b1d3e5f7a";

pub fn mnemonic() -> Mnemonic {
    Mnemonic::new(PHRASE)
}

pub fn content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 31 % 251) as u8).collect()
}

/// Both sides of the network: SDK calls and shard storage.
#[derive(Default)]
pub struct FakeCloud {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub files: Mutex<HashMap<String, DownloadLinks>>,
    pub finished: Mutex<Vec<FinishUploadRequest>>,
    slots: Mutex<HashMap<String, (String, u64)>>,
    counter: AtomicU32,
    pub start_calls: AtomicU32,
    /// Number of leading `start_upload` calls answered with a rate limit.
    pub throttle_start: AtomicU32,
    /// Status returned by every PUT instead of storing the body.
    pub fail_put: Mutex<Option<u16>>,
    pub link_calls: AtomicU32,
    /// Answer `start_upload` without any upload urls.
    pub no_upload_urls: AtomicBool,
}

impl FakeCloud {
    /// Store `plain` encrypted under `index` as shards of the given sizes, listed in
    /// `listed_order`. Returns the file id.
    pub fn seed_file(
        &self,
        plain: &[u8],
        index: [u8; 32],
        shard_sizes: &[usize],
        listed_order: &[usize],
        version: Option<u32>,
    ) -> String {
        let keys = FileKeys::derive(&mnemonic(), BUCKET, &index).unwrap();
        let mut cipher = plain.to_vec();
        keys.cipher().apply(&mut cipher);

        let mut shards = Vec::new();
        let mut offset = 0;
        for (i, size) in shard_sizes.iter().enumerate() {
            let url = format!("mem://seed/{}/{}", hex::encode(&index[..4]), i);
            self.objects
                .lock()
                .insert(url.clone(), cipher[offset..offset + size].to_vec());
            shards.push(ShardRef {
                index: i as u32,
                hash: String::new(),
                url,
                size: *size as u64,
            });
            offset += size;
        }
        let listed = listed_order.iter().map(|&i| shards[i].clone()).collect();

        let id = format!("seeded-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.files.lock().insert(
            id.clone(),
            DownloadLinks {
                index: hex::encode(index),
                shards: listed,
                version,
                size: plain.len() as u64,
            },
        );
        id
    }
}

#[async_trait]
impl StorageNetwork for FakeCloud {
    async fn start_upload(
        &self,
        _bucket_id: &str,
        request: StartUploadRequest,
    ) -> Result<StartUploadResponse, TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let throttled = self
            .throttle_start
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            let mut h = HeaderMap::new();
            h.insert("x-internxt-ratelimit-reset", HeaderValue::from_static("5"));
            return Err(TransportError::from_status(429, &h, "too many requests"));
        }

        if self.no_upload_urls.load(Ordering::SeqCst) {
            return Ok(StartUploadResponse { uploads: Vec::new() });
        }

        let uploads = request
            .uploads
            .iter()
            .map(|part| {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let url = format!("mem://upload/{}", n);
                let uuid = format!("uuid-{}", n);
                self.slots.lock().insert(uuid.clone(), (url.clone(), part.size));
                UploadUrl { url, uuid }
            })
            .collect();
        Ok(StartUploadResponse { uploads })
    }

    async fn finish_upload(
        &self,
        _bucket_id: &str,
        request: FinishUploadRequest,
    ) -> Result<FinishUploadResponse, TransportError> {
        let mut shards = Vec::new();
        let mut size = 0;
        for (i, shard) in request.shards.iter().enumerate() {
            let (url, shard_size) = self
                .slots
                .lock()
                .get(&shard.uuid)
                .cloned()
                .ok_or_else(|| TransportError::Status {
                    status: 404,
                    message: format!("unknown upload {}", shard.uuid),
                })?;
            size += shard_size;
            shards.push(ShardRef {
                index: i as u32,
                hash: shard.hash.clone(),
                url,
                size: shard_size,
            });
        }

        let id = format!("file-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.files.lock().insert(
            id.clone(),
            DownloadLinks {
                index: request.index.clone(),
                shards,
                version: Some(2),
                size,
            },
        );
        self.finished.lock().push(request);
        Ok(FinishUploadResponse { id })
    }

    async fn get_download_links(
        &self,
        _bucket_id: &str,
        file_id: &str,
    ) -> Result<DownloadLinks, TransportError> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .get(file_id)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                status: 404,
                message: format!("no file {}", file_id),
            })
    }
}

#[async_trait]
impl ShardTransport for FakeCloud {
    async fn put(&self, url: &str, mut body: mpsc::Receiver<Bytes>, len: u64) -> Result<(), TransportError> {
        let fail = *self.fail_put.lock();
        if let Some(status) = fail {
            return Err(TransportError::from_status(status, &HeaderMap::new(), "rejected"));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = body.recv().await {
            buf.extend_from_slice(&chunk);
        }
        if buf.len() as u64 != len {
            return Err(TransportError::Network(format!(
                "body ended after {} of {} bytes",
                buf.len(),
                len
            )));
        }
        self.objects.lock().insert(url.to_string(), buf);
        Ok(())
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, TransportError> {
        tokio::task::yield_now().await;
        let objects = self.objects.lock();
        let obj = objects.get(url).ok_or_else(|| TransportError::Status {
            status: 404,
            message: url.to_string(),
        })?;
        if end as usize >= obj.len() {
            return Err(TransportError::Status {
                status: 416,
                message: format!("{}-{} of {}", start, end, obj.len()),
            });
        }
        Ok(Bytes::copy_from_slice(&obj[start as usize..=end as usize]))
    }
}
