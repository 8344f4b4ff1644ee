use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequestPart {
    pub index: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    pub uploads: Vec<UploadRequestPart>,
}

/// Where one declared upload should be PUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub url: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub uploads: Vec<UploadUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedShard {
    pub hash: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishUploadRequest {
    /// Hex-encoded file index.
    pub index: String,
    pub shards: Vec<UploadedShard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishUploadResponse {
    pub id: String,
}

/// One stored shard as reported by the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRef {
    pub index: u32,
    pub hash: String,
    pub url: String,
    pub size: u64,
}

/// Download metadata for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLinks {
    /// Hex-encoded file index.
    pub index: String,
    pub shards: Vec<ShardRef>,
    #[serde(default)]
    pub version: Option<u32>,
    pub size: u64,
}

/// Item in the trash, identified the way the network expects for permanent deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TrashItemKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrashItemKind {
    File,
    Folder,
}

/// The storage network SDK: hands out upload/download locations and records finished uploads.
#[async_trait]
pub trait StorageNetwork: Send + Sync {
    async fn start_upload(
        &self,
        bucket_id: &str,
        request: StartUploadRequest,
    ) -> Result<StartUploadResponse, TransportError>;

    async fn finish_upload(
        &self,
        bucket_id: &str,
        request: FinishUploadRequest,
    ) -> Result<FinishUploadResponse, TransportError>;

    async fn get_download_links(
        &self,
        bucket_id: &str,
        file_id: &str,
    ) -> Result<DownloadLinks, TransportError>;
}

/// Moves shard bytes to and from signed URLs.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// PUT `len` bytes produced by `body` to `url`.
    async fn put(&self, url: &str, body: mpsc::Receiver<Bytes>, len: u64) -> Result<(), TransportError>;

    /// Fetch the inclusive byte range `[start, end]` of the object at `url`.
    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes, TransportError>;
}

/// Permanent deletion of trashed items.
#[async_trait]
pub trait TrashClient: Send + Sync {
    async fn delete_items(&self, items: &[TrashItem]) -> Result<(), TransportError>;
}
