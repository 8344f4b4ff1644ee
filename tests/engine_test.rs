// End-to-end tests for the engine facade: transfers, trash purge and playback streaming.

mod common;

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use drive_transfer_engine::api::engine_api::TransferEngine;
use drive_transfer_engine::api::simple::init_tracing;
use drive_transfer_engine::config::EngineConfig;
use drive_transfer_engine::engine::transfer::TransferHandle;
use drive_transfer_engine::error::TransportError;
use drive_transfer_engine::source::traits::{TrashClient, TrashItem, TrashItemKind};

use common::{content, mnemonic, FakeCloud, BUCKET};

fn engine(cloud: &Arc<FakeCloud>) -> TransferEngine {
    init_tracing();
    TransferEngine::new(EngineConfig::default(), cloud.clone(), cloud.clone(), mnemonic())
}

#[tokio::test]
async fn test_stream_serves_decrypted_ranges() {
    let cloud = Arc::new(FakeCloud::default());
    let data = content(50_000);
    let file_id = cloud.seed_file(&data, [9u8; 32], &[20_000, 30_000], &[1, 0], Some(2));

    let engine = engine(&cloud);
    assert!(engine.register_video_session(&file_id, BUCKET, 50_000).is_err());
    engine.start_streaming().await.unwrap();
    // A second start keeps the running server.
    engine.start_streaming().await.unwrap();

    let info = engine
        .register_video_session(&file_id, BUCKET, data.len() as u64)
        .unwrap();
    assert!(info.stream_url.ends_with(&format!("/video-stream/{}", info.session_id)));

    let client = reqwest::Client::new();
    // Crosses the shard boundary at 20 000.
    let resp = client
        .get(&info.stream_url)
        .header("Range", "bytes=19000-20999")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 19000-20999/50000"
    );
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[19_000..21_000]);

    let resp = client
        .get(&info.stream_url)
        .header("Range", "bytes=49000-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[49_000..]);

    // Links and keys are resolved once per file.
    assert_eq!(cloud.link_calls.load(Ordering::SeqCst), 1);

    assert!(engine.close_session(&info.session_id));
    let resp = client.get(&info.stream_url).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    engine.dispose();
}

async fn get_range(client: &reqwest::Client, url: &str, range: &str) -> (u16, Vec<u8>) {
    let resp = client.get(url).header("Range", range).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.bytes().await.unwrap().to_vec())
}

#[tokio::test]
async fn test_concurrent_start_streaming_keeps_one_live_controller() {
    let cloud = Arc::new(FakeCloud::default());
    let data = content(1000);
    let file_id = cloud.seed_file(&data, [5u8; 32], &[1000], &[0], Some(2));
    let engine = engine(&cloud);

    let (first, second) = tokio::join!(engine.start_streaming(), engine.start_streaming());
    first.unwrap();
    second.unwrap();

    let info = engine.register_video_session(&file_id, BUCKET, 1000).unwrap();
    let client = reqwest::Client::new();
    let (status, body) = get_range(&client, &info.stream_url, "bytes=0-99").await;
    assert_eq!(status, 206);
    assert_eq!(body, &data[..100]);

    engine.dispose();
}

#[tokio::test]
async fn test_closing_last_session_releases_file_keys() {
    let cloud = Arc::new(FakeCloud::default());
    let data = content(2000);
    let file_id = cloud.seed_file(&data, [6u8; 32], &[2000], &[0], Some(2));
    let engine = engine(&cloud);
    engine.start_streaming().await.unwrap();
    let client = reqwest::Client::new();

    let a = engine.register_video_session(&file_id, BUCKET, 2000).unwrap();
    let b = engine.register_video_session(&file_id, BUCKET, 2000).unwrap();
    assert_eq!(get_range(&client, &a.stream_url, "bytes=0-9").await.0, 206);
    assert_eq!(engine.cached_stream_files(), 1);

    // Another session still plays the file, so its keys stay.
    assert!(engine.close_session(&a.session_id));
    assert_eq!(engine.cached_stream_files(), 1);
    let (status, body) = get_range(&client, &b.stream_url, "bytes=100-199").await;
    assert_eq!(status, 206);
    assert_eq!(body, &data[100..200]);
    assert_eq!(cloud.link_calls.load(Ordering::SeqCst), 1);

    assert!(engine.close_session(&b.session_id));
    assert_eq!(engine.cached_stream_files(), 0);
    assert!(!engine.close_session(&b.session_id));

    // A later playback resolves the file again.
    let c = engine.register_video_session(&file_id, BUCKET, 2000).unwrap();
    assert_eq!(get_range(&client, &c.stream_url, "bytes=1990-").await.1, &data[1990..]);
    assert_eq!(cloud.link_calls.load(Ordering::SeqCst), 2);

    engine.dispose();
    assert_eq!(engine.cached_stream_files(), 0);
}

#[tokio::test]
async fn test_upload_and_download_through_engine() {
    let cloud = Arc::new(FakeCloud::default());
    let engine = engine(&cloud);
    let data = content(12_345);

    let file_id = engine
        .upload_file(BUCKET, Cursor::new(data.clone()), data.len() as u64, &TransferHandle::new())
        .await
        .unwrap();
    let out = engine
        .download_file(BUCKET, &file_id, &TransferHandle::new())
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(out, data);
}

/// Records batch sizes; the first call is rate limited.
#[derive(Default)]
struct RecordingTrash {
    batches: Mutex<Vec<usize>>,
    throttled: Mutex<bool>,
}

#[async_trait]
impl TrashClient for RecordingTrash {
    async fn delete_items(&self, items: &[TrashItem]) -> Result<(), TransportError> {
        {
            let mut throttled = self.throttled.lock();
            if !*throttled {
                *throttled = true;
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    "x-internxt-ratelimit-reset",
                    reqwest::header::HeaderValue::from_static("1"),
                );
                return Err(TransportError::from_status(429, &h, "slow down"));
            }
        }
        self.batches.lock().push(items.len());
        Ok(())
    }
}

#[tokio::test]
async fn test_purge_trash_uses_configured_batches() {
    let cloud = Arc::new(FakeCloud::default());
    let config = EngineConfig::from_toml_str("trash_batch_size = 4\ntrash_max_concurrent_batches = 2").unwrap();
    let engine = TransferEngine::new(config, cloud.clone(), cloud.clone(), mnemonic());

    let items: Vec<TrashItem> = (0..10)
        .map(|i| TrashItem {
            id: format!("item-{i}"),
            kind: if i % 2 == 0 { TrashItemKind::File } else { TrashItemKind::Folder },
        })
        .collect();
    let client = RecordingTrash::default();

    let deleted = engine.purge_trash(&client, items).await.unwrap();
    assert_eq!(deleted, 10);
    let mut batches = client.batches.lock().clone();
    batches.sort_unstable();
    assert_eq!(batches, vec![2, 4, 4]);
}
