// Engine orchestration: chunk sizing, retries, batching, sessions and whole-file transfers.

pub mod batch;
pub mod chunk_policy;
pub mod downloader;
pub mod layout;
pub mod retry;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transfer;
pub mod trash;
