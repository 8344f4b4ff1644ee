// Wave-barrier batch runner used for bulk operations.

use std::future::Future;

use futures_util::future::join_all;
use tracing::debug;

/// Run `processor` over `items` in contiguous batches of `batch_size`, with up to
/// `max_concurrent_batches` batches in flight.
///
/// Batches launch in waves: once a wave is full, every batch in it is awaited before the
/// next wave starts. The first error of a wave is returned after the whole wave settles,
/// and no later wave is started.
pub async fn process_batch_concurrently<T, R, E, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    max_concurrent_batches: usize,
    mut processor: F,
) -> Result<(), E>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let batch_size = batch_size.max(1);
    let max_concurrent_batches = max_concurrent_batches.max(1);

    let mut wave = Vec::with_capacity(max_concurrent_batches);
    let mut remaining = items.into_iter().peekable();
    let mut wave_no = 0u32;

    while remaining.peek().is_some() {
        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        wave.push(processor(batch));

        if wave.len() >= max_concurrent_batches {
            wave_no += 1;
            debug!("awaiting batch wave {} ({} batches)", wave_no, wave.len());
            settle(std::mem::take(&mut wave)).await?;
        }
    }

    if !wave.is_empty() {
        wave_no += 1;
        debug!("awaiting final batch wave {} ({} batches)", wave_no, wave.len());
        settle(wave).await?;
    }
    Ok(())
}

async fn settle<R, E, Fut>(wave: Vec<Fut>) -> Result<(), E>
where
    Fut: Future<Output = Result<R, E>>,
{
    for result in join_all(wave).await {
        result?;
    }
    Ok(())
}
