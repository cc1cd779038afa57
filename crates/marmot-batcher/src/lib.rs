//! Size/interval-coalescing batch processor (spec.md §4.B), kept in the
//! workspace as teacher-derived reference scaffolding. `marmot-notify`'s
//! change aggregator needs per-`(recipient, change_type)` coalescing
//! rather than this crate's single FIFO batch, so it implements its own
//! window instead of using `BatchProcessor` directly — nothing in this
//! workspace currently depends on this crate (see DESIGN.md).
//!
//! Items are pushed via [`BatchProcessor::add`]. A background task emits
//! a batch to the process function whenever `batch_size` items have
//! accumulated or `flush_interval` has elapsed since the first item of
//! the current batch, whichever comes first. `stop` guarantees a final
//! flush of anything still buffered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct BatchProcessorConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

enum Message<T> {
    Item(T),
    FlushNow,
}

/// Coalesces items of type `T` and hands completed batches to `process`.
/// `process` failures are logged and swallowed — the batch is not
/// retried, matching the caller's idempotence contract.
pub struct BatchProcessor<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<Message<T>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T> BatchProcessor<T>
where
    T: Send + 'static,
{
    pub fn start<F, Fut>(config: BatchProcessorConfig, process: F) -> Arc<Self>
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<T>>();
        let batch_size = config.batch_size.max(1);
        let flush_interval = config.flush_interval;

        let handle = tokio::spawn(async move {
            let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
            let mut deadline: Option<Instant> = None;

            loop {
                let sleep = match deadline {
                    Some(at) => tokio::time::sleep_until(at),
                    None => tokio::time::sleep(Duration::from_secs(3600)),
                };
                tokio::pin!(sleep);

                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(Message::Item(item)) => {
                                if buffer.is_empty() {
                                    deadline = Some(Instant::now() + flush_interval);
                                }
                                buffer.push(item);
                                if buffer.len() >= batch_size {
                                    flush(&process, &mut buffer).await;
                                    deadline = None;
                                }
                            }
                            Some(Message::FlushNow) => {
                                flush(&process, &mut buffer).await;
                                deadline = None;
                            }
                            None => {
                                flush(&process, &mut buffer).await;
                                break;
                            }
                        }
                    }
                    _ = &mut sleep, if deadline.is_some() => {
                        flush(&process, &mut buffer).await;
                        deadline = None;
                    }
                }
            }
        });

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Pushes `item` onto the current batch. Never blocks: the channel is
    /// unbounded because batched items are expected to be small keys
    /// (e.g. asset MRNs), not payloads.
    pub async fn add(&self, item: T) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(Message::Item(item));
        }
    }

    /// Forces an immediate flush of whatever is currently buffered,
    /// without waiting for size or interval thresholds.
    pub async fn flush_now(&self) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(Message::FlushNow);
        }
    }

    /// Stops accepting new items and waits for the final flush to
    /// complete.
    pub async fn stop(&self) {
        // dropping the sender makes rx.recv() return None, which flushes
        // and exits the loop
        self.tx.lock().await.take();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(%err, "batch processor task panicked");
            }
        }
    }
}

async fn flush<T, F, Fut>(process: &F, buffer: &mut Vec<T>)
where
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<(), anyhow::Error>>,
{
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(err) = process(batch).await {
        warn!(%err, "batch process function failed, batch dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn flushes_on_size_threshold() {
        let batches = Arc::new(Mutex::new(Vec::<Vec<u32>>::new()));
        let batches_clone = batches.clone();
        let processor = BatchProcessor::start(
            BatchProcessorConfig {
                batch_size: 3,
                flush_interval: Duration::from_secs(60),
            },
            move |batch| {
                let batches = batches_clone.clone();
                async move {
                    batches.lock().await.push(batch);
                    Ok(())
                }
            },
        );

        for i in 0..3u32 {
            processor.add(i).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        processor.stop().await;

        let got = batches.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_interval_even_if_not_full() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let processor = BatchProcessor::start(
            BatchProcessorConfig {
                batch_size: 100,
                flush_interval: Duration::from_millis(50),
            },
            move |batch| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        processor.add(1u32).await;
        processor.add(2u32).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        processor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_remaining_items() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let processor = BatchProcessor::start(
            BatchProcessorConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
            move |batch| {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        processor.add(1u32).await;
        processor.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
