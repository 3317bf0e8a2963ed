//! Write coalescing for small, frequent, best-effort store updates such as counter increments.
//!
//! The first [`enqueue()`](BatchQueue::enqueue) of an operation kind opens a window and arms a single-shot timer for
//! it. Until the timer fires, further writes of that kind are collected; a write for a key already pending replaces
//! the pending payload. When the window closes, the whole batch is taken out of the queue at once and handed to the
//! [`BatchWriter`] as one combined write. The next write of that kind opens a new window.
//!
//! A failed combined write is logged and dropped. Nobody who enqueued into it hears about the failure.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use fieldx_plus::fx_plus;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::trace;

use crate::error::CacheError;
use crate::traits::BatchWriter;
use crate::traits::SegmentInvalidator;
use crate::types::BatchStats;

struct PendingBatch<W>
where
    W: BatchWriter,
{
    generation: u64,
    // Keys in the order they were first enqueued within the window.
    entries:    Vec<(W::Key, W::Payload)>,
    index:      HashMap<W::Key, usize>,
    waiters:    Vec<oneshot::Sender<()>>,
    timer:      Option<AbortHandle>,
}

impl<W> PendingBatch<W>
where
    W: BatchWriter,
{
    fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: Vec::new(),
            index: HashMap::new(),
            waiters: Vec::new(),
            timer: None,
        }
    }

    // Returns true if the payload replaced a pending one.
    fn put(&mut self, key: W::Key, payload: W::Payload) -> bool {
        if let Some(idx) = self.index.get(&key) {
            self.entries[*idx].1 = payload;
            true
        }
        else {
            self.index.insert(key.clone(), self.entries.len());
            self.entries.push((key, payload));
            false
        }
    }
}

/// Resolves once the enqueued key has left the pending batch, i.e. has been handed over for writing.
///
/// This only means "accepted for processing". The combined write itself may still fail afterwards.
#[must_use = "a ticket does nothing unless awaited; dropping it does not cancel the write"]
pub struct BatchTicket {
    kind:     String,
    key:      String,
    receiver: oneshot::Receiver<()>,
}

impl BatchTicket {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Future for BatchTicket {
    type Output = Result<(), CacheError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CacheError::BatchDropped {
                kind: this.kind.clone(),
                key:  this.key.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Debug for BatchTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTicket")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .finish()
    }
}

/// Coalescing write queue.
///
/// ```ignore
/// let queue = BatchQueue::builder()
///     .writer(counter_writer)
///     .invalidator(cache.clone() as Arc<dyn SegmentInvalidator>)
///     .window(Duration::from_millis(10))
///     .build()?;
///
/// queue.enqueue(CounterKind::Likes, news_id, 1).await?;
/// ```
///
/// Must be used from within a Tokio runtime: every window is a spawned timer task.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`BatchQueue`].", "", "See [`BatchQueue::builder()`] method."),
        method_doc("Implement builder pattern for [`BatchQueue`]."),
    )
)]
pub struct BatchQueue<W>
where
    W: BatchWriter,
{
    #[fieldx(get(clone), builder(required, into))]
    writer: Arc<W>,

    /// Where segments affected by a written batch get dropped.
    #[fieldx(get(clone), builder(required))]
    invalidator: Arc<dyn SegmentInvalidator>,

    /// Length of a coalescing window.
    #[fieldx(get(copy), default(Duration::from_millis(10)))]
    window: Duration,

    #[fieldx(lock, private, get, get_mut, builder(off), default(HashMap::new()))]
    pending: HashMap<W::Kind, PendingBatch<W>>,

    #[fieldx(private, get(off), builder(off), default(AtomicU64::new(0)))]
    generations: AtomicU64,

    #[fieldx(lock, private, get(copy), get_mut, builder(off), default(BatchStats::default()))]
    counters: BatchStats,
}

impl<W> BatchQueue<W>
where
    W: BatchWriter,
{
    /// Queue `payload` for `key`, replacing any payload still pending for it in the current window of `kind`.
    pub fn enqueue(&self, kind: W::Kind, key: W::Key, payload: W::Payload) -> BatchTicket {
        let (sender, receiver) = oneshot::channel();
        let ticket = BatchTicket {
            kind: kind.to_string(),
            key: key.to_string(),
            receiver,
        };

        let coalesced = {
            let mut pending = self.pending_mut();
            let batch = pending.entry(kind.clone()).or_insert_with(|| {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let mut batch = PendingBatch::new(generation);
                batch.timer = self.arm_timer(kind.clone(), generation);
                batch
            });

            trace!(%kind, %key, ?payload, "enqueue");
            batch.waiters.push(sender);
            batch.put(key, payload)
        };

        let mut counters = self.counters_mut();
        counters.enqueued += 1;
        if coalesced {
            counters.coalesced += 1;
        }

        ticket
    }

    fn arm_timer(&self, kind: W::Kind, generation: u64) -> Option<AbortHandle> {
        let Some(queue) = self.myself()
        else {
            error!(%kind, "batch queue is gone, window timer not armed");
            return None;
        };
        let window = self.window();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(batch) = queue.take_batch(&kind, Some(generation)) {
                queue.write_batch(kind, batch).await;
            }
        });

        Some(handle.abort_handle())
    }

    // Atomically detach the pending batch of `kind` so that new writes start a fresh window. With `generation` set
    // only the batch of that very window is taken.
    fn take_batch(&self, kind: &W::Kind, generation: Option<u64>) -> Option<PendingBatch<W>> {
        let mut pending = self.pending_mut();
        if let Some(generation) = generation {
            if pending.get(kind).map_or(true, |b| b.generation != generation) {
                return None;
            }
        }
        let mut batch = pending.remove(kind)?;
        drop(pending);

        for waiter in batch.waiters.drain(..) {
            // The receiver may have been dropped; the ticket was just not awaited.
            let _ = waiter.send(());
        }
        Some(batch)
    }

    #[instrument(level = "trace", skip(self, batch), fields(size = batch.entries.len()))]
    async fn write_batch(&self, kind: W::Kind, mut batch: PendingBatch<W>) {
        let entries = std::mem::take(&mut batch.entries);
        if entries.is_empty() {
            return;
        }

        let size = entries.len();
        let keys = entries.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>();
        let writer = self.writer();

        self.counters_mut().flushes += 1;

        match writer.write_batch(&kind, entries).await {
            Ok(()) => {
                debug!(%kind, size, "batch written");
                for segment in writer.affected_segments(&kind, &keys) {
                    self.invalidator().invalidate(&segment);
                }
            }
            Err(err) => {
                let mut counters = self.counters_mut();
                counters.failed_flushes += 1;
                counters.dropped_writes += size as u64;
                error!(%kind, size, error = %err, "batch write failed, batch dropped");
            }
        }
    }

    /// Close the current window of `kind` now. Returns the number of keys handed to the writer.
    pub async fn flush(&self, kind: &W::Kind) -> usize {
        let Some(mut batch) = self.take_batch(kind, None)
        else {
            return 0;
        };

        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }

        let size = batch.entries.len();
        self.write_batch(kind.clone(), batch).await;
        size
    }

    /// Flush every open window.
    pub async fn close(&self) -> usize {
        let kinds = self.pending().keys().cloned().collect::<Vec<_>>();
        let mut flushed = 0;
        for kind in kinds {
            flushed += self.flush(&kind).await;
        }
        flushed
    }

    /// Number of distinct keys pending for `kind`.
    pub fn pending_len(&self, kind: &W::Kind) -> usize {
        self.pending().get(kind).map_or(0, |b| b.entries.len())
    }

    pub fn stats(&self) -> BatchStats {
        self.counters()
    }
}

impl<W> Debug for BatchQueue<W>
where
    W: BatchWriter,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue")
            .field("window", &self.window())
            .field("open_windows", &self.pending().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::StoreError;

    #[derive(Default)]
    struct RecordingWriter {
        calls:   Mutex<Vec<(String, Vec<(String, i64)>)>>,
        failing: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        type Key = String;
        type Kind = String;
        type Payload = i64;

        async fn write_batch(&self, kind: &String, batch: Vec<(String, i64)>) -> Result<(), CacheError> {
            self.calls.lock().push((kind.clone(), batch));
            if self.failing.lock().contains(kind) {
                return Err(StoreError::Query("counter table locked".into()).into());
            }
            Ok(())
        }

        fn affected_segments(&self, _kind: &String, _keys: &[String]) -> Vec<String> {
            vec!["news".to_string()]
        }
    }

    #[derive(Default)]
    struct RecordingInvalidator {
        dropped: Mutex<Vec<String>>,
    }

    impl SegmentInvalidator for RecordingInvalidator {
        fn invalidate(&self, segment: &str) -> bool {
            self.dropped.lock().push(segment.to_string());
            true
        }
    }

    fn queue() -> (Arc<BatchQueue<RecordingWriter>>, Arc<RecordingWriter>, Arc<RecordingInvalidator>) {
        let writer = Arc::new(RecordingWriter::default());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let queue = BatchQueue::builder()
            .writer(writer.clone())
            .invalidator(invalidator.clone() as Arc<dyn SegmentInvalidator>)
            .window(Duration::from_millis(10))
            .build()
            .unwrap();
        (queue, writer, invalidator)
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_coalesces_to_last_payload() {
        let (queue, writer, invalidator) = queue();
        let kind = "update_likes".to_string();

        let t1 = queue.enqueue(kind.clone(), "news_42".into(), 1);
        let t2 = queue.enqueue(kind.clone(), "news_42".into(), 5);
        let t3 = queue.enqueue(kind.clone(), "news_42".into(), 7);
        assert_eq!(queue.pending_len(&kind), 1);

        t1.await.unwrap();
        t2.await.unwrap();
        t3.await.unwrap();
        // Let the timer task finish the write after releasing the tickets.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let calls = writer.calls.lock().clone();
        assert_eq!(calls, vec![(kind.clone(), vec![("news_42".to_string(), 7)])]);
        assert_eq!(invalidator.dropped.lock().clone(), vec!["news".to_string()]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_keeps_first_enqueue_order() {
        let (queue, writer, _) = queue();
        let kind = "update_likes".to_string();

        let _ = queue.enqueue(kind.clone(), "a".into(), 1);
        let _ = queue.enqueue(kind.clone(), "b".into(), 2);
        let _ = queue.enqueue(kind.clone(), "a".into(), 3);
        let _ = queue.enqueue(kind.clone(), "c".into(), 4);
        let _ = queue.enqueue(kind.clone(), "b".into(), -5);
        assert_eq!(queue.flush(&kind).await, 3);

        let calls = writer.calls.lock().clone();
        assert_eq!(
            calls,
            vec![(
                kind,
                vec![("a".to_string(), 3), ("b".to_string(), -5), ("c".to_string(), 4)]
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_have_separate_windows() {
        let (queue, writer, _) = queue();
        let likes = queue.enqueue("update_likes".into(), "1".into(), 1);
        let comments = queue.enqueue("update_comments".into(), "1".into(), 1);
        let other = queue.enqueue("update_likes".into(), "2".into(), -1);

        likes.await.unwrap();
        comments.await.unwrap();
        other.await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut calls = writer.calls.lock().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("update_comments".to_string(), vec![("1".to_string(), 1)]),
                ("update_likes".to_string(), vec![("1".to_string(), 1), ("2".to_string(), -1)]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_flush_opens_new_window() {
        let (queue, writer, _) = queue();
        let kind = "update_likes".to_string();

        queue.enqueue(kind.clone(), "a".into(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.pending_len(&kind), 0);

        queue.enqueue(kind.clone(), "a".into(), 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let calls = writer.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, vec![("a".to_string(), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_cancels_timer() {
        let (queue, writer, _) = queue();
        let kind = "update_likes".to_string();

        let ticket = queue.enqueue(kind.clone(), "a".into(), 1);
        assert_eq!(queue.flush(&kind).await, 1);
        ticket.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.calls.lock().len(), 1);
        assert_eq!(queue.flush(&kind).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_dropped() {
        let (queue, writer, invalidator) = queue();
        let kind = "update_likes".to_string();
        writer.failing.lock().insert(kind.clone());

        let _ = queue.enqueue(kind.clone(), "a".into(), 1);
        let _ = queue.enqueue(kind.clone(), "b".into(), 1);
        assert_eq!(queue.close().await, 2);

        let stats = queue.stats();
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.dropped_writes, 2);
        assert!(invalidator.dropped.lock().is_empty());
        assert_eq!(queue.pending_len(&kind), 0);

        // No retry happens later on.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.calls.lock().len(), 1);
    }
}
