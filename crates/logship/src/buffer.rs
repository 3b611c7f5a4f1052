// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered, batching delivery pipeline over any [`Sink`].
//!
//! This module is the delivery engine: it owns the in-memory queue, decides
//! when to flush, drives retries with exponential backoff, and tracks
//! sent/dropped/buffered counters.
//!
//! # Architecture
//!
//! ```text
//!   Producers (write / write_batch)
//!        │
//!        v
//!   ┌──────────────┐
//!   │    Queue     │ (mutex-guarded, bounded by buffer_size)
//!   └──────┬───────┘
//!          │ size threshold / timer / explicit flush / shutdown
//!          v
//!   ┌──────────────┐
//!   │   Batches    │ (≤ max_batch_size entries each)
//!   └──────┬───────┘
//!          │ bounded retry, exponential backoff
//!          v
//!   ┌──────────────┐
//!   │  Transport   │ (HTTP / Loki / custom)
//!   └──────────────┘
//! ```
//!
//! # Locking
//!
//! One mutex guards the queue and counters, held only for in-memory slice
//! manipulation: a flush snapshots and clears the queue under the lock, then
//! delivers outside it, so writers are never blocked by slow or retrying
//! deliveries. The only blocking writers observe is the synchronous flush
//! forced by a full buffer or by reaching the batch-size threshold.
//!
//! Flush cycles themselves are serialized through an async lock so chunks
//! from separate triggers (timer, explicit call, threshold) cannot
//! interleave on the wire.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::entry::LogEntry;
use crate::sink::{Sink, SinkError};

/// Pipeline counters, snapshotted consistently under the queue lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkStats {
    /// Entries delivered to the transport.
    pub sent: u64,
    /// Entries discarded by the overflow or terminal-failure policy.
    pub dropped: u64,
    /// Entries currently resident in the queue.
    pub buffered: u64,
}

#[derive(Default)]
struct BufferState {
    queue: Vec<LogEntry>,
    sent: u64,
    dropped: u64,
}

struct Inner {
    sink: Arc<dyn Sink>,
    config: Config,
    state: Mutex<BufferState>,
    /// Serializes flush cycles; never taken by plain writes.
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Wraps a [`Sink`] with buffering, batching, and retrying delivery.
///
/// A pipeline instance owns its queue and background flush task for its
/// entire lifetime: create it once (inside a tokio runtime) around one
/// constructed transport, share it across writer tasks, and tear it down
/// exactly once via [`close`](BufferedSink::close), which performs a final
/// best-effort flush before closing the wrapped transport. `BufferedSink`
/// implements [`Sink`] itself, so it layers transparently over any backend.
pub struct BufferedSink {
    inner: Arc<Inner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    /// Creates the pipeline and starts its background flush task.
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, config: Config) -> Self {
        let inner = Arc::new(Inner {
            sink,
            config,
            state: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        let flusher = tokio::spawn(Inner::run_background_flusher(Arc::clone(&inner)));

        BufferedSink {
            inner,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Adds an entry to the queue.
    ///
    /// A full queue either drops the entry (counted, not an error) or forces
    /// a synchronous whole-queue flush first, per `drop_on_full`. Reaching
    /// `max_batch_size` resident entries flushes synchronously before
    /// returning; that flush's terminal failure is returned to the caller.
    pub async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
        self.inner.write(entry).await
    }

    /// Applies [`write`](BufferedSink::write) to each entry in order.
    ///
    /// Stops at the first error; entries before it were applied and the
    /// caller detects partial application through the returned error.
    pub async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        for entry in entries {
            self.inner.write(entry.clone()).await?;
        }
        Ok(())
    }

    /// Drains the whole queue and delivers it in batches.
    pub async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush_queue().await
    }

    /// Shuts the pipeline down: signals the background task, waits for its
    /// final flush, then closes the wrapped transport.
    ///
    /// Idempotent; a second call returns without touching the transport.
    #[allow(clippy::expect_used)]
    pub async fn close(&self) -> Result<(), SinkError> {
        let flusher = self.flusher.lock().expect("lock poisoned").take();
        let Some(flusher) = flusher else {
            return Ok(());
        };

        self.inner.shutdown.cancel();
        if flusher.await.is_err() {
            error!("background flusher task panicked during shutdown");
        }
        self.inner.sink.close().await
    }

    /// Consistent snapshot of the pipeline counters.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn stats(&self) -> SinkStats {
        let state = self.inner.state.lock().expect("lock poisoned");
        SinkStats {
            sent: state.sent,
            dropped: state.dropped,
            buffered: state.queue.len() as u64,
        }
    }

    /// Health of the wrapped transport.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.inner.sink.is_healthy()
    }

    /// Most recent error of the wrapped transport, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.sink.last_error()
    }
}

#[async_trait]
impl Sink for BufferedSink {
    async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
        self.inner.write(entry).await
    }

    async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        BufferedSink::write_batch(self, entries).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush_queue().await
    }

    async fn close(&self) -> Result<(), SinkError> {
        BufferedSink::close(self).await
    }

    fn is_healthy(&self) -> bool {
        BufferedSink::is_healthy(self)
    }

    fn last_error(&self) -> Option<String> {
        BufferedSink::last_error(self)
    }
}

#[allow(clippy::expect_used)]
impl Inner {
    async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
        let at_capacity = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.queue.len() >= self.config.buffer_size {
                if self.config.drop_on_full {
                    state.dropped += 1;
                    return Ok(());
                }
                true
            } else {
                false
            }
        };
        if at_capacity {
            self.flush_queue().await?;
        }

        let reached_batch_size = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.queue.push(entry);
            state.queue.len() >= self.config.max_batch_size
        };
        if reached_batch_size {
            self.flush_queue().await
        } else {
            Ok(())
        }
    }

    /// Snapshots and clears the queue, then delivers the snapshot in chunks
    /// of at most `max_batch_size`, in order.
    ///
    /// On a chunk's terminal failure the cycle stops: the failing chunk and
    /// every chunk after it are re-queued ahead of entries written in the
    /// meantime (or, with `drop_on_full`, counted as dropped). Undelivered
    /// entries are never silently discarded.
    async fn flush_queue(&self) -> Result<(), SinkError> {
        let _cycle = self.flush_lock.lock().await;

        let mut snapshot = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.queue.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut state.queue)
        };
        debug!("flushing {} buffered entries", snapshot.len());

        // a zero batch size would stall the loop
        let max_batch = self.config.max_batch_size.max(1);
        let mut start = 0;
        while start < snapshot.len() {
            let end = (start + max_batch).min(snapshot.len());
            match self.write_with_retry(&snapshot[start..end]).await {
                Ok(()) => {
                    let mut state = self.state.lock().expect("lock poisoned");
                    state.sent += (end - start) as u64;
                    start = end;
                }
                Err(e) => {
                    let undelivered = snapshot.split_off(start);
                    let mut state = self.state.lock().expect("lock poisoned");
                    if self.config.drop_on_full {
                        state.dropped += undelivered.len() as u64;
                    } else {
                        let newer = std::mem::take(&mut state.queue);
                        state.queue = undelivered;
                        state.queue.extend(newer);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Delivers one chunk with up to `max_retries` additional attempts.
    ///
    /// Each attempt is bounded by `write_timeout`. The backoff wait between
    /// attempts races the pipeline's shutdown signal, so retries terminate
    /// promptly on shutdown, surfacing the last delivery error. Dropping the
    /// future (caller cancellation) abandons the wait the same way.
    async fn write_with_retry(&self, batch: &[LogEntry]) -> Result<(), SinkError> {
        let mut backoff = self.config.retry_interval;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match timeout(self.config.write_timeout, self.sink.write_batch(batch)).await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => SinkError::Timeout(self.config.write_timeout),
            };

            if attempts > self.config.max_retries {
                return Err(err);
            }
            tokio::select! {
                () = sleep(backoff) => backoff *= 2,
                () = self.shutdown.cancelled() => return Err(err),
            }
        }
    }

    /// Periodic best-effort flushing until shutdown, then one final flush
    /// with a longer deadline.
    async fn run_background_flusher(inner: Arc<Inner>) {
        let mut ticker = interval(inner.config.flush_interval);
        // discard first tick, which is instantaneous
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = inner.flush_queue().await {
                        // best-effort path: observed through counters only
                        error!("periodic flush failed: {e}");
                    }
                }
                () = inner.shutdown.cancelled() => {
                    match timeout(inner.config.write_timeout * 2, inner.flush_queue()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("final flush failed: {e}"),
                        Err(_) => error!("final flush timed out"),
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry::Level;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::time::Duration;

    /// Scriptable in-memory sink recording delivery attempts.
    #[derive(Default)]
    struct MockSink {
        attempts: AtomicU64,
        close_calls: AtomicU64,
        /// Calls left to fail; -1 fails forever.
        failures_remaining: AtomicI64,
        delivered: Mutex<Vec<String>>,
    }

    impl MockSink {
        fn healthy() -> Arc<Self> {
            Arc::new(MockSink::default())
        }

        fn failing(calls: i64) -> Arc<Self> {
            let sink = MockSink::default();
            sink.failures_remaining.store(calls, Ordering::SeqCst);
            Arc::new(sink)
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }

        fn mock_error() -> SinkError {
            SinkError::Status {
                status: 500,
                status_text: "Internal Server Error".to_string(),
                body: "mock failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        async fn write(&self, entry: LogEntry) -> Result<(), SinkError> {
            self.write_batch(std::slice::from_ref(&entry)).await
        }

        async fn write_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining != 0 {
                if remaining > 0 {
                    self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(Self::mock_error());
            }
            self.delivered
                .lock()
                .unwrap()
                .extend(entries.iter().map(|e| e.message.clone()));
            Ok(())
        }

        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SinkError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            self.failures_remaining.load(Ordering::SeqCst) == 0
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    /// Long flush interval keeps the background task out of timing-sensitive
    /// tests; tiny retry interval keeps real-time tests fast.
    fn test_config() -> Config {
        Config {
            flush_interval: Duration::from_secs(3600),
            retry_interval: Duration::from_millis(1),
            ..Config::default()
        }
    }

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(Level::Info, message)
    }

    fn stats(sent: u64, dropped: u64, buffered: u64) -> SinkStats {
        SinkStats {
            sent,
            dropped,
            buffered,
        }
    }

    #[tokio::test]
    async fn test_buffered_count_tracks_writes() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(sink.clone(), test_config());

        for i in 0..5 {
            buffered.write(entry(&format!("m{i}"))).await.unwrap();
        }

        assert_eq!(buffered.stats(), stats(0, 0, 5));
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_reaching_max_batch_size_flushes_synchronously() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_batch_size: 5,
                ..test_config()
            },
        );

        for i in 0..5 {
            buffered.write(entry(&format!("m{i}"))).await.unwrap();
        }

        assert_eq!(buffered.stats(), stats(5, 0, 0));
        assert_eq!(sink.delivered(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_drop_on_full_discards_new_entries_without_blocking() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                buffer_size: 2,
                drop_on_full: true,
                ..test_config()
            },
        );

        for i in 0..4 {
            buffered.write(entry(&format!("m{i}"))).await.unwrap();
        }

        assert_eq!(buffered.stats(), stats(0, 2, 2));
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_flushes_synchronously_before_accepting() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                buffer_size: 2,
                ..test_config()
            },
        );

        for i in 0..3 {
            buffered.write(entry(&format!("m{i}"))).await.unwrap();
        }

        // the third write drained the full buffer first; nothing was lost
        assert_eq!(buffered.stats(), stats(2, 0, 1));
        assert_eq!(sink.delivered(), vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn test_twelve_writes_produce_two_automatic_batches() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                buffer_size: 10,
                max_batch_size: 5,
                ..test_config()
            },
        );

        for i in 0..12 {
            buffered.write(entry(&format!("m{i}"))).await.unwrap();
        }
        assert_eq!(buffered.stats(), stats(10, 0, 2));

        buffered.flush().await.unwrap();
        assert_eq!(buffered.stats(), stats(12, 0, 0));
        assert_eq!(sink.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_after_exponential_backoff() {
        let sink = MockSink::failing(-1);
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_retries: 3,
                retry_interval: Duration::from_secs(1),
                ..test_config()
            },
        );

        buffered.write(entry("doomed")).await.unwrap();

        let start = tokio::time::Instant::now();
        let result = buffered.flush().await;

        assert!(matches!(result, Err(SinkError::Status { status: 500, .. })));
        // 3 retries beyond the first attempt
        assert_eq!(sink.attempts(), 4);
        // backoff waits of 1s, 2s, 4s between attempts
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        // nothing dropped: the chunk went back onto the queue
        assert_eq!(buffered.stats(), stats(0, 0, 1));
    }

    #[tokio::test]
    async fn test_failed_chunks_are_requeued_in_order() {
        let sink = MockSink::failing(2);
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_batch_size: 2,
                max_retries: 0,
                ..test_config()
            },
        );

        buffered.write(entry("m0")).await.unwrap();
        // second write reaches the batch threshold; delivery fails once
        assert!(buffered.write(entry("m1")).await.is_err());
        assert_eq!(buffered.stats(), stats(0, 0, 2));

        // third write re-triggers the threshold; first chunk fails again and
        // the untried second chunk is re-queued along with it
        assert!(buffered.write(entry("m2")).await.is_err());
        assert_eq!(buffered.stats(), stats(0, 0, 3));

        // transport recovered: everything drains in the original order
        buffered.flush().await.unwrap();
        assert_eq!(buffered.stats(), stats(3, 0, 0));
        assert_eq!(sink.delivered(), vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_terminal_failure_preserves_untried_chunks() {
        let sink = MockSink::failing(-1);
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_batch_size: 2,
                max_retries: 0,
                ..test_config()
            },
        );

        // seed a three-entry queue directly so one flush sees two chunks
        buffered
            .inner
            .state
            .lock()
            .unwrap()
            .queue
            .extend([entry("m0"), entry("m1"), entry("m2")]);

        assert!(buffered.flush().await.is_err());
        // the first chunk failed; the cycle stopped without trying the second
        assert_eq!(sink.attempts(), 1);
        assert_eq!(buffered.stats(), stats(0, 0, 3));
    }

    #[tokio::test]
    async fn test_terminal_failure_with_drop_on_full_counts_all_undelivered() {
        let sink = MockSink::failing(-1);
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_batch_size: 2,
                max_retries: 0,
                drop_on_full: true,
                ..test_config()
            },
        );

        buffered
            .inner
            .state
            .lock()
            .unwrap()
            .queue
            .extend([entry("m0"), entry("m1"), entry("m2")]);

        assert!(buffered.flush().await.is_err());
        assert_eq!(sink.attempts(), 1);
        assert_eq!(buffered.stats(), stats(0, 3, 0));
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_a_noop() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(sink.clone(), test_config());

        buffered.flush().await.unwrap();
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_flushes_on_interval() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                flush_interval: Duration::from_secs(5),
                ..Config::default()
            },
        );

        buffered.write(entry("m0")).await.unwrap();
        buffered.write(entry("m1")).await.unwrap();
        assert_eq!(buffered.stats(), stats(0, 0, 2));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(buffered.stats(), stats(2, 0, 0));
        assert_eq!(sink.delivered(), vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn test_close_performs_final_flush() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(sink.clone(), test_config());

        buffered.write(entry("m0")).await.unwrap();
        buffered.write(entry("m1")).await.unwrap();

        buffered.close().await.unwrap();
        assert_eq!(buffered.stats(), stats(2, 0, 0));
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_twice_does_not_double_close_transport() {
        let sink = MockSink::healthy();
        let buffered = BufferedSink::new(sink.clone(), test_config());

        buffered.close().await.unwrap();
        buffered.close().await.unwrap();
        assert_eq!(sink.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_retry_backoff_promptly() {
        let sink = MockSink::failing(-1);
        let buffered = BufferedSink::new(
            sink.clone(),
            Config {
                max_retries: 3,
                // long enough that waiting it out would hang the test
                retry_interval: Duration::from_secs(3600),
                ..test_config()
            },
        );

        buffered.write(entry("m0")).await.unwrap();
        buffered.close().await.unwrap();

        // the final flush gave up after a single attempt instead of backing off
        assert_eq!(sink.attempts(), 1);
        assert_eq!(buffered.stats(), stats(0, 0, 1));
    }
}
