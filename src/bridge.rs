//! Streaming bridge
//!
//! Turns a backend's generation into a cancellable stream of
//! [`Update`]s consumable by the single-threaded controller.
//!
//! Two construction paths share one consumer type:
//!
//! * [`UpdateStream::bridge`] runs a blocking token loop on a dedicated
//!   worker thread (one per in-flight generation, never pooled). The
//!   worker coalesces token fragments and flushes them into a bounded
//!   hand-off channel; the channel is the only thing the worker ever
//!   touches — session state stays on the controller.
//! * [`UpdateStream::pipe`] hands out a sender half for backends whose
//!   increments already arrive on the controller's async I/O (the
//!   networked case). No worker, no coalescing: identity pass-through.
//!
//! Closure of the hand-off channel is the end-of-stream marker and is
//! always reached — normal exit, cancellation, backend failure, and
//! worker panic all drop the sender after a final flush. Consumers must
//! read to the end ([`UpdateStream::next`] returning `None`, or
//! [`UpdateStream::drain`]); that is what guarantees the worker thread
//! is joined rather than leaked.

use crate::backend::BackendError;
use crate::session::Update;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Minimum spacing between two content flushes of one generation. The
/// final flush at loop exit is exempt.
pub const COALESCE_INTERVAL: Duration = Duration::from_millis(300);

/// Hand-off channel capacity. A slow consumer blocks the worker on
/// enqueue rather than dropping or reordering updates; in practice the
/// coalescing interval caps the enqueue rate well below this.
pub const CHANNEL_CAPACITY: usize = 32;

/// Consumer half of a generation's event stream.
///
/// Two states: `Running` while the channel is open, `Closed` once the
/// terminal `None` has been observed and any worker thread joined.
pub struct UpdateStream {
    rx: mpsc::Receiver<Update>,
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
    closed: bool,
}

impl UpdateStream {
    /// Pass-through stream for async backends. The returned sender
    /// shares this stream's stop flag so cancellation reaches the
    /// producing task.
    pub fn pipe() -> (UpdateSender, UpdateStream) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        (
            UpdateSender {
                tx,
                stop: Arc::clone(&stop),
            },
            UpdateStream {
                rx,
                stop,
                worker: None,
                closed: false,
            },
        )
    }

    /// Spawn a dedicated worker thread running `work` with exclusive
    /// ownership of the backend's blocking token loop.
    ///
    /// When `work` returns the buffered tail is flushed; when it
    /// returns an error, or panics, the partial content is flushed and
    /// a single terminal error update is emitted. In every case the
    /// sender is then dropped, closing the stream.
    pub fn bridge<F>(work: F) -> UpdateStream
    where
        F: FnOnce(&mut Worker) -> Result<(), BackendError> + Send + 'static,
    {
        Self::bridge_with_interval(COALESCE_INTERVAL, work)
    }

    /// Test seam: same as [`UpdateStream::bridge`] with a custom
    /// coalescing interval.
    pub(crate) fn bridge_with_interval<F>(interval: Duration, work: F) -> UpdateStream
    where
        F: FnOnce(&mut Worker) -> Result<(), BackendError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                tx,
                stop: worker_stop,
                buffer: String::new(),
                last_flush: Instant::now(),
                interval,
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut worker)));
            match outcome {
                Ok(Ok(())) => {
                    let _ = worker.flush();
                }
                Ok(Err(err)) => {
                    // Keep whatever was generated, then surface the
                    // failure as a normal error turn.
                    let _ = worker.flush();
                    let _ = worker.send_raw(Update::error(err.to_string()));
                }
                Err(payload) => {
                    let description = panic_message(payload.as_ref());
                    tracing::error!(error = %description, "generation worker panicked");
                    let _ = worker.flush();
                    let _ = worker.send_raw(Update::error(format!(
                        "generation failed: {description}"
                    )));
                }
            }
            // Worker drops here, dropping the sender: end of stream.
        });

        UpdateStream {
            rx,
            stop,
            worker: Some(handle),
            closed: false,
        }
    }

    /// Next update, in strict production order. Returns `None` exactly
    /// once the stream has closed; at that point any worker thread has
    /// been joined.
    pub async fn next(&mut self) -> Option<Update> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(update) => Some(update),
            None => {
                self.closed = true;
                if let Some(handle) = self.worker.take() {
                    // The sender is already dropped, so the thread is
                    // past its loop; this join does not block on
                    // generation.
                    if handle.join().is_err() {
                        tracing::error!("generation worker thread poisoned on join");
                    }
                }
                None
            }
        }
    }

    /// Request cooperative cancellation. The producer observes the flag
    /// once per generated unit; at most one additional unit of work may
    /// complete after this call. The stream must still be consumed to
    /// closure afterwards.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Consume and discard the remainder of the stream, joining any
    /// worker thread.
    pub async fn drain(&mut self) {
        while self.next().await.is_some() {}
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        // Dropping the receiver unblocks a worker stuck on enqueue; the
        // stop flag makes it exit at the next token. Detach rather than
        // block the controller on join.
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Sender half of a pass-through stream.
#[derive(Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<Update>,
    stop: Arc<AtomicBool>,
}

impl UpdateSender {
    /// Send one update. Returns `false` when the consumer is gone and
    /// the producer should stop.
    pub async fn send(&self, update: Update) -> bool {
        self.tx.send(update).await.is_ok()
    }

    /// Whether cancellation has been requested by the consumer.
    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Worker-side handle: coalescing accumulator plus the stop flag.
///
/// Owned by the generation loop on its dedicated thread. Content
/// fragments pushed here are batched per [`COALESCE_INTERVAL`];
/// non-content updates flush the buffer first so delivery order always
/// matches production order.
pub struct Worker {
    tx: mpsc::Sender<Update>,
    stop: Arc<AtomicBool>,
    buffer: String,
    last_flush: Instant,
    interval: Duration,
}

/// The consumer hung up; the worker should unwind its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeClosed;

impl From<BridgeClosed> for BackendError {
    fn from(_: BridgeClosed) -> Self {
        BackendError::worker("update channel closed")
    }
}

impl Worker {
    /// Observed once per generated token by the blocking loop.
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Accumulate a content fragment, flushing when the buffer is
    /// non-empty and the coalescing interval has elapsed.
    pub fn push(&mut self, fragment: &str) -> Result<(), BridgeClosed> {
        self.buffer.push_str(fragment);
        if !self.buffer.is_empty() && self.last_flush.elapsed() >= self.interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Send a non-content update (role, finish reason), flushing any
    /// buffered content first to preserve ordering.
    pub fn send(&mut self, update: Update) -> Result<(), BridgeClosed> {
        self.flush()?;
        self.send_raw(update)
    }

    /// Flush buffered content unconditionally. Called by the bridge at
    /// loop exit so no trailing content is ever lost.
    fn flush(&mut self) -> Result<(), BridgeClosed> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let content = std::mem::take(&mut self.buffer);
        self.send_raw(Update::content(content))?;
        self.last_flush = Instant::now();
        Ok(())
    }

    fn send_raw(&self, update: Update) -> Result<(), BridgeClosed> {
        // Bounded blocking enqueue: backpressure, never loss.
        self.tx.blocking_send(update).map_err(|_| BridgeClosed)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use proptest::prelude::*;

    async fn collect(mut stream: UpdateStream) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Some(update) = stream.next().await {
            updates.push(update);
        }
        assert!(stream.is_closed());
        updates
    }

    fn concat_content(updates: &[Update]) -> String {
        updates
            .iter()
            .filter_map(|u| u.content.as_deref())
            .collect()
    }

    #[tokio::test]
    async fn delivers_all_content_in_order() {
        let stream = UpdateStream::bridge_with_interval(Duration::ZERO, |worker| {
            worker.send(Update::role(Role::Assistant))?;
            for fragment in ["He", "llo", ", ", "world"] {
                worker.push(fragment)?;
            }
            Ok(())
        });

        let updates = collect(stream).await;
        assert_eq!(updates[0].role, Some(Role::Assistant));
        assert_eq!(concat_content(&updates), "Hello, world");
    }

    #[tokio::test]
    async fn trailing_content_flushed_under_interval() {
        // Long interval: nothing qualifies for a timed flush, so the
        // content must arrive via the unconditional flush at exit.
        let stream = UpdateStream::bridge_with_interval(Duration::from_secs(60), |worker| {
            worker.push("tail")?;
            Ok(())
        });

        let updates = collect(stream).await;
        assert_eq!(concat_content(&updates), "tail");
    }

    #[tokio::test]
    async fn coalesces_fragments_within_interval() {
        let stream = UpdateStream::bridge_with_interval(Duration::from_millis(100), |worker| {
            for _ in 0..200 {
                worker.push("x")?;
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });

        let updates = collect(stream).await;
        let content_updates = updates.iter().filter(|u| u.content.is_some()).count();
        // 200 one-millisecond tokens over a 100ms window: far fewer
        // flushes than tokens, and nothing lost.
        assert!(
            content_updates < 30,
            "expected coalescing, got {content_updates} flushes"
        );
        assert_eq!(concat_content(&updates), "x".repeat(200));
    }

    #[test]
    fn closed_bridge_maps_to_worker_error() {
        let err = BackendError::from(BridgeClosed);
        assert_eq!(err.kind, crate::backend::BackendErrorKind::Worker);
    }

    #[tokio::test]
    async fn flushes_are_spaced_by_at_least_the_interval() {
        let interval = Duration::from_millis(100);
        let mut stream = UpdateStream::bridge_with_interval(interval, |worker| {
            for _ in 0..150 {
                worker.push("x")?;
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });

        let mut arrivals = Vec::new();
        while let Some(update) = stream.next().await {
            if update.content.is_some() {
                arrivals.push(Instant::now());
            }
        }
        assert!(
            arrivals.len() >= 3,
            "expected several flushes, got {}",
            arrivals.len()
        );
        // The final flush is exempt from spacing; scheduling can also
        // deliver an update slightly early, hence the tolerance.
        let tolerance = Duration::from_millis(40);
        for pair in arrivals[..arrivals.len() - 1].windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap + tolerance >= interval,
                "flushes {gap:?} apart with a {interval:?} interval"
            );
        }
    }

    #[tokio::test]
    async fn worker_error_becomes_single_terminal_error_update() {
        let stream = UpdateStream::bridge_with_interval(Duration::from_secs(60), |worker| {
            worker.push("partial")?;
            Err(BackendError::network("connection reset"))
        });

        let updates = collect(stream).await;
        // Partial content is kept, then exactly one error update.
        assert_eq!(updates[0].content.as_deref(), Some("partial"));
        let errors: Vec<_> = updates
            .iter()
            .filter(|u| u.role == Some(Role::Error))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_terminal());
    }

    #[tokio::test]
    async fn worker_panic_is_contained() {
        let stream = UpdateStream::bridge(|_worker| panic!("tokenizer exploded"));

        let updates = collect(stream).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].role, Some(Role::Error));
        assert!(updates[0]
            .content
            .as_deref()
            .unwrap()
            .contains("tokenizer exploded"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_promptly() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let stream = UpdateStream::bridge_with_interval(Duration::from_secs(60), move |worker| {
            started_tx.send(()).unwrap();
            let mut produced = 0u32;
            while !worker.stopped() {
                worker.push("t")?;
                produced += 1;
                assert!(produced < 1_000_000, "stop flag never observed");
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });

        started_rx.recv().unwrap();
        stream.cancel();
        let updates = collect(stream).await;
        // The worker exited, flushed its buffer, and closed the stream.
        assert!(!concat_content(&updates).is_empty());
    }

    #[tokio::test]
    async fn backpressure_blocks_instead_of_dropping() {
        // Zero interval so every token is its own enqueue, overflowing
        // the channel capacity many times over while the consumer lags.
        let total = CHANNEL_CAPACITY * 8;
        let stream = UpdateStream::bridge_with_interval(Duration::ZERO, move |worker| {
            for i in 0..total {
                worker.push(&format!("{i},"))?;
            }
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let updates = collect(stream).await;
        let joined = concat_content(&updates);
        let expected: String = (0..total).map(|i| format!("{i},")).collect();
        assert_eq!(joined, expected);
    }

    #[tokio::test]
    async fn pipe_passes_updates_through_unmodified() {
        let (tx, stream) = UpdateStream::pipe();
        tokio::spawn(async move {
            tx.send(Update::role(Role::Assistant)).await;
            tx.send(Update::content("hi")).await;
            tx.send(Update::finish("stop")).await;
        });

        let updates = collect(stream).await;
        assert_eq!(
            updates,
            vec![
                Update::role(Role::Assistant),
                Update::content("hi"),
                Update::finish("stop"),
            ]
        );
    }

    #[tokio::test]
    async fn pipe_sender_observes_cancellation() {
        let (tx, stream) = UpdateStream::pipe();
        assert!(!tx.is_cancelled());
        stream.cancel();
        assert!(tx.is_cancelled());
    }

    proptest! {
        // Concatenating every non-empty content delta in delivery order
        // yields exactly the generated text: no loss, no duplication,
        // no reordering, for any fragmentation of the input.
        #[test]
        fn concatenation_is_exact(fragments in proptest::collection::vec(".{0,8}", 0..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let expected: String = fragments.concat();
                let stream = UpdateStream::bridge_with_interval(Duration::ZERO, move |worker| {
                    for fragment in &fragments {
                        worker.push(fragment)?;
                    }
                    Ok(())
                });
                let updates = collect(stream).await;
                prop_assert_eq!(concat_content(&updates), expected);
                Ok(())
            })?;
        }
    }
}
