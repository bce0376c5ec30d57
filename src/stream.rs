//! Single-producer/single-consumer queued event stream (§4.2).
//!
//! Every provider adapter builds one of these to hand events to the agent
//! loop. The queue is unbounded FIFO: producers (the SSE/body reader task)
//! never block on a slow consumer. A stopped consumer (the `Receiver` half
//! dropped) is observed by the producer the next time it tries to `push`,
//! which is the signal to abort the upstream request.
//!
//! At most one terminal event (`end` or `error`) is ever delivered; pushes
//! after the first terminal event are silently discarded, matching §4.2's
//! "the stream emits at most one terminal event" rule.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Producer handle for a [`QueuedStream`]. Cheap to clone; every clone shares
/// the same underlying channel and terminal-state flag.
#[derive(Clone)]
pub struct QueuedSender<T> {
    tx: mpsc::UnboundedSender<T>,
    ended: Arc<AtomicBool>,
}

impl<T> QueuedSender<T> {
    /// Pushes one event. No-op once the stream has ended (terminal event
    /// already sent, or the consumer has dropped the receiver).
    pub fn push(&self, event: T) {
        if self.ended.load(Ordering::Acquire) {
            return;
        }
        // An error here means the receiver was dropped; that is exactly the
        // "consumer stopped" signal callers use to decide whether to abort
        // the upstream request, so we swallow it rather than panic.
        let _ = self.tx.send(event);
    }

    /// True once a terminal event has been pushed or the receiver is gone.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// Consumer half of a [`QueuedStream`]; implements [`Stream`].
pub struct QueuedStream<T> {
    inner: UnboundedReceiverStream<T>,
}

impl<T> Stream for QueuedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Creates a fresh queued stream pair.
pub fn channel<T>() -> (QueuedSender<T>, QueuedStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = QueuedSender {
        tx,
        ended: Arc::new(AtomicBool::new(false)),
    };
    let stream = QueuedStream {
        inner: UnboundedReceiverStream::new(rx),
    };
    (sender, stream)
}

/// Helper for producers that model `push`/`end`/`error` as three distinct
/// calls rather than pushing a pre-built terminal variant directly. Generic
/// over the terminal shape so both the provider-adapter event enum and any
/// future queued-stream use can share this without duplicating the
/// one-terminal-event bookkeeping.
impl<T> QueuedSender<T> {
    /// Pushes a final event and marks the stream ended; subsequent pushes
    /// (from this or any cloned sender) become no-ops.
    pub fn end_with(&self, terminal: T) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_fifo_ordering() {
        let (tx, mut rx) = channel::<i32>();
        tx.push(1);
        tx.push(2);
        tx.end_with(3);
        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.next().await, Some(2));
        assert_eq!(rx.next().await, Some(3));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_pushes_after_terminal_are_discarded() {
        let (tx, mut rx) = channel::<i32>();
        tx.end_with(1);
        tx.push(2);
        tx.push(3);
        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_receiver_marks_sender_ended() {
        let (tx, rx) = channel::<i32>();
        drop(rx);
        tx.push(1);
        assert!(tx.is_ended());
    }

    #[test]
    fn test_clone_shares_terminal_state() {
        let (tx, _rx) = channel::<i32>();
        let tx2 = tx.clone();
        tx.end_with(1);
        assert!(tx2.is_ended());
    }
}
