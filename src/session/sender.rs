//! # Result Sender
//!
//! Drains a session's output queue strictly in FIFO order and hands each event
//! to the transport through an `EventSink`.
//!
//! ## Exit conditions:
//! - the session raised `closing` and the queue is empty (pending events are
//!   flushed first)
//! - a final event was delivered after the worker signalled it is done
//! - a send failed; the failed event is not retried and the caller starts
//!   the session teardown

use crate::error::TransportError;
use crate::session::events::TranscriptEvent;
use crate::session::stats::SessionStats;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound side of a client connection.
pub trait EventSink: Send + Sync {
    fn send(&self, event: TranscriptEvent) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close the connection normally. Safe to call on an already closed peer.
    fn close(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SenderExit {
    /// Closing was signalled and every pending event was delivered
    Drained,
    FinalEventSent,
    TransportFailed(TransportError),
    /// Every producer is gone
    OutputClosed,
}

pub struct ResultSender {
    pub session_id: String,
    pub events: UnboundedReceiver<TranscriptEvent>,
    pub sink: Arc<dyn EventSink>,
    pub stats: Arc<SessionStats>,
    pub closing: CancellationToken,
    pub worker_done: CancellationToken,
}

impl ResultSender {
    pub async fn run(mut self) -> SenderExit {
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return SenderExit::OutputClosed;
                    };
                    let is_final = event.is_final();
                    if let Err(e) = self.deliver(event).await {
                        return SenderExit::TransportFailed(e);
                    }
                    if is_final && self.worker_done.is_cancelled() {
                        debug!(session_id = %self.session_id, "Final event delivered");
                        return SenderExit::FinalEventSent;
                    }
                }
                _ = self.closing.cancelled() => return self.drain().await,
            }
        }
    }

    async fn drain(&mut self) -> SenderExit {
        let mut flushed = 0usize;
        while let Ok(event) = self.events.try_recv() {
            if let Err(e) = self.deliver(event).await {
                return SenderExit::TransportFailed(e);
            }
            flushed += 1;
        }
        debug!(session_id = %self.session_id, flushed, "Output queue flushed on close");
        SenderExit::Drained
    }

    async fn deliver(&self, event: TranscriptEvent) -> Result<(), TransportError> {
        let kind = event.kind();
        match self.sink.send(event).await {
            Ok(()) => {
                self.stats.event_sent();
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.session_id, kind, "Failed to deliver event: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::SessionMeta;
    use crate::testing::RecordingSink;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn sender(
        sink: Arc<RecordingSink>,
    ) -> (
        ResultSender,
        mpsc::UnboundedSender<TranscriptEvent>,
        CancellationToken,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let worker_done = CancellationToken::new();
        let sender = ResultSender {
            session_id: "test".to_string(),
            events: rx,
            sink,
            stats: Arc::new(SessionStats::new(Instant::now())),
            closing: closing.clone(),
            worker_done: worker_done.clone(),
        };
        (sender, tx, closing, worker_done)
    }

    fn text(t: &str) -> TranscriptEvent {
        TranscriptEvent::transcription(&SessionMeta::default(), t.to_string(), "en".to_string())
    }

    #[tokio::test]
    async fn test_closing_flushes_pending_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (sender, tx, closing, _) = sender(Arc::clone(&sink));

        for t in ["one", "two", "three"] {
            tx.send(text(t)).unwrap();
        }
        closing.cancel();

        assert_eq!(sender.run().await, SenderExit::Drained);
        assert_eq!(sink.transcripts(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_exits_after_final_event_from_finished_worker() {
        let sink = Arc::new(RecordingSink::default());
        let (sender, tx, _, worker_done) = sender(Arc::clone(&sink));

        tx.send(text("last words")).unwrap();
        worker_done.cancel();
        tx.send(TranscriptEvent::final_status(&SessionMeta::default(), "done")).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(1), sender.run())
            .await
            .unwrap();
        assert_eq!(exit, SenderExit::FinalEventSent);
        assert_eq!(sink.events().len(), 2);
        // tx is still alive, so the exit came from the final event
        drop(tx);
    }

    #[tokio::test]
    async fn test_send_failure_stops_immediately() {
        let sink = Arc::new(RecordingSink::default());
        sink.set_failing(true);
        let (sender, tx, _, _) = sender(Arc::clone(&sink));

        tx.send(text("lost")).unwrap();
        tx.send(text("never tried")).unwrap();

        assert_eq!(
            sender.run().await,
            SenderExit::TransportFailed(TransportError::Closed)
        );
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_output_closed_when_producers_gone() {
        let sink = Arc::new(RecordingSink::default());
        let (sender, tx, _, _) = sender(Arc::clone(&sink));
        tx.send(text("only")).unwrap();
        drop(tx);

        assert_eq!(sender.run().await, SenderExit::OutputClosed);
        assert_eq!(sink.transcripts(), vec!["only"]);
    }
}
