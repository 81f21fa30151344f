//! Frame broadcast hub
//!
//! One dedicated task per session reads the native screencast feed and
//! fans each frame out to every attached viewer channel, pruning
//! subscribers whose delivery fails. The feed is acknowledged once per
//! frame, immediately after the dispatch pass, so at most one
//! un-acknowledged frame is ever in flight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use browsercast_common::Frame;

use crate::browser::ScreencastFeed;
use crate::config::StreamConfig;

/// What a viewer receives over its subscription channel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Frame),
    /// Terminal event; the session is going away
    Ended { reason: String },
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

/// Per-session frame fan-out state
pub struct FrameHub {
    session_id: String,
    subscribers: Mutex<Vec<Subscriber>>,
    frame_counter: AtomicU64,
    next_subscriber: AtomicU64,
    capture_started: AtomicBool,
    send_timeout: Duration,
    channel_capacity: usize,
}

impl FrameHub {
    pub fn new(session_id: impl Into<String>, stream: &StreamConfig) -> Self {
        Self {
            session_id: session_id.into(),
            subscribers: Mutex::new(Vec::new()),
            frame_counter: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            capture_started: AtomicBool::new(false),
            send_timeout: Duration::from_millis(stream.send_timeout_ms),
            channel_capacity: stream.channel_capacity.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Frames emitted so far; monotonic, never reset
    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Flip the capture flag; true exactly once, for the caller that
    /// must start the screencast as a side effect of the first attach.
    pub fn claim_capture_start(&self) -> bool {
        !self.capture_started.swap(true, Ordering::SeqCst)
    }

    pub fn capture_started(&self) -> bool {
        self.capture_started.load(Ordering::SeqCst)
    }

    /// Undo a claim after a failed capture start so a later attach can
    /// retry.
    pub fn release_capture_claim(&self) {
        self.capture_started.store(false, Ordering::SeqCst);
    }

    /// Attach a viewer. Frames from this point on are delivered in
    /// capture order, gap-free, until the subscriber fails or detaches.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<StreamEvent>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers.lock().push(Subscriber { id, tx });
        debug!("subscriber {} attached to session {}", id, self.session_id);
        (id, rx)
    }

    /// Detach a viewer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
        debug!("subscriber {} detached from session {}", id, self.session_id);
    }

    /// Stamp and deliver one frame to every subscriber. A subscriber
    /// whose channel is closed, or that cannot accept the frame within
    /// the send timeout, is removed for this and all future frames.
    /// Returns the frame number assigned.
    pub async fn broadcast(&self, data: String) -> u64 {
        let number = self.frame_counter.fetch_add(1, Ordering::SeqCst);
        let frame = Frame {
            session_id: self.session_id.clone(),
            frame_number: number,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Snapshot under the lock, deliver outside it; delivery can
        // suspend on the send timeout.
        let targets: Vec<(u64, mpsc::Sender<StreamEvent>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(StreamEvent::Frame(frame.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    match timeout(self.send_timeout, tx.send(event)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            warn!(
                                "subscriber {} of session {} stalled, dropping",
                                id, self.session_id
                            );
                            dead.push(id);
                        }
                    }
                }
            }
        }

        if !dead.is_empty() {
            self.subscribers.lock().retain(|s| !dead.contains(&s.id));
        }

        trace!("frame {} of session {} broadcast", number, self.session_id);
        number
    }

    /// Notify every remaining subscriber that the session is over, then
    /// clear the set.
    pub fn shutdown(&self, reason: &str) {
        let mut subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            let _ = subscriber.tx.try_send(StreamEvent::Ended {
                reason: reason.to_string(),
            });
        }
        subscribers.clear();
    }
}

/// Body of the per-session broadcast task: pull frames off the native
/// feed, fan out, optionally persist, acknowledge. Runs until the feed
/// ends or the task is cancelled by session stop.
pub async fn run_capture(hub: Arc<FrameHub>, mut feed: ScreencastFeed, recording: Option<PathBuf>) {
    while let Some(event) = feed.next().await {
        let data: String = event.data.clone().into();
        let number = hub.broadcast(data.clone()).await;

        if let Some(dir) = &recording {
            match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => {
                    let path = dir.join(format!("frame-{number:08}.jpg"));
                    if let Err(e) = tokio::fs::write(&path, &bytes).await {
                        warn!("recording write failed for {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("undecodable frame {} dropped from recording: {}", number, e),
            }
        }

        feed.ack(event.session_id).await;
    }
    debug!("screencast feed ended for session {}", hub.session_id());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> FrameHub {
        FrameHub::new("s1", &StreamConfig::default())
    }

    #[tokio::test]
    async fn frames_are_numbered_and_gap_free() {
        let hub = hub();
        let (_id, mut rx) = hub.subscribe();

        for _ in 0..3 {
            hub.broadcast("aGk=".to_string()).await;
        }

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                StreamEvent::Frame(frame) => {
                    assert_eq!(frame.frame_number, expected);
                    assert_eq!(frame.session_id, "s1");
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(hub.frame_count(), 3);
    }

    #[tokio::test]
    async fn late_joiner_starts_at_current_number() {
        let hub = hub();
        hub.broadcast("YQ==".to_string()).await;
        hub.broadcast("YQ==".to_string()).await;

        let (_id, mut rx) = hub.subscribe();
        hub.broadcast("YQ==".to_string()).await;

        match rx.recv().await.unwrap() {
            StreamEvent::Frame(frame) => assert_eq!(frame.frame_number, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let hub = hub();
        let (_a, rx_a) = hub.subscribe();
        let (_b, mut rx_b) = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx_a);
        hub.broadcast("YQ==".to_string()).await;

        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            StreamEvent::Frame(_)
        ));
    }

    #[tokio::test]
    async fn stalled_subscriber_is_dropped_after_timeout() {
        let mut config = StreamConfig::default();
        config.channel_capacity = 1;
        config.send_timeout_ms = 50;
        let hub = FrameHub::new("s1", &config);

        // Never consumed; the second frame fills nothing and must expire.
        let (_id, _rx) = hub.subscribe();
        hub.broadcast("YQ==".to_string()).await;
        hub.broadcast("YQ==".to_string()).await;

        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn other_subscribers_survive_a_dead_peer() {
        let hub = hub();
        let (_a, rx_a) = hub.subscribe();
        let (_b, mut rx_b) = hub.subscribe();
        drop(rx_a);

        for _ in 0..2 {
            hub.broadcast("YQ==".to_string()).await;
        }

        for expected in 0..2 {
            match rx_b.recv().await.unwrap() {
                StreamEvent::Frame(frame) => assert_eq!(frame.frame_number, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_notifies_then_clears() {
        let hub = hub();
        let (_id, mut rx) = hub.subscribe();

        hub.shutdown("session stopped");
        assert_eq!(hub.subscriber_count(), 0);

        match rx.recv().await.unwrap() {
            StreamEvent::Ended { reason } => assert_eq!(reason, "session stopped"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn capture_start_is_claimed_once() {
        let hub = hub();
        assert!(!hub.capture_started());
        assert!(hub.claim_capture_start());
        assert!(!hub.claim_capture_start());
        assert!(hub.capture_started());
    }

    #[tokio::test]
    async fn unsubscribe_detaches_only_the_given_viewer() {
        let hub = hub();
        let (a, _rx_a) = hub.subscribe();
        let (_b, _rx_b) = hub.subscribe();

        hub.unsubscribe(a);
        assert_eq!(hub.subscriber_count(), 1);
    }
}
