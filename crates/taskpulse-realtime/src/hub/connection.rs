//! Per-connection state and the bounded outgoing mailbox.
//!
//! Each connection owns a mailbox drained by a single writer task, which
//! preserves per-connection frame ordering. When the mailbox is full the
//! oldest droppable frame is shed; terminal and alert frames always stay.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use taskpulse_shared::types::{Channel, ServerFrame};

/// Result of offering a frame to a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame enqueued
    Queued,
    /// Frame enqueued after shedding an older droppable frame
    QueuedAfterDrop,
    /// The incoming frame itself was shed
    Dropped,
    /// Mailbox is closed; the connection is going away
    Closed,
}

/// Bounded frame queue between the hub and one writer task
#[derive(Debug)]
pub struct Mailbox {
    queue: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    limit: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            limit: limit.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    /// Offer a frame without blocking the broadcast path.
    pub fn push(&self, frame: ServerFrame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.len() < self.limit {
                queue.push_back(frame);
                PushOutcome::Queued
            } else if let Some(idx) = queue.iter().position(|f| f.payload.is_droppable()) {
                queue.remove(idx);
                queue.push_back(frame);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::QueuedAfterDrop
            } else if frame.payload.is_droppable() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            } else {
                // Queue full of undroppable frames: the bound yields so a
                // terminal frame is never lost
                queue.push_back(frame);
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Await the next frame; `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<ServerFrame> {
        loop {
            {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One live subscriber connection
#[derive(Debug)]
pub struct ClientConnection {
    pub client_id: String,
    pub mailbox: Arc<Mailbox>,
    pub subscribed_tasks: HashSet<String>,
    pub subscribed_channels: HashSet<Channel>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub authenticated: bool,
    pub user_id: Option<String>,
    /// One-way transports (SSE) cannot ping; the heartbeat sweep skips them
    /// and their transport tears them down on stream close instead.
    pub one_way: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl ClientConnection {
    pub fn new(
        client_id: String,
        mailbox: Arc<Mailbox>,
        authenticated: bool,
        user_id: Option<String>,
        one_way: bool,
    ) -> Self {
        Self {
            client_id,
            mailbox,
            subscribed_tasks: HashSet::new(),
            subscribed_channels: HashSet::new(),
            connected_at: Utc::now(),
            last_heartbeat: Instant::now(),
            authenticated,
            user_id,
            one_way,
            messages_sent: 0,
            messages_received: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use taskpulse_shared::types::{ServerPayload, TaskProgressData, TaskStatus};

    fn progress_frame(task_id: &str) -> ServerFrame {
        ServerFrame::new(ServerPayload::ProgressUpdate(TaskProgressData {
            task_id: task_id.into(),
            status: TaskStatus::Running,
            progress: 1.0,
            current_stage: "downloading".into(),
            eta_seconds: None,
            average_speed_bps: 0.0,
            peak_speed_bps: 0.0,
            stages: BTreeMap::new(),
            updated_stage: None,
            stage_details: None,
        }))
    }

    fn terminal_frame(task_id: &str) -> ServerFrame {
        ServerFrame::new(ServerPayload::TaskComplete {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            total_duration_seconds: None,
            final_progress: 100.0,
            stages_completed: 1,
        })
    }

    #[tokio::test]
    async fn test_push_then_recv_in_order() {
        let mailbox = Mailbox::new(10);
        mailbox.push(progress_frame("a"));
        mailbox.push(progress_frame("b"));

        let first = mailbox.recv().await.unwrap();
        let second = mailbox.recv().await.unwrap();
        match (&first.payload, &second.payload) {
            (ServerPayload::ProgressUpdate(a), ServerPayload::ProgressUpdate(b)) => {
                assert_eq!(a.task_id, "a");
                assert_eq!(b.task_id, "b");
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overflow_sheds_oldest_droppable() {
        let mailbox = Mailbox::new(2);
        mailbox.push(progress_frame("old"));
        mailbox.push(progress_frame("mid"));
        let outcome = mailbox.push(progress_frame("new"));
        assert_eq!(outcome, PushOutcome::QueuedAfterDrop);
        assert_eq!(mailbox.dropped_count(), 1);

        // "old" was shed
        let first = mailbox.recv().await.unwrap();
        match &first.payload {
            ServerPayload::ProgressUpdate(d) => assert_eq!(d.task_id, "mid"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_frames_survive_overflow() {
        let mailbox = Mailbox::new(1);
        mailbox.push(terminal_frame("t"));
        // Queue full of undroppable frames: terminal still enqueued
        let outcome = mailbox.push(terminal_frame("t2"));
        assert_eq!(outcome, PushOutcome::Queued);
        assert_eq!(mailbox.len(), 2);

        // A droppable frame against a full undroppable queue is shed instead
        let outcome = mailbox.push(progress_frame("p"));
        assert_eq!(outcome, PushOutcome::Dropped);
        assert_eq!(mailbox.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let mailbox = Mailbox::new(10);
        mailbox.push(progress_frame("a"));
        mailbox.close();

        assert!(mailbox.recv().await.is_some());
        assert!(mailbox.recv().await.is_none());
        assert_eq!(mailbox.push(progress_frame("b")), PushOutcome::Closed);
    }
}
