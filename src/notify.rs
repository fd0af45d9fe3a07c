//! Single-process fan-out of task events to connected subscribers.
//!
//! New subscribers first receive a bounded replay of recent events (oldest
//! evicted first), then every subsequent broadcast in send order. Subscribers
//! whose channel has gone away are pruned on the next broadcast.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::TaskStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum TaskEvent {
    Queued {
        task_id: String,
        user_id: String,
    },
    Started {
        task_id: String,
    },
    Finished {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
    },
}

struct HubInner {
    ring: VecDeque<TaskEvent>,
    subscribers: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

pub struct NotificationHub {
    capacity: usize,
    inner: Mutex<HubInner>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HubInner {
                ring: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register a subscriber. The returned receiver yields the replay buffer
    /// first, then live events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for event in &inner.ring {
            // A closed receiver never registers.
            if tx.send(event.clone()).is_err() {
                return rx;
            }
        }
        inner.subscribers.push(tx);
        rx
    }

    pub fn broadcast(&self, event: TaskEvent) {
        let mut inner = self.inner.lock();

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        // Send to a snapshot and keep only the senders that are still open.
        inner
            .subscribers
            .retain(|sub| sub.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
