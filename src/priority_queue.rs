use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

use crate::model::{Priority, Request};

/// Anything the queue can order: a priority class and a unique id for
/// removal.
pub trait Queued {
    fn priority(&self) -> Priority;
    fn request_id(&self) -> &str;
}

impl Queued for Request {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Receipt for an accepted enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub request_id: String,
    pub priority: Priority,
    /// Items ahead of this one in its own class at enqueue time.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("queue full for {priority} priority (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },
    #[error("queue closed")]
    Closed,
}

struct Lanes<T> {
    lanes: [VecDeque<T>; 3],
    closed: bool,
}

/// Three bounded FIFO lanes consulted in fixed precedence order.
///
/// Many producers, one consumer. `enqueue` never blocks; a full lane rejects.
/// Arrival order within a lane is submission order, so FIFO by arrival is
/// FIFO by `submitted_at`.
pub struct PriorityQueue<T> {
    state: Mutex<Lanes<T>>,
    capacity_per_class: usize,
    notify: Notify,
}

impl<T: Queued> PriorityQueue<T> {
    pub fn new(capacity_per_class: usize) -> Self {
        Self {
            state: Mutex::new(Lanes {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                closed: false,
            }),
            capacity_per_class: capacity_per_class.max(1),
            notify: Notify::new(),
        }
    }

    pub fn capacity_per_class(&self) -> usize {
        self.capacity_per_class
    }

    pub fn enqueue(&self, item: T) -> Result<Ticket, Rejected> {
        let priority = item.priority();
        let ticket = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejected::Closed);
            }
            let lane = &mut state.lanes[priority.index()];
            if lane.len() >= self.capacity_per_class {
                return Err(Rejected::QueueFull {
                    priority,
                    capacity: self.capacity_per_class,
                });
            }
            let ticket = Ticket {
                request_id: item.request_id().to_string(),
                priority,
                position: lane.len(),
            };
            lane.push_back(item);
            ticket
        };
        self.notify.notify_one();
        Ok(ticket)
    }

    /// Oldest High item, else oldest Medium, else oldest Low.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        state.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// drained. Intended for a single consumer loop.
    pub async fn next(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.lanes.iter_mut().find_map(VecDeque::pop_front) {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Pulls a still-queued item out, e.g. on caller cancellation.
    pub fn remove(&self, request_id: &str) -> Option<T> {
        let mut state = self.state.lock();
        for lane in state.lanes.iter_mut() {
            if let Some(idx) = lane.iter().position(|item| item.request_id() == request_id) {
                return lane.remove(idx);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.state.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.state.lock().lanes[priority.index()].len()
    }

    /// Stops accepting items and wakes the consumer. Returns what was queued.
    pub fn close(&self) -> Vec<T> {
        let mut drained = Vec::new();
        {
            let mut state = self.state.lock();
            state.closed = true;
            for lane in state.lanes.iter_mut() {
                drained.extend(lane.drain(..));
            }
        }
        self.notify.notify_one();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
