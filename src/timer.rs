//! # Pending-Response Timer
//!
//! Correlates outgoing requests with the responses they attract. Each
//! registered task holds a callback, the number of responses it expects
//! (one for direct sends, the close-group size for group sends) and a
//! deadline. The callback fires exactly once per task:
//!
//! - immediately, once the expected number of responses has arrived;
//! - at the deadline, with however many responses arrived by then
//!   (possibly none);
//! - on explicit cancellation, with the partial set collected so far.
//!
//! Responses arriving after finalisation are discarded silently.
//!
//! The timer also owns the node's message-id counter, so every envelope —
//! with or without a registered callback — gets a locally unique id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace};

/// Host callback receiving the collected responses.
pub type ResponseCallback = Box<dyn FnOnce(Vec<Vec<u8>>) + Send + 'static>;

struct PendingTask {
    callback: Option<ResponseCallback>,
    responses: Vec<Vec<u8>>,
    expected: usize,
    expiry: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ResponseTimer {
    tasks: Arc<Mutex<HashMap<u32, PendingTask>>>,
    next_id: Arc<AtomicU32>,
}

impl Default for ResponseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTimer {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            // Id 0 is reserved as "no correlation".
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// A fresh message id without a pending task attached.
    pub fn next_message_id(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Register a pending task; returns the message id to stamp on the
    /// outgoing envelope. Must be called from within a tokio runtime.
    pub fn add_task(
        &self,
        timeout: Duration,
        callback: ResponseCallback,
        expected_responses: usize,
    ) -> u32 {
        let id = self.next_message_id();
        let timer = self.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!(id, "pending task deadline elapsed");
            timer.finalize(id);
        });
        let task = PendingTask {
            callback: Some(callback),
            responses: Vec::new(),
            expected: expected_responses.max(1),
            expiry,
        };
        self.tasks
            .lock()
            .expect("pending table lock poisoned")
            .insert(id, task);
        id
    }

    /// Deliver a response for `id`. Finalises the task once the expected
    /// count is reached; unknown or already-finalised ids are ignored.
    pub fn on_response(&self, id: u32, response: Vec<u8>) {
        let complete = {
            let mut tasks = self.tasks.lock().expect("pending table lock poisoned");
            match tasks.get_mut(&id) {
                Some(task) => {
                    task.responses.push(response);
                    task.responses.len() >= task.expected
                }
                None => {
                    trace!(id, "late response discarded");
                    return;
                }
            }
        };
        if complete {
            self.finalize(id);
        }
    }

    /// Cancel a task, firing its callback with whatever arrived so far.
    pub fn cancel_task(&self, id: u32) {
        self.finalize(id);
    }

    /// Cancel every outstanding task (shutdown path).
    pub fn cancel_all(&self) {
        let ids: Vec<u32> = self
            .tasks
            .lock()
            .expect("pending table lock poisoned")
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.finalize(id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .lock()
            .expect("pending table lock poisoned")
            .len()
    }

    /// Remove the task and fire its callback. The callback is taken under
    /// the lock but invoked after it is released, so response handlers may
    /// register follow-up tasks.
    fn finalize(&self, id: u32) {
        let finished = {
            let mut tasks = self.tasks.lock().expect("pending table lock poisoned");
            tasks.remove(&id)
        };
        let Some(mut task) = finished else {
            return;
        };
        task.expiry.abort();
        debug!(
            id,
            received = task.responses.len(),
            expected = task.expected,
            "pending task finalised"
        );
        if let Some(callback) = task.callback.take() {
            callback(task.responses);
        }
    }
}

impl std::fmt::Debug for ResponseTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseTimer")
            .field("pending", &self.pending_count())
            .finish()
    }
}
