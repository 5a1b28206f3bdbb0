use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tutor_contracts::conversation::{Conversation, Turn};

use crate::error::{AlreadyPendingError, DecodeError};
use crate::image_payload::decode_image_payload;

/// Handle to the single in-flight generation of a session.
///
/// Dropping the handle requests cancellation. The worker thread is detached,
/// never joined, so a slow generator cannot stall the connection.
#[derive(Debug)]
pub struct PendingTask {
    id: u64,
    question: String,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl PendingTask {
    pub fn new(id: u64, question: impl Into<String>) -> Self {
        Self {
            id,
            question: question.into(),
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn attach_worker(&mut self, handle: JoinHandle<()>) {
        self.worker = Some(handle);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub width: u32,
    pub height: u32,
    pub byte_len: usize,
    pub sha256: String,
    pub history_cleared: usize,
    pub cancelled_task: Option<u64>,
}

/// Per-connection tutoring state: current image, text-only history and at
/// most one pending generation. Owned by the connection thread.
#[derive(Debug)]
pub struct Session {
    id: String,
    directive: String,
    max_image_bytes: usize,
    image: Option<Arc<DynamicImage>>,
    image_sha256: Option<String>,
    history: Vec<Turn>,
    pending: Option<PendingTask>,
    next_task_id: u64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        directive: impl Into<String>,
        max_image_bytes: usize,
    ) -> Self {
        Self {
            id: id.into(),
            directive: directive.into(),
            max_image_bytes,
            image: None,
            image_sha256: None,
            history: Vec::new(),
            pending: None,
            next_task_id: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub fn image(&self) -> Option<&Arc<DynamicImage>> {
        self.image.as_ref()
    }

    pub fn image_sha256(&self) -> Option<&str> {
        self.image_sha256.as_deref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Replaces the image and clears history in one step. A generation still
    /// running against the old image is cancelled. On error nothing changes.
    pub fn set_image(&mut self, payload: &str) -> Result<StoredImage, DecodeError> {
        let decoded = decode_image_payload(payload, self.max_image_bytes)?;
        let stored = StoredImage {
            width: decoded.image.width(),
            height: decoded.image.height(),
            byte_len: decoded.byte_len,
            sha256: decoded.sha256.clone(),
            history_cleared: self.history.len(),
            cancelled_task: self.clear_pending(),
        };
        self.image = Some(Arc::new(decoded.image));
        self.image_sha256 = Some(decoded.sha256);
        self.history.clear();
        Ok(stored)
    }

    pub fn can_ask(&self) -> bool {
        self.image.is_some()
    }

    pub fn build_prompt(&self, question: &str) -> Conversation {
        Conversation::new(&self.directive, &self.history, question)
    }

    pub fn record_turn(&mut self, question: &str, answer: &str) {
        self.history.push(Turn::student(question));
        self.history.push(Turn::tutor(answer));
    }

    pub fn next_task_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id = self.next_task_id.saturating_add(1);
        id
    }

    pub fn try_set_pending(&mut self, task: PendingTask) -> Result<(), AlreadyPendingError> {
        if let Some(active) = self.pending.as_ref() {
            return Err(AlreadyPendingError {
                active: active.id(),
                rejected: task,
            });
        }
        self.pending = Some(task);
        Ok(())
    }

    /// Attaches the worker thread to the pending task with `task_id`. Returns
    /// false when that task is no longer pending.
    pub fn attach_worker(&mut self, task_id: u64, handle: JoinHandle<()>) -> bool {
        match self.pending.as_mut() {
            Some(task) if task.id() == task_id => {
                task.attach_worker(handle);
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Option<&PendingTask> {
        self.pending.as_ref()
    }

    pub fn pending_id(&self) -> Option<u64> {
        self.pending.as_ref().map(PendingTask::id)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Releases the pending handle, requesting cancellation if the worker is
    /// still running. Returns the released task id.
    pub fn clear_pending(&mut self) -> Option<u64> {
        let mut task = self.pending.take()?;
        task.cancel();
        Some(task.id())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear_pending();
    }
}
