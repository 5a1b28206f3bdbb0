use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};
use tutor_contracts::events::EventKind;
use tutor_contracts::protocol::{
    parse_frame, FrameKind, OutboundFrame, ERROR_PROCESSING_FAILED, STATUS_IMAGE_STORED,
};

use crate::config::PendingPolicy;
use crate::error::{FrameError, GenerationError, NoImageError, ProtocolError};
use crate::events::SessionEvents;
use crate::generator::Generator;
use crate::session::{PendingTask, Session};

/// Result of one generation, sent from the worker thread back to the
/// connection thread that owns the session.
#[derive(Debug)]
pub struct GenerationOutcome {
    pub task_id: u64,
    pub question: String,
    pub result: Result<String, GenerationError>,
    pub elapsed: Duration,
}

/// Classifies inbound frames and drives one session. Questions are answered
/// on worker threads; their outcomes come back through the channel given to
/// [`Dispatcher::new`] and are applied with [`Dispatcher::complete`].
pub struct Dispatcher {
    generator: Arc<dyn Generator>,
    policy: PendingPolicy,
    generation_timeout: Duration,
    outcomes: mpsc::Sender<GenerationOutcome>,
    events: SessionEvents,
}

impl Dispatcher {
    pub fn new(
        generator: Arc<dyn Generator>,
        policy: PendingPolicy,
        generation_timeout: Duration,
        outcomes: mpsc::Sender<GenerationOutcome>,
        events: SessionEvents,
    ) -> Self {
        Self {
            generator,
            policy,
            generation_timeout,
            outcomes,
            events,
        }
    }

    pub fn policy(&self) -> PendingPolicy {
        self.policy
    }

    /// Handles one raw text frame. Returns the frames to send right away; an
    /// accepted question returns nothing here and is answered later.
    pub fn handle_text(&self, session: &mut Session, raw: &str) -> Vec<OutboundFrame> {
        self.handle_frame(session, parse_frame(raw))
    }

    pub fn handle_frame(&self, session: &mut Session, kind: FrameKind) -> Vec<OutboundFrame> {
        match kind {
            FrameKind::ImageUpdate(payload) => self.store_image(session, &payload),
            FrameKind::Question(question) => self.ask(session, question),
            FrameKind::Invalid => {
                let err = FrameError::from(ProtocolError);
                debug!(session_id = %session.id(), "rejected frame: {err}");
                vec![OutboundFrame::error(err.client_message())]
            }
        }
    }

    fn store_image(&self, session: &mut Session, payload: &str) -> Vec<OutboundFrame> {
        match session.set_image(payload) {
            Ok(stored) => {
                let mut replies = Vec::with_capacity(2);
                if let Some(task_id) = stored.cancelled_task {
                    info!(
                        session_id = %session.id(),
                        task_id,
                        "new image cancelled pending generation"
                    );
                    self.events.emit(
                        EventKind::GenerationCancelled,
                        json!({"task_id": task_id, "reason": "image_replaced"}),
                    );
                    replies.push(OutboundFrame::error(ERROR_PROCESSING_FAILED));
                }
                debug!(
                    session_id = %session.id(),
                    width = stored.width,
                    height = stored.height,
                    history_cleared = stored.history_cleared,
                    "image stored"
                );
                self.events.emit(
                    EventKind::ImageStored,
                    json!({
                        "width": stored.width,
                        "height": stored.height,
                        "bytes": stored.byte_len,
                        "sha256": stored.sha256,
                        "history_cleared": stored.history_cleared,
                    }),
                );
                replies.push(OutboundFrame::status(STATUS_IMAGE_STORED));
                replies
            }
            Err(decode_err) => {
                info!(session_id = %session.id(), "image rejected: {decode_err}");
                let reason = decode_err.to_string();
                self.events.emit(EventKind::ImageRejected, json!({ "reason": reason }));
                let err = FrameError::from(decode_err);
                vec![OutboundFrame::error(err.client_message())]
            }
        }
    }

    fn ask(&self, session: &mut Session, question: String) -> Vec<OutboundFrame> {
        if !session.can_ask() {
            let err = FrameError::from(NoImageError);
            self.events.emit(EventKind::QuestionRejected, json!({ "reason": "no_image" }));
            return vec![OutboundFrame::error(err.client_message())];
        }

        let mut replies = Vec::new();
        let task_id = session.next_task_id();
        if let Err(pending_err) = session.try_set_pending(PendingTask::new(task_id, &question)) {
            match self.policy {
                PendingPolicy::Reject => {
                    debug!(
                        session_id = %session.id(),
                        active = pending_err.active,
                        "question rejected while generation pending"
                    );
                    self.events.emit(
                        EventKind::QuestionRejected,
                        json!({
                            "reason": "already_pending",
                            "active_task_id": pending_err.active,
                        }),
                    );
                    let err = FrameError::from(pending_err);
                    return vec![OutboundFrame::error(err.client_message())];
                }
                PendingPolicy::Replace => {
                    let active = pending_err.active;
                    session.clear_pending();
                    info!(
                        session_id = %session.id(),
                        task_id = active,
                        "pending generation replaced"
                    );
                    self.events.emit(
                        EventKind::GenerationCancelled,
                        json!({"task_id": active, "reason": "replaced"}),
                    );
                    replies.push(OutboundFrame::error(ERROR_PROCESSING_FAILED));
                    if session.try_set_pending(pending_err.rejected).is_err() {
                        replies.push(OutboundFrame::error(ERROR_PROCESSING_FAILED));
                        return replies;
                    }
                }
            }
        }

        if let Err(err) = self.launch(session, task_id, question) {
            warn!(session_id = %session.id(), task_id, "failed to launch generation: {err}");
            session.clear_pending();
            replies.push(OutboundFrame::error(FrameError::from(err).client_message()));
        }
        replies
    }

    fn launch(
        &self,
        session: &mut Session,
        task_id: u64,
        question: String,
    ) -> Result<(), GenerationError> {
        let Some(image) = session.image().cloned() else {
            return Err(GenerationError::failed("image disappeared before launch"));
        };
        let Some(cancel) = session.pending().map(PendingTask::cancel_flag) else {
            return Err(GenerationError::failed("pending slot empty at launch"));
        };
        let conversation = session.build_prompt(&question);
        let generator = Arc::clone(&self.generator);
        let outcomes = self.outcomes.clone();

        let handle = thread::Builder::new()
            .name(format!("tutor-generate-{task_id}"))
            .spawn(move || {
                let started = Instant::now();
                let result = if cancel.load(Ordering::SeqCst) {
                    Err(GenerationError::Cancelled)
                } else {
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        generator.generate(&conversation, &image)
                    }))
                    .unwrap_or(Err(GenerationError::Panicked))
                };
                let result = if cancel.load(Ordering::SeqCst) {
                    Err(GenerationError::Cancelled)
                } else {
                    result
                };
                let _ = outcomes.send(GenerationOutcome {
                    task_id,
                    question,
                    result,
                    elapsed: started.elapsed(),
                });
            })
            .map_err(|err| GenerationError::Unavailable(format!("thread spawn failed: {err}")))?;

        session.attach_worker(task_id, handle);
        debug!(
            session_id = %session.id(),
            task_id,
            generator = self.generator.name(),
            "generation started"
        );
        self.events.emit(
            EventKind::GenerationStarted,
            json!({
                "task_id": task_id,
                "generator": self.generator.name(),
                "history_turns": session.history().len(),
            }),
        );
        Ok(())
    }

    /// Applies a finished generation. Outcomes for tasks that are no longer
    /// pending (cancelled, replaced, timed out) were already answered and are
    /// dropped.
    pub fn complete(
        &self,
        session: &mut Session,
        outcome: GenerationOutcome,
    ) -> Option<OutboundFrame> {
        if session.pending_id() != Some(outcome.task_id) {
            debug!(
                session_id = %session.id(),
                task_id = outcome.task_id,
                "dropping stale generation outcome"
            );
            return None;
        }
        session.clear_pending();

        let elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome.result {
            Ok(answer) => {
                session.record_turn(&outcome.question, &answer);
                self.events.emit(
                    EventKind::GenerationFinished,
                    json!({
                        "task_id": outcome.task_id,
                        "ok": true,
                        "elapsed_ms": elapsed_ms,
                        "history_turns": session.history().len(),
                    }),
                );
                Some(OutboundFrame::answer(answer))
            }
            Err(err) => {
                warn!(
                    session_id = %session.id(),
                    task_id = outcome.task_id,
                    elapsed_ms,
                    "generation failed: {err}"
                );
                self.events.emit(
                    EventKind::GenerationFinished,
                    json!({
                        "task_id": outcome.task_id,
                        "ok": false,
                        "elapsed_ms": elapsed_ms,
                        "error": err.to_string(),
                    }),
                );
                Some(OutboundFrame::error(FrameError::from(err).client_message()))
            }
        }
    }

    /// Gives up on a pending generation that has run past the configured
    /// timeout. Its eventual outcome is dropped as stale.
    pub fn expire_overdue(&self, session: &mut Session) -> Option<OutboundFrame> {
        let task = session.pending()?;
        if task.elapsed() < self.generation_timeout {
            return None;
        }
        let task_id = task.id();
        session.clear_pending();
        let err = GenerationError::TimedOut(self.generation_timeout);
        warn!(session_id = %session.id(), task_id, "{err}");
        self.events.emit(
            EventKind::GenerationCancelled,
            json!({"task_id": task_id, "reason": "timeout"}),
        );
        Some(OutboundFrame::error(FrameError::from(err).client_message()))
    }
}
