use std::sync::mpsc;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use tutor_contracts::conversation::Turn;
use tutor_contracts::directives::{DirectiveSelector, DirectiveSpec};
use tutor_contracts::events::{EventKind, EventWriter};

use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, GenerationOutcome};
use crate::error::TransportError;
use crate::events::SessionEvents;
use crate::generator::Generator;
use crate::session::Session;
use crate::transport::{Incoming, Transport};

/// Process-wide state shared by every connection: one generator, directive
/// registry, session settings and the optional event stream.
pub struct ServiceContext {
    pub generator: Arc<dyn Generator>,
    pub directives: DirectiveSelector,
    pub config: SessionConfig,
    pub events: Option<EventWriter>,
}

impl ServiceContext {
    pub fn new(generator: Arc<dyn Generator>, config: SessionConfig) -> Self {
        Self {
            generator,
            directives: DirectiveSelector::default(),
            config,
            events: None,
        }
    }

    pub fn with_directives(mut self, directives: DirectiveSelector) -> Self {
        self.directives = directives;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub session_id: String,
    pub frames_received: usize,
    pub frames_sent: usize,
    pub history: Vec<Turn>,
}

#[derive(Debug, Default)]
struct Counters {
    received: usize,
    sent: usize,
}

/// Runs one session over `transport` until the peer closes or the transport
/// fails. Frames are handled strictly in arrival order; generations run on
/// worker threads and their replies are sent between reads. Any pending
/// generation is cancelled when this returns.
pub fn run_connection<T: Transport>(
    transport: &mut T,
    context: &ServiceContext,
    directive: &DirectiveSpec,
) -> Result<ConnectionSummary, TransportError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let events = SessionEvents::new(context.events.clone(), session_id.clone());
    let (outcome_tx, outcome_rx) = mpsc::channel();
    let dispatcher = Dispatcher::new(
        Arc::clone(&context.generator),
        context.config.pending_policy,
        context.config.generation_timeout,
        outcome_tx,
        events.clone(),
    );
    let mut session = Session::new(
        session_id.clone(),
        directive.instruction.clone(),
        context.config.max_image_bytes,
    );

    info!(
        session_id = %session_id,
        directive = %directive.name,
        policy = %dispatcher.policy(),
        "session started"
    );
    events.emit(
        EventKind::SessionStarted,
        json!({
            "directive": directive.name,
            "pending_policy": dispatcher.policy().as_str(),
            "generator": context.generator.name(),
        }),
    );

    let mut counters = Counters::default();
    let result = drive(transport, &dispatcher, &mut session, &outcome_rx, &mut counters);

    let cancelled = session.clear_pending();
    transport.close();
    let reason = match &result {
        Ok(()) => "closed".to_string(),
        Err(err) => err.to_string(),
    };
    info!(
        session_id = %session_id,
        frames_received = counters.received,
        frames_sent = counters.sent,
        turns = session.history().len(),
        reason = %reason,
        "session ended"
    );
    events.emit(
        EventKind::SessionClosed,
        json!({
            "reason": reason,
            "frames_received": counters.received,
            "frames_sent": counters.sent,
            "history_turns": session.history().len(),
            "cancelled_task_id": cancelled,
        }),
    );

    result.map(|()| ConnectionSummary {
        session_id,
        frames_received: counters.received,
        frames_sent: counters.sent,
        history: session.history().to_vec(),
    })
}

fn drive<T: Transport>(
    transport: &mut T,
    dispatcher: &Dispatcher,
    session: &mut Session,
    outcomes: &mpsc::Receiver<GenerationOutcome>,
    counters: &mut Counters,
) -> Result<(), TransportError> {
    loop {
        while let Ok(outcome) = outcomes.try_recv() {
            if let Some(frame) = dispatcher.complete(session, outcome) {
                transport.send(&frame)?;
                counters.sent += 1;
            }
        }
        if let Some(frame) = dispatcher.expire_overdue(session) {
            transport.send(&frame)?;
            counters.sent += 1;
        }

        match transport.recv()? {
            Incoming::Frame(raw) => {
                counters.received += 1;
                debug!(session_id = %session.id(), bytes = raw.len(), "frame received");
                for frame in dispatcher.handle_text(session, &raw) {
                    transport.send(&frame)?;
                    counters.sent += 1;
                }
            }
            Incoming::Idle => {}
            Incoming::Closed => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;
    use tutor_contracts::conversation::Turn;
    use tutor_contracts::directives::DirectiveSelector;
    use tutor_contracts::events::EventWriter;
    use tutor_contracts::protocol::{
        OutboundFrame, ERROR_ALREADY_PENDING, ERROR_INVALID_REQUEST, ERROR_NO_IMAGE,
        STATUS_IMAGE_STORED,
    };

    use super::{run_connection, ServiceContext};
    use crate::config::SessionConfig;
    use crate::error::TransportError;
    use crate::generator::Generator;
    use crate::test_support::{
        image_frame, png_base64, question_frame, GatedGenerator, MemoryTransport, ScriptStep,
        ScriptedGenerator,
    };

    fn context(generator: Arc<dyn Generator>) -> ServiceContext {
        ServiceContext::new(
            generator,
            SessionConfig {
                poll_interval: Duration::from_millis(5),
                ..SessionConfig::default()
            },
        )
    }

    fn run(
        transport: &mut MemoryTransport,
        context: &ServiceContext,
    ) -> Result<super::ConnectionSummary, TransportError> {
        let selection = context.directives.select(None).unwrap();
        run_connection(transport, context, &selection.directive)
    }

    #[test]
    fn tutoring_scenario_over_a_connection() {
        let context = context(Arc::new(ScriptedGenerator::new(["Try again", "Correct!"])));
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(3, 3))),
            ScriptStep::Frame(question_frame("2+3")),
            ScriptStep::AwaitSent(2),
            ScriptStep::Frame(question_frame("5")),
            ScriptStep::AwaitSent(3),
        ]);

        let summary = run(&mut transport, &context).unwrap();

        assert_eq!(
            transport.sent(),
            &[
                OutboundFrame::status(STATUS_IMAGE_STORED),
                OutboundFrame::answer("Try again"),
                OutboundFrame::answer("Correct!"),
            ]
        );
        assert_eq!(
            summary.history,
            vec![
                Turn::student("2+3"),
                Turn::tutor("Try again"),
                Turn::student("5"),
                Turn::tutor("Correct!"),
            ]
        );
        assert_eq!(summary.frames_received, 3);
        assert_eq!(summary.frames_sent, 3);
        assert!(transport.is_closed());
    }

    #[test]
    fn every_classified_frame_gets_one_reply() {
        let context = context(Arc::new(ScriptedGenerator::new(["fine"])));
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(question_frame("too early")),
            ScriptStep::Frame("{not json".to_string()),
            ScriptStep::Frame("{}".to_string()),
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Frame(question_frame("now?")),
            ScriptStep::AwaitSent(5),
        ]);

        let summary = run(&mut transport, &context).unwrap();

        assert_eq!(
            transport.sent(),
            &[
                OutboundFrame::error(ERROR_NO_IMAGE),
                OutboundFrame::error(ERROR_INVALID_REQUEST),
                OutboundFrame::error(ERROR_INVALID_REQUEST),
                OutboundFrame::status(STATUS_IMAGE_STORED),
                OutboundFrame::answer("fine"),
            ]
        );
        assert_eq!(summary.frames_received, 5);
    }

    #[test]
    fn rejected_question_does_not_disturb_pending_answer() {
        let generator = Arc::new(GatedGenerator::new("Carry the one."));
        let release = Arc::clone(&generator);
        let context = context(generator);
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Frame(question_frame("19+5")),
            ScriptStep::Frame(question_frame("hello?")),
            ScriptStep::AwaitSent(2),
            ScriptStep::Call(Box::new(move || release.release())),
            ScriptStep::AwaitSent(3),
        ]);

        let summary = run(&mut transport, &context).unwrap();

        assert_eq!(
            transport.sent(),
            &[
                OutboundFrame::status(STATUS_IMAGE_STORED),
                OutboundFrame::error(ERROR_ALREADY_PENDING),
                OutboundFrame::answer("Carry the one."),
            ]
        );
        assert_eq!(
            summary.history,
            vec![Turn::student("19+5"), Turn::tutor("Carry the one.")]
        );
    }

    #[test]
    fn disconnect_with_pending_generation_sends_nothing_more() {
        let generator = Arc::new(GatedGenerator::new("never delivered"));
        let release = Arc::clone(&generator);
        let context = context(generator);
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Frame(question_frame("slow")),
        ]);

        let summary = run(&mut transport, &context).unwrap();
        release.release();

        assert_eq!(transport.sent(), &[OutboundFrame::status(STATUS_IMAGE_STORED)]);
        assert!(summary.history.is_empty());
        assert!(transport.is_closed());
    }

    #[test]
    fn transport_failure_ends_the_session_with_error() {
        let context = context(Arc::new(ScriptedGenerator::new(["x"])));
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Drop,
            ScriptStep::Frame(question_frame("unreached")),
        ]);

        let err = run(&mut transport, &context).unwrap_err();

        assert!(matches!(err, TransportError::Io(_)), "{err:?}");
        assert_eq!(transport.sent().len(), 1);
        assert!(transport.is_closed());
    }

    #[test]
    fn send_failure_is_fatal() {
        let context = context(Arc::new(ScriptedGenerator::new(["x"])));
        let mut transport =
            MemoryTransport::new(vec![ScriptStep::Frame(question_frame("q"))]).failing_sends();

        let err = run(&mut transport, &context).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn selected_directive_reaches_the_generator() {
        let generator = Arc::new(ScriptedGenerator::new(["hint"]));
        let context = context(generator.clone());
        let selection = DirectiveSelector::default()
            .select(Some("hint-ladder"))
            .unwrap();
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Frame(question_frame("q")),
            ScriptStep::AwaitSent(2),
        ]);

        run_connection(&mut transport, &context, &selection.directive).unwrap();

        let prompts = generator.conversations();
        assert_eq!(
            prompts[0].directive(),
            Some(selection.directive.instruction.as_str())
        );
    }

    #[test]
    fn session_lifecycle_is_written_to_event_stream() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let context = context(Arc::new(ScriptedGenerator::new(["ok"])))
            .with_events(EventWriter::create(&path, "srv-test")?);
        let mut transport = MemoryTransport::new(vec![
            ScriptStep::Frame(image_frame(&png_base64(2, 2))),
            ScriptStep::Frame(question_frame("q")),
            ScriptStep::AwaitSent(2),
        ]);

        let summary = run(&mut transport, &context)?;

        let content = fs::read_to_string(&path)?;
        let events = content
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?;
        let kinds = events
            .iter()
            .map(|event| event["type"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<String>>();
        assert_eq!(
            kinds,
            vec![
                "session_started",
                "image_stored",
                "generation_started",
                "generation_finished",
                "session_closed",
            ]
        );
        assert!(events
            .iter()
            .all(|event| event["session_id"] == summary.session_id.as_str()));
        assert!(!content.contains(&png_base64(2, 2)));
        Ok(())
    }
}
