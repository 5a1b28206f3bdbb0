use serde_json::Value;
use tracing::warn;
use tutor_contracts::events::{EventKind, EventWriter};

/// A session's handle on the optional event log. Write failures are logged
/// and never reach the client.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    writer: Option<EventWriter>,
    session_id: String,
}

impl SessionEvents {
    pub fn new(writer: Option<EventWriter>, session_id: impl Into<String>) -> Self {
        Self {
            writer,
            session_id: session_id.into(),
        }
    }

    pub fn disabled(session_id: impl Into<String>) -> Self {
        Self::new(None, session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `fields` must be a JSON object; anything else is recorded as empty.
    pub fn emit(&self, kind: EventKind, fields: Value) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let payload = match fields {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        if let Err(err) = writer.emit_for_session(kind, &self.session_id, payload) {
            warn!(
                session_id = %self.session_id,
                event = %kind,
                error = %err,
                "failed to write session event"
            );
        }
    }
}
