pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod generator;
pub mod image_payload;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{PendingPolicy, SessionConfig};
pub use connection::{run_connection, ConnectionSummary, ServiceContext};
pub use dispatcher::{Dispatcher, GenerationOutcome};
pub use error::{FrameError, GenerationError, TransportError};
pub use generator::{DryrunGenerator, Generator, OpenAiGenerator};
pub use server::{ServerHandle, TutorServer};
pub use session::Session;
pub use transport::{Incoming, Transport, WebSocketTransport};
