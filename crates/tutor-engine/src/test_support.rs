use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tutor_contracts::conversation::Conversation;
use tutor_contracts::protocol::OutboundFrame;

use crate::error::{GenerationError, TransportError};
use crate::generator::Generator;
use crate::transport::{Incoming, Transport};

const GATE_TIMEOUT: Duration = Duration::from_secs(5);
const AWAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn png_base64(width: u32, height: u32) -> String {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 40 % 256) as u8, (y * 40 % 256) as u8, 128])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    BASE64.encode(bytes)
}

pub fn image_frame(payload: &str) -> String {
    serde_json::json!({ "image": payload }).to_string()
}

pub fn question_frame(question: &str) -> String {
    serde_json::json!({ "question": question }).to_string()
}

/// Returns canned results in order and records every conversation it saw.
pub struct ScriptedGenerator {
    results: Mutex<VecDeque<Result<String, GenerationError>>>,
    seen: Mutex<Vec<Conversation>>,
}

impl ScriptedGenerator {
    pub fn new<const N: usize>(answers: [&str; N]) -> Self {
        Self::from_results(answers.iter().map(|answer| Ok(answer.to_string())).collect())
    }

    pub fn from_results(results: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.seen.lock().unwrap().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(
        &self,
        conversation: &Conversation,
        _image: &DynamicImage,
    ) -> Result<String, GenerationError> {
        self.seen.lock().unwrap().push(conversation.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::failed("script exhausted")))
    }
}

/// Blocks every call until [`GatedGenerator::release`] is called once for it.
pub struct GatedGenerator {
    answer: String,
    gate_tx: Mutex<mpsc::Sender<()>>,
    gate_rx: Mutex<mpsc::Receiver<()>>,
    calls: Mutex<usize>,
}

impl GatedGenerator {
    pub fn new(answer: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            answer: answer.to_string(),
            gate_tx: Mutex::new(tx),
            gate_rx: Mutex::new(rx),
            calls: Mutex::new(0),
        }
    }

    pub fn release(&self) {
        let _ = self.gate_tx.lock().unwrap().send(());
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Generator for GatedGenerator {
    fn name(&self) -> &str {
        "gated"
    }

    fn generate(
        &self,
        _conversation: &Conversation,
        _image: &DynamicImage,
    ) -> Result<String, GenerationError> {
        *self.calls.lock().unwrap() += 1;
        let released = self.gate_rx.lock().unwrap().recv_timeout(GATE_TIMEOUT);
        match released {
            Ok(()) => Ok(self.answer.clone()),
            Err(_) => Err(GenerationError::failed("gate never released")),
        }
    }
}

pub struct PanickingGenerator;

impl Generator for PanickingGenerator {
    fn name(&self) -> &str {
        "panicking"
    }

    fn generate(
        &self,
        _conversation: &Conversation,
        _image: &DynamicImage,
    ) -> Result<String, GenerationError> {
        panic!("generator blew up");
    }
}

pub enum ScriptStep {
    Frame(String),
    /// Stay idle until at least this many frames have been sent.
    AwaitSent(usize),
    Call(Box<dyn FnOnce() + Send>),
    /// Fail the next receive as if the peer vanished.
    Drop,
}

/// In-memory transport that plays a script of inbound steps and records
/// outbound frames. An exhausted script reads as a clean close.
pub struct MemoryTransport {
    script: VecDeque<ScriptStep>,
    sent: Vec<OutboundFrame>,
    awaiting_since: Option<Instant>,
    fail_sends: bool,
    closed: bool,
}

impl MemoryTransport {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: script.into(),
            sent: Vec::new(),
            awaiting_since: None,
            fail_sends: false,
            closed: false,
        }
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn sent(&self) -> &[OutboundFrame] {
        &self.sent
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for MemoryTransport {
    fn recv(&mut self) -> Result<Incoming, TransportError> {
        let Some(step) = self.script.pop_front() else {
            return Ok(Incoming::Closed);
        };
        match step {
            ScriptStep::Frame(raw) => Ok(Incoming::Frame(raw)),
            ScriptStep::AwaitSent(count) => {
                let since = *self.awaiting_since.get_or_insert_with(Instant::now);
                if self.sent.len() >= count || since.elapsed() > AWAIT_TIMEOUT {
                    self.awaiting_since = None;
                } else {
                    self.script.push_front(ScriptStep::AwaitSent(count));
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(Incoming::Idle)
            }
            ScriptStep::Call(hook) => {
                hook();
                Ok(Incoming::Idle)
            }
            ScriptStep::Drop => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer reset",
            ))),
        }
    }

    fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::Closed);
        }
        self.sent.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
