use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tungstenite::error::ProtocolError;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::{Message as WsMessage, WebSocket};
use tutor_contracts::protocol::OutboundFrame;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Frame(String),
    /// Nothing arrived within the poll interval.
    Idle,
    Closed,
}

/// Connection as seen by a session: ordered inbound frames, outbound frames,
/// close. `recv` must return `Idle` periodically so finished generations can
/// be delivered while the client is quiet.
pub trait Transport {
    fn recv(&mut self) -> Result<Incoming, TransportError>;
    fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub path: String,
    pub directive: Option<String>,
}

pub struct WebSocketTransport<S: Read + Write> {
    ws: WebSocket<S>,
    closed: bool,
}

impl WebSocketTransport<TcpStream> {
    /// Performs the server handshake. Requests for any path other than
    /// `route` are refused with 404. The stream then polls with
    /// `poll_interval` read timeouts.
    pub fn accept(
        stream: TcpStream,
        route: &str,
        poll_interval: Duration,
    ) -> Result<(Self, HandshakeInfo), TransportError> {
        let mut info = HandshakeInfo::default();
        let callback = |request: &Request, response: Response| {
            let path = request.uri().path().to_string();
            if !route_matches(route, &path) {
                let mut refusal = ErrorResponse::new(Some(format!("no websocket route at {path}")));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                return Err(refusal);
            }
            info.directive = request.uri().query().and_then(directive_from_query);
            info.path = path;
            Ok(response)
        };
        let ws = tungstenite::accept_hdr(stream, callback)
            .map_err(|err| TransportError::Handshake(err.to_string()))?;
        ws.get_ref().set_read_timeout(Some(poll_interval))?;
        Ok((Self { ws, closed: false }, info))
    }
}

impl<S: Read + Write> Transport for WebSocketTransport<S> {
    fn recv(&mut self) -> Result<Incoming, TransportError> {
        if self.closed {
            return Ok(Incoming::Closed);
        }
        match self.ws.read() {
            Ok(WsMessage::Text(text)) => Ok(Incoming::Frame(text.as_str().to_string())),
            Ok(WsMessage::Binary(bytes)) => {
                Ok(Incoming::Frame(String::from_utf8_lossy(&bytes).to_string()))
            }
            Ok(WsMessage::Close(_)) => {
                self.closed = true;
                Ok(Incoming::Closed)
            }
            Ok(_) => Ok(Incoming::Idle),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(Incoming::Idle)
            }
            Err(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => {
                self.closed = true;
                Ok(Incoming::Closed)
            }
            Err(err) => {
                self.closed = true;
                Err(TransportError::WebSocket(err))
            }
        }
    }

    fn send(&mut self, frame: &OutboundFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.ws
            .send(WsMessage::Text(frame.to_json().into()))
            .map_err(TransportError::from)
    }

    fn close(&mut self) {
        let _ = self.ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "session closed".into(),
        }));
        let _ = self.ws.flush();
        self.closed = true;
    }
}

fn route_matches(route: &str, path: &str) -> bool {
    let route = route.trim().trim_end_matches('/');
    let path = path.trim_end_matches('/');
    route.is_empty() || route == path
}

fn directive_from_query(query: &str) -> Option<String> {
    let url = reqwest::Url::parse(&format!("ws://localhost/?{query}")).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "directive")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
