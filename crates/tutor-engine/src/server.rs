use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use tutor_contracts::events::{EventKind, EventPayload};

use crate::config::DEFAULT_ROUTE;
use crate::connection::{run_connection, ServiceContext};
use crate::transport::WebSocketTransport;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// WebSocket server that runs one independent tutoring session per
/// connection.
pub struct TutorServer {
    listener: TcpListener,
    route: String,
    context: Arc<ServiceContext>,
}

impl TutorServer {
    pub fn bind(addr: &str, context: ServiceContext) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self {
            listener,
            route: DEFAULT_ROUTE.to_string(),
            context: Arc::new(context),
        })
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    /// Starts accepting on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        self.listener
            .set_nonblocking(true)
            .context("failed to make listener nonblocking")?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let accept_thread = thread::Builder::new()
            .name("tutor-accept".to_string())
            .spawn(move || self.accept_loop(&stop_flag))
            .context("failed to spawn accept thread")?;
        Ok(ServerHandle {
            addr,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    /// Accepts until the process is terminated.
    pub fn serve_forever(self) -> Result<()> {
        let never = AtomicBool::new(false);
        self.listener
            .set_nonblocking(true)
            .context("failed to make listener nonblocking")?;
        self.accept_loop(&never);
        Ok(())
    }

    fn accept_loop(&self, stop: &AtomicBool) {
        let mut payload = EventPayload::new();
        payload.insert("route".to_string(), json!(self.route));
        if let Ok(addr) = self.listener.local_addr() {
            payload.insert("addr".to_string(), json!(addr.to_string()));
        }
        payload.insert(
            "generator".to_string(),
            json!(self.context.generator.name()),
        );
        payload.insert(
            "pending_policy".to_string(),
            json!(self.context.config.pending_policy.as_str()),
        );
        if let Some(events) = self.context.events.as_ref() {
            if let Err(err) = events.emit(EventKind::ServerStarted, payload) {
                warn!(error = %err, "failed to write server event");
            }
        }

        let connection_ids = AtomicU64::new(0);
        while !stop.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = connection_ids.fetch_add(1, Ordering::SeqCst) + 1;
                    let context = Arc::clone(&self.context);
                    let route = self.route.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("tutor-conn-{id}"))
                        .spawn(move || serve_connection(stream, peer, &route, &context));
                    if let Err(err) = spawned {
                        warn!(peer = %peer, error = %err, "failed to spawn connection thread");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }
}

fn serve_connection(stream: TcpStream, peer: SocketAddr, route: &str, context: &ServiceContext) {
    // Accepted sockets inherit nonblocking mode on some platforms. The
    // handshake read timeout is replaced by the poll interval once upgraded.
    let configured = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(context.config.handshake_timeout)));
    if let Err(err) = configured {
        warn!(peer = %peer, error = %err, "failed to configure connection");
        return;
    }
    let (mut transport, handshake) =
        match WebSocketTransport::accept(stream, route, context.config.poll_interval) {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(peer = %peer, error = %err, "websocket handshake refused");
                return;
            }
        };

    let selection = match context.directives.select(handshake.directive.as_deref()) {
        Ok(selection) => selection,
        Err(err) => {
            warn!(peer = %peer, error = %err, "no directive available");
            return;
        }
    };
    if let (Some(reason), Some(_)) = (&selection.fallback_reason, &selection.requested) {
        warn!(peer = %peer, reason = %reason, "directive fallback");
    }
    info!(
        peer = %peer,
        path = %handshake.path,
        directive = %selection.directive.name,
        "connection accepted"
    );

    match run_connection(&mut transport, context, &selection.directive) {
        Ok(summary) => info!(
            peer = %peer,
            session_id = %summary.session_id,
            turns = summary.history.len(),
            "connection closed"
        ),
        Err(err) => warn!(peer = %peer, error = %err, "connection ended with error"),
    }
}

/// Running server; dropping it stops the accept loop.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop_accepting();
    }

    fn stop_accepting(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_accepting();
    }
}
