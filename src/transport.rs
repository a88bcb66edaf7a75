//! Transports the connection manager can drive.
//!
//! A [`Transport`] fetches the bootstrap document and opens duplex
//! [`Connection`]s that carry JSON text frames. [`WsTransport`] talks HTTP +
//! WebSocket to a real server; [`loopback`] builds an in-process pair for
//! tests and demos.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ObserverConfig;
use crate::error::TransportError;
use crate::types::WorldBootstrap;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of bootstrap documents and stream connections.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Conn: Connection;

    async fn fetch_bootstrap(&self) -> Result<WorldBootstrap, TransportError>;

    async fn open(&self) -> Result<Self::Conn, TransportError>;
}

/// One open duplex stream of text frames.
#[allow(async_fn_in_trait)]
pub trait Connection {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame. `None` once the peer has closed the stream.
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Default bound on the bootstrap request and the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP `GET` for the bootstrap, WebSocket for the stream.
#[derive(Debug, Clone)]
pub struct WsTransport {
    http: reqwest::Client,
    bootstrap_url: String,
    ws_url: String,
    timeout: Duration,
}

impl WsTransport {
    pub fn new(bootstrap_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bootstrap_url: bootstrap_url.into(),
            ws_url: ws_url.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound both the bootstrap request (through its body) and the
    /// WebSocket handshake.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(cfg: &ObserverConfig) -> Self {
        Self::new(cfg.bootstrap_url.clone(), cfg.ws_url.clone())
            .with_timeout(Duration::from_millis(cfg.connect_timeout_ms.max(1)))
    }
}

impl Transport for WsTransport {
    type Conn = WsConnection;

    async fn fetch_bootstrap(&self) -> Result<WorldBootstrap, TransportError> {
        let resp = self
            .http
            .get(&self.bootstrap_url)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(resp.json::<WorldBootstrap>().await?)
    }

    async fn open(&self) -> Result<WsConnection, TransportError> {
        let handshake = tokio_tungstenite::connect_async(self.ws_url.as_str());
        let (stream, _response) = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        debug!("WebSocket closed by peer: {} {}", frame.code, frame.reason);
                    }
                    return None;
                }
                // Binary, ping, pong: not part of the protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

/// Build an in-process transport and the server half that drives it.
pub fn loopback(bootstrap: Option<WorldBootstrap>) -> (LoopbackTransport, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Rc::new(LoopbackShared {
        bootstrap: RefCell::new(bootstrap),
        refuse: Cell::new(0),
        attempts: RefCell::new(Vec::new()),
    });
    (
        LoopbackTransport {
            shared: Rc::clone(&shared),
            accept_tx,
        },
        LoopbackServer { shared, accept_rx },
    )
}

struct LoopbackShared {
    bootstrap: RefCell<Option<WorldBootstrap>>,
    refuse: Cell<u32>,
    attempts: RefCell<Vec<Instant>>,
}

pub struct LoopbackTransport {
    shared: Rc<LoopbackShared>,
    accept_tx: mpsc::UnboundedSender<LoopbackPeer>,
}

impl Transport for LoopbackTransport {
    type Conn = LoopbackConnection;

    async fn fetch_bootstrap(&self) -> Result<WorldBootstrap, TransportError> {
        self.shared
            .bootstrap
            .borrow()
            .clone()
            .ok_or(TransportError::Status(503))
    }

    async fn open(&self) -> Result<LoopbackConnection, TransportError> {
        self.shared.attempts.borrow_mut().push(Instant::now());

        let refuse = self.shared.refuse.get();
        if refuse > 0 {
            self.shared.refuse.set(refuse - 1);
            return Err(TransportError::Other("connection refused".into()));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        self.accept_tx
            .send(LoopbackPeer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Other("loopback server gone".into()))?;

        Ok(LoopbackConnection {
            tx: Some(client_tx),
            rx: client_rx,
        })
    }
}

pub struct LoopbackConnection {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Connection for LoopbackConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(text).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// Server side of a [`loopback`] pair.
pub struct LoopbackServer {
    shared: Rc<LoopbackShared>,
    accept_rx: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackServer {
    /// Wait for the client's next successful open.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accept_rx.recv().await
    }

    /// Refuse the next `n` open attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.refuse.set(n);
    }

    pub fn set_bootstrap(&self, bootstrap: Option<WorldBootstrap>) {
        *self.shared.bootstrap.borrow_mut() = bootstrap;
    }

    /// When each open attempt (refused or not) happened.
    pub fn attempts(&self) -> Vec<Instant> {
        self.shared.attempts.borrow().clone()
    }
}

/// Server end of one loopback connection. Dropping it closes the stream.
pub struct LoopbackPeer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl LoopbackPeer {
    /// Returns `false` if the client has gone away.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Next frame from the client; `None` once it has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}
