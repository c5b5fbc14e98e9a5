//! WebSocket transport over tokio-tungstenite.
//!
//! The client side dials `<base url>/api/socket`. The server side upgrades an
//! accepted `TcpStream`. Only text and close frames are meaningful to the
//! protocol; pings are answered by tungstenite and binary frames are
//! dropped with a warning.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::transport::{
    CloseFrame, Connection, Dialer, FrameSink, FrameStream, Incoming, TransportError,
    TransportResult,
};

/// Path appended to the base URL
pub const SOCKET_PATH: &str = "api/socket";

/// Build the socket URL from a base URL
///
/// A missing trailing slash on the base path is added first so that
/// `https://host/prefix` becomes `wss://host/prefix/api/socket`. `http` and
/// `https` schemes are mapped to `ws` and `wss`.
///
/// # Errors
///
/// Returns `TransportError::InvalidConfig` for unparsable URLs or schemes
/// other than http(s) and ws(s).
pub fn socket_url(base: &str) -> TransportResult<Url> {
    let mut url =
        Url::parse(base).map_err(|e| TransportError::InvalidConfig(format!("{base}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported scheme {other}"
            )));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::InvalidConfig(format!(
            "cannot use scheme {scheme} for {base}"
        )));
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.join(SOCKET_PATH)
        .map_err(|e| TransportError::InvalidConfig(format!("{base}: {e}")))
}

/// Dials a WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: Url,
}

impl WebSocketDialer {
    /// Create a dialer for the socket endpoint under `base`
    ///
    /// # Errors
    ///
    /// See [`socket_url`].
    pub fn new(base: &str) -> TransportResult<Self> {
        Ok(Self {
            url: socket_url(base)?,
        })
    }

    /// Resolved socket URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> TransportResult<Connection> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(split(ws))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Upgrade an accepted TCP stream to a WebSocket connection
///
/// # Errors
///
/// Returns `TransportError::ConnectionFailed` if the upgrade handshake fails.
pub async fn accept(stream: TcpStream) -> TransportResult<Connection> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(split(ws))
}

fn split<S>(ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = ws.split();
    Connection::new(
        Box::new(WsSink { tx }),
        Box::new(WsStream { rx, finished: false }),
    )
}

struct WsSink<S> {
    tx: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self, frame: CloseFrame) -> TransportResult<()> {
        let ws_frame = WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: Cow::Owned(frame.reason),
        };
        self.tx
            .send(Message::Close(Some(ws_frame)))
            .await
            .map_err(map_ws_error)
    }
}

struct WsStream<S> {
    rx: SplitStream<WebSocketStream<S>>,
    finished: bool,
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<TransportResult<Incoming>> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Incoming::Text(text))),
                Ok(Message::Close(frame)) => {
                    self.finished = true;
                    let frame = frame.map(|f| CloseFrame::new(u16::from(f.code), f.reason));
                    return Some(Ok(Incoming::Closed(frame)));
                }
                Ok(Message::Binary(data)) => {
                    tracing::warn!(len = data.len(), "Ignoring binary WebSocket frame");
                }
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(map_ws_error(e)));
                }
            }
        }
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
        Error::Io(io) => TransportError::Io(io),
        other => TransportError::Other(other.to_string()),
    }
}
