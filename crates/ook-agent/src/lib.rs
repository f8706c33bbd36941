//! Editor-side passthrough: NDJSON on stdio in, WebSocket frames out.
//!
//! Each input line becomes one text frame to the bridge, and each text frame
//! from the bridge is written back as exactly one output line.

use futures::{SinkExt, StreamExt};
use ook_core::ensure_newline;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub use ook_core::DEFAULT_PORT;

pub type BridgeStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("failed to read input: {0}")]
    Input(#[source] std::io::Error),
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Where the bridge lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Remote {
    pub host: String,
    pub port: u16,
}

impl Remote {
    /// An explicit host wins; otherwise `lima-<hostname>-sandbox`. An
    /// unparsable port falls back to [`DEFAULT_PORT`].
    pub fn resolve(host: Option<String>, port: Option<&str>, hostname: Option<String>) -> Self {
        let host = host.unwrap_or_else(|| default_host(hostname));
        let port = match port {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = raw, "ignoring invalid remote port");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        Self { host, port }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Sandbox VM host name for this machine.
pub fn default_host(hostname: Option<String>) -> String {
    let hostname = hostname.unwrap_or_else(|| "localhost".to_string());
    format!("lima-{hostname}-sandbox")
}

/// Why the relay stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayEnd {
    /// Input reached EOF.
    InputClosed,
    /// The bridge sent a close frame.
    ServerClosed(Option<(u16, String)>),
    /// The socket ended without a close frame.
    StreamEnded,
}

pub async fn connect(url: &str) -> Result<BridgeStream, AgentError> {
    let (ws, _) = connect_async(url).await.map_err(|source| AgentError::Connect {
        url: url.to_string(),
        source,
    })?;
    Ok(ws)
}

/// Connect to `url` and relay between `input`/`output` and the socket until
/// either side ends.
pub async fn run_passthrough<R, W>(input: R, output: W, url: &str) -> Result<RelayEnd, AgentError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(url, "connecting to ook bridge");
    let ws = connect(url).await?;
    info!(url, "connected to ook bridge");
    relay(input, output, ws).await
}

/// Relay over an established socket. The socket is closed on every exit path.
pub async fn relay<R, W, S>(input: R, mut output: W, ws: WebSocketStream<S>) -> Result<RelayEnd, AgentError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut lines = BufReader::new(input).lines();

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    debug!(direction = "editor->bridge", len = line.len(), "forwarding frame");
                    if let Err(e) = ws_tx.send(Message::Text(line.into())).await {
                        break Err(AgentError::WebSocket(e));
                    }
                }
                Ok(None) => {
                    info!("input closed, shutting down");
                    break Ok(RelayEnd::InputClosed);
                }
                Err(e) => break Err(AgentError::Input(e)),
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!(direction = "bridge->editor", len = text.len(), "forwarding frame");
                    if let Err(e) = write_line(&mut output, text.as_str()).await {
                        break Err(AgentError::Output(e));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "bridge closed the connection");
                    break Ok(RelayEnd::ServerClosed(frame.map(close_parts)));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                        warn!(error = %e, "failed to send pong");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(AgentError::WebSocket(e)),
                None => {
                    info!("bridge stream ended");
                    break Ok(RelayEnd::StreamEnded);
                }
            },
        }
    };

    let _ = ws_tx.close().await;
    result
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> std::io::Result<()> {
    output.write_all(ensure_newline(text).as_bytes()).await?;
    output.flush().await
}

fn close_parts(frame: CloseFrame) -> (u16, String) {
    (u16::from(frame.code), frame.reason.to_string())
}
