//! Websocket connector: binary protobuf frames over `/api/ws`.
//!
//! Each open spawns a writer task (outbound channel → socket) and a reader
//! task (socket → inbound channel). Dropping the outbound sender closes the
//! socket; a socket close or error ends the inbound stream. Text messages are
//! accepted as JSON envelopes for servers that speak the lighter format.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{Connector, Link, TransportError};

pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(&self, token: &str) -> Result<Link, TransportError> {
        let url = ws_url(&self.base_url, token)?;
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<frames::Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<frames::Frame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = frames::encode_frame(&frame);
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    warn!(error = %e, "ws: send failed");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("ws: writer stopped");
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let decoded = match msg {
                    Ok(Message::Binary(bytes)) => frames::decode_frame(&bytes),
                    Ok(Message::Text(text)) => frames::decode_text(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "ws: read failed");
                        break;
                    }
                };
                match decoded {
                    Ok(frame) => {
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "ws: dropping undecodable message"),
                }
            }
            debug!("ws: reader stopped");
        });

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}

/// Convert an http(s) base URL into the ticketed websocket URL.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] for a base URL that is not http(s).
pub fn ws_url(base_url: &str, ticket: &str) -> Result<String, TransportError> {
    let trimmed = base_url.trim_end_matches('/');

    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws?ticket={ticket}"));
    }
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws?ticket={ticket}"));
    }

    Err(TransportError::Connect(format!("invalid base URL '{base_url}'")))
}
