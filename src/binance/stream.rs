// =============================================================================
// Upstream stream client — combined-stream WebSocket with framed reads
// =============================================================================
//
// A client owns a connection name (for logging) and a set of stream topics.
// `connect` retries forever with a one second sleep; `next` yields one framed
// message and surfaces connection loss as an error so the owning dispatcher
// can recreate the client.
// =============================================================================

use anyhow::{bail, Result};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

const STREAM_ENDPOINT: &str = "wss://stream.binance.com:9443";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct StreamClient {
    name: String,
    streams: Vec<String>,
    ws: Option<WsStream>,
}

impl StreamClient {
    pub fn new(name: impl Into<String>, streams: Vec<String>) -> Self {
        Self {
            name: name.into(),
            streams,
            ws: None,
        }
    }

    /// Combined-stream URL for this client's topics.
    fn url(&self) -> String {
        format!("{STREAM_ENDPOINT}/stream?streams={}", self.streams.join("/"))
    }

    /// Connect, retrying forever with a one second sleep between attempts.
    pub async fn connect(&mut self) {
        let url = self.url();
        loop {
            match connect_async(&url).await {
                Ok((ws, _response)) => {
                    info!(stream = %self.name, "connected to upstream stream");
                    self.ws = Some(ws);
                    return;
                }
                Err(e) => {
                    info!(stream = %self.name, error = %e, "failed to connect, retrying");
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Read the next data frame. Control frames are skipped (tungstenite
    /// answers pings internally). Any connection loss surfaces as an error.
    pub async fn next(&mut self) -> Result<Vec<u8>> {
        let ws = match self.ws.as_mut() {
            Some(ws) => ws,
            None => bail!("stream [{}] is not connected", self.name),
        };

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    warn!(stream = %self.name, frame = ?frame, "upstream sent close frame");
                    self.ws = None;
                    bail!("stream [{}] closed by upstream", self.name);
                }
                Some(Err(e)) => {
                    self.ws = None;
                    return Err(e.into());
                }
                None => {
                    self.ws = None;
                    bail!("stream [{}] ended", self.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_url_joins_topics() {
        let client = StreamClient::new(
            "binance.trade",
            vec!["btcusdt@aggTrade".to_string(), "ethusdt@aggTrade".to_string()],
        );
        assert_eq!(
            client.url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
    }

    #[tokio::test]
    async fn next_without_connect_is_error() {
        let mut client = StreamClient::new("binance.ticker", vec!["!ticker@arr".to_string()]);
        assert!(client.next().await.is_err());
    }
}
