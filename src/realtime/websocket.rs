//! Gateway WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct GatewaySocket {
    stream: WsStream,
}

/// Realtime endpoint with the auth token as `?token=` query parameter.
pub fn socket_url(base: &str, token: &str) -> Result<Url> {
    let mut url =
        Url::parse(base).with_context(|| format!("Invalid WebSocket URL: {}", base))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// URL safe to log: the token value is masked.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

impl GatewaySocket {
    /// Connect to the realtime endpoint.
    ///
    /// Auth is carried in the URL; nothing is sent after the upgrade.
    pub async fn connect(url: &Url) -> Result<Self> {
        tracing::info!("Connecting WebSocket to {}", redacted(url));

        let (stream, response) = connect_async(url.as_str())
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        tracing::debug!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg.to_string()))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next text frame, answering pings and skipping pongs.
    ///
    /// Returns `Ok(None)` when the peer closed the connection.
    pub async fn recv_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some proxies deliver JSON as binary frames.
                    match String::from_utf8(data) {
                        Ok(text) => return Ok(Some(text)),
                        Err(_) => tracing::debug!("WS binary frame (not UTF-8, ignored)"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Close the connection, ignoring errors from an already-dead socket.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_appends_token() {
        let url = socket_url("wss://socket.eldor.kz/api/ws", "a.b.c").unwrap();
        assert_eq!(url.as_str(), "wss://socket.eldor.kz/api/ws?token=a.b.c");
    }

    #[test]
    fn test_redacted_hides_token() {
        let url = socket_url("wss://socket.eldor.kz/api/ws?v=2", "secret").unwrap();
        let shown = redacted(&url);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("v=2"));
        assert!(shown.contains("token=***") || shown.contains("token=%2A%2A%2A"));
    }
}
