//! Duplex connection to the realtime service

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::ClientEvent;
use crate::{Error, Result};

/// Opens connections to the remote service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// One open duplex connection
#[async_trait]
pub trait Connection: Send {
    /// Send an event
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] if the connection is gone
    async fn send(&mut self, event: &ClientEvent) -> Result<()>;

    /// Next inbound text message, or `None` once the remote closed
    ///
    /// # Errors
    ///
    /// Returns error if the connection failed
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Keepalive
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection
    async fn close(&mut self);
}

/// WebSocket connector for the `OpenAI` realtime endpoint
pub struct RealtimeConnector {
    url: String,
    api_key: SecretString,
}

impl RealtimeConnector {
    /// Connect to `url` (model included as a query parameter) with `api_key`
    #[must_use]
    pub const fn new(url: String, api_key: SecretString) -> Self {
        Self { url, api_key }
    }
}

#[async_trait]
impl Connector for RealtimeConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut request = self.url.as_str().into_client_request()?;

        let bearer = format!("Bearer {}", self.api_key.expose_secret());
        let auth = HeaderValue::from_str(&bearer)
            .map_err(|e| Error::Config(format!("invalid api key header: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        tracing::info!(status = %response.status(), "realtime connection open");

        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(frame = ?frame, "realtime connection closed by remote");
                    return Ok(None);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    tracing::debug!(len = bytes.len(), "ignoring binary message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::ConnectionLost(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "error closing realtime connection");
        }
    }
}
