//! WebSocket transport implementation using tokio-tungstenite
//!
//! The handshake request carries the auth credential in an `Auth` header and
//! the protocol version in a `Wstun-Version` header. An HTTP 400/401/403
//! answer from the server is a fatal authentication rejection; every other
//! failure is transient and retried by the supervisor.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use wstun_proto::PROTOCOL_VERSION;
use wstun_transport::{
    BoxSink, BoxSource, ConnectError, Connector, TransportError, TransportSink, TransportSource,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for the persistent tunnel connection
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        server: &str,
        auth: &str,
    ) -> Result<(BoxSink, BoxSource), ConnectError> {
        let url = Url::parse(server)
            .map_err(|e| ConnectError::Transient(format!("invalid server url: {}", e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConnectError::Transient(format!(
                "unsupported scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }

        let mut request = server
            .into_client_request()
            .map_err(|e| ConnectError::Transient(format!("invalid handshake request: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert(
            "Auth",
            HeaderValue::from_str(auth)
                .map_err(|e| ConnectError::Transient(format!("invalid auth credential: {}", e)))?,
        );
        headers.insert("Wstun-Version", HeaderValue::from(PROTOCOL_VERSION));

        debug!("connecting to {}", server);

        let (ws, _response) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                if matches!(status, 400 | 401 | 403) {
                    return Err(ConnectError::AuthRejected { status });
                }
                return Err(ConnectError::Transient(format!(
                    "handshake rejected with status {}",
                    status
                )));
            }
            Err(e) => {
                return Err(ConnectError::Transient(format!(
                    "websocket handshake failed: {}",
                    e
                )));
            }
        };

        info!("websocket connection established to {}", server);

        let (sink, source) = ws.split();
        Ok((
            Box::new(WebSocketSink { inner: sink }),
            Box::new(WebSocketSource { inner: source }),
        ))
    }
}

#[derive(Debug)]
struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(map_ws_error)
    }
}

#[derive(Debug)]
struct WebSocketSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl TransportSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(frame))) => {
                    debug!("websocket close received: {:?}", frame);
                    return Ok(None);
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    warn!("ignoring non-binary websocket message: {:?}", other);
                    continue;
                }
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Ok(None),
            }
        }
    }
}

fn map_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::Other(other.to_string()),
    }
}
