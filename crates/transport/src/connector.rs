//! The transport seam: dialing a collection endpoint and pumping text
//! frames, abstracted so the channel logic is independent of the socket
//! implementation.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Dials a collection endpoint.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<Self::Conn>> + Send;
}

/// One established connection, split into independently owned halves so the
/// writer and reader loops never contend on a lock.
pub trait Connection: Send + 'static {
    type Sender: ConnectionSender;
    type Receiver: ConnectionReceiver;

    fn split(self) -> (Self::Sender, Self::Receiver);
}

pub trait ConnectionSender: Send + 'static {
    fn send(
        &mut self,
        text: String,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;

    /// Close the connection with a normal-closure signal. Best effort.
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

pub trait ConnectionReceiver: Send + 'static {
    /// Next text payload; `Ok(None)` on clean close.
    fn recv(
        &mut self,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<String>>> + Send;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector speaking WebSocket via `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsConnection {
    ws: WsStream,
}

pub struct WsSender {
    sink: SplitSink<WsStream, Message>,
}

pub struct WsReceiver {
    stream: SplitStream<WsStream>,
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &str) -> anyhow::Result<WsConnection> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        tracing::debug!(url, "WebSocket handshake complete");
        Ok(WsConnection { ws })
    }
}

impl Connection for WsConnection {
    type Sender = WsSender;
    type Receiver = WsReceiver;

    fn split(self) -> (WsSender, WsReceiver) {
        let (sink, stream) = self.ws.split();
        (WsSender { sink }, WsReceiver { stream })
    }
}

impl ConnectionSender for WsSender {
    async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "close frame not delivered");
        }
        let _ = self.sink.close().await;
    }
}

impl ConnectionReceiver for WsReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8(data.into())?));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // transport ping/pong/frame
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
