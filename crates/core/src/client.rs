use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{Message, Role};
use crate::status::ServerStats;
use crate::{Error, Result};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, WsMessage>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// What the coordinator answered to `register`.
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub assigned_id: Uuid,
    pub session_id: Uuid,
    pub server_stats: ServerStats,
}

/// Opens the socket and performs the `register` handshake.
pub(crate) async fn connect_and_register(
    server_url: &str,
    role: Role,
    session_id: Option<Uuid>,
) -> Result<(WsSink, WsSource, Registration)> {
    let (ws, _) = connect_async(server_url).await?;
    let (mut sink, mut source) = ws.split();

    send(&mut sink, &Message::Register { role, session_id }).await?;
    match recv(&mut source).await? {
        Some(Message::Registered {
            assigned_id,
            session_id,
            server_stats,
        }) => Ok((
            sink,
            source,
            Registration {
                assigned_id,
                session_id,
                server_stats,
            },
        )),
        Some(Message::Error { message }) => Err(Error::Protocol { message }),
        Some(other) => Err(Error::protocol(format!(
            "expected registered, got {}",
            other.kind()
        ))),
        None => Err(Error::Disconnected),
    }
}

pub(crate) async fn send(sink: &mut WsSink, message: &Message) -> Result<()> {
    sink.send(WsMessage::Text(message.encode()?)).await?;
    Ok(())
}

/// Next control message; `None` once the socket is closed. Binary frames
/// are not expected here.
pub(crate) async fn recv(source: &mut WsSource) -> Result<Option<Message>> {
    match recv_frame(source).await? {
        Some(Frame::Text(message)) => Ok(Some(message)),
        Some(Frame::Binary(_)) => Err(Error::protocol("unexpected binary frame")),
        None => Ok(None),
    }
}

pub(crate) enum Frame {
    Text(Message),
    Binary(Vec<u8>),
}

pub(crate) async fn recv_frame(source: &mut WsSource) -> Result<Option<Frame>> {
    loop {
        let Some(frame) = source.next().await else {
            return Ok(None);
        };
        match frame? {
            WsMessage::Text(text) => return Ok(Some(Frame::Text(Message::decode(&text)?))),
            WsMessage::Binary(bytes) => return Ok(Some(Frame::Binary(bytes))),
            WsMessage::Close(frame) => {
                debug!(event = "client.close_frame", frame = ?frame, "client.close_frame");
                return Ok(None);
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}
