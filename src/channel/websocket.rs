//! WebSocket transport.
//!
//! Thin adapter from a `tokio-tungstenite` stream to [`FrameSink`] /
//! [`FrameSource`]. UTF-8 payloads go out as text frames, anything else (for
//! example the output of a compression stage) as binary frames. Tungstenite
//! already reassembles continuation frames, so every data frame read here is a
//! whole message.
//!
//! Use [`connect`] on the client side and [`accept`] for a stream the host has
//! already accepted (or upgraded). [`split`] wraps any existing stream.

// Rust guideline compliant 2026-02

use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChannelError, CloseStatus, FrameSink, FrameSource, TransportFrame};

/// Client-side stream type returned by [`connect`].
pub type ClientStream = MaybeTlsStream<tokio::net::TcpStream>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

/// Split an established WebSocket stream into transport halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (WebSocketSink<S>, WebSocketSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (WebSocketSink { sink }, WebSocketSource { stream })
}

/// Connect to a `ws://` or `wss://` URL.
pub async fn connect(
    url: &str,
) -> Result<(WebSocketSink<ClientStream>, WebSocketSource<ClientStream>), ChannelError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ChannelError::ConnectionFailed(format!("{url}: {e}")))?;
    log::debug!("[Channel] websocket connected to {url}");
    Ok(split(ws))
}

/// Perform the server side of the WebSocket handshake on an accepted stream.
pub async fn accept<S>(stream: S) -> Result<(WebSocketSink<S>, WebSocketSource<S>), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ChannelError::ConnectionFailed(format!("handshake failed: {e}")))?;
    Ok(split(ws))
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let frame = match String::from_utf8(payload) {
            Ok(text) => tungstenite::Message::Text(text),
            Err(e) => tungstenite::Message::Binary(e.into_bytes()),
        };
        self.sink
            .send(frame)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, status: CloseStatus, reason: &str) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: Cow::Owned(reason.to_string()),
        };
        match self.sink.send(tungstenite::Message::Close(Some(frame))).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(ChannelError::SendFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<TransportFrame, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(TransportFrame::complete(text.into_bytes())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(TransportFrame::complete(data)));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        log::debug!(
                            "[Channel] websocket closed by peer: {} {}",
                            u16::from(frame.code),
                            frame.reason
                        );
                    }
                    return None;
                }
                // Tungstenite answers pings itself; raw frames never surface on read.
                Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                ) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn test_text_payload_roundtrip() {
        let (client, server) = ws_pair().await;
        let (mut client_sink, _client_source) = split(client);
        let (_server_sink, mut server_source) = split(server);

        client_sink.send_frame(b"{\"hello\":1}".to_vec()).await.unwrap();
        let frame = server_source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload, b"{\"hello\":1}");
        assert!(frame.end_of_message);
    }

    #[tokio::test]
    async fn test_binary_payload_roundtrip() {
        let (client, server) = ws_pair().await;
        let (mut client_sink, _client_source) = split(client);
        let (_server_sink, mut server_source) = split(server);

        client_sink.send_frame(vec![0x1f, 0x8b, 0xff]).await.unwrap();
        let frame = server_source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.payload, vec![0x1f, 0x8b, 0xff]);
    }

    #[tokio::test]
    async fn test_close_ends_peer_source() {
        let (client, server) = ws_pair().await;
        let (mut client_sink, _client_source) = split(client);
        let (_server_sink, mut server_source) = split(server);

        client_sink.close(CloseStatus::Normal, "bye").await.unwrap();
        assert!(server_source.next_frame().await.is_none());
    }
}
