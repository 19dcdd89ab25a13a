//! Transport plumbing shared by the broker and the client.
//!
//! The core protocol machinery only ever sees `AsyncRead + AsyncWrite`
//! byte streams framed through [`StompCodec`]. This module supplies the
//! serialized write loop used on every connection, plus the WebSocket
//! adapter that presents a `tokio-tungstenite` stream as plain bytes.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::stream::{SplitSink, Stream};
use futures::{Sink, SinkExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::Message;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{StompCodec, StompItem};
use crate::error::{Result, StompError};

/// WebSocket subprotocol identifier for STOMP 1.2.
pub const WS_SUBPROTOCOL: &str = "v12.stomp";

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Drain a session's outbound channel into the connection sink.
///
/// All frame and heartbeat writes for one connection funnel through here,
/// which is what serializes them on the wire. Exhausting the write retries
/// abandons the connection; the read side notices the closed stream and
/// runs session cleanup.
pub(crate) async fn write_loop<S>(
    mut sink: SplitSink<Framed<S, StompCodec>, StompItem>,
    mut outbound: mpsc::Receiver<StompItem>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        if let Err(err) = send_with_retry(&mut sink, item).await {
            warn!(error = %err, "connection write failed, giving up");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Write one item, retrying transient failures with exponential backoff.
async fn send_with_retry<S>(
    sink: &mut SplitSink<Framed<S, StompCodec>, StompItem>,
    item: StompItem,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut delay = WRITE_BACKOFF;
    let mut attempt = 1;
    loop {
        match sink.send(item.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < WRITE_ATTEMPTS => {
                debug!(error = %err, attempt, "write failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Open a TCP connection to a broker.
pub(crate) async fn connect_tcp(host: &str, port: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(format!("{host}:{port}")).await?;
    Ok(stream)
}

/// Dial a broker over WebSocket, requesting the STOMP subprotocol.
pub(crate) async fn connect_ws(
    host: &str,
    port: &str,
) -> Result<WsByteStream<MaybeTlsStream<TcpStream>>> {
    use tungstenite::client::IntoClientRequest;

    let mut request = format!("ws://{host}:{port}")
        .into_client_request()
        .map_err(|err| StompError::InvalidArgument(format!("bad websocket address: {err}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));
    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| StompError::Network(ws_io_error(err)))?;
    Ok(WsByteStream::new(ws))
}

/// Accept a server-side WebSocket handshake, echoing the STOMP
/// subprotocol when the client offered it.
pub(crate) async fn accept_ws(stream: TcpStream) -> Result<WsByteStream<TcpStream>> {
    let negotiate = |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(',').any(|p| p.trim() == WS_SUBPROTOCOL))
            .unwrap_or(false);
        if offered {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_SUBPROTOCOL));
        }
        Ok::<_, ErrorResponse>(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, negotiate)
        .await
        .map_err(|err| StompError::Network(ws_io_error(err)))?;
    Ok(WsByteStream::new(ws))
}

/// `AsyncRead + AsyncWrite` view of a WebSocket connection.
///
/// STOMP frames ride inside text messages (binary when the body is not
/// UTF-8); incoming message payloads are surfaced as a plain byte stream so
/// the frame codec can rescan them without knowing about message borders.
#[derive(Debug)]
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = buf.remaining().min(self.read_buf.len());
                buf.put_slice(&self.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Text(text))) => {
                    self.read_buf.extend_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    self.read_buf.extend_from_slice(&data);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(err)) => return Poll::Ready(Err(ws_io_error(err))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_io_error)?;
        let message = match std::str::from_utf8(buf) {
            Ok(text) => Message::text(text),
            Err(_) => Message::binary(buf.to_vec()),
        };
        Pin::new(&mut self.inner)
            .start_send(message)
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_io_error)
    }
}
