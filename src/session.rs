//! Per-connection broker session: the protocol state machine.
//!
//! One session runs per accepted connection. A reader loop drives decoded
//! frames through validation and dispatch; all writes (replies, fanned-out
//! MESSAGEs from other sessions, heartbeats) go through the session's
//! outbound channel into a dedicated writer task, so the wire order of a
//! subscriber's messages is exactly their enqueue order.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{StompCodec, StompItem};
use crate::error::{Result, StompError};
use crate::frame::{headers, AckMode, Frame};
use crate::heartbeat::{self, Heartbeater};
use crate::registry::SubscriptionRegistry;
use crate::transaction::TxStore;
use crate::transport;
use crate::validator::{self, Command, FrameSource};

/// Value of the `server` header in CONNECTED frames.
const SERVER_ID: &str = concat!("tungsten-stomp/", env!("CARGO_PKG_VERSION"));

/// Authentication hook invoked with the CONNECT frame's login and passcode.
pub type LoginFn =
    Arc<dyn Fn(&str, &str) -> std::result::Result<(), String> + Send + Sync>;

/// Broker collaborators shared by every session.
pub(crate) struct SessionContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub transactions: Arc<TxStore>,
    pub heartbeater: Arc<Heartbeater>,
    pub login_fn: Option<LoginFn>,
    /// Broker heart-beat policy, pre-negotiation (milliseconds).
    pub hb_send_ms: u64,
    pub hb_recv_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Connected,
    Closed,
}

struct Session {
    session_id: String,
    state: SessionState,
    outbound: mpsc::Sender<StompItem>,
    ctx: Arc<SessionContext>,
}

/// Run a session to completion over any byte-stream connection.
pub(crate) async fn run_session<S>(stream: S, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, StompCodec::new());
    let (sink, mut frames) = framed.split();
    let (outbound, outbound_rx) = mpsc::channel::<StompItem>(32);
    let writer = tokio::spawn(transport::write_loop(sink, outbound_rx));

    let mut session = Session {
        session_id: Uuid::new_v4().to_string(),
        state: SessionState::New,
        outbound,
        ctx,
    };
    debug!(session = %session.session_id, "session started");

    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(StompItem::Heartbeat) => continue,
            Ok(StompItem::Frame(frame)) => frame,
            Err(err) => {
                let _ = session.send_error(&err, "frame decoding failed").await;
                break;
            }
        };
        let command = match validator::validate(&frame, FrameSource::Client) {
            Ok(command) => command,
            Err(err) => {
                let detail = format!("frame validation failed:\n{frame}");
                let _ = session.send_error(&err, &detail).await;
                break;
            }
        };
        if let Err(err) = session.dispatch(command, frame).await {
            warn!(session = %session.session_id, error = %err, "closing session");
            let _ = session.send_error(&err, "request failed").await;
            break;
        }
        if session.state == SessionState::Closed {
            break;
        }
    }

    session.cleanup().await;
    drop(session);
    // the writer drains once every sender (session, registry entries,
    // heartbeat task) is gone, flushing any parting ERROR or RECEIPT
    let _ = writer.await;
}

impl Session {
    async fn dispatch(&mut self, command: Command, frame: Frame) -> Result<()> {
        if self.state == SessionState::New
            && !matches!(command, Command::Connect | Command::Stomp)
        {
            return Err(StompError::BrokerState(format!(
                "'{command}' before CONNECT"
            )));
        }

        match command {
            Command::Connect | Command::Stomp => self.handle_connect(frame).await,
            Command::Send => {
                let tx_id = frame
                    .get_header(headers::TRANSACTION)
                    .unwrap_or_default()
                    .to_string();
                if tx_id.is_empty() {
                    self.ctx.registry.publish(&frame, "").await
                } else {
                    self.ctx.transactions.append(&tx_id, frame).await
                }
            }
            Command::Subscribe => {
                let ack_mode = match frame.get_header(headers::ACK) {
                    Some(value) => AckMode::parse(value)?,
                    None => AckMode::default(),
                };
                // destination and id presence guaranteed by validation
                let destination = frame.get_header(headers::DESTINATION).unwrap_or_default();
                let sub_id = frame.get_header(headers::ID).unwrap_or_default();
                self.ctx
                    .registry
                    .add(
                        destination,
                        sub_id,
                        ack_mode,
                        &self.session_id,
                        self.outbound.clone(),
                    )
                    .await
            }
            Command::Unsubscribe => {
                let sub_id = frame.get_header(headers::ID).unwrap_or_default();
                self.ctx.registry.remove(sub_id).await
            }
            Command::Ack => {
                let token = frame.get_header(headers::ID).unwrap_or_default();
                self.ctx.registry.process_ack(token).await
            }
            Command::Nack => {
                let token = frame.get_header(headers::ID).unwrap_or_default();
                self.ctx.registry.process_nack(token).await
            }
            Command::Begin => {
                let tx_id = frame.get_header(headers::TRANSACTION).unwrap_or_default();
                self.ctx.transactions.begin(tx_id).await
            }
            Command::Commit => {
                let tx_id = frame
                    .get_header(headers::TRANSACTION)
                    .unwrap_or_default()
                    .to_string();
                let registry = self.ctx.registry.clone();
                self.ctx
                    .transactions
                    .for_each(&tx_id, |buffered| {
                        let registry = registry.clone();
                        let tx_id = tx_id.clone();
                        async move { registry.publish(&buffered, &tx_id).await }
                    })
                    .await?;
                self.ctx.transactions.drop_tx(&tx_id).await
            }
            Command::Abort => {
                let tx_id = frame.get_header(headers::TRANSACTION).unwrap_or_default();
                self.ctx.transactions.drop_tx(tx_id).await
            }
            Command::Disconnect => {
                self.ctx.registry.cleanup_session(&self.session_id).await;
                if let Some(receipt) = frame.get_header(headers::RECEIPT) {
                    let receipt = Frame::new(Command::Receipt.as_str())
                        .header(headers::RECEIPT_ID, receipt);
                    self.send_frame(receipt).await?;
                }
                self.state = SessionState::Closed;
                Ok(())
            }
            // server-originated commands never pass client-side validation
            Command::Connected | Command::Message | Command::Receipt | Command::Error => {
                Err(StompError::ProtocolFrame(format!(
                    "'{command}' is not a valid client command"
                )))
            }
        }
    }

    async fn handle_connect(&mut self, frame: Frame) -> Result<()> {
        if self.state == SessionState::Connected {
            return Err(StompError::BrokerState("already connected".into()));
        }

        if let Some(login_fn) = &self.ctx.login_fn {
            let login = frame.get_header(headers::LOGIN).unwrap_or_default();
            let passcode = frame.get_header(headers::PASSCODE).unwrap_or_default();
            if let Err(cause) = login_fn(login, passcode) {
                return Err(StompError::BrokerState(format!("login failed: {cause}")));
            }
        }

        let accepted = frame.get_header(headers::ACCEPT_VERSION).unwrap_or_default();
        if !accepted.split(',').any(|v| v.trim() == "1.2") {
            return Err(StompError::BrokerState(format!(
                "unsupported accept-version '{accepted}', need 1.2"
            )));
        }

        // only a present heart-beat header renegotiates; an omitted one
        // leaves the broker's configured cadence in force
        let (send_ms, recv_ms) = match frame.get_header(headers::HEART_BEAT) {
            Some(hb_value) => {
                let (client_send, client_recv) = heartbeat::parse_heartbeat(hb_value)?;
                heartbeat::negotiate(
                    self.ctx.hb_send_ms,
                    self.ctx.hb_recv_ms,
                    client_send,
                    client_recv,
                )
            }
            None => (self.ctx.hb_send_ms, self.ctx.hb_recv_ms),
        };

        let connected = Frame::new(Command::Connected.as_str())
            .header(headers::VERSION, "1.2")
            .header(headers::SESSION, &self.session_id)
            .header(headers::SERVER, SERVER_ID)
            .header(headers::HEART_BEAT, format!("{send_ms},{recv_ms}"));
        self.send_frame(connected).await?;

        if send_ms > 0 {
            self.ctx
                .heartbeater
                .register(
                    &self.session_id,
                    Duration::from_millis(send_ms),
                    self.outbound.clone(),
                )
                .await;
        }

        self.state = SessionState::Connected;
        debug!(session = %self.session_id, send_ms, recv_ms, "client connected");
        Ok(())
    }

    /// Validate and enqueue a server frame for this session's writer.
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        validator::validate(&frame, FrameSource::Server)?;
        self.outbound
            .send(StompItem::Frame(frame))
            .await
            .map_err(|_| {
                StompError::Network(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "session writer closed",
                ))
            })
    }

    /// Best-effort ERROR frame describing why the session is closing.
    async fn send_error(&self, err: &StompError, detail: &str) -> Result<()> {
        let frame = Frame::new(Command::Error.as_str())
            .header(headers::MESSAGE, err.to_string())
            .header(headers::CONTENT_TYPE, "text/plain")
            .header(headers::CONTENT_LENGTH, detail.len().to_string())
            .set_body(detail.as_bytes().to_vec());
        self.send_frame(frame).await
    }

    async fn cleanup(&self) {
        self.ctx.registry.cleanup_session(&self.session_id).await;
        self.ctx.heartbeater.deregister(&self.session_id).await;
        debug!(session = %self.session_id, "session ended");
    }
}
