//! STOMP client: the mirror-side state machine.
//!
//! A `Client` dials a broker, drives the CONNECT handshake, and consumes
//! server frames on a background reader task. Received MESSAGE frames are
//! surfaced to a user-supplied callback; the callback runs on the reader
//! task and must not block.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::Transport;
use crate::codec::{StompCodec, StompItem};
use crate::error::{Result, StompError};
use crate::frame::{headers, AckMode, Frame};
use crate::heartbeat::{self, Heartbeater};
use crate::subscription::{Subscription, Transaction};
use crate::transport;
use crate::validator::{self, Command, FrameSource};

/// `receipt` value the client attaches to its DISCONNECT; seeing it echoed
/// in a RECEIPT tells the reader the broker has said goodbye.
const DISCONNECT_RECEIPT_ID: &str = "BYE-BYE!";

/// A message as delivered to the user callback: all MESSAGE headers (STOMP
/// and custom) as a plain map, plus the payload.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// User-supplied callback invoked for each received MESSAGE.
pub type MessageHandler = Arc<dyn Fn(UserMessage) + Send + Sync>;

/// Client configuration.
#[derive(Default)]
pub struct ClientOpts {
    /// Value for the CONNECT `host` header. Default: the peer address.
    pub virtual_host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Heart-beat intervals offered to the broker, in milliseconds;
    /// 0 disables, negative clamps to 0.
    pub heartbeat_send_ms: i64,
    pub heartbeat_recv_ms: i64,
    pub message_handler: Option<MessageHandler>,
}

pub(crate) struct SubscriptionInfo {
    pub destination: String,
    pub ack_mode: AckMode,
}

pub(crate) struct ClientInner {
    outbound: mpsc::Sender<StompItem>,
    /// Session id assigned by the broker; `None` until CONNECTED arrives
    /// (and again after the connection ends).
    session: watch::Sender<Option<String>>,
    subscriptions: Mutex<HashMap<String, SubscriptionInfo>>,
    heartbeater: Heartbeater,
    virtual_host: String,
    login: Option<String>,
    passcode: Option<String>,
    hb_send_ms: u64,
    hb_recv_ms: u64,
    handler: Option<MessageHandler>,
}

/// Handle to a STOMP client connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Dial the broker over the chosen transport. The CONNECT handshake is
    /// a separate step; see [`Client::connect`].
    pub async fn new(
        transport: Transport,
        host: &str,
        port: &str,
        opts: ClientOpts,
    ) -> Result<Client> {
        match transport {
            Transport::Tcp => {
                let stream = transport::connect_tcp(host, port).await?;
                let peer = stream.peer_addr()?.to_string();
                Ok(Self::setup(stream, peer, opts))
            }
            Transport::Websocket => {
                let stream = transport::connect_ws(host, port).await?;
                Ok(Self::setup(stream, format!("{host}:{port}"), opts))
            }
        }
    }

    fn setup<S>(stream: S, peer: String, opts: ClientOpts) -> Client
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, StompCodec::new());
        let (sink, frames) = framed.split();
        let (outbound, outbound_rx) = mpsc::channel::<StompItem>(32);
        tokio::spawn(transport::write_loop(sink, outbound_rx));

        let (session, _) = watch::channel(None);
        let client = Client {
            inner: Arc::new(ClientInner {
                outbound,
                session,
                subscriptions: Mutex::new(HashMap::new()),
                heartbeater: Heartbeater::new(),
                virtual_host: opts.virtual_host.unwrap_or(peer),
                login: opts.login,
                passcode: opts.passcode,
                hb_send_ms: opts.heartbeat_send_ms.max(0) as u64,
                hb_recv_ms: opts.heartbeat_recv_ms.max(0) as u64,
                handler: opts.message_handler,
            }),
        };
        tokio::spawn(read_loop(frames, client.clone()));
        client
    }

    /// Send the CONNECT (or STOMP) frame opening the session.
    pub async fn connect(&self, use_stomp_verb: bool) -> Result<()> {
        let inner = &self.inner;
        let command = if use_stomp_verb {
            Command::Stomp
        } else {
            Command::Connect
        };
        let mut frame = Frame::new(command.as_str())
            .header(headers::ACCEPT_VERSION, "1.2")
            .header(headers::HOST, &inner.virtual_host);
        if let Some(login) = &inner.login {
            frame = frame
                .header(headers::LOGIN, login)
                .header(headers::PASSCODE, inner.passcode.as_deref().unwrap_or(""));
        }
        if inner.hb_send_ms != 0 || inner.hb_recv_ms != 0 {
            frame = frame.header(
                headers::HEART_BEAT,
                format!("{},{}", inner.hb_send_ms, inner.hb_recv_ms),
            );
        }
        self.send_frame(frame).await
    }

    /// Request an orderly disconnect; the broker's RECEIPT closes the
    /// connection from the reader side.
    pub async fn disconnect(&self) -> Result<()> {
        let frame = Frame::new(Command::Disconnect.as_str())
            .header(headers::RECEIPT, DISCONNECT_RECEIPT_ID);
        self.send_frame(frame).await
    }

    /// Publish `body` to `destination`.
    pub async fn send(
        &self,
        destination: &str,
        body: &[u8],
        content_type: &str,
        custom_headers: Vec<(String, String)>,
    ) -> Result<()> {
        let mut frame = Frame::new(Command::Send.as_str())
            .header(headers::DESTINATION, destination)
            .header(headers::CONTENT_LENGTH, body.len().to_string());
        if !content_type.is_empty() {
            frame = frame.header(headers::CONTENT_TYPE, content_type);
        }
        for (name, value) in custom_headers {
            frame = frame.header(name, value);
        }
        self.send_frame(frame.set_body(body.to_vec())).await
    }

    /// Subscribe to a destination. The returned handle unsubscribes.
    pub async fn subscribe(&self, destination: &str, ack_mode: AckMode) -> Result<Subscription> {
        let sub_id = Uuid::new_v4().to_string();
        let frame = Frame::new(Command::Subscribe.as_str())
            .header(headers::ID, &sub_id)
            .header(headers::DESTINATION, destination)
            .header(headers::ACK, ack_mode.as_str());
        self.send_frame(frame).await?;
        self.inner.subscriptions.lock().await.insert(
            sub_id.clone(),
            SubscriptionInfo {
                destination: destination.to_string(),
                ack_mode,
            },
        );
        Ok(Subscription::new(
            self.clone(),
            sub_id,
            destination.to_string(),
            ack_mode,
        ))
    }

    /// Begin a broker-side transaction with a fresh id.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let tx_id = Uuid::new_v4().to_string();
        let frame =
            Frame::new(Command::Begin.as_str()).header(headers::TRANSACTION, &tx_id);
        self.send_frame(frame).await?;
        Ok(Transaction::new(self.clone(), tx_id))
    }

    /// The broker-assigned session id, once CONNECTED has been processed.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.borrow().clone()
    }

    /// Wait until the CONNECT handshake has completed.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut session = self.inner.session.subscribe();
        session
            .wait_for(|sid| sid.is_some())
            .await
            .map_err(|_| StompError::ClientState("connection closed before CONNECTED".into()))?;
        Ok(())
    }

    pub(crate) async fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        let frame = Frame::new(Command::Unsubscribe.as_str()).header(headers::ID, sub_id);
        self.send_frame(frame).await?;
        if let Some(info) = self.inner.subscriptions.lock().await.remove(sub_id) {
            debug!(sub_id, destination = %info.destination, "unsubscribed");
        }
        Ok(())
    }

    /// Validate and enqueue a client frame for the writer task.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        validator::validate(&frame, FrameSource::Client)?;
        self.inner
            .outbound
            .send(StompItem::Frame(frame))
            .await
            .map_err(|_| {
                StompError::Network(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection writer closed",
                ))
            })
    }

    async fn send_ack(&self, token: &str, tx_id: Option<&str>) -> Result<()> {
        let mut frame = Frame::new(Command::Ack.as_str()).header(headers::ID, token);
        if let Some(tx_id) = tx_id {
            frame = frame.header(headers::TRANSACTION, tx_id);
        }
        self.send_frame(frame).await
    }

    async fn handle_connected(&self, frame: &Frame) -> Result<()> {
        let Some(session_id) = frame.get_header(headers::SESSION) else {
            return Err(StompError::ClientState(
                "missing session id in CONNECTED".into(),
            ));
        };
        // a CONNECTED without a heart-beat header keeps the client's own
        // configured cadence; only a present header renegotiates
        let (send_ms, recv_ms) = match frame.get_header(headers::HEART_BEAT) {
            Some(hb_value) => {
                let (broker_send, broker_recv) = heartbeat::parse_heartbeat(hb_value)?;
                heartbeat::negotiate(
                    self.inner.hb_send_ms,
                    self.inner.hb_recv_ms,
                    broker_send,
                    broker_recv,
                )
            }
            None => (self.inner.hb_send_ms, self.inner.hb_recv_ms),
        };
        debug!(session = session_id, send_ms, recv_ms, "heartbeats negotiated");
        if send_ms > 0 {
            self.inner
                .heartbeater
                .register(
                    session_id,
                    Duration::from_millis(send_ms),
                    self.inner.outbound.clone(),
                )
                .await;
        }
        self.inner.session.send_replace(Some(session_id.to_string()));
        Ok(())
    }

    async fn handle_message(&self, frame: &Frame) -> Result<()> {
        if let Some(handler) = &self.inner.handler {
            let mut message_headers = HashMap::new();
            for (name, value) in &frame.headers {
                message_headers
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
            handler(UserMessage {
                headers: message_headers,
                body: frame.body.clone(),
            });
        }

        let Some(ack_token) = frame.get_header(headers::ACK) else {
            return Ok(());
        };
        let sub_id = frame.get_header(headers::SUBSCRIPTION).unwrap_or_default();
        let ack_mode = {
            let subscriptions = self.inner.subscriptions.lock().await;
            match subscriptions.get(sub_id) {
                Some(info) => info.ack_mode,
                None => {
                    debug!(sub_id, "MESSAGE for unknown subscription, not acking");
                    return Ok(());
                }
            }
        };
        match ack_mode {
            AckMode::Auto => Ok(()),
            // acks could be batched for cumulative mode; acking each
            // message is equally valid and keeps the path uniform
            AckMode::Client | AckMode::ClientIndividual => {
                self.send_ack(ack_token, frame.get_header(headers::TRANSACTION))
                    .await
            }
        }
    }

    /// Returns `false` when the connection should close.
    async fn handle_frame(&self, command: Command, frame: Frame) -> Result<bool> {
        match command {
            Command::Connected => {
                self.handle_connected(&frame).await?;
                Ok(true)
            }
            Command::Message => {
                self.handle_message(&frame).await?;
                Ok(true)
            }
            Command::Receipt => {
                Ok(frame.get_header(headers::RECEIPT_ID) != Some(DISCONNECT_RECEIPT_ID))
            }
            Command::Error => {
                warn!(
                    message = frame.get_header(headers::MESSAGE).unwrap_or_default(),
                    body = %String::from_utf8_lossy(&frame.body),
                    "received ERROR frame"
                );
                let _ = self.disconnect().await;
                Ok(true)
            }
            _ => Err(StompError::ClientState(format!(
                "unexpected '{command}' from broker"
            ))),
        }
    }
}

async fn read_loop<S>(mut frames: SplitStream<Framed<S, StompCodec>>, client: Client)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(StompItem::Heartbeat) => continue,
            Ok(StompItem::Frame(frame)) => frame,
            Err(err) => {
                warn!(error = %err, "dropping connection on decode error");
                break;
            }
        };
        let command = match validator::validate(&frame, FrameSource::Server) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "dropping connection on invalid server frame");
                break;
            }
        };
        match client.handle_frame(command, frame).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                warn!(error = %err, "dropping connection");
                break;
            }
        }
    }

    if let Some(session_id) = client.session_id() {
        client.inner.heartbeater.deregister(&session_id).await;
    }
    client.inner.session.send_replace(None);
    debug!("client connection closed");
}
