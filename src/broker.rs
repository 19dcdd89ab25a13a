//! The broker: accept loop, per-session spawning, graceful shutdown.
//!
//! A `Broker` owns the subscription registry, the transaction store, and
//! the heartbeat scheduler, handing shared references to each session it
//! accepts. Shutdown stops accepting and waits for live sessions to drain;
//! it never breaks an open connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, StompError};
use crate::heartbeat::Heartbeater;
use crate::registry::SubscriptionRegistry;
use crate::session::{run_session, LoginFn, SessionContext};
use crate::transaction::TxStore;

/// Default STOMP listening port.
pub const DEFAULT_PORT: &str = "61613";

/// Underlying transport for broker and client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Websocket,
}

/// Broker configuration.
pub struct BrokerOpts {
    pub transport: Transport,
    /// Host or IP to bind. Default: localhost.
    pub host: String,
    /// Port to listen on. Default: 61613. "0" binds an ephemeral port.
    pub port: String,
    /// Authentication hook called on CONNECT when set.
    pub login_fn: Option<LoginFn>,
    /// Interval in milliseconds at which the broker is willing to send
    /// heartbeats; 0 disables, negative clamps to 0.
    pub heartbeat_send_ms: i64,
    /// Interval in milliseconds at which the broker is willing to receive
    /// heartbeats; 0 disables, negative clamps to 0.
    pub heartbeat_recv_ms: i64,
}

impl Default for BrokerOpts {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            host: "localhost".to_string(),
            port: DEFAULT_PORT.to_string(),
            login_fn: None,
            heartbeat_send_ms: 0,
            heartbeat_recv_ms: 0,
        }
    }
}

/// A running broker instance.
pub struct Broker {
    local_addr: SocketAddr,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl Broker {
    /// Bind the listener and start accepting sessions in the background.
    pub async fn start(opts: BrokerOpts) -> Result<Broker> {
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(SubscriptionRegistry::new()),
            transactions: Arc::new(TxStore::new()),
            heartbeater: Arc::new(Heartbeater::new()),
            login_fn: opts.login_fn,
            hb_send_ms: opts.heartbeat_send_ms.max(0) as u64,
            hb_recv_ms: opts.heartbeat_recv_ms.max(0) as u64,
        });

        let listener = TcpListener::bind(format!("{}:{}", opts.host, opts.port))
            .await
            .map_err(|err| {
                StompError::Network(std::io::Error::new(
                    err.kind(),
                    format!("listening on {}:{} failed: {err}", opts.host, opts.port),
                ))
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, transport = ?opts.transport, "broker listening");

        let shutdown = CancellationToken::new();
        let sessions = TaskTracker::new();
        tokio::spawn(accept_loop(
            listener,
            opts.transport,
            ctx.clone(),
            shutdown.clone(),
            sessions.clone(),
        ));

        Ok(Broker {
            local_addr,
            registry: ctx.registry.clone(),
            shutdown,
            sessions,
        })
    }

    /// Address the broker is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The broker's subscription registry, for introspection.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Stop accepting connections and wait for live sessions to finish.
    pub async fn shutdown(self) {
        info!("shutdown initiated");
        self.shutdown.cancel();
        self.sessions.close();
        self.sessions.wait().await;
        info!("all sessions drained");
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Transport,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, "connection accepted");
        let ctx = ctx.clone();
        match transport {
            Transport::Tcp => {
                sessions.spawn(run_session(stream, ctx));
            }
            Transport::Websocket => {
                sessions.spawn(async move {
                    match crate::transport::accept_ws(stream).await {
                        Ok(ws) => run_session(ws, ctx).await,
                        Err(err) => warn!(%peer, error = %err, "websocket handshake failed"),
                    }
                });
            }
        }
    }
}
