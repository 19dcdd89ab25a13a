//! `stompd` — run a STOMP 1.2 broker until interrupted.

use clap::Parser;
use tracing::info;
use tungsten_stomp::{Broker, BrokerOpts, StompError, Transport, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "stompd", version, about = "STOMP 1.2 message broker")]
struct Cli {
    /// Transport to serve: tcp or websocket
    #[arg(long, default_value = "tcp")]
    transport: String,

    /// Host or IP to bind
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    /// Broker heartbeat send interval in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    heartbeat_send_ms: i64,

    /// Broker heartbeat receive interval in milliseconds (0 disables)
    #[arg(long, default_value_t = 0)]
    heartbeat_recv_ms: i64,

    /// Log filter (e.g. info, debug, tungsten_stomp=trace)
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> tungsten_stomp::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .init();

    let transport = match cli.transport.as_str() {
        "tcp" => Transport::Tcp,
        "websocket" | "ws" => Transport::Websocket,
        other => {
            return Err(StompError::InvalidArgument(format!(
                "unknown transport '{other}', expected tcp or websocket"
            )));
        }
    };

    let broker = Broker::start(BrokerOpts {
        transport,
        host: cli.host,
        port: cli.port,
        login_fn: None,
        heartbeat_send_ms: cli.heartbeat_send_ms,
        heartbeat_recv_ms: cli.heartbeat_recv_ms,
    })
    .await?;

    wait_for_signal().await?;
    info!("signal received, shutting down");
    broker.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> tungsten_stomp::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> tungsten_stomp::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
