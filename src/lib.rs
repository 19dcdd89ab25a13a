//! STOMP 1.2 messaging over TCP and WebSocket.
//!
//! This crate provides both halves of the protocol: a [`Broker`] that
//! accepts connections, routes published messages to subscribers, and
//! buffers transactions; and a [`Client`] that connects, subscribes, and
//! publishes. Frames are scanned incrementally off the byte stream, so
//! arbitrarily fragmented input reassembles correctly.
//!
//! ```no_run
//! use tungsten_stomp::{Broker, BrokerOpts};
//!
//! # async fn run() -> tungsten_stomp::Result<()> {
//! let broker = Broker::start(BrokerOpts::default()).await?;
//! println!("listening on {}", broker.local_addr());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod registry;
pub mod session;
pub mod subscription;
pub mod transaction;
pub mod transport;
pub mod validator;

pub use broker::{Broker, BrokerOpts, Transport, DEFAULT_PORT};
pub use client::{Client, ClientOpts, MessageHandler, UserMessage};
pub use codec::{StompCodec, StompItem};
pub use error::{Result, StompError};
pub use frame::{AckMode, Frame};
pub use heartbeat::{negotiate, negotiated_interval, parse_heartbeat};
pub use session::LoginFn;
pub use subscription::{Subscription, Transaction as ClientTransaction};
pub use validator::{validate, Command, FrameSource};
