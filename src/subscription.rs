//! Client-side subscription and transaction handles.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::Client;
use crate::error::{Result, StompError};
use crate::frame::{headers, AckMode};
use crate::validator::Command;

/// A live subscription as tracked by the client.
///
/// Messages for the subscription arrive through the client's message
/// handler; this handle exists to identify and end the subscription.
pub struct Subscription {
    client: Client,
    sub_id: String,
    destination: String,
    ack_mode: AckMode,
}

impl Subscription {
    pub(crate) fn new(
        client: Client,
        sub_id: String,
        destination: String,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            client,
            sub_id,
            destination,
            ack_mode,
        }
    }

    pub fn id(&self) -> &str {
        &self.sub_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Tell the broker to stop delivering and forget this subscription.
    pub async fn unsubscribe(self) -> Result<()> {
        self.client.unsubscribe(&self.sub_id).await
    }
}

/// A client-initiated transaction.
///
/// Sends routed through the handle are buffered by the broker until
/// [`Transaction::commit`] replays them or [`Transaction::abort`] discards
/// them. A completed handle refuses further use.
pub struct Transaction {
    client: Client,
    tx_id: String,
    completed: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(client: Client, tx_id: String) -> Self {
        Self {
            client,
            tx_id,
            completed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.tx_id
    }

    fn check_open(&self) -> Result<()> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(StompError::ProtocolFrame(format!(
                "transaction '{}' already completed",
                self.tx_id
            )));
        }
        Ok(())
    }

    /// Publish within this transaction; delivery waits for commit.
    pub async fn send(
        &self,
        destination: &str,
        body: &[u8],
        content_type: &str,
        mut custom_headers: Vec<(String, String)>,
    ) -> Result<()> {
        self.check_open()?;
        custom_headers.push((headers::TRANSACTION.to_string(), self.tx_id.clone()));
        self.client
            .send(destination, body, content_type, custom_headers)
            .await
    }

    /// Atomically deliver everything sent in this transaction.
    pub async fn commit(&self) -> Result<()> {
        self.finish(Command::Commit).await
    }

    /// Discard everything sent in this transaction.
    pub async fn abort(&self) -> Result<()> {
        self.finish(Command::Abort).await
    }

    async fn finish(&self, command: Command) -> Result<()> {
        self.check_open()?;
        let frame = crate::frame::Frame::new(command.as_str())
            .header(headers::TRANSACTION, &self.tx_id);
        self.client.send_frame(frame).await?;
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
