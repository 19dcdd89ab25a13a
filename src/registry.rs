//! Destination-to-subscriber routing and per-subscription ack tracking.
//!
//! The registry keeps three inter-consistent mappings: destination to its
//! subscriptions, subscription id to destination, and session id to the
//! subscriptions it owns. Publishing fans a SEND out to every subscription
//! on the destination as freshly-stamped MESSAGE frames.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::StompItem;
use crate::error::{Result, StompError};
use crate::frame::{headers, AckMode, Frame};
use crate::validator::{self, Command, FrameSource};

/// Ack numbering state, guarded per subscription so fan-out to other
/// subscribers never contends on it.
#[derive(Debug, Default)]
struct AckWindow {
    next: u32,
    pending: RoaringBitmap,
}

/// One subscription as the broker sees it.
#[derive(Debug)]
pub(crate) struct Subscription {
    sub_id: String,
    destination: String,
    session_id: String,
    ack_mode: AckMode,
    /// Writer channel of the owning session; MESSAGE frames enqueue here.
    sender: mpsc::Sender<StompItem>,
    acks: Mutex<AckWindow>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    dest_to_subs: HashMap<String, HashMap<String, Arc<Subscription>>>,
    sub_to_dest: HashMap<String, String>,
    sess_to_subs: HashMap<String, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    dropped_no_subscriber: AtomicU64,
}

/// Broker-generated `ack` header value: `destination:sub-id:counter`.
pub(crate) fn format_ack_token(destination: &str, sub_id: &str, ack_num: u32) -> String {
    format!("{destination}:{sub_id}:{ack_num}")
}

/// Split an ack token back into its components. The destination may itself
/// contain colons, so the token is split from the right.
pub(crate) fn parse_ack_token(token: &str) -> Result<(String, String, u32)> {
    let mut parts = token.rsplitn(3, ':');
    let (Some(num), Some(sub_id), Some(destination)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(StompError::BrokerState(format!(
            "malformed ack token '{token}'"
        )));
    };
    let ack_num = num.parse::<u32>().map_err(|_| {
        StompError::BrokerState(format!("invalid ack number in token '{token}'"))
    })?;
    Ok((destination.to_string(), sub_id.to_string(), ack_num))
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Reusing a live subscription id is a
    /// protocol error.
    pub(crate) async fn add(
        &self,
        destination: &str,
        sub_id: &str,
        ack_mode: AckMode,
        session_id: &str,
        sender: mpsc::Sender<StompItem>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.sub_to_dest.contains_key(sub_id) {
            return Err(StompError::ProtocolFrame(format!(
                "subscription id '{sub_id}' already in use"
            )));
        }
        let entry = Arc::new(Subscription {
            sub_id: sub_id.to_string(),
            destination: destination.to_string(),
            session_id: session_id.to_string(),
            ack_mode,
            sender,
            acks: Mutex::new(AckWindow::default()),
        });
        inner
            .dest_to_subs
            .entry(destination.to_string())
            .or_default()
            .insert(sub_id.to_string(), entry);
        inner
            .sub_to_dest
            .insert(sub_id.to_string(), destination.to_string());
        inner
            .sess_to_subs
            .entry(session_id.to_string())
            .or_default()
            .insert(sub_id.to_string());
        Ok(())
    }

    /// Drop a subscription from all three mappings.
    pub(crate) async fn remove(&self, sub_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::remove_locked(&mut inner, sub_id)
    }

    fn remove_locked(inner: &mut RegistryInner, sub_id: &str) -> Result<()> {
        let Some(destination) = inner.sub_to_dest.remove(sub_id) else {
            return Err(StompError::BrokerState(format!(
                "no such subscription '{sub_id}' to unsubscribe"
            )));
        };
        let mut session_id = None;
        if let Some(bucket) = inner.dest_to_subs.get_mut(&destination) {
            if let Some(entry) = bucket.remove(sub_id) {
                session_id = Some(entry.session_id.clone());
            }
            if bucket.is_empty() {
                inner.dest_to_subs.remove(&destination);
            }
        }
        if let Some(session_id) = session_id {
            if let Some(subs) = inner.sess_to_subs.get_mut(&session_id) {
                subs.remove(sub_id);
                if subs.is_empty() {
                    inner.sess_to_subs.remove(&session_id);
                }
            }
        }
        Ok(())
    }

    /// Remove every subscription belonging to `session_id`. Unknown
    /// sessions are a no-op.
    pub(crate) async fn cleanup_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(sub_ids) = inner.sess_to_subs.remove(session_id) else {
            return;
        };
        for sub_id in sub_ids {
            // already gone from sess_to_subs; scrub the other two maps
            let _ = Self::remove_locked(&mut inner, &sub_id);
        }
    }

    /// Fan a SEND frame out to every subscription on its destination.
    ///
    /// Each subscriber receives a MESSAGE with a fresh message-id, its own
    /// subscription id and ack token, the sender's headers (lower-cased),
    /// and the body. `tx_id` is carried in a `transaction` header when
    /// non-empty. A destination with no subscribers drops the message and
    /// bumps a counter; a dead subscriber is skipped.
    pub(crate) async fn publish(&self, frame: &Frame, tx_id: &str) -> Result<()> {
        let Some(destination) = frame.get_header(headers::DESTINATION) else {
            return Err(StompError::ProtocolFrame(
                "SEND frame missing destination".into(),
            ));
        };

        let subs: Vec<Arc<Subscription>> = {
            let inner = self.inner.lock().await;
            inner
                .dest_to_subs
                .get(destination)
                .map(|bucket| bucket.values().cloned().collect())
                .unwrap_or_default()
        };

        if subs.is_empty() {
            self.dropped_no_subscriber.fetch_add(1, Ordering::Relaxed);
            debug!(destination, "no subscribers, message dropped");
            return Ok(());
        }

        for sub in subs {
            // holding the window lock across the enqueue keeps ack numbers
            // monotonic on this subscriber's wire
            let mut window = sub.acks.lock().await;
            let ack_num = window.next;
            let message = build_message(frame, destination, &sub, ack_num, tx_id);
            if let Err(err) = validator::validate(&message, FrameSource::Server) {
                warn!(sub_id = %sub.sub_id, error = %err, "dropping undeliverable message");
                continue;
            }
            if sub.sender.send(StompItem::Frame(message)).await.is_err() {
                warn!(sub_id = %sub.sub_id, session = %sub.session_id, "subscriber session gone");
                continue;
            }
            window.pending.insert(ack_num);
            window.next = window.next.wrapping_add(1);
        }
        Ok(())
    }

    /// Apply an incoming ACK to the subscription's pending window.
    ///
    /// `client` mode acknowledges cumulatively (everything up to and
    /// including the acked number); `client-individual` clears exactly one
    /// entry. An ACK for a subscription that has since gone away is
    /// tolerated.
    pub(crate) async fn process_ack(&self, token: &str) -> Result<()> {
        let (destination, sub_id, ack_num) = parse_ack_token(token)?;
        let sub = {
            let inner = self.inner.lock().await;
            inner
                .dest_to_subs
                .get(&destination)
                .and_then(|bucket| bucket.get(&sub_id))
                .cloned()
        };
        let Some(sub) = sub else {
            debug!(%destination, %sub_id, "ack for unknown subscription ignored");
            return Ok(());
        };
        let mut window = sub.acks.lock().await;
        match sub.ack_mode {
            AckMode::Client => {
                window.pending.remove_range(..=ack_num);
            }
            AckMode::ClientIndividual => {
                window.pending.remove(ack_num);
            }
            AckMode::Auto => {}
        }
        Ok(())
    }

    /// NACKs are parsed and accepted; no redelivery is attempted.
    pub(crate) async fn process_nack(&self, token: &str) -> Result<()> {
        let _ = parse_ack_token(token)?;
        Ok(())
    }

    /// Messages published to destinations nobody was subscribed to.
    pub fn dropped_no_subscriber(&self) -> u64 {
        self.dropped_no_subscriber.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions on a destination.
    pub async fn subscriber_count(&self, destination: &str) -> usize {
        self.inner
            .lock()
            .await
            .dest_to_subs
            .get(destination)
            .map_or(0, |bucket| bucket.len())
    }

    /// Whether a subscription id is currently registered.
    pub async fn has_subscription(&self, sub_id: &str) -> bool {
        self.inner.lock().await.sub_to_dest.contains_key(sub_id)
    }

    #[cfg(test)]
    async fn pending_acks(&self, sub_id: &str) -> Vec<u32> {
        let inner = self.inner.lock().await;
        let Some(destination) = inner.sub_to_dest.get(sub_id) else {
            return Vec::new();
        };
        let Some(sub) = inner
            .dest_to_subs
            .get(destination)
            .and_then(|bucket| bucket.get(sub_id))
        else {
            return Vec::new();
        };
        let acks = sub.acks.lock().await;
        let result = acks.pending.iter().collect();
        result
    }
}

fn build_message(
    frame: &Frame,
    destination: &str,
    sub: &Subscription,
    ack_num: u32,
    tx_id: &str,
) -> Frame {
    let mut message = Frame::new(Command::Message.as_str());
    for (name, value) in &frame.headers {
        let name = name.to_ascii_lowercase();
        if matches!(
            name.as_str(),
            headers::DESTINATION
                | headers::MESSAGE_ID
                | headers::SUBSCRIPTION
                | headers::ACK
                | headers::TRANSACTION
        ) {
            continue;
        }
        message = message.header(name, value.clone());
    }
    message = message
        .header(headers::DESTINATION, destination)
        .header(headers::MESSAGE_ID, Uuid::new_v4().to_string())
        .header(headers::SUBSCRIPTION, &sub.sub_id)
        .header(
            headers::ACK,
            format_ack_token(destination, &sub.sub_id, ack_num),
        );
    if !tx_id.is_empty() {
        message = message.header(headers::TRANSACTION, tx_id);
    }
    message.set_body(frame.body.clone())
}
