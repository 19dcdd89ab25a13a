//! Heart-beat parsing, negotiation, and the per-session emission scheduler.
//!
//! A `heart-beat: sx,sy` header advertises "I can send no more often than
//! every sx ms" and "I want to receive at least every sy ms". Each side
//! combines its own policy with the peer's advertisement; the effective
//! interval in a direction is zero (disabled) when either side opts out,
//! otherwise the larger of the two values.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::codec::StompItem;
use crate::error::{Result, StompError};

/// Parse a `heart-beat` header value: exactly two non-negative integers
/// separated by a comma.
pub fn parse_heartbeat(value: &str) -> Result<(u64, u64)> {
    let mut parts = value.split(',');
    let (Some(send), Some(recv), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(StompError::ProtocolFrame(format!(
            "invalid heart-beat header '{value}'"
        )));
    };
    let send = send.trim().parse::<u64>().map_err(|_| {
        StompError::ProtocolFrame(format!("invalid heart-beat send interval '{value}'"))
    })?;
    let recv = recv.trim().parse::<u64>().map_err(|_| {
        StompError::ProtocolFrame(format!("invalid heart-beat receive interval '{value}'"))
    })?;
    Ok((send, recv))
}

/// Effective interval for one direction: disabled when either side says 0,
/// otherwise the slower of the two cadences.
pub fn negotiated_interval(ours_ms: u64, theirs_ms: u64) -> u64 {
    if ours_ms == 0 || theirs_ms == 0 {
        0
    } else {
        ours_ms.max(theirs_ms)
    }
}

/// Negotiate both directions at once.
///
/// `local_send`/`local_recv` are this side's policy; `remote_send`/
/// `remote_recv` come from the peer's `heart-beat` header. Returns the
/// effective `(send, recv)` intervals in milliseconds for this side.
pub fn negotiate(
    local_send: u64,
    local_recv: u64,
    remote_send: u64,
    remote_recv: u64,
) -> (u64, u64) {
    (
        negotiated_interval(local_send, remote_recv),
        negotiated_interval(local_recv, remote_send),
    )
}

/// Periodic heartbeat emitter, one task per registered session.
///
/// Registration is tagged by session id so a terminating session can drop
/// its task in O(1). Emission goes through the session's outbound frame
/// channel, which serializes heartbeats with regular frame writes.
#[derive(Debug, Default)]
pub struct Heartbeater {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Heartbeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start emitting one heartbeat every `interval` on `outbound`,
    /// replacing any emitter already registered for this session.
    pub async fn register(
        &self,
        session_id: &str,
        interval: Duration,
        outbound: mpsc::Sender<StompItem>,
    ) {
        let id = session_id.to_string();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; the peer expects silence
            // until one full interval has passed
            ticker.tick().await;
            loop {
                ticker.tick().await;
                trace!(session = %task_id, "sending heartbeat");
                if outbound.send(StompItem::Heartbeat).await.is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.jobs.lock().await.insert(id, task) {
            old.abort();
        }
    }

    /// Stop and forget the emitter for `session_id`, if any.
    pub async fn deregister(&self, session_id: &str) {
        if let Some(job) = self.jobs.lock().await.remove(session_id) {
            job.abort();
        }
    }

    pub async fn is_registered(&self, session_id: &str) -> bool {
        self.jobs.lock().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_ticks_at_interval() {
        let hb = Heartbeater::new();
        let (tx, mut rx) = mpsc::channel(8);
        hb.register("sess-1", Duration::from_millis(20), tx).await;
        assert!(hb.is_registered("sess-1").await);

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("no heartbeat arrived");
        assert_eq!(first, Some(StompItem::Heartbeat));

        hb.deregister("sess-1").await;
        assert!(!hb.is_registered("sess-1").await);
    }

    #[tokio::test]
    async fn reregistering_replaces_previous_job() {
        let hb = Heartbeater::new();
        let (tx, _rx) = mpsc::channel(8);
        hb.register("sess-1", Duration::from_millis(10), tx.clone()).await;
        hb.register("sess-1", Duration::from_millis(10), tx).await;
        assert!(hb.is_registered("sess-1").await);
        hb.deregister("sess-1").await;
        assert!(!hb.is_registered("sess-1").await);
    }
}
