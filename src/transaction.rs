//! Broker-side transaction buffering.
//!
//! SEND frames carrying a `transaction` header are held here, in arrival
//! order, until the owning client COMMITs (replay then drop) or ABORTs
//! (drop). Transactions are keyed by the client-chosen id; a STOMP
//! transaction lives within a single session, so the store only needs to be
//! safe under concurrent access to distinct ids.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;

use crate::error::{Result, StompError};
use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct TxStore {
    buffers: Mutex<HashMap<String, Vec<Frame>>>,
}

impl TxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a buffer for `tx_id`. An empty or already-known id is an error.
    pub async fn begin(&self, tx_id: &str) -> Result<()> {
        if tx_id.is_empty() {
            return Err(StompError::Transaction("missing transaction id".into()));
        }
        let mut buffers = self.buffers.lock().await;
        if buffers.contains_key(tx_id) {
            return Err(StompError::Transaction(format!(
                "transaction '{tx_id}' already begun"
            )));
        }
        buffers.insert(tx_id.to_string(), Vec::new());
        Ok(())
    }

    /// Append a buffered frame to an open transaction.
    pub async fn append(&self, tx_id: &str, frame: Frame) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        let Some(buffer) = buffers.get_mut(tx_id) else {
            return Err(StompError::Transaction(format!(
                "no such transaction '{tx_id}'"
            )));
        };
        buffer.push(frame);
        Ok(())
    }

    /// Run `f` over each buffered frame in insertion order, stopping at the
    /// first error. The buffer is left in place; a successful commit
    /// follows up with [`TxStore::drop_tx`].
    pub async fn for_each<F, Fut>(&self, tx_id: &str, mut f: F) -> Result<()>
    where
        F: FnMut(Frame) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let frames = {
            let buffers = self.buffers.lock().await;
            let Some(buffer) = buffers.get(tx_id) else {
                return Err(StompError::Transaction(format!(
                    "no such transaction '{tx_id}'"
                )));
            };
            buffer.clone()
        };
        for frame in frames {
            f(frame).await?;
        }
        Ok(())
    }

    /// Discard all state for `tx_id`.
    pub async fn drop_tx(&self, tx_id: &str) -> Result<()> {
        if self.buffers.lock().await.remove(tx_id).is_none() {
            return Err(StompError::Transaction(format!(
                "no such transaction '{tx_id}'"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn send_frame(body: &str) -> Frame {
        Frame::new("SEND")
            .header("destination", "/queue/a")
            .set_body(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn begin_rejects_empty_and_duplicate_ids() {
        let store = TxStore::new();
        assert!(store.begin("").await.is_err());
        store.begin("tx1").await.unwrap();
        assert!(matches!(
            store.begin("tx1").await,
            Err(StompError::Transaction(_))
        ));
    }

    #[tokio::test]
    async fn append_requires_open_transaction() {
        let store = TxStore::new();
        assert!(store.append("tx1", send_frame("a")).await.is_err());
        store.begin("tx1").await.unwrap();
        store.append("tx1", send_frame("a")).await.unwrap();
    }

    #[tokio::test]
    async fn for_each_preserves_insertion_order() {
        let store = TxStore::new();
        store.begin("tx1").await.unwrap();
        for body in ["first", "second", "third"] {
            store.append("tx1", send_frame(body)).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        store
            .for_each("tx1", |frame| {
                let seen = seen_in.clone();
                async move {
                    seen.lock().await.push(frame.body.clone());
                    Ok(())
                }
            })
            .await
            .unwrap();

        let order = seen.lock().await.clone();
        assert_eq!(order, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);

        // still present until explicitly dropped
        store.drop_tx("tx1").await.unwrap();
        assert!(store.drop_tx("tx1").await.is_err());
    }

    #[tokio::test]
    async fn for_each_short_circuits_on_error() {
        let store = TxStore::new();
        store.begin("tx1").await.unwrap();
        for body in ["a", "b", "c"] {
            store.append("tx1", send_frame(body)).await.unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let result = store
            .for_each("tx1", |_| {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                        Err(StompError::BrokerState("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
