//! Open request/reply transactions

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use ferrybus_core::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, RouterError};

type Waiter = oneshot::Sender<Result<Value>>;

/// Transactions this context originated and is still waiting on.
///
/// Each entry is settled at most once: the first of reply, end or
/// termination removes it and later attempts are no-ops.
#[derive(Default)]
pub struct TransactionTable {
    open: DashMap<String, Waiter>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, transaction_id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.open.insert(transaction_id.to_string(), tx);
        PendingReply {
            transaction_id: transaction_id.to_string(),
            rx,
        }
    }

    /// Settle with an outcome. Returns `false` if the transaction was unknown.
    pub fn settle(&self, transaction_id: &str, outcome: Result<Value>) -> bool {
        match self.open.remove(transaction_id) {
            Some((_, tx)) => {
                if tx.send(outcome).is_err() {
                    debug!("Waiter for transaction {} already gone", transaction_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        self.open.contains_key(transaction_id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

/// Resolves with the reply to a request
#[derive(Debug)]
pub struct PendingReply {
    transaction_id: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RouterError::ReplyDropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_settle_once() {
        let table = TransactionTable::new();
        let pending = table.open("t1");
        assert!(table.contains("t1"));

        assert!(table.settle("t1", Ok(json!(2))));
        assert!(!table.settle("t1", Err(RouterError::TransactionEnded("t1".into()))));
        assert!(table.is_empty());

        assert_eq!(pending.await.unwrap(), json!(2));
    }

    #[test]
    fn test_settle_unknown() {
        let table = TransactionTable::new();
        assert!(!table.settle("missing", Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_dropped_waiter_resolves_error() {
        let table = TransactionTable::new();
        let pending = table.open("t2");
        drop(table);
        assert!(matches!(pending.await, Err(RouterError::ReplyDropped)));
    }
}
