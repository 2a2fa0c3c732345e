//! Delivery bookkeeping: receipts for delivered requests and the backlog of
//! packets waiting for their destination to connect.

use std::collections::VecDeque;

use ferrybus_core::{DeliveryReceipt, Fingerprint, Packet};

/// Receipts for requests that reached their destination but have not been
/// answered yet.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    receipts: Vec<DeliveryReceipt>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, receipt: DeliveryReceipt) {
        self.receipts.push(receipt);
    }

    /// Drop receipts for a transaction once its reply arrived
    pub fn remove_transaction(&mut self, transaction_id: &str) -> usize {
        let before = self.receipts.len();
        self.receipts
            .retain(|r| r.message.transaction_id != transaction_id);
        before - self.receipts.len()
    }

    /// Remove and return every receipt addressed to a terminated connection
    pub fn take_destined_to(&mut self, fingerprint: &Fingerprint) -> Vec<DeliveryReceipt> {
        let (gone, keep): (Vec<_>, Vec<_>) = self
            .receipts
            .drain(..)
            .partition(|r| &r.to == fingerprint);
        self.receipts = keep;
        gone
    }

    pub fn entries(&self) -> &[DeliveryReceipt] {
        &self.receipts
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }
}

/// A packet parked until its destination connects
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub resolved_destination: String,
    pub message: Packet,
}

/// Result of queueing into a [`Backlog`]
#[derive(Debug, PartialEq)]
pub enum Queued {
    Added,
    /// Same transaction already parked
    Duplicate,
    /// Backlog was full; the oldest entry was pushed out
    Evicted(Packet),
}

/// Bounded FIFO of undeliverable packets
#[derive(Debug)]
pub struct Backlog {
    queue: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, resolved_destination: String, message: Packet) -> Queued {
        if self
            .queue
            .iter()
            .any(|q| q.message.transaction_id == message.transaction_id)
        {
            return Queued::Duplicate;
        }

        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front().map(|q| q.message)
        } else {
            None
        };

        self.queue.push_back(QueuedMessage {
            resolved_destination,
            message,
        });

        match evicted {
            Some(old) => Queued::Evicted(old),
            None => Queued::Added,
        }
    }

    /// Remove and return, in queue order, everything parked for a destination
    pub fn take_for(&mut self, resolved_destination: &str) -> Vec<Packet> {
        let mut taken = Vec::new();
        self.queue.retain(|q| {
            if q.resolved_destination == resolved_destination {
                taken.push(q.message.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Distinct destinations with parked packets, first-queued first
    pub fn pending_destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for q in &self.queue {
            if !out.contains(&q.resolved_destination) {
                out.push(q.resolved_destination.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
