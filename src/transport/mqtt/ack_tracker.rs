//! Ordered acknowledgment of QoS 1 deliveries
//!
//! The broker requires PUBACKs in the order the PUBLISH packets were received,
//! so completion is only legal for the oldest outstanding lock token. Tokens are
//! prefixed with the connection generation id; a reconnect invalidates every
//! token handed out before it.

use crate::error::{TransportError, TransportResult};
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingAck {
    lock_token: String,
    packet_id: u16,
}

/// FIFO of deliveries awaiting acknowledgment
#[derive(Debug)]
pub struct AckTracker {
    generation_id: String,
    next_sequence: u64,
    pending: VecDeque<PendingAck>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            generation_id: Self::new_generation_id(),
            next_sequence: 0,
            pending: VecDeque::new(),
        }
    }

    fn new_generation_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    /// Start a new connection generation. Outstanding entries are dropped; the
    /// broker redelivers them on the new connection.
    pub fn regenerate(&mut self) {
        self.generation_id = Self::new_generation_id();
        self.next_sequence = 0;
        self.pending.clear();
        debug!(generation_id = %self.generation_id, "Started new ack generation");
    }

    /// Record a delivery and return its lock token
    pub fn track(&mut self, packet_id: u16) -> String {
        self.next_sequence += 1;
        let lock_token = format!("{}{}", self.generation_id, self.next_sequence);
        self.pending.push_back(PendingAck {
            lock_token: lock_token.clone(),
            packet_id,
        });
        lock_token
    }

    /// Validate `lock_token` against the head of the queue without dequeuing it.
    ///
    /// Returns the packet id to acknowledge on the wire. The entry stays at the
    /// head until [`AckTracker::commit_head`] so a failed PUBACK can be retried.
    pub fn head_packet_id(&self, lock_token: &str) -> TransportResult<u16> {
        if !lock_token.starts_with(&self.generation_id) {
            return Err(TransportError::StaleOrInvalidToken {
                lock_token: lock_token.to_string(),
            });
        }

        let head = self.pending.front().ok_or(TransportError::NoPendingAcks)?;
        if head.lock_token != lock_token {
            return Err(TransportError::OutOfOrderCompletion {
                expected: head.lock_token.clone(),
                actual: lock_token.to_string(),
            });
        }
        Ok(head.packet_id)
    }

    /// Drop the head entry once its PUBACK has been written
    pub fn commit_head(&mut self) {
        self.pending.pop_front();
    }

    /// Validate `lock_token` against the head of the queue and dequeue it
    pub fn complete(&mut self, lock_token: &str) -> TransportResult<u16> {
        let packet_id = self.head_packet_id(lock_token)?;
        self.commit_head();
        Ok(packet_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
