//! Requests sent on the current connection and still waiting for a reply
//!
//! The divvy protocol carries no request identifier: the n-th reply on a
//! connection answers the n-th request written to it. The ledger is therefore a
//! plain FIFO, and the only safe way to drop an entry from the middle is to
//! throw the whole connection away along with it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ClientError, Result};
use crate::protocol::Decision;

/// Completion handle for one request
pub type Completion = oneshot::Sender<Result<Decision>>;

/// A reply arrived while nothing was outstanding
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Reply received with no outstanding request")]
pub struct LedgerEmpty;

struct PendingEntry {
    seq: u64,
    completion: Completion,
    deadline: Instant,
}

impl PendingEntry {
    fn fulfill(self, result: Result<Decision>) {
        // The caller may have given up and dropped the receiver
        let _ = self.completion.send(result);
    }
}

#[derive(Default)]
pub struct Ledger {
    entries: VecDeque<PendingEntry>,
    /// Deadlines of outstanding entries. Sequences that have already been
    /// resolved are dropped lazily when they reach the top.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_seq: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a request that is about to be written, returning its position
    pub fn enqueue(&mut self, completion: Completion, deadline: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.push_back(PendingEntry {
            seq,
            completion,
            deadline,
        });
        self.deadlines.push(Reverse((deadline, seq)));
        seq
    }

    /// Hand a reply to the oldest outstanding request
    pub fn resolve_oldest(
        &mut self,
        result: Result<Decision>,
    ) -> std::result::Result<u64, LedgerEmpty> {
        let entry = self.entries.pop_front().ok_or(LedgerEmpty)?;
        let seq = entry.seq;
        entry.fulfill(result);

        if self.entries.is_empty() {
            self.deadlines.clear();
        }
        Ok(seq)
    }

    /// Fail every outstanding request, returning how many there were
    pub fn fail_all(&mut self, cause: ClientError) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.fulfill(Err(cause.clone()));
        }
        self.deadlines.clear();
        count
    }

    /// Fail every request whose deadline is not after `now` with
    /// [`ClientError::Timeout`], returning how many expired.
    ///
    /// Expired entries are removed wherever they sit in the queue, which breaks
    /// the positional pairing of the survivors with future replies. Callers
    /// must discard the connection whenever this returns a non-zero count.
    pub fn expire(&mut self, now: Instant) -> usize {
        if self.next_deadline().is_none_or(|deadline| deadline > now) {
            return 0;
        }

        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.deadline <= now {
                entry.fulfill(Err(ClientError::Timeout));
                expired += 1;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;

        self.deadlines = self
            .entries
            .iter()
            .map(|entry| Reverse((entry.deadline, entry.seq)))
            .collect();
        expired
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&mut self) -> Option<Instant> {
        let oldest = self.entries.front()?.seq;
        while let Some(Reverse((deadline, seq))) = self.deadlines.peek().copied() {
            if seq >= oldest {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        self.fail_all(ClientError::ClientClosed);
    }
}
