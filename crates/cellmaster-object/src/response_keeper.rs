//! Kept responses of identified mutations
//!
//! A client may tag a write with a mutation id. The response computed when
//! the write is first applied is remembered, and a retransmission with the
//! same id gets those bytes back instead of being executed again. The
//! keeper is part of the replicated state and of the snapshot.

use crate::proto::MutationId;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Bounded FIFO of responses.
#[derive(Debug)]
pub struct ResponseKeeper {
    capacity: usize,
    order: VecDeque<MutationId>,
    responses: HashMap<MutationId, Bytes>,
}

impl ResponseKeeper {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            responses: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.responses.clear();
    }

    pub fn find(&self, id: &MutationId) -> Option<Bytes> {
        self.responses.get(id).cloned()
    }

    /// Remember a response, evicting the oldest ones beyond capacity.
    pub fn keep(&mut self, id: MutationId, response: Bytes) {
        if self.capacity == 0 {
            return;
        }
        if self.responses.insert(id, response).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.responses.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Snapshot form, oldest first.
    pub fn save(&self) -> Vec<(MutationId, Vec<u8>)> {
        self.order
            .iter()
            .filter_map(|id| Some((*id, self.responses.get(id)?.to_vec())))
            .collect()
    }

    pub fn load(&mut self, entries: Vec<(MutationId, Vec<u8>)>) {
        self.clear();
        for (id, response) in entries {
            self.keep(id, Bytes::from(response));
        }
    }
}
