use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use tokio::time::Instant;

use crate::message::Message;

/// Bounded, ordered set of messages awaiting a flush.
pub(crate) struct Batch {
    messages: Vec<Message>,
    ids: HashSet<String>,
    capacity: usize,
    opened_at: Option<Instant>,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
            opened_at: None,
        }
    }

    /// Append a message. Returns `false` when the batch is full or already
    /// holds a message with the same id.
    pub fn push(&mut self, message: Message) -> bool {
        if self.is_full() || self.ids.contains(&message.id) {
            return false;
        }

        if self.messages.is_empty() {
            self.opened_at = Some(Instant::now());
        }

        self.ids.insert(message.id.clone());
        self.messages.push(message);

        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Time since the oldest buffered message arrived.
    pub fn age(&self) -> Option<Duration> {
        self.opened_at.map(|opened| opened.elapsed())
    }

    /// Take every message out, in arrival order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.ids.clear();
        self.opened_at = None;

        std::mem::take(&mut self.messages)
    }
}

/// Fixed-size window of recently acknowledged message ids.
pub(crate) struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, id: &str) {
        if self.capacity == 0 || self.ids.contains(id) {
            return;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }

        self.order.push_back(id.to_owned());
        self.ids.insert(id.to_owned());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}
