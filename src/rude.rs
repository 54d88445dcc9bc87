//! Per-sender rate accounting and rude verdicts.
//!
//! Every inbound message registers a receive timestamp against its sender's
//! address. A sender whose count within the trailing one-second window
//! exceeds the configured rate is "rude" until the window drains; rude
//! senders get no new connections accepted and may have existing ones torn
//! down.
//!
//! With no rate configured (the default) nobody is ever rude.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::Address;

/// Sliding window over which receive timestamps are counted.
const RATE_WINDOW: Duration = Duration::from_millis(1000);

/// SECURITY: Bounds the accounting table itself; an attacker cycling source
/// addresses evicts old accounting instead of growing memory.
const MAX_TRACKED_SENDERS: usize = 10_000;

pub struct RudeList {
    senders: LruCache<Address, VecDeque<Instant>>,
    max_message_rate: Option<u32>,
}

impl RudeList {
    pub fn new(max_message_rate: Option<u32>) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_SENDERS).expect("cap is non-zero");
        Self {
            senders: LruCache::new(cap),
            max_message_rate,
        }
    }

    /// Record one receive event for `address`.
    pub fn register(&mut self, address: &Address) {
        self.register_at(address, Instant::now());
    }

    fn register_at(&mut self, address: &Address, at: Instant) {
        if self.max_message_rate.is_none() {
            return;
        }
        let timestamps = self
            .senders
            .get_or_insert_mut(address.clone(), VecDeque::new);
        timestamps.push_back(at);
    }

    /// Whether `address` currently exceeds the configured rate.
    pub fn is_rude(&mut self, address: &Address) -> bool {
        self.is_rude_at(address, Instant::now())
    }

    fn is_rude_at(&mut self, address: &Address, now: Instant) -> bool {
        let Some(max_rate) = self.max_message_rate else {
            return false;
        };
        let Some(timestamps) = self.senders.get_mut(address) else {
            return false;
        };
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len() > max_rate as usize
    }
}
