//! Per-call replica selection.
//!
//! A [`Selector`] holds the resolved address view and hands out one address
//! per call. `Direct` always returns the same address; `RoundRobin` walks
//! the ordered set with a shared cursor, so concurrent callers still spread
//! evenly.

use crate::rpc::ReplicaAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection policy for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Direct,
    RoundRobin,
}

#[derive(Debug)]
pub enum Selector {
    /// The first resolved address, used for every call.
    Direct(Option<ReplicaAddr>),
    RoundRobin(RoundRobin),
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        match policy {
            SelectionPolicy::Direct => Selector::Direct(None),
            SelectionPolicy::RoundRobin => Selector::RoundRobin(RoundRobin::new(Vec::new())),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        match self {
            Selector::Direct(_) => SelectionPolicy::Direct,
            Selector::RoundRobin(_) => SelectionPolicy::RoundRobin,
        }
    }

    /// Address for the next call, or `None` if nothing is resolved.
    pub fn next(&self) -> Option<ReplicaAddr> {
        match self {
            Selector::Direct(addr) => addr.clone(),
            Selector::RoundRobin(rr) => rr.next(),
        }
    }

    /// Replace the address view. Returns `true` if it changed.
    pub fn update(&mut self, mut addrs: Vec<ReplicaAddr>) -> bool {
        match self {
            Selector::Direct(current) => {
                let first = if addrs.is_empty() {
                    None
                } else {
                    Some(addrs.swap_remove(0))
                };
                if *current == first {
                    return false;
                }
                *current = first;
                true
            }
            Selector::RoundRobin(rr) => rr.update(addrs),
        }
    }

    pub fn addrs(&self) -> Vec<ReplicaAddr> {
        match self {
            Selector::Direct(addr) => addr.iter().cloned().collect(),
            Selector::RoundRobin(rr) => rr.addrs.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Selector::Direct(addr) => addr.is_none(),
            Selector::RoundRobin(rr) => rr.addrs.is_empty(),
        }
    }
}

/// Equal-weight rotation over an ordered address set.
#[derive(Debug)]
pub struct RoundRobin {
    addrs: Vec<ReplicaAddr>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(addrs: Vec<ReplicaAddr>) -> Self {
        Self {
            addrs,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Option<ReplicaAddr> {
        if self.addrs.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        Some(self.addrs[slot].clone())
    }

    /// Swap in a new address set. The cursor keeps counting, so a refresh
    /// does not send the next call back to the first address.
    pub fn update(&mut self, addrs: Vec<ReplicaAddr>) -> bool {
        if self.addrs == addrs {
            return false;
        }
        self.addrs = addrs;
        true
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
