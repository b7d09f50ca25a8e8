//! Lowest-free integer allocator backing request identities.

use crate::error::{BrokerError, Result};
use std::collections::BTreeSet;

/// Sorted set of ids currently in use.
///
/// Allocation always hands out the lowest integer not in the set, so a
/// freed id is reused before the set grows.
#[derive(Debug, Default, Clone)]
pub struct IdSet {
    in_use: BTreeSet<u32>,
}

impl IdSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free id
    pub fn allocate(&mut self) -> u32 {
        let mut lowest = 0;
        for id in &self.in_use {
            if *id != lowest {
                break;
            }
            lowest += 1;
        }

        self.in_use.insert(lowest);
        lowest
    }

    /// Return an id to the pool.
    ///
    /// Freeing an id that was never handed out means the caller's
    /// bookkeeping is broken.
    pub fn free(&mut self, id: u32) -> Result<()> {
        if !self.in_use.remove(&id) {
            return Err(BrokerError::internal(format!(
                "freeing unallocated request id {}",
                id
            )));
        }
        Ok(())
    }

    /// Check whether an id is allocated
    pub fn contains(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }

    /// Number of allocated ids
    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    /// True when nothing is allocated
    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }
}
