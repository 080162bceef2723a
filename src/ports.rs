//! Worker port allocation over a fixed contiguous range

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("no free port in {begin}..={end}")]
    RangeExhausted { begin: u16, end: u16 },
    #[error("port {0} is not held")]
    NotHeld(u16),
}

/// Free set over `[begin, end]`.
///
/// Not synchronised; the pool calls it from inside its own lock.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    free: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            free: range.clone().collect(),
            range,
        }
    }

    /// Take the lowest free port
    pub fn acquire(&mut self) -> Result<u16, PortError> {
        self.free.pop_first().ok_or(PortError::RangeExhausted {
            begin: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Return a port previously handed out by [`acquire`](Self::acquire)
    pub fn release(&mut self, port: u16) -> Result<(), PortError> {
        if !self.range.contains(&port) || self.free.contains(&port) {
            return Err(PortError::NotHeld(port));
        }
        self.free.insert(port);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.range.clone().count()
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.range.contains(&port) && !self.free.contains(&port)
    }
}
