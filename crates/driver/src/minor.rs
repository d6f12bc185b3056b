//! Minor number allocation
//!
//! Each channel is named by a small integer drawn from a fixed-size pool. The
//! pool is a single `u64` bitmap (bit set = in use), so at most
//! [`MAX_MINORS`] channels can exist at once.

use crate::error::{DriverError, Result};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Upper bound on the identifier pool size
pub const MAX_MINORS: usize = 64;

/// Channel identifier within the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Minor(pub u8);

impl fmt::Display for Minor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bitmap-backed pool of minor numbers
#[derive(Debug)]
pub struct MinorAllocator {
    capacity: usize,
    bitmap: Mutex<u64>,
}

impl MinorAllocator {
    /// Create a pool of `capacity` identifiers (clamped to [`MAX_MINORS`])
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(MAX_MINORS),
            bitmap: Mutex::new(0),
        }
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the lowest free identifier
    pub fn allocate(&self) -> Result<Minor> {
        let mut bitmap = crate::lock(&self.bitmap);

        // trailing_ones() is the index of the first clear bit (64 when full)
        let free_bit = bitmap.trailing_ones() as usize;
        if free_bit >= self.capacity {
            return Err(DriverError::ResourceExhausted(format!(
                "all {} minor numbers in use",
                self.capacity
            )));
        }

        *bitmap |= 1 << free_bit;
        debug!("Allocated minor {} (bitmap: {:#018x})", free_bit, *bitmap);

        Ok(Minor(free_bit as u8))
    }

    /// Return an identifier to the pool
    ///
    /// Releasing an identifier that is not allocated is a caller bug; it is
    /// logged and ignored.
    pub fn release(&self, minor: Minor) {
        let bit = minor.0 as usize;
        if bit >= self.capacity {
            warn!("Attempted to release out-of-range minor {} (ignored)", minor);
            return;
        }

        let mut bitmap = crate::lock(&self.bitmap);
        if *bitmap & (1 << bit) == 0 {
            warn!("Attempted to release free minor {} (ignored)", minor);
            return;
        }

        *bitmap &= !(1 << bit);
        debug!("Released minor {} (bitmap: {:#018x})", minor, *bitmap);
    }

    /// Snapshot of allocated identifiers in ascending order
    pub fn allocated(&self) -> Vec<Minor> {
        let bitmap = *crate::lock(&self.bitmap);
        (0..self.capacity)
            .filter(|bit| bitmap & (1 << bit) != 0)
            .map(|bit| Minor(bit as u8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ascending_allocation() {
        let pool = MinorAllocator::new(4);
        assert_eq!(pool.allocate().unwrap(), Minor(0));
        assert_eq!(pool.allocate().unwrap(), Minor(1));
        assert_eq!(pool.allocate().unwrap(), Minor(2));
    }

    #[test]
    fn test_lowest_free_slot_is_reused() {
        let pool = MinorAllocator::new(4);
        for _ in 0..3 {
            pool.allocate().unwrap();
        }
        pool.release(Minor(1));
        assert_eq!(pool.allocate().unwrap(), Minor(1));
        assert_eq!(pool.allocate().unwrap(), Minor(3));
    }

    #[test]
    fn test_exhaustion() {
        let pool = MinorAllocator::new(2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(matches!(
            pool.allocate(),
            Err(DriverError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_full_width_pool() {
        let pool = MinorAllocator::new(MAX_MINORS);
        for expected in 0..MAX_MINORS {
            assert_eq!(pool.allocate().unwrap(), Minor(expected as u8));
        }
        assert!(pool.allocate().is_err());
        pool.release(Minor(63));
        assert_eq!(pool.allocate().unwrap(), Minor(63));
    }

    #[test]
    fn test_capacity_is_clamped() {
        let pool = MinorAllocator::new(1000);
        assert_eq!(pool.capacity(), MAX_MINORS);
    }

    #[test]
    fn test_release_of_free_minor_is_ignored() {
        let pool = MinorAllocator::new(4);
        pool.release(Minor(2));
        pool.release(Minor(200));
        assert!(pool.allocated().is_empty());
    }

    #[test]
    fn test_allocate_release_round_trip_never_exhausts() {
        let pool = MinorAllocator::new(8);
        for _ in 0..pool.capacity() * 4 {
            let minor = pool.allocate().unwrap();
            pool.release(minor);
        }
        assert!(pool.allocated().is_empty());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let pool = Arc::new(MinorAllocator::new(MAX_MINORS));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..8).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for minor in handle.join().unwrap() {
                assert!(seen.insert(minor), "duplicate minor {}", minor);
            }
        }
        assert_eq!(seen.len(), MAX_MINORS);
        assert!(pool.allocate().is_err());
    }

    proptest! {
        /// Property: any interleaving of allocations and releases keeps the
        /// allocated set inside [0, N) and free of duplicates
        #[test]
        fn prop_allocated_set_stays_bounded(
            capacity in 1usize..=MAX_MINORS,
            ops in proptest::collection::vec(any::<Option<u8>>(), 0..200),
        ) {
            let pool = MinorAllocator::new(capacity);
            let mut model: HashSet<Minor> = HashSet::new();

            for op in ops {
                match op {
                    None => match pool.allocate() {
                        Ok(minor) => {
                            prop_assert!((minor.0 as usize) < capacity);
                            prop_assert!(model.insert(minor));
                        }
                        Err(_) => prop_assert_eq!(model.len(), capacity),
                    },
                    Some(pick) => {
                        if let Some(&minor) = model.iter().nth(pick as usize % model.len().max(1)) {
                            pool.release(minor);
                            model.remove(&minor);
                        }
                    }
                }
            }

            let allocated: HashSet<Minor> = pool.allocated().into_iter().collect();
            prop_assert_eq!(allocated, model);
        }
    }
}
