//! UDP port leasing for recording RTP endpoints
//!
//! Every recording tap needs one (or two, without RTCP muxing) UDP ports
//! the external recorder listens on. The allocator hands out unique ports
//! from a fixed range and takes them back when the recording ends.

use crate::error::{MediaError, Result};
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashSet;

/// Random draws attempted before falling back to a linear scan.
const RANDOM_DRAW_ATTEMPTS: u32 = 64;

/// Leases unique UDP ports from a fixed inclusive range.
///
/// Concurrent lease/release calls from multiple sessions are serialized by
/// a single mutex around the leased set.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// # Panics
    ///
    /// Panics if `min_port > max_port`.
    #[must_use]
    pub fn new(min_port: u16, max_port: u16) -> Self {
        assert!(min_port <= max_port, "invalid port range");
        Self {
            min_port,
            max_port,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease a currently unleased port.
    ///
    /// Draws uniformly at random and retries on collision; once the random
    /// attempts are spent the remaining range is scanned linearly, so a
    /// saturated pool fails with [`MediaError::PortPoolExhausted`] instead
    /// of spinning.
    pub fn lease(&self) -> Result<u16> {
        let mut leased = self.leased.lock();
        let range_size = usize::from(self.max_port - self.min_port) + 1;

        if leased.len() >= range_size {
            return Err(MediaError::PortPoolExhausted);
        }

        let mut rng = rand::rng();
        for _ in 0..RANDOM_DRAW_ATTEMPTS {
            let port = rng.random_range(self.min_port..=self.max_port);
            if leased.insert(port) {
                return Ok(port);
            }
        }

        // Dense occupancy: scan for the first free port.
        for port in self.min_port..=self.max_port {
            if leased.insert(port) {
                return Ok(port);
            }
        }

        Err(MediaError::PortPoolExhausted)
    }

    /// Return a port to the pool. No-op when the port is not leased.
    pub fn release(&self, port: u16) {
        self.leased.lock().remove(&port);
    }

    /// Number of currently leased ports.
    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn leases_are_disjoint_and_in_range() {
        let allocator = PortAllocator::new(20000, 20100);
        let mut seen = HashSet::new();

        for _ in 0..50 {
            let port = allocator.lease().unwrap();
            assert!((20000..=20100).contains(&port));
            assert!(seen.insert(port), "port {port} leased twice");
        }
    }

    #[test]
    fn released_port_is_eligible_again() {
        let allocator = PortAllocator::new(30000, 30000);
        let port = allocator.lease().unwrap();
        assert_eq!(port, 30000);
        assert!(matches!(
            allocator.lease(),
            Err(MediaError::PortPoolExhausted)
        ));

        allocator.release(port);
        assert_eq!(allocator.lease().unwrap(), 30000);
    }

    #[test]
    fn releasing_unleased_port_is_a_noop() {
        let allocator = PortAllocator::new(20000, 20010);
        allocator.release(20005);
        assert_eq!(allocator.leased_count(), 0);
    }

    #[test]
    fn saturated_pool_fails() {
        let allocator = PortAllocator::new(20000, 20003);
        for _ in 0..4 {
            allocator.lease().unwrap();
        }
        assert!(matches!(
            allocator.lease(),
            Err(MediaError::PortPoolExhausted)
        ));
    }

    #[test]
    fn concurrent_leases_stay_disjoint() {
        let allocator = Arc::new(PortAllocator::new(20000, 21000));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                (0..32)
                    .map(|_| allocator.lease().unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} leased twice");
            }
        }
        assert_eq!(seen.len(), 8 * 32);
    }
}
