//! RTP/RTCP port pair allocation.
//!
//! The pool hands out consecutive `(rtp, rtcp = rtp + 1)` pairs from a
//! configured range. Candidate pairs are removed from the free set before
//! probing so concurrent allocators never race on the same ports; ports
//! that fail the bind probe stay out of the pool.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::UdpSocket;

use confab_core::{Error, Result};

pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Pool over `[min, max)`.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            free: Mutex::new((min..max).collect()),
        }
    }

    /// Reserve a consecutive pair, probing both ports on localhost.
    ///
    /// Fails with `NoPortPairs` when no consecutive pair can be bound.
    pub fn allocate_pair(&self) -> Result<(u16, u16)> {
        loop {
            // Claim a candidate pair inside the critical section.
            let (rtp, rtcp) = {
                let mut free = self.free.lock();
                let Some(rtp) = free
                    .iter()
                    .copied()
                    .find(|p| p.checked_add(1).is_some_and(|next| free.contains(&next)))
                else {
                    return Err(Error::NoPortPairs);
                };
                let rtcp = rtp + 1;
                free.remove(&rtp);
                free.remove(&rtcp);
                (rtp, rtcp)
            };

            // Probe outside the lock; a port that fails the bind stays
            // removed so it is never offered again.
            let rtp_ok = Self::probe(rtp);
            let rtcp_ok = Self::probe(rtcp);
            match (rtp_ok, rtcp_ok) {
                (true, true) => {
                    tracing::debug!(rtp = rtp, rtcp = rtcp, "Allocated RTP/RTCP port pair");
                    return Ok((rtp, rtcp));
                }
                (true, false) => {
                    self.free.lock().insert(rtp);
                    tracing::warn!(port = rtcp, "UDP port failed probe, dropping from pool");
                }
                (false, true) => {
                    self.free.lock().insert(rtcp);
                    tracing::warn!(port = rtp, "UDP port failed probe, dropping from pool");
                }
                (false, false) => {
                    tracing::warn!(rtp = rtp, rtcp = rtcp, "UDP port pair failed probe, dropping from pool");
                }
            }
        }
    }

    /// Return a pair to the pool when a tap session ends.
    pub fn release_pair(&self, rtp: u16, rtcp: u16) {
        let mut free = self.free.lock();
        free.insert(rtp);
        free.insert(rtcp);
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    fn probe(port: u16) -> bool {
        UdpSocket::bind(("127.0.0.1", port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_consecutive() {
        let pool = PortPool::new(61000, 61010);
        let (rtp, rtcp) = pool.allocate_pair().unwrap();
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_release_restores_pool() {
        let pool = PortPool::new(61020, 61024);
        let (rtp, rtcp) = pool.allocate_pair().unwrap();
        pool.release_pair(rtp, rtcp);
        assert_eq!(pool.free_count(), 4);

        // The released pair is allocatable again.
        let (rtp2, rtcp2) = pool.allocate_pair().unwrap();
        assert_eq!(rtcp2, rtp2 + 1);
    }

    #[test]
    fn test_exhaustion_fails_without_partial_allocation() {
        let pool = PortPool::new(61030, 61034);
        let first = pool.allocate_pair().unwrap();
        let second = pool.allocate_pair().unwrap();
        assert_ne!(first.0, second.0);

        let err = pool.allocate_pair().unwrap_err();
        assert!(matches!(err, Error::NoPortPairs));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_no_consecutive_pair_fails() {
        let pool = PortPool::new(61040, 61044);
        // Leave only 61040 and 61042 in the pool: no consecutive pair.
        {
            let mut free = pool.free.lock();
            free.remove(&61041);
            free.remove(&61043);
        }
        assert!(matches!(pool.allocate_pair(), Err(Error::NoPortPairs)));
        // Failed allocation leaves the remaining ports untouched.
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_busy_port_skipped() {
        // Hold a socket on a port inside the range; the allocator must skip
        // past it and still produce a consecutive pair.
        let held = UdpSocket::bind(("127.0.0.1", 61051)).unwrap();
        let pool = PortPool::new(61050, 61056);

        let (rtp, rtcp) = pool.allocate_pair().unwrap();
        assert_ne!(rtp, 61051);
        assert_ne!(rtcp, 61051);
        assert_eq!(rtcp, rtp + 1);
        drop(held);
    }
}
