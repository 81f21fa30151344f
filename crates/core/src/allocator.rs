//! Port and display-slot allocation
//!
//! Ports are probed by binding and immediately releasing a listener;
//! an in-process reserved set prevents two sessions racing the same
//! candidate between probe and child spawn.

use browsercast_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use tracing::debug;

/// Allocates TCP ports and virtual-display slots for sessions
pub struct Allocator {
    scan_attempts: u16,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    next_display: u32,
    reserved_ports: HashSet<u16>,
}

impl Allocator {
    pub fn new(display_base: u32, scan_attempts: u16) -> Self {
        Self {
            scan_attempts,
            state: Mutex::new(AllocatorState {
                next_display: display_base,
                reserved_ports: HashSet::new(),
            }),
        }
    }

    /// Reserve the first free port at or above `preferred_start`.
    ///
    /// Fails with `ResourceExhausted` when nothing is free within the
    /// scan window.
    pub fn reserve_port(&self, preferred_start: u16) -> Result<u16> {
        let mut state = self.state.lock();
        for offset in 0..self.scan_attempts {
            let Some(port) = preferred_start.checked_add(offset) else {
                break;
            };
            if state.reserved_ports.contains(&port) {
                continue;
            }
            if port_is_free(port) {
                state.reserved_ports.insert(port);
                debug!("reserved port {}", port);
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted {
            resource: format!("TCP port (scanned {} from {})", self.scan_attempts, preferred_start),
        })
    }

    /// Return a port to the free pool.
    pub fn release_port(&self, port: u16) {
        self.state.lock().reserved_ports.remove(&port);
        debug!("released port {}", port);
    }

    /// Hand out the next display slot. Slots are monotonic; a released
    /// slot is not reissued within a process lifetime.
    pub fn next_display_slot(&self) -> u32 {
        let mut state = self.state.lock();
        let slot = state.next_display;
        state.next_display += 1;
        slot
    }
}

/// Bind-then-release probe. The listener must not outlive the check.
fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ports_are_distinct() {
        let allocator = Allocator::new(100, 100);
        let a = allocator.reserve_port(15900).unwrap();
        let b = allocator.reserve_port(15900).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhausted_window_fails_without_side_effects() {
        let allocator = Allocator::new(100, 1);
        let port = allocator.reserve_port(16900).unwrap();
        assert_eq!(port, 16900);

        let err = allocator.reserve_port(16900).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));

        // The failed reservation must not have consumed anything.
        allocator.release_port(port);
        assert_eq!(allocator.reserve_port(16900).unwrap(), 16900);
    }

    #[test]
    fn release_makes_port_reusable() {
        let allocator = Allocator::new(100, 100);
        let port = allocator.reserve_port(17900).unwrap();
        allocator.release_port(port);
        assert_eq!(allocator.reserve_port(17900).unwrap(), port);
    }

    #[test]
    fn occupied_os_port_is_skipped() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let allocator = Allocator::new(100, 100);
        let port = allocator.reserve_port(taken).unwrap();
        assert_ne!(port, taken);
        drop(listener);
    }

    #[test]
    fn display_slots_are_monotonic() {
        let allocator = Allocator::new(100, 100);
        assert_eq!(allocator.next_display_slot(), 100);
        assert_eq!(allocator.next_display_slot(), 101);
        assert_eq!(allocator.next_display_slot(), 102);
    }
}
