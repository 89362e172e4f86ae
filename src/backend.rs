//! Upstream backends and the rotating pools requests draw them from

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// One upstream server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub name: String,
    /// `host:port` connect string
    pub address: String,
}

impl Backend {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Round-robin rotation over a fixed set of backends
///
/// Taking a backend moves it from the head of the ring to the tail in one
/// step under the lock. Nothing is held while the request is in flight, so
/// concurrent requests may share a backend; only the order of assignment is
/// round robin.
pub struct BackendPool {
    ring: Mutex<VecDeque<Arc<Backend>>>,
}

impl BackendPool {
    /// Build a pool holding exactly `backends`, in order.
    ///
    /// Returns `None` for an empty list: a frontend without backends for a
    /// route has no pool at all rather than an empty one.
    pub fn new(backends: Vec<Arc<Backend>>) -> Option<Self> {
        if backends.is_empty() {
            return None;
        }

        Some(Self {
            ring: Mutex::new(backends.into()),
        })
    }

    /// Take the backend at the head of the rotation and requeue it at the tail
    pub fn take_next(&self) -> Arc<Backend> {
        let mut ring = self.ring.lock();
        // The ring is never empty and never shrinks.
        let next = Arc::clone(&ring[0]);
        ring.rotate_left(1);
        next
    }
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_list()
            .entries(ring.iter().map(|b| b.name.as_str()))
            .finish()
    }
}
